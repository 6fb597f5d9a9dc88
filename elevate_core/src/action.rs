// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::hal::MutexToken;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use core::time::Duration;
use elevate_areas::{MutexId, Overlay};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use zeroize::Zeroizing;

/// Wire codes of the elevated actions, as passed in the first argument word
/// of a raw entry from baseline code.
#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ActionCode {
    DeriveKey = 0x01,
    Digest = 0x02,
    InitSharedStruct = 0x03,
    PolicyUpdate = 0x04,
    TransitionEnter = 0x10,
    TransitionProtect = 0x11,
    TransitionExit = 0x12,
    MutexAcquire = 0x20,
    MutexRelease = 0x21,
}

/// One request for elevated work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElevatedAction {
    /// AES(device secret, salt), handed back to the caller
    DeriveKey { salt: [u8; 16] },
    /// SHA-256 of `len` bytes of backing storage at `src`
    Digest { src: u32, len: u32 },
    /// Writes an empty shared-struct header and zeroed payload at `dst`
    InitSharedStruct { dst: u32, len: u32 },
    /// Raises the anti-rollback floor
    PolicyUpdate { floor: u32 },
    TransitionEnter,
    TransitionProtect { salt: [u8; 16] },
    TransitionExit,
    MutexAcquire { id: MutexId, timeout: Duration },
    MutexRelease { id: MutexId, token: MutexToken },
}

fn salt_from(args: &[u32]) -> [u8; 16] {
    let mut salt = [0u8; 16];
    LittleEndian::write_u32_into(&args[..4], &mut salt);
    salt
}

impl ElevatedAction {
    pub fn code(&self) -> ActionCode {
        match self {
            ElevatedAction::DeriveKey { .. } => ActionCode::DeriveKey,
            ElevatedAction::Digest { .. } => ActionCode::Digest,
            ElevatedAction::InitSharedStruct { .. } => ActionCode::InitSharedStruct,
            ElevatedAction::PolicyUpdate { .. } => ActionCode::PolicyUpdate,
            ElevatedAction::TransitionEnter => ActionCode::TransitionEnter,
            ElevatedAction::TransitionProtect { .. } => ActionCode::TransitionProtect,
            ElevatedAction::TransitionExit => ActionCode::TransitionExit,
            ElevatedAction::MutexAcquire { .. } => ActionCode::MutexAcquire,
            ElevatedAction::MutexRelease { .. } => ActionCode::MutexRelease,
        }
    }

    /// Decodes a raw entry. Salts are four little-endian words; timeouts are
    /// in microseconds.
    pub fn decode(code: u32, args: &[u32]) -> Result<ElevatedAction, Error> {
        let c = ActionCode::from_u32(code).ok_or(Error::UnsupportedAction(code))?;
        let needed = match c {
            ActionCode::DeriveKey | ActionCode::TransitionProtect => 4,
            ActionCode::Digest
            | ActionCode::InitSharedStruct
            | ActionCode::MutexAcquire
            | ActionCode::MutexRelease => 2,
            ActionCode::PolicyUpdate => 1,
            ActionCode::TransitionEnter | ActionCode::TransitionExit => 0,
        };
        if args.len() < needed {
            return Err(Error::UnsupportedAction(code));
        }

        Ok(match c {
            ActionCode::DeriveKey => ElevatedAction::DeriveKey {
                salt: salt_from(args),
            },
            ActionCode::Digest => ElevatedAction::Digest {
                src: args[0],
                len: args[1],
            },
            ActionCode::InitSharedStruct => ElevatedAction::InitSharedStruct {
                dst: args[0],
                len: args[1],
            },
            ActionCode::PolicyUpdate => ElevatedAction::PolicyUpdate { floor: args[0] },
            ActionCode::TransitionEnter => ElevatedAction::TransitionEnter,
            ActionCode::TransitionProtect => ElevatedAction::TransitionProtect {
                salt: salt_from(args),
            },
            ActionCode::TransitionExit => ElevatedAction::TransitionExit,
            ActionCode::MutexAcquire => ElevatedAction::MutexAcquire {
                id: mutex_id(code, args[0])?,
                timeout: Duration::from_micros(args[1].into()),
            },
            ActionCode::MutexRelease => ElevatedAction::MutexRelease {
                id: mutex_id(code, args[0])?,
                token: MutexToken(args[1]),
            },
        })
    }

    /// Code overlays that must be resident before this action runs.
    ///
    /// Starting a transition loads what the whole window needs, so the later
    /// steps find it already in place.
    pub fn required_overlays(&self) -> &'static [Overlay] {
        match self {
            ElevatedAction::DeriveKey { .. } => &[Overlay::Kdf],
            ElevatedAction::Digest { .. } => &[Overlay::Sha],
            ElevatedAction::InitSharedStruct { .. } => &[Overlay::SharedStruct],
            ElevatedAction::PolicyUpdate { .. } => &[Overlay::Policy],
            ElevatedAction::TransitionEnter => &[Overlay::Transition, Overlay::Kdf],
            ElevatedAction::TransitionProtect { .. } | ElevatedAction::TransitionExit => {
                &[Overlay::Transition]
            }
            ElevatedAction::MutexAcquire { .. } | ElevatedAction::MutexRelease { .. } => {
                &[Overlay::Mutex]
            }
        }
    }
}

fn mutex_id(code: u32, raw: u32) -> Result<MutexId, Error> {
    u8::try_from(raw)
        .map(MutexId)
        .map_err(|_| Error::UnsupportedAction(code))
}

/// What a successful action hands back.
#[derive(Debug)]
pub enum ActionOutput {
    None,
    DerivedKey(Zeroizing<[u8; 16]>),
    Digest([u8; 32]),
    Token(MutexToken),
}

impl ActionOutput {
    pub fn into_token(self) -> Option<MutexToken> {
        match self {
            ActionOutput::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_digest(self) -> Option<[u8; 32]> {
        match self {
            ActionOutput::Digest(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_key(self) -> Option<Zeroizing<[u8; 16]>> {
        match self {
            ActionOutput::DerivedKey(k) => Some(k),
            _ => None,
        }
    }
}
