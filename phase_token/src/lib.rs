// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Trust phase register encodings
//!
//! The trust phase of the coprocessor lives in a single 32-bit register that
//! is visible to both baseline and elevated code. It is not touched when code
//! moves between the two levels, which is what lets a multi-call transition
//! span several elevated entries; it is only cleared by a chip reset.
//!
//! This crate defines the values that may legitimately appear in that
//! register. They are shared between the firmware, the simulator and host
//! tooling that decodes register dumps.
//!
//! The non-zero values are chosen arbitrarily from hashes of sentences; we
//! just need something that a stray write is unlikely to produce.
#![no_std]

/// Value of the register after reset, before any code wrote to it
///
/// This decodes as [`TrustPhase::Idle`].
pub const CLEARED: u32 = 0;

/// No transition is in flight
pub const IDLE: u32 = 0x5e1d_0a7b;

/// The resident set has been verified and protection lowered
pub const ENTERED: u32 = 0xa3c4_19e6;

/// The protected action has run; only `exit` is legal now
pub const KEY_READY: u32 = 0x17f0_c85d;

/// Decoded trust phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrustPhase {
    Idle,
    Entered,
    KeyReady,
}

impl TrustPhase {
    /// Decodes a raw register value, returning `None` for anything that is
    /// not one of the four defined encodings.
    pub const fn from_register(raw: u32) -> Option<TrustPhase> {
        match raw {
            CLEARED | IDLE => Some(TrustPhase::Idle),
            ENTERED => Some(TrustPhase::Entered),
            KEY_READY => Some(TrustPhase::KeyReady),
            _ => None,
        }
    }

    /// The value written to the register when moving into this phase.
    pub const fn register_value(self) -> u32 {
        match self {
            TrustPhase::Idle => IDLE,
            TrustPhase::Entered => ENTERED,
            TrustPhase::KeyReady => KEY_READY,
        }
    }

    /// The only phase that may legally follow this one.
    pub const fn successor(self) -> TrustPhase {
        match self {
            TrustPhase::Idle => TrustPhase::Entered,
            TrustPhase::Entered => TrustPhase::KeyReady,
            TrustPhase::KeyReady => TrustPhase::Idle,
        }
    }
}

impl core::fmt::Display for TrustPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TrustPhase::Idle => "idle",
            TrustPhase::Entered => "entered",
            TrustPhase::KeyReady => "key-ready",
        };
        f.write_str(name)
    }
}
