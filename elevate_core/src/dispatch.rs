// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single entry point for elevated work.
//!
//! Every call, successful or not, runs the cleanup step exactly once before
//! returning: the RNG path is re-armed and, unless a transition is still
//! mid-flight, the lockdown latch is released.

use crate::action::{ActionOutput, ElevatedAction};
use crate::context::ElevatedContext;
use crate::hal::{FatalReason, Platform, SecureRegisters};
use crate::shared::init_shared_struct;
use crate::transition::{self, phase};
use crate::Error;
use elevate_areas::TRANSFER_WINDOW;
use log::{debug, error, trace, warn};
use phase_token::TrustPhase;
use zeroize::{Zeroize, Zeroizing};

/// Runs `action` on behalf of a caller that will resume at `return_addr`.
pub fn dispatch<P: Platform>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    action: ElevatedAction,
    return_addr: u32,
) -> Result<ActionOutput, Error> {
    guarded(ctx, platform, return_addr, |ctx, p| run(ctx, p, action))
}

/// Same as [`dispatch`], for an entry that still has to be decoded.
/// An undecodable entry still counts as a call and gets cleaned up after.
pub fn dispatch_raw<P: Platform>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    code: u32,
    args: &[u32],
    return_addr: u32,
) -> Result<ActionOutput, Error> {
    guarded(ctx, platform, return_addr, |ctx, p| {
        let action = ElevatedAction::decode(code, args)?;
        run(ctx, p, action)
    })
}

fn guarded<P, F>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    return_addr: u32,
    f: F,
) -> Result<ActionOutput, Error>
where
    P: Platform,
    F: FnOnce(&mut ElevatedContext, &mut P) -> Result<ActionOutput, Error>,
{
    if platform.elevated_call_active() {
        error!("elevated entry while a call is already active");
        platform.halt(FatalReason::ReentrantCall);
    }
    if ctx.config.elevated_region.contains(return_addr) {
        error!("return address {return_addr:#x} is elevated code");
        platform.halt(FatalReason::ReturnIntoElevatedRegion(return_addr));
    }

    platform.set_elevated_call_active(true);
    let r = check_revocation(ctx, platform).and_then(|()| f(ctx, platform));
    if let Err(e) = &r {
        debug!("elevated call failed: {e}");
    }
    cleanup(ctx, platform);
    platform.set_elevated_call_active(false);
    r
}

fn check_revocation<P>(ctx: &ElevatedContext, platform: &P) -> Result<(), Error>
where
    P: SecureRegisters + ?Sized,
{
    let version = ctx.config.firmware_version;
    let floor = platform.fuse_version().max(platform.policy_floor());
    if version < floor {
        warn!("firmware version {version} revoked, floor is {floor}");
        return Err(Error::RevocationFailure { version, floor });
    }
    Ok(())
}

fn cleanup<P: Platform>(ctx: &mut ElevatedContext, platform: &mut P) {
    platform.rearm_rng();
    match phase(platform) {
        Some(TrustPhase::Idle) => {
            if platform.lockdown_engaged() {
                platform.release_lockdown();
            }
        }
        p => trace!("lockdown held, phase {p:?}"),
    }
    ctx.cleanup_count += 1;
}

fn run<P: Platform>(
    ctx: &mut ElevatedContext,
    p: &mut P,
    action: ElevatedAction,
) -> Result<ActionOutput, Error> {
    trace!("running {:?}", action.code());
    match action {
        ElevatedAction::DeriveKey { salt } => Ok(ActionOutput::DerivedKey(derive_key(p, &salt))),
        ElevatedAction::Digest { src, len } => digest_backing(p, src, len).map(ActionOutput::Digest),
        ElevatedAction::InitSharedStruct { dst, len } => {
            init_shared_struct(p, dst, len).map(|()| ActionOutput::None)
        }
        ElevatedAction::PolicyUpdate { floor } => {
            update_policy(p, floor).map(|()| ActionOutput::None)
        }
        ElevatedAction::TransitionEnter => transition::enter(ctx, p).map(|()| ActionOutput::None),
        ElevatedAction::TransitionProtect { salt } => {
            transition::perform_protected_action(ctx, p, &salt).map(|()| ActionOutput::None)
        }
        ElevatedAction::TransitionExit => transition::exit(ctx, p).map(|()| ActionOutput::None),
        ElevatedAction::MutexAcquire { id, timeout } => {
            Ok(ActionOutput::Token(p.acquire(id, timeout)?))
        }
        ElevatedAction::MutexRelease { id, token } => {
            p.release(id, token)?;
            Ok(ActionOutput::None)
        }
    }
}

fn derive_key<P: Platform>(p: &mut P, salt: &[u8; 16]) -> Zeroizing<[u8; 16]> {
    let mut secret = p.device_secret();
    let key = Zeroizing::new(p.encrypt(&secret, salt));
    secret.zeroize();
    key
}

/// SHA-256 over backing storage, pulled in one transfer window at a time.
fn digest_backing<P: Platform>(p: &mut P, src: u32, len: u32) -> Result<[u8; 32], Error> {
    let end = src
        .checked_add(len)
        .ok_or(Error::InvalidRange { start: src, end: u32::MAX })?;
    let mut window = [0u8; TRANSFER_WINDOW as usize];
    p.hash_start();
    let mut addr = src;
    while addr < end {
        let n = (end - addr).min(TRANSFER_WINDOW) as usize;
        if let Err(e) = p.read_in(&mut window[..n], addr) {
            // Leave the engine idle for the next caller.
            let _ = p.hash_finish();
            return Err(e.into());
        }
        p.hash_update(&window[..n]);
        addr += n as u32;
    }
    window.zeroize();
    Ok(p.hash_finish())
}

fn update_policy<P>(p: &mut P, floor: u32) -> Result<(), Error>
where
    P: SecureRegisters + ?Sized,
{
    let current = p.policy_floor();
    if floor < current {
        return Err(Error::RevocationFailure {
            version: floor,
            floor: current,
        });
    }
    p.set_policy_floor(floor);
    debug!("policy floor {current} -> {floor}");
    Ok(())
}
