// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The elevated-trust state machine.
//!
//! A transition walks the phase register through
//! `Idle -> Entered -> KeyReady -> Idle`, one step per call:
//!
//! - [`enter`] proves to the hardware monitor that only authorized code is
//!   resident and lowers protection for the window.
//! - [`perform_protected_action`] runs the primitive that needed the window.
//! - [`exit`] puts protection back, wipes what the window left behind and
//!   reloads everything `enter` evicted.
//!
//! Each call checks the phase first and fails with
//! [`Error::IllegalState`] without touching anything if it is out of order.

use crate::context::ElevatedContext;
use crate::digest::ChainedDigest;
use crate::hal::{with_scheduling_suspended, Platform, SecureRegisters};
use crate::stack_guard::StackSnapshot;
use crate::Error;
use elevate_areas::{ProtectionMask, TransitionRecord, RECORD_MAGIC};
use log::{debug, info, trace, warn};
use packed_struct::prelude::*;
use phase_token::TrustPhase;
use zeroize::Zeroize;

/// Current phase, or `None` if the register holds an undefined value.
pub fn phase<P>(platform: &P) -> Option<TrustPhase>
where
    P: SecureRegisters + ?Sized,
{
    TrustPhase::from_register(platform.phase_register())
}

fn require_phase<P>(platform: &P, expected: TrustPhase, operation: &'static str) -> Result<(), Error>
where
    P: SecureRegisters + ?Sized,
{
    let raw = platform.phase_register();
    match TrustPhase::from_register(raw) {
        Some(p) if p == expected => Ok(()),
        _ => Err(Error::IllegalState {
            operation,
            register: raw,
        }),
    }
}

fn advance<P>(platform: &mut P, to: TrustPhase)
where
    P: SecureRegisters + ?Sized,
{
    platform.set_phase_register(to.register_value());
    debug!("trust phase -> {to}");
}

/// Opens the elevated window.
///
/// On any returned error every side effect has been undone: evicted blocks
/// are back, the bookkeeping region is unmarked and the phase is still Idle.
pub fn enter<P: Platform>(ctx: &mut ElevatedContext, platform: &mut P) -> Result<(), Error> {
    require_phase(platform, TrustPhase::Idle, "enter")?;

    with_scheduling_suspended(platform, |p| -> Result<(), Error> {
        let bookkeeping = ctx.config.bookkeeping;
        bookkeeping.mark(p);

        let r = verify_and_lower(ctx, p);
        match &r {
            Ok(()) => {
                ctx.actions_in_window = 0;
                advance(p, TrustPhase::Entered);
                info!("entered elevated window");
            }
            Err(e) => {
                warn!("enter failed: {e}");
                undo_entry(ctx, p);
            }
        }
        r
    })
}

fn verify_and_lower<P: Platform>(ctx: &mut ElevatedContext, p: &mut P) -> Result<(), Error> {
    let bookkeeping = ctx.config.bookkeeping;

    let snapshot = StackSnapshot::capture(&*p);
    let mut record = TransitionRecord {
        magic: RECORD_MAGIC,
        saved_mask: p.protection_mask(),
        ..Default::default()
    };
    snapshot.store(&mut record);
    p.write_local(bookkeeping.addr, &record.pack()?)?;
    trace!("transition record at {:#x}: {record:x?}", bookkeeping.addr);

    let evicted = ctx.guard.evict_non_registered(p, &ctx.registry)?;
    debug!("evicted {evicted} unregistered block(s)");

    let expected = p.reference_signature();
    let mut digest = ChainedDigest::new(ctx.config.seed);
    digest.digest_registry(p, &ctx.registry)?;
    let computed = digest.words();
    digest.zeroize();

    // An empty registry would otherwise verify against the seed alone.
    if ctx.registry.is_empty() || computed != expected {
        return Err(Error::SignatureMismatch { expected, computed });
    }
    debug!("overlay signature verified");

    let mask = ProtectionMask(p.protection_mask());
    if mask.levels().is_weaker_than(&ctx.config.expected_protection) {
        return Err(Error::InsufficientProtection { mask: mask.0 });
    }
    p.set_protection_mask(mask.with_levels(ctx.config.window_protection).0);
    trace!("protection mask {:#010x} lowered", mask.0);

    Ok(())
}

fn undo_entry<P: Platform>(ctx: &mut ElevatedContext, p: &mut P) {
    let bookkeeping = ctx.config.bookkeeping;
    if let Err(e) = ctx.guard.restore_evicted(p) {
        warn!("could not restore all evicted blocks: {e}");
    }
    if let Err(e) = p.zero_local(bookkeeping.addr, TransitionRecord::SIZE as u32) {
        warn!("could not clear transition record: {e}");
    }
    bookkeeping.unmark(p);
}

/// Runs the protected primitive: derives the session key from the device
/// secret and `salt` into the elevated-only key buffer.
///
/// Legal once in Entered; with `max-protected-actions` above 1 it may be
/// repeated from KeyReady until the limit for this window is reached.
pub fn perform_protected_action<P: Platform>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    salt: &[u8; 16],
) -> Result<(), Error> {
    let raw = platform.phase_register();
    let limit = ctx.config.max_protected_actions.max(1);
    match TrustPhase::from_register(raw) {
        Some(TrustPhase::Entered) => {}
        Some(TrustPhase::KeyReady) if ctx.actions_in_window < limit => {}
        _ => {
            return Err(Error::IllegalState {
                operation: "perform_protected_action",
                register: raw,
            })
        }
    }

    let mut secret = platform.device_secret();
    *ctx.session_key = platform.encrypt(&secret, salt);
    secret.zeroize();

    ctx.actions_in_window += 1;
    advance(platform, TrustPhase::KeyReady);
    debug!("protected action {} of {limit} done", ctx.actions_in_window);
    Ok(())
}

/// Closes the elevated window.
///
/// If the protection mask does not read back as saved, this fails with
/// [`Error::InsufficientProtection`] and the phase stays KeyReady. A failure
/// to reload evicted blocks is reported only after the phase is back at Idle,
/// since protection and secrets are already squared away by then.
pub fn exit<P: Platform>(ctx: &mut ElevatedContext, platform: &mut P) -> Result<(), Error> {
    require_phase(platform, TrustPhase::KeyReady, "exit")?;

    with_scheduling_suspended(platform, |p| -> Result<(), Error> {
        let bookkeeping = ctx.config.bookkeeping;

        let mut bytes = [0u8; TransitionRecord::SIZE];
        p.read_local(bookkeeping.addr, &mut bytes)?;
        let record = TransitionRecord::unpack(&bytes)?;
        bytes.zeroize();
        if record.magic != RECORD_MAGIC {
            warn!("transition record magic is {:#010x}", record.magic);
        }

        p.set_protection_mask(record.saved_mask);
        let readback = p.protection_mask();
        if readback != record.saved_mask {
            return Err(Error::InsufficientProtection { mask: readback });
        }
        trace!("protection mask {readback:#010x} restored");

        ctx.session_key.zeroize();
        if let Some(scratch) = ctx.config.scratch {
            p.zero_local(scratch.addr, scratch.size)?;
        }

        let mut snapshot = StackSnapshot::from_record(&record);
        snapshot.scrub(p)?;

        let restored = ctx.guard.restore_evicted(p);

        p.zero_local(bookkeeping.addr, TransitionRecord::SIZE as u32)?;
        bookkeeping.unmark(p);

        ctx.actions_in_window = 0;
        advance(p, TrustPhase::Idle);

        let restored = restored?;
        info!("left elevated window, {restored} block(s) restored");
        Ok(())
    })
}
