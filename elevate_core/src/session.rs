// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Baseline-side wrapper around the dispatcher.
//!
//! Makes sure the code an action needs is resident before dispatching and
//! takes it away again afterwards. An action that starts a transition keeps
//! its overlays loaded until the transition ends, since the later steps run
//! from the same code.

use crate::action::{ActionOutput, ElevatedAction};
use crate::context::ElevatedContext;
use crate::dispatch::{dispatch, dispatch_raw};
use crate::hal::{OverlayLoader, Platform};
use crate::prealloc::Preallocation;
use crate::transition::phase;
use crate::Error;
use elevate_areas::Overlay;
use log::{debug, warn};
use phase_token::TrustPhase;

fn load_all<P>(platform: &mut P, overlays: &[Overlay]) -> Result<(), Error>
where
    P: OverlayLoader + ?Sized,
{
    for (i, &o) in overlays.iter().enumerate() {
        if let Err(e) = platform.load_overlay(o) {
            warn!("could not load {o:?} overlay: {e}");
            unload_all(platform, &overlays[..i]);
            return Err(e.into());
        }
    }
    Ok(())
}

fn unload_all<P>(platform: &mut P, overlays: &[Overlay])
where
    P: OverlayLoader + ?Sized,
{
    for &o in overlays.iter().rev() {
        platform.unload_overlay(o);
    }
}

/// Runs `action` with its code loaded and the lockdown latch engaged.
pub fn call<P: Platform>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    action: ElevatedAction,
    return_addr: u32,
) -> Result<ActionOutput, Error> {
    if phase(platform) != Some(TrustPhase::Idle) {
        // Mid-transition: the overlays are already resident.
        platform.engage_lockdown();
        let r = dispatch(ctx, platform, action, return_addr);
        if phase(platform) == Some(TrustPhase::Idle) {
            let overlays = core::mem::take(&mut ctx.transition_overlays);
            unload_all(platform, &overlays);
            debug!("transition over, unloaded {} overlay(s)", overlays.len());
        }
        return r;
    }

    let overlays = action.required_overlays();
    load_all(platform, overlays)?;

    if matches!(action, ElevatedAction::TransitionEnter) {
        // The window itself must not need the allocator; fail here instead.
        match Preallocation::reserve(ctx.config.prealloc_bytes) {
            Ok(block) => block.release(),
            Err(e) => {
                unload_all(platform, overlays);
                return Err(e);
            }
        }
    }

    platform.engage_lockdown();
    let r = dispatch(ctx, platform, action, return_addr);

    if phase(platform) == Some(TrustPhase::Idle) {
        unload_all(platform, overlays);
    } else {
        ctx.transition_overlays.clear();
        ctx.transition_overlays.extend_from_slice(overlays);
    }
    r
}

/// Decodes and runs a raw entry. An entry that does not decode goes straight
/// to the dispatcher so it is still cleaned up after like any other call.
pub fn call_raw<P: Platform>(
    ctx: &mut ElevatedContext,
    platform: &mut P,
    code: u32,
    args: &[u32],
    return_addr: u32,
) -> Result<ActionOutput, Error> {
    match ElevatedAction::decode(code, args) {
        Ok(action) => call(ctx, platform, action, return_addr),
        Err(_) => {
            platform.engage_lockdown();
            dispatch_raw(ctx, platform, code, args, return_addr)
        }
    }
}
