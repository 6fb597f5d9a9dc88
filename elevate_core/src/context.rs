// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide state of the elevated-trust mechanism.
//!
//! There is exactly one [`ElevatedContext`] per firmware image. It is built
//! during init, passed by `&mut` to every transition, dispatch and gate call,
//! and torn down (zeroizing anything secret) when the image shuts down. The
//! scheduling suspension inside `enter`/`exit` is the only thing that keeps
//! other tasks away from it mid-transition.

use crate::block_guard::MemoryBlockGuard;
use crate::config::TransitionConfig;
use crate::registry::{OverlayRange, OverlayRangeRegistry};
use crate::Error;
use elevate_areas::{Overlay, TransitionRecord};
use log::debug;
use zeroize::{Zeroize, Zeroizing};

pub struct ElevatedContext {
    pub(crate) config: TransitionConfig,
    pub(crate) registry: OverlayRangeRegistry,
    pub(crate) guard: MemoryBlockGuard,
    pub(crate) session_key: Zeroizing<[u8; 16]>,
    pub(crate) actions_in_window: u32,
    pub(crate) cleanup_count: u64,
    pub(crate) transition_overlays: Vec<Overlay>,
}

impl ElevatedContext {
    pub fn new(config: TransitionConfig) -> Result<ElevatedContext, Error> {
        let registry = config.registry()?;
        let bk = config.bookkeeping;
        if (bk.size as usize) < TransitionRecord::SIZE {
            return Err(Error::InvalidRange {
                start: bk.addr,
                end: bk.addr.saturating_add(bk.size),
            });
        }
        debug!(
            "elevated context with {} overlay range(s), fw version {}",
            registry.len(),
            config.firmware_version
        );
        Ok(ElevatedContext {
            config,
            registry,
            guard: MemoryBlockGuard::new(),
            session_key: Zeroizing::new([0; 16]),
            actions_in_window: 0,
            cleanup_count: 0,
            transition_overlays: Vec::with_capacity(8),
        })
    }

    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    pub fn registry(&self) -> &OverlayRangeRegistry {
        &self.registry
    }

    /// Adds an authorized range. Only meaningful while no transition is in
    /// flight; the digest is computed over whatever is registered at `enter`.
    pub fn register_range(&mut self, range: OverlayRange) -> Result<(), Error> {
        self.registry.insert_sorted(range)
    }

    pub fn block_guard(&self) -> &MemoryBlockGuard {
        &self.guard
    }

    /// Key produced by the most recent protected action. Zero outside an
    /// entered window.
    pub fn session_key(&self) -> &[u8; 16] {
        &self.session_key
    }

    pub fn actions_in_window(&self) -> u32 {
        self.actions_in_window
    }

    /// Number of times the dispatcher's cleanup step has run.
    pub fn cleanup_count(&self) -> u64 {
        self.cleanup_count
    }

    /// Overlays kept resident by an in-flight transition.
    pub fn transition_overlays(&self) -> &[Overlay] {
        &self.transition_overlays
    }

    pub fn teardown(mut self) {
        self.session_key.zeroize();
        self.guard.zeroize();
        self.registry.clear();
        self.transition_overlays.clear();
        debug!("elevated context torn down");
    }
}
