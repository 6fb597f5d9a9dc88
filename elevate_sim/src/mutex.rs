// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use elevate_areas::MutexId;
use elevate_core::hal::{MutexError, MutexToken};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct BankState {
    held: HashMap<MutexId, u32>,
    next_token: u32,
}

/// A bank of hardware mutexes that several simulated agents can share.
#[derive(Default)]
pub struct SimMutexBank {
    state: Mutex<BankState>,
    freed: Condvar,
}

impl SimMutexBank {
    pub fn new() -> SimMutexBank {
        SimMutexBank::default()
    }

    fn lock(&self) -> MutexGuard<'_, BankState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_held(&self, id: MutexId) -> bool {
        self.lock().held.contains_key(&id)
    }

    /// Blocks until `id` is free or `timeout` has passed.
    pub fn acquire(&self, id: MutexId, timeout: Duration) -> Result<MutexToken, MutexError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.held.contains_key(&id) {
                state.next_token = state.next_token.wrapping_add(1);
                let token = state.next_token;
                state.held.insert(id, token);
                return Ok(MutexToken(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MutexError::Timeout(id.0));
            }
            let (s, _) = self
                .freed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = s;
        }
    }

    pub fn release(&self, id: MutexId, token: MutexToken) -> Result<(), MutexError> {
        let mut state = self.lock();
        match state.held.get(&id) {
            Some(&t) if t == token.0 => {
                state.held.remove(&id);
                drop(state);
                self.freed.notify_all();
                Ok(())
            }
            _ => Err(MutexError::NotOwner(id.0)),
        }
    }
}
