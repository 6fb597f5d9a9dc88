// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Heap reservation ahead of a transition.
//!
//! The entry path must not allocate. Reserving (and then freeing) a block of
//! the size the transition needs before we start proves that the heap can
//! satisfy it, and leaves that block at the front of the free list for
//! whatever baseline code runs next.

use crate::Error;
use log::trace;

#[derive(Debug)]
pub struct Preallocation {
    block: Vec<u8>,
}

impl Preallocation {
    pub fn reserve(bytes: usize) -> Result<Preallocation, Error> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(bytes)
            .map_err(|_| Error::AllocationFailure { bytes })?;
        trace!("preallocated {bytes} bytes");
        Ok(Preallocation { block })
    }

    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Frees the reservation. Must happen before `enter`.
    pub fn release(self) {
        trace!("released {} preallocated bytes", self.block.capacity());
    }
}
