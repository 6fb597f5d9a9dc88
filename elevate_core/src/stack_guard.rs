// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::hal::{LocalMemory, StackProbe};
use crate::Error;
use elevate_areas::{TransitionRecord, RECORD_FLAG_STACK_TRACKED};
use log::{debug, trace};
use zeroize::Zeroize;

/// Stack state captured on entry.
///
/// Elevated code runs on the same stack as its caller, so anything it left
/// below the entry stack pointer has to be wiped before baseline code can
/// look at it again.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Zeroize)]
pub struct StackSnapshot {
    pub saved_pointer: u32,
    pub lower_bound: u32,
    pub supported: bool,
}

impl StackSnapshot {
    pub fn capture<S>(probe: &S) -> StackSnapshot
    where
        S: StackProbe + ?Sized,
    {
        let saved_pointer = probe.stack_pointer();
        match probe.stack_lower_bound() {
            Some(lower_bound) => StackSnapshot {
                saved_pointer,
                lower_bound,
                supported: true,
            },
            None => StackSnapshot {
                saved_pointer,
                lower_bound: 0,
                supported: false,
            },
        }
    }

    pub fn from_record(record: &TransitionRecord) -> StackSnapshot {
        StackSnapshot {
            saved_pointer: record.saved_sp,
            lower_bound: record.lower_bound,
            supported: record.stack_tracked(),
        }
    }

    pub fn store(&self, record: &mut TransitionRecord) {
        record.saved_sp = self.saved_pointer;
        record.lower_bound = self.lower_bound;
        if self.supported {
            record.flags |= RECORD_FLAG_STACK_TRACKED;
        } else {
            record.flags &= !RECORD_FLAG_STACK_TRACKED;
        }
    }

    /// Zeroes `[lower_bound, saved_pointer)` and then the snapshot itself.
    ///
    /// Returns the number of bytes scrubbed; this is 0 when the platform
    /// does not track the stack lower bound.
    pub fn scrub<M>(&mut self, mem: &mut M) -> Result<u32, Error>
    where
        M: LocalMemory + ?Sized,
    {
        if !self.supported {
            trace!("stack bound tracking unsupported; not scrubbing");
            self.zeroize();
            return Ok(0);
        }

        let len = self.saved_pointer.saturating_sub(self.lower_bound);
        if len > 0 {
            mem.zero_local(self.lower_bound, len)?;
            debug!(
                "scrubbed stack {:#x}..{:#x}",
                self.lower_bound, self.saved_pointer
            );
        }
        self.zeroize();
        Ok(len)
    }
}
