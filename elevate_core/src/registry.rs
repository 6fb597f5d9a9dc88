// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authorized overlay ranges
//!
//! The signing authority computes its reference digest by walking the
//! authorized ranges in ascending address order, and it assumes the same
//! fixed capacity we use here. Both the ordering and the capacity are
//! therefore part of the signature format.

use crate::Error;
use elevate_areas::TRANSFER_WINDOW;
use log::trace;

/// Must match the number of ranges the signing authority accounts for.
pub const MAX_OVERLAY_RANGES: usize = 8;

/// A half-open address range `[start, end)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OverlayRange {
    start: u32,
    end: u32,
}

impl OverlayRange {
    pub const EMPTY: OverlayRange = OverlayRange { start: 0, end: 0 };

    pub fn new(start: u32, end: u32) -> Result<OverlayRange, Error> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        if start % TRANSFER_WINDOW != 0 || end % TRANSFER_WINDOW != 0 {
            return Err(Error::MisalignedRange {
                start,
                end,
                window: TRANSFER_WINDOW,
            });
        }
        Ok(OverlayRange { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if all of `[base, base + size)` lies inside this range.
    pub fn contains_block(&self, base: u32, size: u32) -> bool {
        match base.checked_add(size) {
            Some(block_end) => self.start <= base && block_end <= self.end,
            None => false,
        }
    }

    pub fn overlaps(&self, other: &OverlayRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

/// Fixed-capacity list of [`OverlayRange`]s kept sorted by start address.
#[derive(Clone, Debug)]
pub struct OverlayRangeRegistry {
    ranges: [OverlayRange; MAX_OVERLAY_RANGES],
    len: usize,
}

impl Default for OverlayRangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayRangeRegistry {
    pub const fn new() -> OverlayRangeRegistry {
        OverlayRangeRegistry {
            ranges: [OverlayRange::EMPTY; MAX_OVERLAY_RANGES],
            len: 0,
        }
    }

    /// Inserts `range` in start-address order.
    ///
    /// On any error the registry is left exactly as it was.
    pub fn insert_sorted(&mut self, range: OverlayRange) -> Result<(), Error> {
        if self.len == MAX_OVERLAY_RANGES {
            return Err(Error::TooManyRanges {
                capacity: MAX_OVERLAY_RANGES,
            });
        }
        if self.as_slice().iter().any(|r| r.overlaps(&range)) {
            return Err(Error::OverlappingRange {
                start: range.start,
                end: range.end,
            });
        }

        let mut i = self.len;
        while i > 0 && self.ranges[i - 1].start > range.start {
            self.ranges[i] = self.ranges[i - 1];
            i -= 1;
        }
        self.ranges[i] = range;
        self.len += 1;

        trace!(
            "registered overlay range {:#x}..{:#x} at slot {i}",
            range.start,
            range.end
        );
        Ok(())
    }

    pub fn as_slice(&self) -> &[OverlayRange] {
        &self.ranges[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the block at `[base, base + size)` is entirely covered by a
    /// registered range.
    pub fn covers_block(&self, base: u32, size: u32) -> bool {
        self.as_slice().iter().any(|r| r.contains_block(base, size))
    }

    pub fn clear(&mut self) {
        self.ranges = [OverlayRange::EMPTY; MAX_OVERLAY_RANGES];
        self.len = 0;
    }
}
