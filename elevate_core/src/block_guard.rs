// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code-cache containment
//!
//! Before elevating, every resident code block that is not part of an
//! authorized overlay is evicted so that nothing unsigned can run with the
//! elevated level. The runtime's own residency bookkeeping never sees these
//! evictions, so we remember them here and put the blocks back on the way
//! out.

use crate::hal::CodeCache;
use crate::registry::OverlayRangeRegistry;
use crate::Error;
use elevate_areas::CODE_BLOCK_SIZE;
use log::{trace, warn};
use zeroize::Zeroize;

/// Number of cache slots we can keep eviction records for.
pub const MAX_CODE_SLOTS: usize = 256;

const BITMAP_WORDS: usize = MAX_CODE_SLOTS / 32;

/// Eviction records, indexed by cache slot.
#[derive(Clone, Debug, Zeroize)]
pub struct MemoryBlockGuard {
    bitmap: [u32; BITMAP_WORDS],
    addrs: [u32; MAX_CODE_SLOTS],
}

impl Default for MemoryBlockGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockGuard {
    pub const fn new() -> MemoryBlockGuard {
        MemoryBlockGuard {
            bitmap: [0; BITMAP_WORDS],
            addrs: [0; MAX_CODE_SLOTS],
        }
    }

    pub fn is_evicted(&self, slot: usize) -> bool {
        slot < MAX_CODE_SLOTS && self.bitmap[slot / 32] & (1 << (slot % 32)) != 0
    }

    /// Address recorded for an evicted slot.
    pub fn evicted_address(&self, slot: usize) -> Option<u32> {
        self.is_evicted(slot).then(|| self.addrs[slot])
    }

    pub fn evicted_count(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn record(&mut self, slot: usize, addr: u32) {
        self.bitmap[slot / 32] |= 1 << (slot % 32);
        self.addrs[slot] = addr;
    }

    fn forget(&mut self, slot: usize) {
        self.bitmap[slot / 32] &= !(1 << (slot % 32));
        self.addrs[slot] = 0;
    }

    /// Evicts every valid block that is not covered by `registry`, returning
    /// how many were evicted.
    ///
    /// A cache with more slots than we keep records for is refused before
    /// anything is evicted.
    pub fn evict_non_registered<C>(
        &mut self,
        cache: &mut C,
        registry: &OverlayRangeRegistry,
    ) -> Result<usize, Error>
    where
        C: CodeCache + ?Sized,
    {
        let slots = cache.slot_count();
        if slots > MAX_CODE_SLOTS {
            return Err(Error::TooManyCodeSlots {
                slots,
                capacity: MAX_CODE_SLOTS,
            });
        }

        let mut evicted = 0;
        for slot in 0..slots {
            let Some(base) = cache.slot_tag(slot) else {
                continue;
            };
            if registry.covers_block(base, CODE_BLOCK_SIZE) {
                continue;
            }

            cache.evict(slot);
            self.record(slot, base);
            evicted += 1;
            trace!("evicted slot {slot} ({base:#x})");
        }
        Ok(evicted)
    }

    /// Reloads every block evicted by [`Self::evict_non_registered`], skipping
    /// slots that are now security-marked.
    ///
    /// All records are consumed even if a reload fails; the first failure is
    /// returned.
    pub fn restore_evicted<C>(&mut self, cache: &mut C) -> Result<usize, Error>
    where
        C: CodeCache + ?Sized,
    {
        let mut first_err = None;
        let mut restored = 0;
        let slots = cache.slot_count().min(MAX_CODE_SLOTS);
        for slot in 0..slots {
            let Some(addr) = self.evicted_address(slot) else {
                continue;
            };
            self.forget(slot);

            if cache.is_secure(slot) {
                warn!("slot {slot} ({addr:#x}) is security-marked, leaving it evicted");
                continue;
            }
            match cache.reload(slot, addr) {
                Ok(()) => {
                    restored += 1;
                    trace!("restored slot {slot} ({addr:#x})");
                }
                Err(e) => {
                    warn!("failed to restore slot {slot} ({addr:#x}): {e}");
                    first_err.get_or_insert(Error::Dma(e));
                }
            }
        }
        // Records past the cache's current slot count cannot be reloaded.
        self.zeroize();

        match first_err {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::DmaError;
    use crate::registry::OverlayRange;

    #[derive(Default)]
    struct FakeCache {
        slots: Vec<Option<u32>>,
        secure: Vec<bool>,
        fail_reload: bool,
    }

    impl CodeCache for FakeCache {
        fn slot_count(&self) -> usize {
            self.slots.len()
        }
        fn slot_tag(&self, slot: usize) -> Option<u32> {
            self.slots[slot]
        }
        fn is_secure(&self, slot: usize) -> bool {
            self.secure[slot]
        }
        fn evict(&mut self, slot: usize) {
            self.slots[slot] = None;
        }
        fn reload(&mut self, slot: usize, base: u32) -> Result<(), DmaError> {
            if self.fail_reload {
                return Err(DmaError::Failed);
            }
            self.slots[slot] = Some(base);
            Ok(())
        }
    }

    fn cache(tags: &[Option<u32>]) -> FakeCache {
        FakeCache {
            slots: tags.to_vec(),
            secure: vec![false; tags.len()],
            fail_reload: false,
        }
    }

    fn registry() -> OverlayRangeRegistry {
        let mut reg = OverlayRangeRegistry::new();
        reg.insert_sorted(OverlayRange::new(0x1000, 0x1200).unwrap())
            .unwrap();
        reg
    }

    #[test]
    fn evicts_only_unregistered_blocks() {
        let mut c = cache(&[Some(0x1000), Some(0x4000), None, Some(0x1100)]);
        let mut guard = MemoryBlockGuard::new();

        assert_eq!(guard.evict_non_registered(&mut c, &registry()), Ok(1));
        assert_eq!(c.slots, vec![Some(0x1000), None, None, Some(0x1100)]);
        assert_eq!(guard.evicted_address(1), Some(0x4000));
        assert!(!guard.is_evicted(2));
    }

    #[test]
    fn restore_round_trips() {
        let tags = [Some(0x5000), Some(0x1000), Some(0x9f00), None];
        let mut c = cache(&tags);
        let mut guard = MemoryBlockGuard::new();

        guard.evict_non_registered(&mut c, &registry()).unwrap();
        assert_eq!(guard.restore_evicted(&mut c), Ok(2));
        assert_eq!(c.slots, tags.to_vec());
        assert_eq!(guard.evicted_count(), 0);
    }

    #[test]
    fn secure_slots_are_not_reloaded() {
        let mut c = cache(&[Some(0x5000), Some(0x6000)]);
        let mut guard = MemoryBlockGuard::new();
        guard.evict_non_registered(&mut c, &registry()).unwrap();
        c.secure[0] = true;

        assert_eq!(guard.restore_evicted(&mut c), Ok(1));
        assert_eq!(c.slots, vec![None, Some(0x6000)]);
        assert_eq!(guard.evicted_count(), 0);
    }

    #[test]
    fn reload_failure_still_consumes_records() {
        let mut c = cache(&[Some(0x5000), Some(0x6000)]);
        let mut guard = MemoryBlockGuard::new();
        guard.evict_non_registered(&mut c, &registry()).unwrap();
        c.fail_reload = true;

        assert_eq!(
            guard.restore_evicted(&mut c),
            Err(Error::Dma(DmaError::Failed))
        );
        assert_eq!(guard.evicted_count(), 0);
    }

    #[test]
    fn oversized_cache_is_left_alone() {
        let tags = vec![Some(0x5000); MAX_CODE_SLOTS + 1];
        let mut c = cache(&tags);
        let mut guard = MemoryBlockGuard::new();

        assert_eq!(
            guard.evict_non_registered(&mut c, &OverlayRangeRegistry::new()),
            Err(Error::TooManyCodeSlots {
                slots: MAX_CODE_SLOTS + 1,
                capacity: MAX_CODE_SLOTS,
            })
        );
        assert_eq!(c.slots, tags);
        assert_eq!(guard.evicted_count(), 0);
    }
}
