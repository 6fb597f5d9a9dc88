// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use common::*;
use elevate_areas::{CODE_BLOCK_SIZE, TRANSFER_WINDOW};
use elevate_core::block_guard::MemoryBlockGuard;
use elevate_core::registry::{OverlayRange, OverlayRangeRegistry, MAX_OVERLAY_RANGES};
use elevate_core::transition::{enter, exit, perform_protected_action};
use elevate_core::{Error, TrustPhase};
use elevate_sim::{SimConfig, SimPlatform};
use proptest::prelude::*;

fn range_strategy() -> impl Strategy<Value = (u32, u32)> {
    (0u32..64, 1u32..4).prop_map(|(start, len)| {
        (start * TRANSFER_WINDOW, (start + len) * TRANSFER_WINDOW)
    })
}

#[derive(Copy, Clone, Debug)]
enum Step {
    Enter,
    Protect,
    Exit,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Enter), Just(Step::Protect), Just(Step::Exit)]
}

proptest! {
    #[test]
    fn registry_stays_sorted_and_disjoint(ranges in prop::collection::vec(range_strategy(), 0..24)) {
        let mut reg = OverlayRangeRegistry::new();
        for (start, end) in ranges {
            let before: Vec<OverlayRange> = reg.as_slice().to_vec();
            let range = OverlayRange::new(start, end).unwrap();
            match reg.insert_sorted(range) {
                Ok(()) => prop_assert!(reg.as_slice().contains(&range)),
                Err(Error::TooManyRanges { .. }) => {
                    prop_assert_eq!(before.len(), MAX_OVERLAY_RANGES);
                    prop_assert_eq!(reg.as_slice(), &before[..]);
                }
                Err(Error::OverlappingRange { .. }) => {
                    prop_assert!(before.iter().any(|r| r.overlaps(&range)));
                    prop_assert_eq!(reg.as_slice(), &before[..]);
                }
                Err(e) => prop_assert!(false, "unexpected {e}"),
            }
            let s = reg.as_slice();
            for w in s.windows(2) {
                prop_assert!(w[0].end() <= w[1].start());
            }
        }
    }

    #[test]
    fn evict_then_restore_is_identity(
        blocks in prop::collection::btree_set(0u32..96, 0..32),
        ranges in prop::collection::vec(range_strategy(), 0..6),
    ) {
        let mut reg = OverlayRangeRegistry::new();
        for (start, end) in ranges {
            let _ = reg.insert_sorted(OverlayRange::new(start, end).unwrap());
        }
        let mut sim = SimPlatform::from_config(&SimConfig::default(), &[]);
        let bases: Vec<u32> = blocks.iter().map(|b| b * CODE_BLOCK_SIZE).collect();
        sim.make_resident(&bases, false);
        let before = sim.resident_blocks();

        let mut guard = MemoryBlockGuard::new();
        let evicted = guard.evict_non_registered(&mut sim, &reg).unwrap();
        for base in sim.resident_blocks() {
            prop_assert!(reg.covers_block(base, CODE_BLOCK_SIZE));
        }
        prop_assert_eq!(evicted, before.len() - sim.resident_blocks().len());

        let restored = guard.restore_evicted(&mut sim).unwrap();
        prop_assert_eq!(restored, evicted);
        prop_assert_eq!(sim.resident_blocks(), before);
        prop_assert_eq!(guard.evicted_count(), 0);
    }

    #[test]
    fn phase_follows_the_only_legal_order(steps in prop::collection::vec(step_strategy(), 0..16)) {
        let (mut ctx, mut sim) = setup();
        let mut model = TrustPhase::Idle;
        for step in steps {
            let before = sim.phase;
            let (r, legal_from) = match step {
                Step::Enter => (enter(&mut ctx, &mut sim), TrustPhase::Idle),
                Step::Protect => (
                    perform_protected_action(&mut ctx, &mut sim, &SALT),
                    TrustPhase::Entered,
                ),
                Step::Exit => (exit(&mut ctx, &mut sim), TrustPhase::KeyReady),
            };
            if model == legal_from {
                prop_assert!(r.is_ok(), "{step:?} from {model}: {r:?}");
                model = model.successor();
            } else {
                let illegal = matches!(r, Err(Error::IllegalState { .. }));
                prop_assert!(illegal, "{:?} from {}: {:?}", step, model, r);
                prop_assert_eq!(sim.phase, before);
            }
            prop_assert_eq!(sim.trust_phase(), Some(model));
        }
    }
}
