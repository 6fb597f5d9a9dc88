// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use common::*;
use elevate_areas::{ProtectionMask, TransitionRecord};
use elevate_core::completion::CompletionSignal;
use elevate_core::hal::{BlockCipher, DmaError};
use elevate_core::transition::{enter, exit, perform_protected_action};
use elevate_core::{Error, TrustPhase};
use elevate_core::block_guard::MAX_CODE_SLOTS;
use elevate_sim::{DmaFault, SimConfig, SimPlatform, SoftAes};
use packed_struct::prelude::*;
use std::collections::BTreeSet;

fn all_resident() -> BTreeSet<u32> {
    REGISTERED.iter().chain(UNREGISTERED.iter()).copied().collect()
}

fn record_bytes(sim: &elevate_sim::SimPlatform) -> &[u8] {
    let at = BOOKKEEPING as usize;
    &sim.local[at..at + TransitionRecord::SIZE]
}

#[test]
fn matching_reference_opens_window() {
    let (mut ctx, mut sim) = setup();
    let mask = sim.mask;

    enter(&mut ctx, &mut sim).unwrap();

    assert_eq!(sim.trust_phase(), Some(TrustPhase::Entered));
    let lowered = ProtectionMask(sim.mask);
    assert_eq!((lowered.read_level(), lowered.write_level()), (0, 0));
    assert_eq!(sim.mask & !0xff, mask & !0xff);
    assert_eq!(sim.resident_blocks(), BTreeSet::from(REGISTERED));
    assert_eq!(ctx.block_guard().evicted_count(), UNREGISTERED.len());
    assert_eq!(sim.marked, vec![(BOOKKEEPING, 0x20)]);
    assert_eq!((sim.suspended, sim.suspensions), (0, 1));

    let record = TransitionRecord::unpack_from_slice(record_bytes(&sim)).unwrap();
    assert_eq!(record.saved_mask, mask);
    assert_eq!(record.saved_sp, STACK_TOP);
    assert!(record.stack_tracked());
}

#[test]
fn any_flipped_reference_bit_is_rejected() {
    for (word, bit) in [(0, 0), (0, 31), (1, 7), (1, 16)] {
        let (mut ctx, mut sim) = setup();
        let mask = sim.mask;
        sim.reference[word] ^= 1 << bit;

        let r = enter(&mut ctx, &mut sim);
        assert!(
            matches!(r, Err(Error::SignatureMismatch { .. })),
            "word {word} bit {bit}: {r:?}"
        );
        assert_eq!(sim.phase, 0);
        assert_eq!(sim.mask, mask);
        assert_eq!(sim.resident_blocks(), all_resident());
        assert!(sim.marked.is_empty());
        assert!(record_bytes(&sim).iter().all(|&b| b == 0));
        assert_eq!(sim.suspended, 0);
    }
}

#[test]
fn code_changed_after_signing_is_rejected() {
    let (mut ctx, mut sim) = setup();
    sim.load_image(0x2180, &[0x01]);
    assert!(matches!(
        enter(&mut ctx, &mut sim),
        Err(Error::SignatureMismatch { .. })
    ));

    // Unregistered code is not covered.
    let (mut ctx, mut sim) = setup();
    sim.load_image(0x5000, &[0xff; 0x100]);
    enter(&mut ctx, &mut sim).unwrap();
}

#[test]
fn empty_registry_never_verifies() {
    let mut cfg = config();
    cfg.ranges.clear();
    let (mut ctx, mut sim) = setup_with(cfg);

    // Digest of nothing is just the seed; that must not be enough.
    let seed_words = [
        u32::from_le_bytes([SEED[0], SEED[1], SEED[2], SEED[3]]),
        u32::from_le_bytes([SEED[4], SEED[5], SEED[6], SEED[7]]),
    ];
    for reference in [seed_words, [0, 0], [0xdead_beef, 1]] {
        sim.reference = reference;
        assert!(matches!(
            enter(&mut ctx, &mut sim),
            Err(Error::SignatureMismatch { .. })
        ));
        assert_eq!(sim.trust_phase(), Some(TrustPhase::Idle));
    }
}

#[test]
fn weak_protection_blocks_entry() {
    let (mut ctx, mut sim) = setup();
    sim.mask = 0xa500_0013;

    assert_eq!(
        enter(&mut ctx, &mut sim),
        Err(Error::InsufficientProtection { mask: 0xa500_0013 })
    );
    assert_eq!(sim.mask, 0xa500_0013);
    assert_eq!(sim.phase, 0);
    assert_eq!(sim.resident_blocks(), all_resident());
}

#[test]
fn out_of_order_calls_leave_phase_alone() {
    let (mut ctx, mut sim) = setup();

    assert!(matches!(
        exit(&mut ctx, &mut sim),
        Err(Error::IllegalState { operation: "exit", .. })
    ));
    assert!(matches!(
        perform_protected_action(&mut ctx, &mut sim, &SALT),
        Err(Error::IllegalState { .. })
    ));
    assert_eq!(sim.phase, 0);

    enter(&mut ctx, &mut sim).unwrap();
    let entered = sim.phase;
    assert!(matches!(enter(&mut ctx, &mut sim), Err(Error::IllegalState { .. })));
    assert!(matches!(exit(&mut ctx, &mut sim), Err(Error::IllegalState { .. })));
    assert_eq!(sim.phase, entered);

    perform_protected_action(&mut ctx, &mut sim, &SALT).unwrap();
    let key_ready = sim.phase;
    assert!(matches!(
        perform_protected_action(&mut ctx, &mut sim, &SALT),
        Err(Error::IllegalState { .. })
    ));
    assert!(matches!(enter(&mut ctx, &mut sim), Err(Error::IllegalState { .. })));
    assert_eq!(sim.phase, key_ready);
    assert_eq!(sim.trust_phase(), Some(TrustPhase::KeyReady));
}

#[test]
fn undefined_phase_register_is_illegal() {
    let (mut ctx, mut sim) = setup();
    sim.phase = 0x1234_5678;
    assert_eq!(
        enter(&mut ctx, &mut sim),
        Err(Error::IllegalState {
            operation: "enter",
            register: 0x1234_5678
        })
    );
}

#[test]
fn full_cycle_restores_everything() {
    let (mut ctx, mut sim) = setup();
    let mask = sim.mask;

    enter(&mut ctx, &mut sim).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &SALT).unwrap();
    let expected_key = SoftAes.encrypt(&sim.device_secret, &SALT);
    assert_eq!(ctx.session_key(), &expected_key);

    // What the window leaves lying around.
    sim.local[STACK_LOW as usize - 1] = 0xee;
    sim.local[STACK_LOW as usize..STACK_TOP as usize].fill(0xcc);
    sim.local[STACK_TOP as usize] = 0xdd;
    sim.local[SCRATCH as usize..SCRATCH as usize + 0x100].fill(0xab);

    exit(&mut ctx, &mut sim).unwrap();

    assert_eq!(sim.trust_phase(), Some(TrustPhase::Idle));
    assert_eq!(sim.mask, mask);
    assert!(sim.local[STACK_LOW as usize..STACK_TOP as usize]
        .iter()
        .all(|&b| b == 0));
    assert_eq!(sim.local[STACK_LOW as usize - 1], 0xee);
    assert_eq!(sim.local[STACK_TOP as usize], 0xdd);
    assert!(sim.local[SCRATCH as usize..SCRATCH as usize + 0x100]
        .iter()
        .all(|&b| b == 0));
    assert_eq!(ctx.session_key(), &[0; 16]);
    assert_eq!(ctx.actions_in_window(), 0);
    assert_eq!(sim.resident_blocks(), all_resident());
    assert_eq!(ctx.block_guard().evicted_count(), 0);
    assert!(sim.marked.is_empty());
    assert!(record_bytes(&sim).iter().all(|&b| b == 0));
    assert_eq!((sim.suspended, sim.suspensions), (0, 2));

    // And the next window opens the same way.
    enter(&mut ctx, &mut sim).unwrap();
}

#[test]
fn mask_that_does_not_read_back_keeps_key_ready() {
    let (mut ctx, mut sim) = setup();
    enter(&mut ctx, &mut sim).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &SALT).unwrap();

    sim.stuck_clear_bits = 0x30;
    assert_eq!(
        exit(&mut ctx, &mut sim),
        Err(Error::InsufficientProtection { mask: 0xa500_0003 })
    );
    assert_eq!(sim.trust_phase(), Some(TrustPhase::KeyReady));
    assert_eq!(sim.suspended, 0);
}

#[test]
fn untracked_stack_is_left_alone() {
    let (mut ctx, mut sim) = setup();
    sim.stack_lower_bound = None;

    enter(&mut ctx, &mut sim).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &SALT).unwrap();
    sim.local[STACK_LOW as usize..STACK_TOP as usize].fill(0xcc);
    exit(&mut ctx, &mut sim).unwrap();

    assert!(sim.local[STACK_LOW as usize..STACK_TOP as usize]
        .iter()
        .all(|&b| b == 0xcc));
}

#[test]
fn reload_failure_is_reported_once_idle() {
    let (mut ctx, mut sim) = setup();
    let mask = sim.mask;
    enter(&mut ctx, &mut sim).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &SALT).unwrap();

    sim.reload_fault = Some(DmaError::Failed);
    assert_eq!(
        exit(&mut ctx, &mut sim),
        Err(Error::Dma(DmaError::Failed))
    );
    assert_eq!(sim.trust_phase(), Some(TrustPhase::Idle));
    assert_eq!(sim.mask, mask);
    assert_eq!(ctx.session_key(), &[0; 16]);
    assert!(sim.marked.is_empty());
}

#[test]
fn nack_while_digesting_unwinds_entry() {
    let (mut ctx, mut sim) = setup();
    sim.dma_fault = Some(DmaFault {
        addr: 0x2100,
        error: DmaError::Nack,
    });

    let r = enter(&mut ctx, &mut sim);
    assert_eq!(r, Err(Error::Dma(DmaError::Nack)));
    assert_eq!(CompletionSignal::from_result(&r), CompletionSignal::Nack);
    assert_eq!(sim.phase, 0);
    assert_eq!(sim.resident_blocks(), all_resident());
    assert!(sim.marked.is_empty());
}

#[test]
#[should_panic(expected = "tamper-evident")]
fn mark_failure_halts() {
    let (mut ctx, mut sim) = setup();
    sim.mark_fault = true;
    let _ = enter(&mut ctx, &mut sim);
}

#[test]
fn configured_limit_allows_repeated_actions() {
    let mut cfg = config();
    cfg.max_protected_actions = 2;
    let (mut ctx, mut sim) = setup_with(cfg);

    enter(&mut ctx, &mut sim).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &[1; 16]).unwrap();
    perform_protected_action(&mut ctx, &mut sim, &[2; 16]).unwrap();
    assert_eq!(ctx.actions_in_window(), 2);
    assert_eq!(ctx.session_key(), &SoftAes.encrypt(&sim.device_secret, &[2; 16]));
    assert!(matches!(
        perform_protected_action(&mut ctx, &mut sim, &[3; 16]),
        Err(Error::IllegalState { .. })
    ));
    exit(&mut ctx, &mut sim).unwrap();
}

/// AES-128 fold of 48 zero units, seeded with `SEED`, computed independently
/// of this crate.
const ZERO_FILLED_REFERENCE: [u32; 2] = [0x3bce_edae, 0x71bb_ea14];

#[test]
fn zero_filled_example_matches_known_answer() {
    let cfg = config();
    assert_eq!(sign(&cfg, &platform_for(&cfg)), ZERO_FILLED_REFERENCE);

    let (mut ctx, mut sim) = setup();
    sim.reference = ZERO_FILLED_REFERENCE;
    enter(&mut ctx, &mut sim).unwrap();
    assert_eq!(sim.trust_phase(), Some(TrustPhase::Entered));
}

#[test]
fn untrackable_cache_is_refused_before_eviction() {
    init_logger();
    let cfg = config();
    let platform = SimConfig {
        cache_slots: MAX_CODE_SLOTS + 44,
        ..SimConfig::default()
    };
    let mut sim = SimPlatform::from_config(&platform, &overlays());
    sim.make_resident(&UNREGISTERED, false);
    sim.reference = sign(&cfg, &sim);
    let mut ctx = elevate_core::ElevatedContext::new(cfg).unwrap();

    assert_eq!(
        enter(&mut ctx, &mut sim),
        Err(Error::TooManyCodeSlots {
            slots: MAX_CODE_SLOTS + 44,
            capacity: MAX_CODE_SLOTS,
        })
    );
    assert_eq!(sim.phase, 0);
    assert_eq!(sim.resident_blocks(), BTreeSet::from(UNREGISTERED));
    assert!(sim.marked.is_empty());
    assert!(record_bytes(&sim).iter().all(|&b| b == 0));
}
