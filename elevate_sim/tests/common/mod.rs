// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use elevate_areas::Overlay;
use elevate_core::config::{LocalRegion, RangeCfg, TransitionConfig};
use elevate_core::digest::reference_words;
use elevate_core::ElevatedContext;
use elevate_sim::{SimConfig, SimOverlay, SimPlatform, SoftAes, BACKING_SIZE};

/// A return address in ordinary code.
pub const BASELINE_RET: u32 = 0x0400;
/// A return address inside the configured elevated region.
pub const ELEVATED_RET: u32 = 0x8010;

pub const SEED: [u8; 16] = *b"elevate-test-iv!";
pub const SALT: [u8; 16] = [0x5a; 16];

pub const REGISTERED: [u32; 3] = [0x1000, 0x2000, 0x2100];
pub const UNREGISTERED: [u32; 3] = [0x5000, 0x6000, 0x7300];

pub const STACK_LOW: u32 = 0x2800;
pub const STACK_TOP: u32 = 0x3000;
pub const SCRATCH: u32 = 0x3c00;
pub const BOOKKEEPING: u32 = 0x3f00;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two authorized ranges, `[0x1000, 0x1100)` and `[0x2000, 0x2200)`.
pub fn config() -> TransitionConfig {
    TransitionConfig {
        firmware_version: 2,
        seed: SEED,
        scratch: Some(LocalRegion {
            addr: SCRATCH,
            size: 0x100,
        }),
        ranges: vec![
            RangeCfg {
                start: 0x2000,
                end: 0x2200,
            },
            RangeCfg {
                start: 0x1000,
                end: 0x1100,
            },
        ],
        ..TransitionConfig::default()
    }
}

pub fn overlays() -> Vec<SimOverlay> {
    vec![
        SimOverlay {
            name: Overlay::Kdf,
            start: 0x1000,
            end: 0x1100,
            secure: false,
        },
        SimOverlay {
            name: Overlay::Transition,
            start: 0x2000,
            end: 0x2200,
            secure: false,
        },
    ]
}

/// What the signing authority would provision for `cfg` over the current
/// contents of backing storage.
pub fn sign(cfg: &TransitionConfig, sim: &SimPlatform) -> [u32; 2] {
    let image = sim.backing_bytes(0, BACKING_SIZE);
    let registry = cfg.registry().unwrap();
    reference_words(&mut SoftAes, cfg.seed, &image, 0, &registry)
}

pub fn platform_for(cfg: &TransitionConfig) -> SimPlatform {
    let mut sim = SimPlatform::from_config(&SimConfig::default(), &overlays());
    sim.make_resident(&REGISTERED, false);
    sim.make_resident(&UNREGISTERED, false);
    sim.reference = sign(cfg, &sim);
    sim
}

pub fn setup_with(cfg: TransitionConfig) -> (ElevatedContext, SimPlatform) {
    init_logger();
    let sim = platform_for(&cfg);
    let ctx = ElevatedContext::new(cfg).unwrap();
    (ctx, sim)
}

pub fn setup() -> (ElevatedContext, SimPlatform) {
    setup_with(config())
}
