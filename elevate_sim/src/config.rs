// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use elevate_areas::{Bus, MutexId, Overlay};
use serde::Deserialize;

/// Where an overlay's code lives in backing storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SimOverlay {
    pub name: Overlay,
    pub start: u32,
    pub end: u32,
    /// Blocks loaded from this overlay carry the cache's secure bit
    #[serde(default)]
    pub secure: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MutexRoute {
    pub mutex: MutexId,
    pub bus: Bus,
}

/// Power-on state of the simulated coprocessor.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default = "default_fuse_version")]
    pub fuse_version: u32,
    #[serde(default)]
    pub policy_floor: u32,
    #[serde(default = "default_protection_mask")]
    pub protection_mask: u32,
    #[serde(default = "default_cache_slots")]
    pub cache_slots: usize,
    /// Code blocks resident before the first call
    #[serde(default)]
    pub resident: Vec<u32>,
    #[serde(default)]
    pub routes: Vec<MutexRoute>,
}

fn default_fuse_version() -> u32 {
    1
}

fn default_protection_mask() -> u32 {
    0xa500_0033
}

fn default_cache_slots() -> usize {
    32
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            fuse_version: default_fuse_version(),
            policy_floor: 0,
            protection_mask: default_protection_mask(),
            cache_slots: default_cache_slots(),
            resident: Vec::new(),
            routes: Vec::new(),
        }
    }
}
