// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::marker::SecurityMarkRegion;
use crate::registry::{OverlayRange, OverlayRangeRegistry};
use crate::Error;
use core::time::Duration;
use elevate_areas::ProtectionLevels;
use serde::Deserialize;

/// Everything that varies between installations of the transition.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TransitionConfig {
    /// Version of this firmware, checked against fuses and the policy floor
    pub firmware_version: u32,

    /// How many protected actions may run in one entered window
    #[serde(default = "default_max_protected_actions")]
    pub max_protected_actions: u32,

    #[serde(default = "default_mutex_timeout_us")]
    pub mutex_timeout_us: u64,

    /// Size of the heap block reserved ahead of `enter`
    #[serde(default = "default_prealloc_bytes")]
    pub prealloc_bytes: usize,

    /// Initial value of the chained digest, as hex
    #[serde(default, with = "hex")]
    pub seed: [u8; 16],

    /// Code addresses that only run elevated
    pub elevated_region: AddressRange,

    /// Protection levels the mask must have before we lower it
    pub expected_protection: ProtectionLevels,

    /// Protection levels while the window is open
    pub window_protection: ProtectionLevels,

    pub bookkeeping: SecurityMarkRegion,

    /// Elevated-only scratch memory wiped on exit
    #[serde(default)]
    pub scratch: Option<LocalRegion>,

    /// Overlay ranges authorized to stay resident while elevated
    #[serde(default)]
    pub ranges: Vec<RangeCfg>,
}

fn default_max_protected_actions() -> u32 {
    1
}

fn default_mutex_timeout_us() -> u64 {
    1000
}

fn default_prealloc_bytes() -> usize {
    512
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalRegion {
    pub addr: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeCfg {
    pub start: u32,
    pub end: u32,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        TransitionConfig {
            firmware_version: 1,
            max_protected_actions: default_max_protected_actions(),
            mutex_timeout_us: default_mutex_timeout_us(),
            prealloc_bytes: default_prealloc_bytes(),
            seed: [0; 16],
            elevated_region: AddressRange {
                start: 0x8000,
                end: 0x9000,
            },
            expected_protection: ProtectionLevels {
                read_level: 3,
                write_level: 3,
            },
            window_protection: ProtectionLevels {
                read_level: 0,
                write_level: 0,
            },
            bookkeeping: SecurityMarkRegion {
                addr: 0x3f00,
                size: 0x20,
            },
            scratch: None,
            ranges: Vec::new(),
        }
    }
}

impl TransitionConfig {
    pub fn from_toml(s: &str) -> Result<TransitionConfig, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn mutex_timeout(&self) -> Duration {
        Duration::from_micros(self.mutex_timeout_us)
    }

    /// Builds the sorted registry from `ranges`.
    pub fn registry(&self) -> Result<OverlayRangeRegistry, Error> {
        let mut registry = OverlayRangeRegistry::new();
        for r in &self.ranges {
            registry.insert_sorted(OverlayRange::new(r.start, r.end)?)?;
        }
        Ok(registry)
    }
}
