// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use elevate_core::config::TransitionConfig;
use elevate_sim::{SimConfig, SimOverlay, SimPlatform};
use serde::Deserialize;
use std::path::Path;

/// One installation: how the transition is configured and, for
/// `simulate`, what the simulated chip looks like.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Scenario {
    pub transition: TransitionConfig,

    #[serde(default)]
    pub overlay: Vec<SimOverlay>,

    #[serde(default)]
    pub platform: SimConfig,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Scenario> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("could not parse {}", path.display()))
    }

    pub fn platform(&self) -> SimPlatform {
        SimPlatform::from_config(&self.platform, &self.overlay)
    }
}
