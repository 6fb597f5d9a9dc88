// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::hal::{FatalReason, Halt, SecurityMarker};
use log::{error, trace};
use serde::Deserialize;

/// Location of the transition's own bookkeeping in local memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SecurityMarkRegion {
    pub addr: u32,
    pub size: u32,
}

impl SecurityMarkRegion {
    /// Marks the region non-downgradable. There is no way to carry on
    /// without this, so failure halts.
    pub fn mark<P>(&self, platform: &mut P)
    where
        P: SecurityMarker + Halt + ?Sized,
    {
        if let Err(e) = platform.mark(self.addr, self.size) {
            error!("{e}");
            platform.halt(FatalReason::MarkFailed);
        }
        trace!("marked {:#x}+{:#x} tamper-evident", self.addr, self.size);
    }

    pub fn unmark<P>(&self, platform: &mut P)
    where
        P: SecurityMarker + ?Sized,
    {
        platform.unmark(self.addr, self.size);
        trace!("unmarked {:#x}+{:#x}", self.addr, self.size);
    }
}
