// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitfield::bitfield;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};

/// Size of one code-cache block, in bytes.
pub const CODE_BLOCK_SIZE: u32 = 0x100;

/// Size of one DMA transfer window, in bytes. Overlay ranges must be
/// aligned to this.
pub const TRANSFER_WINDOW: u32 = 0x100;

bitfield! {
    /// Protection mask register
    ///
    /// The register is mostly opaque to us; the only sub-fields we look at
    /// are the minimum privilege levels required to read and to write the
    /// protected region. Everything else is carried through untouched.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ProtectionMask(u32);
    impl Debug;
    pub u8, read_level, set_read_level: 3, 0;
    pub u8, write_level, set_write_level: 7, 4;
}

impl ProtectionMask {
    pub fn levels(&self) -> ProtectionLevels {
        ProtectionLevels {
            read_level: self.read_level(),
            write_level: self.write_level(),
        }
    }

    /// Returns a copy of this mask with both levels replaced, leaving the
    /// opaque bits alone.
    pub fn with_levels(mut self, levels: ProtectionLevels) -> ProtectionMask {
        self.set_read_level(levels.read_level);
        self.set_write_level(levels.write_level);
        self
    }
}

/// The two protection levels we inspect in [`ProtectionMask`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProtectionLevels {
    pub read_level: u8,
    pub write_level: u8,
}

impl ProtectionLevels {
    /// A mask is weaker than expected if either level admits a lower
    /// privilege than `expected` requires.
    pub fn is_weaker_than(&self, expected: &ProtectionLevels) -> bool {
        self.read_level < expected.read_level || self.write_level < expected.write_level
    }
}

/// Set in [`TransitionRecord::flags`] when the stack lower bound is valid.
pub const RECORD_FLAG_STACK_TRACKED: u32 = 1 << 0;

/// Marker at the start of a live [`TransitionRecord`].
pub const RECORD_MAGIC: u32 = 0x7e1e_7a7e;

/// Bookkeeping kept in local memory for the duration of a transition.
///
/// This is the structure that gets marked tamper-evident on entry; anything
/// `exit` needs to put the world back is read from here rather than trusted
/// from ordinary memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "20", endian = "lsb", bit_numbering = "msb0")]
pub struct TransitionRecord {
    pub magic: u32,
    pub saved_mask: u32,
    pub saved_sp: u32,
    pub lower_bound: u32,
    pub flags: u32,
}

impl TransitionRecord {
    pub const SIZE: usize = 20;

    pub fn stack_tracked(&self) -> bool {
        self.flags & RECORD_FLAG_STACK_TRACKED != 0
    }
}

/// First mutex identifier that can only be reached over the restricted bus.
pub const ELEVATED_MUTEX_BASE: u8 = 0x80;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct MutexId(pub u8);

impl MutexId {
    pub fn is_elevated_only(&self) -> bool {
        self.0 >= ELEVATED_MUTEX_BASE
    }
}

/// Which bus a mutex is wired to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Bus {
    /// Reachable from baseline code directly
    Ordinary,
    /// Only reachable while elevated
    Restricted,
}

/// Independently loadable code overlays used by elevated actions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Overlay {
    /// Key derivation
    Kdf,
    /// SHA-256 digesting
    Sha,
    /// Shared structure setup
    SharedStruct,
    /// Anti-rollback policy updates
    Policy,
    /// The multi-call trust transition itself
    Transition,
    /// Restricted-bus mutex access
    Mutex,
}
