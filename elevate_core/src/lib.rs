// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod action;
pub mod block_guard;
pub mod completion;
pub mod config;
pub mod context;
pub mod digest;
pub mod dispatch;
pub mod hal;
pub mod marker;
pub mod prealloc;
pub mod registry;
pub mod session;
pub mod shared;
pub mod stack_guard;
pub mod transition;

pub use context::ElevatedContext;
pub use phase_token::TrustPhase;

use hal::{DmaError, MutexError};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{operation} is not legal with phase register at {register:#010x}")]
    IllegalState {
        operation: &'static str,
        register: u32,
    },

    #[error("overlay digest {computed:08x?} does not match reference {expected:08x?}")]
    SignatureMismatch {
        expected: [u32; 2],
        computed: [u32; 2],
    },

    #[error("protection mask {mask:#010x} is weaker than required")]
    InsufficientProtection { mask: u32 },

    #[error("too many overlay ranges: expected {capacity} or fewer")]
    TooManyRanges { capacity: usize },

    #[error("code cache has {slots} slots, more than the {capacity} we can track")]
    TooManyCodeSlots { slots: usize, capacity: usize },

    #[error("invalid overlay range {start:#x}..{end:#x}")]
    InvalidRange { start: u32, end: u32 },

    #[error("overlay range {start:#x}..{end:#x} is not aligned to {window:#x} bytes")]
    MisalignedRange { start: u32, end: u32, window: u32 },

    #[error("overlay range {start:#x}..{end:#x} overlaps a registered range")]
    OverlappingRange { start: u32, end: u32 },

    #[error("unsupported elevated action {0:#x}")]
    UnsupportedAction(u32),

    #[error("firmware version {version} is below revocation floor {floor}")]
    RevocationFailure { version: u32, floor: u32 },

    #[error("memory transfer error: {0}")]
    Dma(#[from] DmaError),

    #[error("timed out waiting for mutex {0:#x}")]
    MutexTimeout(u8),

    #[error("could not preallocate {bytes} bytes")]
    AllocationFailure { bytes: usize },

    #[error("shared region is not held by this gate")]
    NotHolder,

    #[error("shared region is already held by this gate")]
    AlreadyHeld,

    #[error("struct packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),
}

impl From<MutexError> for Error {
    fn from(e: MutexError) -> Self {
        match e {
            MutexError::Timeout(id) => Error::MutexTimeout(id),
            MutexError::NotOwner(_) => Error::NotHolder,
        }
    }
}
