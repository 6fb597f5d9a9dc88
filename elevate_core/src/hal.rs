// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the hardware and to the collaborators we do not implement.
//!
//! Everything the transition touches outside of its own bookkeeping goes
//! through one of these traits. A real build implements them over MMIO and
//! the ROM crypto routines; `elevate_sim` implements them in software.

use core::time::Duration;
use elevate_areas::{Bus, MutexId, Overlay};
use thiserror::Error;

/// Failure of the memory-transfer engine.
///
/// A NACK is kept distinct from other failures all the way up, since the
/// protocol layer reports it with its own completion signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("transfer was NACKed by the target")]
    Nack,
    #[error("transfer failed")]
    Failed,
}

/// Marking a region tamper-evident was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("could not mark {size:#x} bytes at {addr:#x} as tamper-evident")]
pub struct MarkError {
    pub addr: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum MutexError {
    #[error("timed out waiting for mutex {0:#x}")]
    Timeout(u8),
    #[error("mutex {0:#x} is not held with that token")]
    NotOwner(u8),
}

/// Proof of ownership handed out by [`HwMutex::acquire`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MutexToken(pub u32);

/// Why the core refused to continue.
///
/// These never come back as an [`crate::Error`]: each one means an assumption
/// the rest of the mechanism relies on has already been broken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FatalReason {
    #[error("re-entrant call into elevated code")]
    ReentrantCall,
    #[error("return address {0:#x} lies inside the elevated region")]
    ReturnIntoElevatedRegion(u32),
    #[error("bookkeeping region could not be marked tamper-evident")]
    MarkFailed,
}

/// Security registers owned by the hardware monitor.
pub trait SecureRegisters {
    fn phase_register(&self) -> u32;
    fn set_phase_register(&mut self, raw: u32);

    fn protection_mask(&self) -> u32;
    fn set_protection_mask(&mut self, mask: u32);

    /// The two reference words provisioned by the signing authority.
    fn reference_signature(&self) -> [u32; 2];

    /// Minimum firmware version burned into fuses.
    fn fuse_version(&self) -> u32;
    /// Anti-rollback floor maintained by policy updates.
    fn policy_floor(&self) -> u32;
    fn set_policy_floor(&mut self, floor: u32);

    /// Root secret; only readable while elevated.
    fn device_secret(&self) -> [u8; 16];

    /// Re-arms the RNG control path after elevated code may have touched it.
    fn rearm_rng(&mut self);

    /// Hardware-visible marker set for the duration of one dispatch, so a
    /// second entry through the elevated entry point can be told apart.
    fn elevated_call_active(&self) -> bool;
    fn set_elevated_call_active(&mut self, active: bool);

    fn engage_lockdown(&mut self);
    fn lockdown_engaged(&self) -> bool;
    fn release_lockdown(&mut self);
}

/// On-chip code cache.
pub trait CodeCache {
    fn slot_count(&self) -> usize;
    /// Base address of the block resident in `slot`, or `None` if the slot
    /// does not hold a valid block.
    fn slot_tag(&self, slot: usize) -> Option<u32>;
    fn is_secure(&self, slot: usize) -> bool;
    fn evict(&mut self, slot: usize);
    fn reload(&mut self, slot: usize, base: u32) -> Result<(), DmaError>;
}

/// Local data memory.
pub trait LocalMemory {
    fn read_local(&self, addr: u32, dst: &mut [u8]) -> Result<(), DmaError>;
    fn write_local(&mut self, addr: u32, src: &[u8]) -> Result<(), DmaError>;
    fn zero_local(&mut self, addr: u32, len: u32) -> Result<(), DmaError>;
}

/// Memory-transfer engine between local memory and backing storage.
pub trait Dma {
    fn read_in(&mut self, dst: &mut [u8], src: u32) -> Result<(), DmaError>;
    fn write_out(&mut self, dst: u32, src: &[u8]) -> Result<(), DmaError>;
}

/// Opaque 128-bit block cipher.
pub trait BlockCipher {
    fn encrypt(&mut self, key: &[u8; 16], msg: &[u8; 16]) -> [u8; 16];
}

/// Opaque streaming SHA-256 engine.
pub trait HashEngine {
    fn hash_start(&mut self);
    fn hash_update(&mut self, data: &[u8]);
    fn hash_finish(&mut self) -> [u8; 32];
}

pub trait SecurityMarker {
    fn mark(&mut self, addr: u32, size: u32) -> Result<(), MarkError>;
    fn unmark(&mut self, addr: u32, size: u32);
}

pub trait StackProbe {
    fn stack_pointer(&self) -> u32;
    /// Lowest address the stack has been permitted to grow to, if the
    /// platform tracks it.
    fn stack_lower_bound(&self) -> Option<u32>;
}

/// Hardware mutex bank shared with the other execution agent.
pub trait HwMutex {
    fn acquire(&self, id: MutexId, timeout: Duration) -> Result<MutexToken, MutexError>;
    fn release(&self, id: MutexId, token: MutexToken) -> Result<(), MutexError>;
}

/// Installation-specific routing of mutexes to buses.
pub trait BusRouter {
    fn route(&self, id: MutexId) -> Bus;
}

/// The small part of the RTOS scheduler we need.
pub trait Scheduler {
    fn suspend(&mut self);
    fn resume(&mut self);
}

pub trait OverlayLoader {
    fn load_overlay(&mut self, overlay: Overlay) -> Result<(), DmaError>;
    fn unload_overlay(&mut self, overlay: Overlay);
}

pub trait Halt {
    fn halt(&mut self, reason: FatalReason) -> !;
}

/// Everything the transition, dispatcher and gate need from the platform.
pub trait Platform:
    SecureRegisters
    + CodeCache
    + LocalMemory
    + Dma
    + BlockCipher
    + HashEngine
    + SecurityMarker
    + StackProbe
    + HwMutex
    + BusRouter
    + Scheduler
    + OverlayLoader
    + Halt
{
}

impl<T> Platform for T where
    T: SecureRegisters
        + CodeCache
        + LocalMemory
        + Dma
        + BlockCipher
        + HashEngine
        + SecurityMarker
        + StackProbe
        + HwMutex
        + BusRouter
        + Scheduler
        + OverlayLoader
        + Halt
{
}

/// Runs `f` with task scheduling suspended, resuming afterwards on every
/// path out of `f`.
pub fn with_scheduling_suspended<P, R>(platform: &mut P, f: impl FnOnce(&mut P) -> R) -> R
where
    P: Scheduler,
{
    platform.suspend();
    let r = f(platform);
    platform.resume();
    r
}
