// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software model of the secure coprocessor.
//!
//! [`SimPlatform`] implements every `elevate_core::hal` trait over plain
//! memory so the transition, dispatcher and gate can run on a host. Most
//! state is public; tests poke at it directly to set up a scenario or to
//! inject a fault.

mod config;
mod mutex;

pub use config::{MutexRoute, SimConfig, SimOverlay};
pub use mutex::SimMutexBank;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use elevate_areas::{Bus, MutexId, Overlay, CODE_BLOCK_SIZE};
use elevate_core::hal::{
    BlockCipher, BusRouter, CodeCache, Dma, DmaError, FatalReason, Halt, HashEngine, HwMutex,
    LocalMemory, MarkError, MutexError, MutexToken, OverlayLoader, Scheduler, SecureRegisters,
    SecurityMarker, StackProbe,
};
use log::trace;
use phase_token::TrustPhase;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const LOCAL_MEMORY_SIZE: usize = 0x4000;
pub const BACKING_SIZE: usize = 0x1_0000;

/// AES-128 in software.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoftAes;

impl BlockCipher for SoftAes {
    fn encrypt(&mut self, key: &[u8; 16], msg: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut block = GenericArray::clone_from_slice(msg);
        cipher.encrypt_block(&mut block);
        block.into()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheSlot {
    pub tag: Option<u32>,
    pub secure: bool,
}

/// A DMA fault that fires on any transfer touching `addr`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaFault {
    pub addr: u32,
    pub error: DmaError,
}

pub type Backing = Arc<Mutex<Vec<u8>>>;

pub struct SimPlatform {
    pub phase: u32,
    pub mask: u32,
    /// Mask bits that read back as zero whatever is written
    pub stuck_clear_bits: u32,
    pub reference: [u32; 2],
    pub fuse_version: u32,
    pub policy_floor: u32,
    pub device_secret: [u8; 16],
    pub rng_rearms: u32,
    pub call_active: bool,
    pub lockdown: bool,
    pub lockdown_releases: u32,

    pub slots: Vec<CacheSlot>,
    pub reload_fault: Option<DmaError>,

    pub local: Vec<u8>,
    pub backing: Backing,
    pub dma_fault: Option<DmaFault>,

    pub marked: Vec<(u32, u32)>,
    pub mark_fault: bool,

    pub stack_pointer: u32,
    pub stack_lower_bound: Option<u32>,

    pub mutexes: Arc<SimMutexBank>,
    pub routes: HashMap<MutexId, Bus>,

    pub suspended: u32,
    pub suspensions: u32,

    pub overlays: HashMap<Overlay, SimOverlay>,
    pub loaded: Vec<Overlay>,
    pub overlay_fault: Option<Overlay>,

    cipher: SoftAes,
    hash: Option<Sha256>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        SimPlatform::new()
    }
}

fn lock(backing: &Backing) -> MutexGuard<'_, Vec<u8>> {
    backing.lock().unwrap_or_else(PoisonError::into_inner)
}

fn span(addr: u32, len: usize, limit: usize) -> Result<core::ops::Range<usize>, DmaError> {
    let start = addr as usize;
    match start.checked_add(len) {
        Some(end) if end <= limit => Ok(start..end),
        _ => Err(DmaError::Failed),
    }
}

impl SimPlatform {
    pub fn new() -> SimPlatform {
        SimPlatform::from_config(&SimConfig::default(), &[])
    }

    pub fn from_config(cfg: &SimConfig, overlays: &[SimOverlay]) -> SimPlatform {
        let mut sim = SimPlatform {
            phase: 0,
            mask: cfg.protection_mask,
            stuck_clear_bits: 0,
            reference: [0; 2],
            fuse_version: cfg.fuse_version,
            policy_floor: cfg.policy_floor,
            device_secret: *b"sim-device-root!",
            rng_rearms: 0,
            call_active: false,
            lockdown: false,
            lockdown_releases: 0,
            slots: vec![CacheSlot::default(); cfg.cache_slots],
            reload_fault: None,
            local: vec![0; LOCAL_MEMORY_SIZE],
            backing: Arc::new(Mutex::new(vec![0; BACKING_SIZE])),
            dma_fault: None,
            marked: Vec::new(),
            mark_fault: false,
            stack_pointer: 0x3000,
            stack_lower_bound: Some(0x2800),
            mutexes: Arc::new(SimMutexBank::new()),
            routes: cfg.routes.iter().map(|r| (r.mutex, r.bus)).collect(),
            suspended: 0,
            suspensions: 0,
            overlays: overlays.iter().map(|o| (o.name, *o)).collect(),
            loaded: Vec::new(),
            overlay_fault: None,
            cipher: SoftAes,
            hash: None,
        };
        sim.make_resident(&cfg.resident, false);
        sim
    }

    /// A second agent on the same chip: shares backing storage and the
    /// mutex bank, nothing else.
    pub fn agent(&self) -> SimPlatform {
        let mut other = SimPlatform::new();
        other.backing = Arc::clone(&self.backing);
        other.mutexes = Arc::clone(&self.mutexes);
        other.routes = self.routes.clone();
        other
    }

    pub fn trust_phase(&self) -> Option<TrustPhase> {
        TrustPhase::from_register(self.phase)
    }

    pub fn load_image(&self, base: u32, image: &[u8]) {
        let mut b = lock(&self.backing);
        let start = base as usize;
        b[start..start + image.len()].copy_from_slice(image);
    }

    pub fn backing_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let b = lock(&self.backing);
        b[addr as usize..addr as usize + len].to_vec()
    }

    /// Places each block base into the first free slot. Blocks that do not
    /// fit are dropped.
    pub fn make_resident(&mut self, bases: &[u32], secure: bool) {
        for &base in bases {
            if let Some(slot) = self.slots.iter_mut().find(|s| s.tag.is_none()) {
                *slot = CacheSlot {
                    tag: Some(base),
                    secure,
                };
            }
        }
    }

    /// Set of block bases currently held in the cache.
    pub fn resident_blocks(&self) -> BTreeSet<u32> {
        self.slots.iter().filter_map(|s| s.tag).collect()
    }

    fn check_fault(&self, addr: u32, len: usize) -> Result<(), DmaError> {
        match self.dma_fault {
            Some(f) if f.addr >= addr && ((f.addr - addr) as usize) < len => Err(f.error),
            _ => Ok(()),
        }
    }
}

impl SecureRegisters for SimPlatform {
    fn phase_register(&self) -> u32 {
        self.phase
    }

    fn set_phase_register(&mut self, raw: u32) {
        self.phase = raw;
    }

    fn protection_mask(&self) -> u32 {
        self.mask
    }

    fn set_protection_mask(&mut self, mask: u32) {
        self.mask = mask & !self.stuck_clear_bits;
    }

    fn reference_signature(&self) -> [u32; 2] {
        self.reference
    }

    fn fuse_version(&self) -> u32 {
        self.fuse_version
    }

    fn policy_floor(&self) -> u32 {
        self.policy_floor
    }

    fn set_policy_floor(&mut self, floor: u32) {
        self.policy_floor = floor;
    }

    fn device_secret(&self) -> [u8; 16] {
        self.device_secret
    }

    fn rearm_rng(&mut self) {
        self.rng_rearms += 1;
    }

    fn elevated_call_active(&self) -> bool {
        self.call_active
    }

    fn set_elevated_call_active(&mut self, active: bool) {
        self.call_active = active;
    }

    fn engage_lockdown(&mut self) {
        self.lockdown = true;
    }

    fn lockdown_engaged(&self) -> bool {
        self.lockdown
    }

    fn release_lockdown(&mut self) {
        self.lockdown = false;
        self.lockdown_releases += 1;
    }
}

impl CodeCache for SimPlatform {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_tag(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).and_then(|s| s.tag)
    }

    fn is_secure(&self, slot: usize) -> bool {
        self.slots.get(slot).map_or(false, |s| s.secure)
    }

    fn evict(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.tag = None;
        }
    }

    fn reload(&mut self, slot: usize, base: u32) -> Result<(), DmaError> {
        if let Some(e) = self.reload_fault {
            return Err(e);
        }
        let s = self.slots.get_mut(slot).ok_or(DmaError::Failed)?;
        s.tag = Some(base);
        Ok(())
    }
}

impl LocalMemory for SimPlatform {
    fn read_local(&self, addr: u32, dst: &mut [u8]) -> Result<(), DmaError> {
        let r = span(addr, dst.len(), self.local.len())?;
        dst.copy_from_slice(&self.local[r]);
        Ok(())
    }

    fn write_local(&mut self, addr: u32, src: &[u8]) -> Result<(), DmaError> {
        let r = span(addr, src.len(), self.local.len())?;
        self.local[r].copy_from_slice(src);
        Ok(())
    }

    fn zero_local(&mut self, addr: u32, len: u32) -> Result<(), DmaError> {
        let r = span(addr, len as usize, self.local.len())?;
        self.local[r].fill(0);
        Ok(())
    }
}

impl Dma for SimPlatform {
    fn read_in(&mut self, dst: &mut [u8], src: u32) -> Result<(), DmaError> {
        self.check_fault(src, dst.len())?;
        let b = lock(&self.backing);
        let r = span(src, dst.len(), b.len())?;
        dst.copy_from_slice(&b[r]);
        Ok(())
    }

    fn write_out(&mut self, dst: u32, src: &[u8]) -> Result<(), DmaError> {
        self.check_fault(dst, src.len())?;
        let mut b = lock(&self.backing);
        let r = span(dst, src.len(), b.len())?;
        b[r].copy_from_slice(src);
        Ok(())
    }
}

impl BlockCipher for SimPlatform {
    fn encrypt(&mut self, key: &[u8; 16], msg: &[u8; 16]) -> [u8; 16] {
        self.cipher.encrypt(key, msg)
    }
}

impl HashEngine for SimPlatform {
    fn hash_start(&mut self) {
        self.hash = Some(Sha256::new());
    }

    fn hash_update(&mut self, data: &[u8]) {
        self.hash.get_or_insert_with(Sha256::new).update(data);
    }

    fn hash_finish(&mut self) -> [u8; 32] {
        self.hash.take().unwrap_or_default().finalize().into()
    }
}

impl SecurityMarker for SimPlatform {
    fn mark(&mut self, addr: u32, size: u32) -> Result<(), MarkError> {
        if self.mark_fault {
            return Err(MarkError { addr, size });
        }
        self.marked.push((addr, size));
        Ok(())
    }

    fn unmark(&mut self, addr: u32, size: u32) {
        self.marked.retain(|&m| m != (addr, size));
    }
}

impl StackProbe for SimPlatform {
    fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    fn stack_lower_bound(&self) -> Option<u32> {
        self.stack_lower_bound
    }
}

impl HwMutex for SimPlatform {
    fn acquire(&self, id: MutexId, timeout: Duration) -> Result<MutexToken, MutexError> {
        self.mutexes.acquire(id, timeout)
    }

    fn release(&self, id: MutexId, token: MutexToken) -> Result<(), MutexError> {
        self.mutexes.release(id, token)
    }
}

impl BusRouter for SimPlatform {
    /// Unrouted mutexes follow their id: elevated-only ids sit on the
    /// restricted bus.
    fn route(&self, id: MutexId) -> Bus {
        match self.routes.get(&id) {
            Some(&bus) => bus,
            None if id.is_elevated_only() => Bus::Restricted,
            None => Bus::Ordinary,
        }
    }
}

impl Scheduler for SimPlatform {
    fn suspend(&mut self) {
        self.suspended += 1;
        self.suspensions += 1;
    }

    fn resume(&mut self) {
        self.suspended = self.suspended.saturating_sub(1);
    }
}

impl OverlayLoader for SimPlatform {
    fn load_overlay(&mut self, overlay: Overlay) -> Result<(), DmaError> {
        if self.overlay_fault == Some(overlay) {
            return Err(DmaError::Failed);
        }
        if let Some(o) = self.overlays.get(&overlay).copied() {
            let bases: Vec<u32> = (o.start..o.end).step_by(CODE_BLOCK_SIZE as usize).collect();
            self.make_resident(&bases, o.secure);
        }
        self.loaded.push(overlay);
        trace!("loaded {overlay:?} overlay");
        Ok(())
    }

    fn unload_overlay(&mut self, overlay: Overlay) {
        if let Some(o) = self.overlays.get(&overlay).copied() {
            for s in self.slots.iter_mut() {
                if matches!(s.tag, Some(t) if t >= o.start && t < o.end) {
                    *s = CacheSlot::default();
                }
            }
        }
        if let Some(i) = self.loaded.iter().rposition(|&l| l == overlay) {
            self.loaded.remove(i);
        }
        trace!("unloaded {overlay:?} overlay");
    }
}

impl Halt for SimPlatform {
    fn halt(&mut self, reason: FatalReason) -> ! {
        panic!("halted: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_aes_matches_fips_197() {
        let key = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let msg = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let expected = [
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
            0xc5, 0x5a,
        ];
        assert_eq!(SoftAes.encrypt(&key, &msg), expected);
    }

    #[test]
    fn dma_fault_fires_inside_transfer_only() {
        let mut sim = SimPlatform::new();
        sim.dma_fault = Some(DmaFault {
            addr: 0x1080,
            error: DmaError::Nack,
        });
        let mut buf = [0u8; 0x80];
        assert_eq!(sim.read_in(&mut buf, 0x1000), Ok(()));
        assert_eq!(sim.read_in(&mut buf, 0x1040), Err(DmaError::Nack));
        assert_eq!(sim.write_out(0x1080, &buf), Err(DmaError::Nack));
    }

    #[test]
    fn overlays_occupy_and_free_slots() {
        let overlays = [SimOverlay {
            name: Overlay::Kdf,
            start: 0x4000,
            end: 0x4200,
            secure: true,
        }];
        let mut sim = SimPlatform::from_config(&SimConfig::default(), &overlays);
        sim.load_overlay(Overlay::Kdf).unwrap();
        assert_eq!(sim.resident_blocks(), BTreeSet::from([0x4000, 0x4100]));
        assert!(sim.is_secure(0));
        sim.unload_overlay(Overlay::Kdf);
        assert!(sim.resident_blocks().is_empty());
        assert!(sim.loaded.is_empty());
    }

    #[test]
    fn agents_share_backing_and_mutexes() {
        let mut a = SimPlatform::new();
        let b = a.agent();
        a.write_out(0x20, &[1, 2, 3]).unwrap();
        assert_eq!(b.backing_bytes(0x20, 3), vec![1, 2, 3]);

        let t = a.acquire(MutexId(1), Duration::ZERO).unwrap();
        assert!(b.mutexes.is_held(MutexId(1)));
        a.release(MutexId(1), t).unwrap();
    }
}
