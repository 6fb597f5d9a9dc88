// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory shared with the other execution agent.
//!
//! A [`SharedRegionGate`] owns a local staging copy of one region of backing
//! storage and the hardware mutex that serializes it. While the mutex is held
//! the caller works on the staged bytes; release writes them back first and
//! only then gives up the mutex.
//!
//! Which bus a mutex is reached over is installation-specific. Ordinary
//! mutexes are taken directly; restricted ones only through the elevated
//! dispatcher.

use crate::action::{ActionCode, ElevatedAction};
use crate::context::ElevatedContext;
use crate::hal::{Dma, MutexToken, Platform};
use crate::session;
use crate::Error;
use byteorder::LittleEndian;
use crc_any::CRCu32;
use elevate_areas::{Bus, MutexId, TRANSFER_WINDOW};
use log::{debug, trace, warn};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, U32};
use zeroize::Zeroize;

/// Marker at the start of an initialized shared struct.
pub const SHARED_STRUCT_MAGIC: u32 = 0x5ead_c0de;
pub const SHARED_STRUCT_VERSION: u32 = 1;

/// Header laid down by the shared-struct initialization action.
#[derive(Debug, Clone, FromBytes, AsBytes)]
#[repr(C)]
pub struct SharedStructHeader {
    magic: U32<LittleEndian>,
    version: U32<LittleEndian>,
    payload_len: U32<LittleEndian>,
    crc: U32<LittleEndian>,
}

pub const SHARED_STRUCT_HEADER_SIZE: usize = core::mem::size_of::<SharedStructHeader>();

fn payload_crc(payload: &[u8]) -> u32 {
    let mut crc = CRCu32::crc32();
    crc.digest(payload);
    crc.get_crc()
}

impl SharedStructHeader {
    pub fn new(payload: &[u8]) -> SharedStructHeader {
        SharedStructHeader {
            magic: U32::new(SHARED_STRUCT_MAGIC),
            version: U32::new(SHARED_STRUCT_VERSION),
            payload_len: U32::new(payload.len() as u32),
            crc: U32::new(payload_crc(payload)),
        }
    }

    /// Reads the header at the front of `bytes`, if there is one.
    pub fn parse(bytes: &[u8]) -> Option<SharedStructHeader> {
        let (header, _) = LayoutVerified::<_, SharedStructHeader>::new_from_prefix(bytes)?;
        if header.magic.get() != SHARED_STRUCT_MAGIC {
            return None;
        }
        Some(header.into_ref().clone())
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn payload_len(&self) -> u32 {
        self.payload_len.get()
    }

    pub fn crc(&self) -> u32 {
        self.crc.get()
    }

    /// True if `bytes` holds a header whose CRC matches the payload after it.
    pub fn is_intact(bytes: &[u8]) -> bool {
        match SharedStructHeader::parse(bytes) {
            Some(h) => {
                let end = SHARED_STRUCT_HEADER_SIZE + h.payload_len() as usize;
                end <= bytes.len() && payload_crc(&bytes[SHARED_STRUCT_HEADER_SIZE..end]) == h.crc()
            }
            None => false,
        }
    }

    /// Recomputes the CRC of a staged struct in place. Returns false, leaving
    /// `bytes` untouched, if there is no header or its payload does not fit.
    pub fn seal(bytes: &mut [u8]) -> bool {
        let len = match SharedStructHeader::parse(bytes) {
            Some(h) => h.payload_len() as usize,
            None => return false,
        };
        let end = SHARED_STRUCT_HEADER_SIZE + len;
        if end > bytes.len() {
            return false;
        }
        let header = SharedStructHeader::new(&bytes[SHARED_STRUCT_HEADER_SIZE..end]);
        bytes[..SHARED_STRUCT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        true
    }
}

/// Writes an empty shared struct of `len` bytes, header included, to `dst`.
pub fn init_shared_struct<P>(platform: &mut P, dst: u32, len: u32) -> Result<(), Error>
where
    P: Dma + ?Sized,
{
    let header_len = SHARED_STRUCT_HEADER_SIZE as u32;
    let end = dst.checked_add(len).ok_or(Error::InvalidRange {
        start: dst,
        end: u32::MAX,
    })?;
    if len < header_len {
        return Err(Error::InvalidRange { start: dst, end });
    }

    let zeros = [0u8; TRANSFER_WINDOW as usize];
    let payload_len = (len - header_len) as usize;
    let mut crc = CRCu32::crc32();
    let mut left = payload_len;
    while left > 0 {
        let n = left.min(zeros.len());
        crc.digest(&zeros[..n]);
        left -= n;
    }
    let header = SharedStructHeader {
        magic: U32::new(SHARED_STRUCT_MAGIC),
        version: U32::new(SHARED_STRUCT_VERSION),
        payload_len: U32::new(payload_len as u32),
        crc: U32::new(crc.get_crc()),
    };
    platform.write_out(dst, header.as_bytes())?;

    let mut addr = dst + header_len;
    while addr < end {
        let n = (end - addr).min(TRANSFER_WINDOW);
        platform.write_out(addr, &zeros[..n as usize])?;
        addr += n;
    }
    debug!("initialized shared struct at {dst:#x}, {payload_len} byte payload");
    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedRegion {
    /// Address in backing storage
    pub backing: u32,
    pub len: u32,
    pub mutex: MutexId,
}

#[derive(Copy, Clone, Debug)]
struct Held {
    token: MutexToken,
    bus: Bus,
}

pub struct SharedRegionGate {
    region: SharedRegion,
    staged: Vec<u8>,
    held: Option<Held>,
}

impl SharedRegionGate {
    pub fn new(region: SharedRegion) -> SharedRegionGate {
        SharedRegionGate {
            region,
            staged: vec![0; region.len as usize],
            held: None,
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Staged contents. Only available while held.
    pub fn contents(&self) -> Result<&[u8], Error> {
        match self.held {
            Some(_) => Ok(&self.staged),
            None => Err(Error::NotHolder),
        }
    }

    pub fn contents_mut(&mut self) -> Result<&mut [u8], Error> {
        match self.held {
            Some(_) => Ok(&mut self.staged),
            None => Err(Error::NotHolder),
        }
    }

    /// Takes the region's mutex and copies the region in.
    ///
    /// If the copy fails the mutex is still held; the caller decides whether
    /// to retry or to [`release`](SharedRegionGate::release).
    pub fn acquire<P: Platform>(
        &mut self,
        ctx: &mut ElevatedContext,
        platform: &mut P,
        caller: u32,
    ) -> Result<(), Error> {
        if self.held.is_some() {
            return Err(Error::AlreadyHeld);
        }

        let id = self.region.mutex;
        let timeout = ctx.config.mutex_timeout();
        let bus = platform.route(id);
        let token = match bus {
            Bus::Ordinary => platform.acquire(id, timeout)?,
            Bus::Restricted => {
                session::call(ctx, platform, ElevatedAction::MutexAcquire { id, timeout }, caller)?
                    .into_token()
                    .ok_or(Error::UnsupportedAction(ActionCode::MutexAcquire as u32))?
            }
        };
        self.held = Some(Held { token, bus });
        trace!("mutex {:#x} taken over {bus:?} bus", id.0);

        platform.read_in(&mut self.staged, self.region.backing)?;
        if !SharedStructHeader::is_intact(&self.staged) {
            trace!("region at {:#x} holds no intact shared struct", self.region.backing);
        }
        Ok(())
    }

    /// Writes the staged copy back and gives up the mutex.
    ///
    /// The mutex is released even if the write-back fails; the write-back
    /// error is the one reported. If the mutex itself cannot be released the
    /// gate keeps its token and staged copy so the release can be retried.
    pub fn release<P: Platform>(
        &mut self,
        ctx: &mut ElevatedContext,
        platform: &mut P,
        caller: u32,
    ) -> Result<(), Error> {
        let held = self.held.ok_or(Error::NotHolder)?;
        let id = self.region.mutex;

        SharedStructHeader::seal(&mut self.staged);
        let flushed = platform.write_out(self.region.backing, &self.staged);
        if let Err(e) = &flushed {
            warn!("write-back of region at {:#x} failed: {e}", self.region.backing);
        }

        let released = match held.bus {
            Bus::Ordinary => platform.release(id, held.token).map_err(Error::from),
            Bus::Restricted => session::call(
                ctx,
                platform,
                ElevatedAction::MutexRelease {
                    id,
                    token: held.token,
                },
                caller,
            )
            .map(|_| ()),
        };

        match &released {
            // NotHolder means the hardware no longer knows our token.
            Ok(()) | Err(Error::NotHolder) => {
                self.held = None;
                self.staged.zeroize();
                self.staged.resize(self.region.len as usize, 0);
                trace!("mutex {:#x} released", id.0);
            }
            Err(e) => warn!("mutex {:#x} still held: {e}", id.0),
        }

        flushed?;
        released
    }
}
