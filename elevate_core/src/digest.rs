// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chained fold digest over authorized overlays.
//!
//! Each 16-byte unit of input is used as the *key* of the block cipher, the
//! running value as the message, and the ciphertext is folded back in:
//!
//! ```text
//! hash = hash ^ E(key = unit, msg = hash)
//! ```
//!
//! There is no finalization step; the running value is the digest. The
//! signing authority runs the same fold offline over the same ranges in the
//! same order to produce the reference words.

use crate::hal::{BlockCipher, Dma};
use crate::registry::{OverlayRange, OverlayRangeRegistry};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use elevate_areas::TRANSFER_WINDOW;
use log::trace;
use zeroize::Zeroize;

pub const DIGEST_UNIT: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Zeroize)]
pub struct ChainedDigest {
    hash: [u8; DIGEST_UNIT],
}

impl ChainedDigest {
    pub fn new(seed: [u8; DIGEST_UNIT]) -> ChainedDigest {
        ChainedDigest { hash: seed }
    }

    pub fn value(&self) -> [u8; DIGEST_UNIT] {
        self.hash
    }

    /// The two words compared against the reference signature.
    pub fn words(&self) -> [u32; 2] {
        [
            LittleEndian::read_u32(&self.hash[0..4]),
            LittleEndian::read_u32(&self.hash[4..8]),
        ]
    }

    /// Folds `block` into the running value. `block` must be a whole number
    /// of units.
    pub fn update<C>(&mut self, cipher: &mut C, block: &[u8])
    where
        C: BlockCipher + ?Sized,
    {
        debug_assert_eq!(block.len() % DIGEST_UNIT, 0);
        for unit in block.chunks_exact(DIGEST_UNIT) {
            let mut key = [0u8; DIGEST_UNIT];
            key.copy_from_slice(unit);
            let e = cipher.encrypt(&key, &self.hash);
            for (h, x) in self.hash.iter_mut().zip(e.iter()) {
                *h ^= x;
            }
            key.zeroize();
        }
    }

    /// Copies `range` in one transfer window at a time and folds each window.
    pub fn digest_overlay<P>(&mut self, platform: &mut P, range: &OverlayRange) -> Result<(), Error>
    where
        P: Dma + BlockCipher + ?Sized,
    {
        let mut window = [0u8; TRANSFER_WINDOW as usize];
        let mut addr = range.start();
        while addr < range.end() {
            platform.read_in(&mut window, addr)?;
            self.update(&mut *platform, &window);
            addr += TRANSFER_WINDOW;
        }
        window.zeroize();
        trace!(
            "digested {:#x}..{:#x}: {:08x?}",
            range.start(),
            range.end(),
            self.words()
        );
        Ok(())
    }

    /// Digests every registered range, lowest address first.
    pub fn digest_registry<P>(&mut self, platform: &mut P, registry: &OverlayRangeRegistry) -> Result<(), Error>
    where
        P: Dma + BlockCipher + ?Sized,
    {
        for range in registry.as_slice() {
            self.digest_overlay(platform, range)?;
        }
        Ok(())
    }
}

/// Computes the reference words for `registry` over an image that is loaded
/// at `base`.
///
/// This is what the signing authority does offline. Bytes of a range that
/// fall outside the image are treated as zero.
pub fn reference_words<C>(
    cipher: &mut C,
    seed: [u8; DIGEST_UNIT],
    image: &[u8],
    base: u32,
    registry: &OverlayRangeRegistry,
) -> [u32; 2]
where
    C: BlockCipher + ?Sized,
{
    let mut digest = ChainedDigest::new(seed);
    let mut window = [0u8; TRANSFER_WINDOW as usize];
    for range in registry.as_slice() {
        let mut addr = range.start();
        while addr < range.end() {
            window.fill(0);
            if let Some(offset) = addr.checked_sub(base) {
                let offset = offset as usize;
                if offset < image.len() {
                    let n = (image.len() - offset).min(window.len());
                    window[..n].copy_from_slice(&image[offset..offset + n]);
                }
            }
            digest.update(cipher, &window);
            addr += TRANSFER_WINDOW;
        }
    }
    digest.words()
}
