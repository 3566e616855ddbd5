// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the FTL-side collaborators of the scheduler core.
//!
//! The scheduler does not own the page cache, the logical-to-physical map,
//! or the in-memory bad-block table; it reaches them through the traits
//! here. The traits deliberately expose only what the core consumes, so the
//! FTL's replacement policy, map maintenance, and table persistence stay on
//! the far side of the boundary.

#![cfg_attr(not(test), no_std)]

use drv_petrel_flash_api::SECTOR_BYTES;
use drv_petrel_hostdma_api::DmaFlight;

/// Handle to one page-buffer entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufId(pub u16);

/// The LRU page buffer: a cache of recently read or written flash pages,
/// one NAND page per entry.
pub trait PageBuffer {
    /// Probes the cache for `lpa`, touching the entry on hit.
    fn check_hit(&mut self, lpa: u32) -> Option<BufId>;

    /// Allocates (possibly evicting) an entry for `lpa`.
    fn allocate(&mut self, lpa: u32) -> BufId;

    /// Page contents of an entry.
    fn page(&self, buf: BufId) -> &[u8];

    /// Mutable page contents of an entry.
    fn page_mut(&mut self, buf: BufId) -> &mut [u8];

    /// One sector of an entry, for per-sector DMA.
    fn sector_mut(&mut self, buf: BufId, sector: usize) -> &mut [u8] {
        &mut self.page_mut(buf)[sector * SECTOR_BYTES..][..SECTOR_BYTES]
    }

    /// In-flight DMA state of an entry.
    fn dma_flight(&self, buf: BufId) -> DmaFlight;

    /// Mutable in-flight DMA state of an entry.
    fn dma_flight_mut(&mut self, buf: BufId) -> &mut DmaFlight;
}

/// The logical-to-physical page map.
pub trait PageMap {
    /// Physical page number backing `die_lpn` on `die`, or `None` if the
    /// page was never written.
    fn ppn(&self, die: u32, die_lpn: u32) -> Option<u32>;
}

/// Consumer of newly discovered bad blocks.
pub trait BadBlockSink {
    /// Records `block` (die-relative physical block number) as bad on
    /// `(ch, way)` in the in-memory table.
    fn update_bad_block(&mut self, ch: u8, way: u8, block: u32);
}
