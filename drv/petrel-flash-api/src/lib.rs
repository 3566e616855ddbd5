// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the petrel NAND flash controller.
//!
//! This crate defines the array geometry, the logical-to-physical row
//! address mappings, and the [`NandController`] trait through which the
//! scheduler drives the controller hardware. Every NAND primitive here is
//! asynchronous at the hardware level: issuing one occupies the channel's
//! command bus briefly (observable via [`NandController::is_controller_busy`])
//! and completion is observed later through the completion word, the ECC
//! error information, or the per-die ready/busy signal.

#![cfg_attr(not(test), no_std)]

use static_assertions::const_assert;

/// Number of flash channels in the production configuration.
pub const CHANNEL_COUNT: usize = 8;

/// Ways (dies) per channel. Way handles are 4 bits wide in hardware, so
/// this can never exceed 15.
pub const WAY_COUNT: usize = 8;

/// FTL sector size in bytes.
pub const SECTOR_BYTES: usize = 4096;

/// NAND page size in bytes.
pub const PAGE_BYTES: usize = 16384;

/// Sectors per NAND page.
pub const SECTORS_PER_PAGE: usize = PAGE_BYTES / SECTOR_BYTES;

/// Logical pages per block when the array runs in SLC (LSB-only) mode.
pub const SLC_PAGES_PER_BLOCK: u32 = 128;

/// Physical rows per block. This is also the MLC logical page count per
/// block: MLC mode uses every row, SLC mode spreads its pages across the
/// same row range.
pub const PHY_PAGES_PER_BLOCK: u32 = 256;

/// Blocks per LUN.
pub const BLOCKS_PER_LUN: u32 = 4096;

/// Independently-operable LUNs per die.
pub const LUNS_PER_DIE: u32 = 2;

/// Physical row-address stride between LUN 0 and LUN 1 of a die.
pub const LUN_ROW_STRIDE: u32 = 0x0020_0000;

/// Worst-chunk bit-error count above which a successful read is reported as
/// a warning (the block is going bad and should be retired).
pub const BIT_ERROR_THRESHOLD: u32 = 24;

/// Bounded retry count for failed die operations.
pub const RETRY_LIMIT: u8 = 3;

/// Spare-region bytes transferred alongside each page.
pub const SPARE_BYTES: usize = 256;

// Way handles are 4 bits wide in hardware.
const_assert!(WAY_COUNT <= 15);
// The SLC layout spreads its pages over a block's full physical row span,
// and `phys_block_of_row` divides by that span; the two must agree.
const_assert!(2 * SLC_PAGES_PER_BLOCK == PHY_PAGES_PER_BLOCK);
// Every block of a LUN must fit below the next LUN's row base.
const_assert!(BLOCKS_PER_LUN * PHY_PAGES_PER_BLOCK <= LUN_ROW_STRIDE);

/// Cell mode of the array, fixed at build time in the production image but
/// carried as a value so both mappings stay testable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellMode {
    /// LSB pages only; a block exposes [`SLC_PAGES_PER_BLOCK`] pages.
    Slc,
    /// All pages; a block exposes [`PHY_PAGES_PER_BLOCK`] pages.
    Mlc,
}

impl CellMode {
    /// Logical pages addressable per LUN in this mode.
    pub const fn pages_per_lun(self) -> u32 {
        match self {
            CellMode::Slc => BLOCKS_PER_LUN * SLC_PAGES_PER_BLOCK,
            CellMode::Mlc => BLOCKS_PER_LUN * PHY_PAGES_PER_BLOCK,
        }
    }
}

/// Maps a die-relative logical page address to a physical row address.
///
/// In SLC mode only the LSB rows are used: logical page 0 of a block sits on
/// row 0, and page `p > 0` on row `2p - 1`; blocks stride
/// [`PHY_PAGES_PER_BLOCK`] rows. MLC mode is linear within the LUN.
pub fn row_for_page(lpage: u32, mode: CellMode) -> u32 {
    let per_lun = mode.pages_per_lun();
    let lun_base = (lpage / per_lun) * LUN_ROW_STRIDE;
    let in_lun = lpage % per_lun;
    match mode {
        CellMode::Slc => {
            let block = in_lun / SLC_PAGES_PER_BLOCK;
            let page = in_lun % SLC_PAGES_PER_BLOCK;
            let phy_page = if page == 0 { 0 } else { 2 * page - 1 };
            lun_base + block * SLC_PAGES_PER_BLOCK * 2 + phy_page
        }
        CellMode::Mlc => lun_base + in_lun,
    }
}

/// Maps a logical LSB page address to a physical row.
///
/// Bad-block table pages and raw scan reads always use the SLC layout
/// regardless of the build cell mode. A raw scan read of the last logical
/// page of a block must land on the last physical row of the block (bad
/// block marks live in the first and last pages), which is the one spot
/// where the LSB layout is departed from.
pub fn lsb_row_for_page(lpage: u32, raw_scan: bool) -> u32 {
    let per_lun = BLOCKS_PER_LUN * SLC_PAGES_PER_BLOCK;
    let lun_base = (lpage / per_lun) * LUN_ROW_STRIDE;
    let in_lun = lpage % per_lun;
    let block = in_lun / SLC_PAGES_PER_BLOCK;
    let page = in_lun % SLC_PAGES_PER_BLOCK;
    let phy_page = if page == 0 {
        0
    } else if raw_scan && page == SLC_PAGES_PER_BLOCK - 1 {
        2 * SLC_PAGES_PER_BLOCK - 1
    } else {
        2 * page - 1
    };
    lun_base + block * SLC_PAGES_PER_BLOCK * 2 + phy_page
}

/// Recovers the die-relative physical block number from a row address.
///
/// A block occupies [`PHY_PAGES_PER_BLOCK`] rows under both cell modes (SLC
/// spreads half as many pages over the same rows), so this needs no mode
/// parameter.
pub fn phys_block_of_row(row: u32) -> u32 {
    let lun = row / LUN_ROW_STRIDE;
    let in_lun = row % LUN_ROW_STRIDE;
    lun * BLOCKS_PER_LUN + in_lun / PHY_PAGES_PER_BLOCK
}

/// ECC error information for the most recent page transfer on a die.
#[derive(Copy, Clone, Debug, Default)]
pub struct EccInfo {
    pub crc_valid: bool,
    pub spare_valid: bool,
    pub page_valid: bool,
    pub worst_chunk_errors: u32,
}

/// Classified outcome of a page transfer's ECC pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EccStatus {
    Pass,
    /// Recovered, but with an error count above [`BIT_ERROR_THRESHOLD`];
    /// data is good and the block should be retired.
    Warning,
    Fail,
}

impl EccInfo {
    pub fn status(&self) -> EccStatus {
        if self.crc_valid && self.spare_valid && self.page_valid {
            if self.worst_chunk_errors > BIT_ERROR_THRESHOLD {
                EccStatus::Warning
            } else {
                EccStatus::Pass
            }
        } else {
            EccStatus::Fail
        }
    }
}

/// Low-level NAND controller operations.
///
/// One instance serves the whole array; `ch`/`way` select the die. Page and
/// spare data cross this boundary as slices at issue time; completion state
/// is polled through the accessor methods. `reset` and `enter_toggle_mode`
/// are synchronous and signal completion only through ready/busy.
pub trait NandController {
    /// Issues the read-sense command for `row` (long latency; the die drops
    /// its ready bit until the sense completes).
    fn read_page_trigger(&mut self, ch: u8, way: u8, row: u32);

    /// Moves the sensed page through ECC into `page`/`spare`. Completion is
    /// signalled by bit 0 of the completion word; the ECC information must
    /// then be inspected.
    fn read_page_transfer(
        &mut self,
        ch: u8,
        way: u8,
        row: u32,
        page: &mut [u8],
        spare: &mut [u8],
    );

    /// Like `read_page_transfer` but bypassing ECC; used by the bad-block
    /// scan. Completion word bit 0 only.
    fn read_page_transfer_raw(&mut self, ch: u8, way: u8, page: &mut [u8]);

    /// Programs `page`/`spare` at `row`.
    fn program_page(
        &mut self,
        ch: u8,
        way: u8,
        row: u32,
        page: &[u8],
        spare: &[u8],
    );

    /// Erases the block containing `row`.
    fn erase_block(&mut self, ch: u8, way: u8, row: u32);

    /// Issues an asynchronous status-register read; the result arrives in
    /// the completion word.
    fn status_check(&mut self, ch: u8, way: u8);

    /// Completion word for the last transfer or status command on the die.
    /// Bit 0 set means the word is valid; for status commands the status
    /// byte sits in bits 8:1.
    fn completion_word(&self, ch: u8, way: u8) -> u32;

    /// ECC error information for the last ECC transfer on the die.
    fn ecc_info(&self, ch: u8, way: u8) -> EccInfo;

    /// Per-way ready/busy bitmask for a channel (bit `way` set = ready).
    fn ready_busy(&self, ch: u8) -> u32;

    /// Whether the channel's command bus is still driving a transaction.
    /// While true, no new primitive may be issued on the channel.
    fn is_controller_busy(&self, ch: u8) -> bool;

    /// Synchronous die reset.
    fn reset(&mut self, ch: u8, way: u8);

    /// Synchronous switch to toggle-mode timings (the set-features step of
    /// die bring-up).
    fn enter_toggle_mode(&mut self, ch: u8, way: u8);
}
