// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-level die scheduler for the petrel SSD, with in-storage embedding
//! lookup.
//!
//! The scheduler drives every NAND die in the array through its operation
//! lifecycle while interleaving host DMA, and feeds an embedding-lookup
//! engine that gathers rows of flash-resident tables and reduces them into
//! result vectors on the way back to the host.
//!
//! The model is single-threaded and cooperative: a control loop calls
//! [`LowLevelScheduler::service`] repeatedly, and every state transition
//! happens on that caller. One `service` pass visits each channel once,
//! harvests completions, issues at most one new NAND primitive per channel
//! busy-window, advances translation work, and reports what it saw in a
//! [`Summary`]. Producers ([`LowLevelScheduler::push_host_req`] and
//! friends) block only by running passes until space opens up.
//!
//! Hardware and FTL collaborators are reached through the trait objects in
//! [`Devices`]; the scheduler owns no registers and no page cache, which is
//! what keeps the whole state machine runnable on a host.

#![cfg_attr(not(test), no_std)]

mod die;
mod queues;
mod rq;
mod sched;
mod trans;
mod waylist;

pub use die::{DieStep, PageHandoff, QueueKind, ReqStatus, NEW_BAD_BLOCK_CAP};
pub use queues::{
    ReqEntry, Request, StatusOption, SubEntry, TransTag, REQ_QUEUE_DEPTH,
    SUB_REQ_QUEUE_DEPTH,
};
pub use sched::{bbt_die_stride, bbt_scratch_len, bbt_table_bytes};
pub use trans::{
    EmbeddingPair, LookupHeader, PagePlan, TransEngine, TransEntry,
    TransStats, MAX_REQUEST_PAGES, RESULT_LANES_PER_ENTRY,
    RESULT_SECTORS_PER_ENTRY, TABLE_SECTOR_STRIDE, TRANS_BUF_ENTRY_NUM,
    TRANS_CONFIG_BYTES, TRANS_READ_RQ_DEPTH,
};
pub use waylist::WayList;

use drv_petrel_flash_api::{CellMode, NandController, SPARE_BYTES};
use drv_petrel_ftl_api::{BadBlockSink, BufId, PageBuffer, PageMap};
use drv_petrel_hostdma_api::HostDma;
use embed_cache::CacheSlot;
use ringlog::Ringlog;

use die::Die;
use trans::{TransReadItem, TransRqItem};
use waylist::ChannelWays;

/// Notable scheduler events, kept in the trace ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    None,
    /// An operation was abandoned after its retry budget ran out.
    RetryExhausted { ch: u8, way: u8, request: Request },
    /// A read recovered with a worrying error count; the block is queued
    /// for retirement.
    BadBlock { ch: u8, way: u8, block: u32 },
    /// The on-flash bad-block tables were rewritten.
    BadBlockTableRewrite { dies: u8 },
    /// A ring entry carried an operation this consumer doesn't issue.
    UndefinedRequest { ch: u8, way: u8 },
    /// A die reported a status the current step can't accept.
    BadStatus { ch: u8, way: u8 },
}

/// What a `service` pass observed, for the caller's drain loop.
#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    /// Some channel still has, or produced, work.
    pub work_pending: bool,
    /// A warning arrived and the bad-block tables were rewritten during
    /// this call.
    pub bad_block_update: bool,
}

/// Internal maintenance operations accepted on the sub ring.
///
/// Bad-block table pages and scan reads always use the LSB page layout;
/// `Reset` and `SetFeatures` complete on the ready/busy pin alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubRequest {
    ReadLsbPage,
    WriteLsbPage,
    ReadRawPage,
    EraseBlock,
    Reset,
    SetFeatures,
}

/// A primary-ring request descriptor, as produced by the FTL or the
/// translation engine.
///
/// For NAND operations `lpage` is the die-relative logical page; the push
/// applies the cell-mode row mapping. For `RxDma`/`TxDma` the DMA fields
/// select the host window and the buffer sectors to move.
#[derive(Copy, Clone, Debug)]
pub struct LowLevelReq {
    pub ch: u8,
    pub way: u8,
    pub request: Request,
    pub lpage: u32,
    pub buf: BufId,
    pub translate: Option<TransTag>,
    pub cmd_slot_tag: u16,
    pub start_dma_index: u8,
    pub start_sector: u8,
    pub sector_count: u8,
}

/// The hardware and FTL collaborators a scheduler call may touch.
pub struct Devices<'d> {
    pub nand: &'d mut dyn NandController,
    pub dma: &'d mut dyn HostDma,
    pub bufs: &'d mut dyn PageBuffer,
    pub map: &'d dyn PageMap,
    pub bad_blocks: &'d mut dyn BadBlockSink,
}

/// The scheduler core for a `CH` x `W` die array.
///
/// Large lookaside state (embedding cache slots, lookup config and result
/// regions, the bad-block scratch) is borrowed, mirroring the dedicated
/// memory-map regions it occupies on the device.
pub struct LowLevelScheduler<'m, const CH: usize, const W: usize> {
    pub(crate) dies: [[Die; W]; CH],
    pub(crate) ways: [ChannelWays<W>; CH],
    pub(crate) trans: TransEngine<'m>,
    pub(crate) cell_mode: CellMode,
    pub(crate) metadata_block: u32,
    pub(crate) bbt_scratch: &'m mut [u8],
    pub(crate) spare: [u8; SPARE_BYTES],
    pub(crate) log: Ringlog<Event, 64>,
    pub(crate) bad_block_update: bool,
}

impl<'m, const CH: usize, const W: usize> LowLevelScheduler<'m, CH, W> {
    /// Builds the scheduler over its backing regions.
    ///
    /// `bbt_scratch` must hold at least [`bbt_scratch_len`]`(CH, W)` bytes;
    /// the translation regions are checked by the engine. `metadata_block`
    /// names the per-die block whose LSB pages persist the bad-block table.
    pub fn new(
        cell_mode: CellMode,
        metadata_block: u32,
        cache_slots: &'m mut [CacheSlot],
        config_region: &'m mut [u8],
        result_region: &'m mut [f32],
        bbt_scratch: &'m mut [u8],
    ) -> Self {
        assert!(CH > 0 && W > 0);
        assert!(W <= 15, "way handles are 4 bits wide");
        assert!(bbt_scratch.len() >= bbt_scratch_len(CH, W));
        Self {
            dies: core::array::from_fn(|_| {
                core::array::from_fn(|_| Die::new())
            }),
            ways: core::array::from_fn(|_| ChannelWays::new()),
            trans: TransEngine::new(cache_slots, config_region, result_region),
            cell_mode,
            metadata_block,
            bbt_scratch,
            spare: [0; SPARE_BYTES],
            log: Ringlog::new(Event::None),
            bad_block_update: false,
        }
    }

    // `service`, the drains, and the ring producers live in `sched.rs`.

    /// Queues a primary-ring operation, running scheduler passes until the
    /// die can take it.
    pub fn push_host_req(
        &mut self,
        req: &LowLevelReq,
        dev: &mut Devices<'_>,
    ) {
        while !self.push_req_nonblocking(req, 0) {
            self.channels_pass(QueueKind::Sub, dev);
        }
    }

    /// Accepts a lookup configuration write: allocates a translation
    /// buffer entry, streams the config blob in over RX DMA, and queues the
    /// entry for processing. Returns the entry handle.
    ///
    /// `slba` must sit in the table's reserved stride; `slba %`
    /// [`TABLE_SECTOR_STRIDE`] becomes the request id a later
    /// [`Self::submit_lookup_read`] refers to.
    pub fn submit_lookup_config(
        &mut self,
        cmd_slot_tag: u16,
        slba: u32,
        nlb: u16,
        dev: &mut Devices<'_>,
    ) -> u8 {
        let table_slba = slba / TABLE_SECTOR_STRIDE * TABLE_SECTOR_STRIDE;
        let request_id = (slba % TABLE_SECTOR_STRIDE) as u16;
        let entry = self.trans.allocate(table_slba, request_id);

        let mut dma_index: u8 = 0;
        for sector in 0..nlb {
            dev.dma.set_auto_rx_dma(
                cmd_slot_tag,
                dma_index,
                self.trans.config_sector_mut(entry, sector),
            );
            dma_index = dma_index.wrapping_add(1);
        }
        let snap = dev.dma.rx_snapshot();
        self.trans.entry_mut(entry).set_rx_dma(snap);

        while self
            .trans
            .rq
            .push(TransRqItem {
                entry,
                next_page: 0,
            })
            .is_err()
        {
            self.channels_pass(QueueKind::Sub, dev);
        }
        entry
    }

    /// Accepts a lookup read: reserves the next `nlb` result sectors of the
    /// entry identified by `slba`'s request id and queues them for return
    /// DMA as they become ready.
    pub fn submit_lookup_read(
        &mut self,
        cmd_slot_tag: u16,
        slba: u32,
        nlb: u16,
        dev: &mut Devices<'_>,
    ) {
        let request_id = (slba % TABLE_SECTOR_STRIDE) as u16;
        let entry = self.trans.find(request_id);
        let first_sector = self.trans.entry(entry).nlb_requested();
        let item = TransReadItem {
            entry,
            first_sector,
            next_sector: first_sector,
            nlb,
            cmd_slot_tag,
        };
        while self.trans.read_rq.push(item).is_err() {
            self.channels_pass(QueueKind::Sub, dev);
        }
        self.trans.entry_mut(entry).add_requested(nlb);
    }

    /// Host flush: drains the primary rings and returns (resetting) the
    /// translation statistics.
    pub fn flush(&mut self, dev: &mut Devices<'_>) -> TransStats {
        self.drain_primary(dev);
        self.trans.take_stats()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn die_step(&self, ch: u8, way: u8) -> DieStep {
        self.dies[ch as usize][way as usize].step
    }

    pub fn queue_select(&self, ch: u8, way: u8) -> QueueKind {
        self.dies[ch as usize][way as usize].queue_select
    }

    /// Which priority list the way is on; `None` only while the arbiter is
    /// holding it between unlink and reclassification.
    pub fn way_list(&self, ch: u8, way: u8) -> Option<WayList> {
        self.ways[ch as usize].membership(way)
    }

    pub fn req_queue_len(&self, ch: u8, way: u8) -> usize {
        self.dies[ch as usize][way as usize].req_ring.len()
    }

    pub fn sub_queue_len(&self, ch: u8, way: u8) -> usize {
        self.dies[ch as usize][way as usize].sub_ring.len()
    }

    /// Whether the die's primary ring can take one more operation while
    /// keeping `open_slots` slots free.
    pub fn req_queue_available(
        &self,
        ch: u8,
        way: u8,
        open_slots: usize,
    ) -> bool {
        self.dies[ch as usize][way as usize]
            .req_ring
            .can_accept(open_slots)
    }

    /// Whether a completed translate read is parked awaiting reduction.
    pub fn mailbox_pending(&self, ch: u8, way: u8) -> bool {
        self.dies[ch as usize][way as usize].mailbox.is_some()
    }

    /// The bad-block scratch region (scan reads and table rewrites land
    /// here).
    pub fn scratch(&self) -> &[u8] {
        &self.bbt_scratch[..]
    }

    pub fn trans(&self) -> &TransEngine<'m> {
        &self.trans
    }

    pub fn log(&self) -> &Ringlog<Event, 64> {
        &self.log
    }
}
