// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic simulated platform for driving the scheduler on the host.
//!
//! Hardware latencies advance on the polls the scheduler already makes:
//! the channel stays "controller busy" for one `is_controller_busy` poll
//! after an issue, a die's ready countdown steps on each `ready_busy`
//! sample of its channel, and completion words surface after a
//! `completion_word` poll. That keeps every test a plain loop of `service`
//! calls with no out-of-band clock, while still exercising the busy-yield
//! and await-ready paths.
//!
//! The NAND model panics if a second primitive is issued on a channel
//! within one busy window, enforcing the bus mutual-exclusion invariant in
//! every test that runs on it.

// Each test binary uses its own slice of this module.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use drv_petrel_flash_api::{
    phys_block_of_row, CellMode, EccInfo, NandController, PAGE_BYTES,
};
use drv_petrel_ftl_api::{BadBlockSink, BufId, PageBuffer, PageMap};
use drv_petrel_hostdma_api::{DmaFlight, DmaSnapshot, HostDma};
use drv_petrel_sched::{
    bbt_scratch_len, Devices, LowLevelScheduler, QueueKind, WayList,
    RESULT_LANES_PER_ENTRY, TRANS_BUF_ENTRY_NUM, TRANS_CONFIG_BYTES,
};
use embed_cache::CacheSlot;

pub const CH: usize = 2;
pub const W: usize = 2;

pub type Sched<'m> = LowLevelScheduler<'m, CH, W>;

/// Injected ECC outcome for one page transfer.
#[derive(Copy, Clone, Debug)]
pub enum EccPlan {
    Pass,
    Warning(u32),
    Fail,
}

#[derive(Default)]
struct DieSim {
    ready_in: u32,
    completion: u32,
    completion_in: Option<(u32, u32)>,
    ecc: EccInfo,
    sensed_row: Option<u32>,
}

/// NAND array model. Poll-advanced state (ready countdowns, completion
/// words, the busy window) sits behind `Cell`/`RefCell` because the
/// register-read side of the trait is `&self`.
pub struct SimNand {
    pub flash: HashMap<(u8, u8, u32), Vec<u8>>,
    dies: RefCell<[[DieSim; W]; CH]>,
    busy_polls: [Cell<u32>; CH],
    /// Injected per-row transfer outcomes, consumed front-to-back.
    pub read_outcomes: HashMap<(u8, u8, u32), VecDeque<EccPlan>>,
    /// Injected per-die status-register failures, consumed per status poll.
    pub status_fails: HashMap<(u8, u8), VecDeque<bool>>,
    /// Every primitive put on a bus: (ch, way, op, row).
    pub issue_log: Vec<(u8, u8, &'static str, u32)>,
    pub erases: Vec<(u8, u8, u32)>,
    pub programs: Vec<(u8, u8, u32)>,
    trigger_latency: u32,
    transfer_latency: u32,
}

impl SimNand {
    pub fn new() -> Self {
        Self {
            flash: HashMap::new(),
            dies: RefCell::new(Default::default()),
            busy_polls: std::array::from_fn(|_| Cell::new(0)),
            read_outcomes: HashMap::new(),
            status_fails: HashMap::new(),
            issue_log: Vec::new(),
            erases: Vec::new(),
            programs: Vec::new(),
            trigger_latency: 2,
            transfer_latency: 1,
        }
    }

    pub fn triggers_issued(&self, ch: u8, way: u8) -> usize {
        self.issue_log
            .iter()
            .filter(|(c, w, op, _)| *c == ch && *w == way && *op == "trigger")
            .count()
    }

    pub fn transfers_issued(&self, ch: u8, way: u8) -> usize {
        self.issue_log
            .iter()
            .filter(|(c, w, op, _)| *c == ch && *w == way && *op == "transfer")
            .count()
    }

    fn issue(&mut self, ch: u8, way: u8, op: &'static str, row: u32) {
        assert_eq!(
            self.busy_polls[ch as usize].get(),
            0,
            "second NAND primitive issued on ch{ch} within one busy window",
        );
        self.busy_polls[ch as usize].set(1);
        self.issue_log.push((ch, way, op, row));
    }

    fn page_at(&self, ch: u8, way: u8, row: u32) -> Vec<u8> {
        self.flash
            .get(&(ch, way, row))
            .cloned()
            .unwrap_or_else(|| vec![0xff; PAGE_BYTES])
    }

    fn next_outcome(&mut self, ch: u8, way: u8, row: u32) -> EccPlan {
        self.read_outcomes
            .get_mut(&(ch, way, row))
            .and_then(|q| q.pop_front())
            .unwrap_or(EccPlan::Pass)
    }

    fn next_status_fail(&mut self, ch: u8, way: u8) -> bool {
        self.status_fails
            .get_mut(&(ch, way))
            .and_then(|q| q.pop_front())
            .unwrap_or(false)
    }
}

impl NandController for SimNand {
    fn read_page_trigger(&mut self, ch: u8, way: u8, row: u32) {
        self.issue(ch, way, "trigger", row);
        let lat = self.trigger_latency;
        let dies = self.dies.get_mut();
        let die = &mut dies[ch as usize][way as usize];
        die.sensed_row = Some(row);
        die.ready_in = lat;
        die.completion = 0;
    }

    fn read_page_transfer(
        &mut self,
        ch: u8,
        way: u8,
        row: u32,
        page: &mut [u8],
        _spare: &mut [u8],
    ) {
        self.issue(ch, way, "transfer", row);
        let data = self.page_at(ch, way, row);
        page.copy_from_slice(&data);
        let outcome = self.next_outcome(ch, way, row);
        let lat = self.transfer_latency;
        let dies = self.dies.get_mut();
        let die = &mut dies[ch as usize][way as usize];
        die.ecc = match outcome {
            EccPlan::Pass => EccInfo {
                crc_valid: true,
                spare_valid: true,
                page_valid: true,
                worst_chunk_errors: 0,
            },
            EccPlan::Warning(count) => EccInfo {
                crc_valid: true,
                spare_valid: true,
                page_valid: true,
                worst_chunk_errors: count,
            },
            EccPlan::Fail => EccInfo {
                crc_valid: false,
                spare_valid: false,
                page_valid: false,
                worst_chunk_errors: 0,
            },
        };
        die.completion = 0;
        die.completion_in = Some((lat, 1));
    }

    fn read_page_transfer_raw(&mut self, ch: u8, way: u8, page: &mut [u8]) {
        self.issue(ch, way, "transfer-raw", 0);
        let row = self.dies.get_mut()[ch as usize][way as usize]
            .sensed_row
            .unwrap_or(0);
        let data = self.page_at(ch, way, row);
        page.copy_from_slice(&data);
        let lat = self.transfer_latency;
        let die = &mut self.dies.get_mut()[ch as usize][way as usize];
        die.completion = 0;
        die.completion_in = Some((lat, 1));
    }

    fn program_page(
        &mut self,
        ch: u8,
        way: u8,
        row: u32,
        page: &[u8],
        _spare: &[u8],
    ) {
        self.issue(ch, way, "program", row);
        self.flash.insert((ch, way, row), page.to_vec());
        self.programs.push((ch, way, row));
        let die = &mut self.dies.get_mut()[ch as usize][way as usize];
        die.ready_in = 2;
        die.completion = 0;
    }

    fn erase_block(&mut self, ch: u8, way: u8, row: u32) {
        self.issue(ch, way, "erase", row);
        self.erases.push((ch, way, row));
        let block = phys_block_of_row(row);
        self.flash
            .retain(|&(c, w, r), _| {
                !(c == ch && w == way && phys_block_of_row(r) == block)
            });
        let die = &mut self.dies.get_mut()[ch as usize][way as usize];
        die.ready_in = 2;
        die.completion = 0;
    }

    fn status_check(&mut self, ch: u8, way: u8) {
        self.issue(ch, way, "status", 0);
        let fail = self.next_status_fail(ch, way);
        let status = 0x60 | u32::from(fail);
        let die = &mut self.dies.get_mut()[ch as usize][way as usize];
        die.completion = 0;
        die.completion_in = Some((1, (status << 1) | 1));
    }

    fn completion_word(&self, ch: u8, way: u8) -> u32 {
        let mut dies = self.dies.borrow_mut();
        let die = &mut dies[ch as usize][way as usize];
        if let Some((n, word)) = die.completion_in {
            if n == 0 {
                die.completion = word;
                die.completion_in = None;
            } else {
                die.completion_in = Some((n - 1, word));
            }
        }
        die.completion
    }

    fn ecc_info(&self, ch: u8, way: u8) -> EccInfo {
        self.dies.borrow()[ch as usize][way as usize].ecc
    }

    fn ready_busy(&self, ch: u8) -> u32 {
        let mut dies = self.dies.borrow_mut();
        let mut mask = 0;
        for way in 0..W {
            let die = &mut dies[ch as usize][way];
            if die.ready_in == 0 {
                mask |= 1 << way;
            } else {
                die.ready_in -= 1;
            }
        }
        mask
    }

    fn is_controller_busy(&self, ch: u8) -> bool {
        let busy = &self.busy_polls[ch as usize];
        if busy.get() > 0 {
            busy.set(busy.get() - 1);
            true
        } else {
            false
        }
    }

    fn reset(&mut self, ch: u8, way: u8) {
        // Synchronous command: holds the bus and returns when done, so it
        // doesn't open a busy window.
        self.issue_log.push((ch, way, "reset", 0));
        self.dies.get_mut()[ch as usize][way as usize].ready_in = 1;
    }

    fn enter_toggle_mode(&mut self, ch: u8, way: u8) {
        self.issue_log.push((ch, way, "set-features", 0));
        self.dies.get_mut()[ch as usize][way as usize].ready_in = 1;
    }
}

/// Host DMA model. Descriptors copy at enqueue; retirement is under test
/// control unless `auto_complete` is set.
pub struct SimDma {
    rx_seq: u32,
    tx_seq: u32,
    rx_done: u32,
    tx_done: u32,
    pub auto_complete: bool,
    /// Host payload for upcoming RX sectors, front-to-back (zeroes when
    /// empty).
    pub rx_data: VecDeque<Vec<u8>>,
    /// Every TX sector shipped: (cmd_slot_tag, dma_index, payload).
    pub tx_log: Vec<(u16, u8, Vec<u8>)>,
}

impl SimDma {
    pub fn new(auto_complete: bool) -> Self {
        Self {
            rx_seq: 0,
            tx_seq: 0,
            rx_done: 0,
            tx_done: 0,
            auto_complete,
            rx_data: VecDeque::new(),
            tx_log: Vec::new(),
        }
    }

    /// Retires everything currently enqueued, both directions.
    pub fn retire_all(&mut self) {
        self.rx_done = self.rx_seq;
        self.tx_done = self.tx_seq;
    }

    fn snapshot(seq: u32) -> DmaSnapshot {
        DmaSnapshot {
            tail: (seq % 256) as u8,
            overflow: seq / 256,
        }
    }

    fn seq_of(snap: DmaSnapshot) -> u32 {
        snap.overflow * 256 + u32::from(snap.tail)
    }
}

impl HostDma for SimDma {
    fn set_auto_rx_dma(&mut self, _tag: u16, _idx: u8, dest: &mut [u8]) {
        let data = self.rx_data.pop_front().unwrap_or_default();
        dest.fill(0);
        dest[..data.len()].copy_from_slice(&data);
        self.rx_seq += 1;
        if self.auto_complete {
            self.rx_done = self.rx_seq;
        }
    }

    fn set_auto_tx_dma(&mut self, tag: u16, idx: u8, src: &[u8]) {
        self.tx_log.push((tag, idx, src.to_vec()));
        self.tx_seq += 1;
        if self.auto_complete {
            self.tx_done = self.tx_seq;
        }
    }

    fn rx_snapshot(&self) -> DmaSnapshot {
        Self::snapshot(self.rx_seq)
    }

    fn tx_snapshot(&self) -> DmaSnapshot {
        Self::snapshot(self.tx_seq)
    }

    fn rx_partial_done(&self, snap: DmaSnapshot) -> bool {
        self.rx_done >= Self::seq_of(snap)
    }

    fn tx_partial_done(&self, snap: DmaSnapshot) -> bool {
        self.tx_done >= Self::seq_of(snap)
    }
}

/// LRU page buffer model: a flat pool, no eviction.
pub struct SimBufs {
    pages: Vec<Vec<u8>>,
    lpas: Vec<Option<u32>>,
    flights: Vec<DmaFlight>,
}

impl SimBufs {
    pub fn new() -> Self {
        let n = 32;
        Self {
            pages: (0..n).map(|_| vec![0; PAGE_BYTES]).collect(),
            lpas: vec![None; n],
            flights: vec![DmaFlight::default(); n],
        }
    }

    /// Seeds an entry so `check_hit(lpa)` will find `data`.
    pub fn preload(&mut self, lpa: u32, data: &[u8]) -> BufId {
        let slot = self
            .lpas
            .iter()
            .position(|l| l.is_none())
            .expect("buffer pool full");
        self.lpas[slot] = Some(lpa);
        self.pages[slot][..data.len()].copy_from_slice(data);
        BufId(slot as u16)
    }
}

impl PageBuffer for SimBufs {
    fn check_hit(&mut self, lpa: u32) -> Option<BufId> {
        self.lpas
            .iter()
            .position(|l| *l == Some(lpa))
            .map(|i| BufId(i as u16))
    }

    fn allocate(&mut self, lpa: u32) -> BufId {
        let slot = self
            .lpas
            .iter()
            .position(|l| l.is_none())
            .expect("buffer pool full");
        self.lpas[slot] = Some(lpa);
        BufId(slot as u16)
    }

    fn page(&self, buf: BufId) -> &[u8] {
        &self.pages[buf.0 as usize]
    }

    fn page_mut(&mut self, buf: BufId) -> &mut [u8] {
        &mut self.pages[buf.0 as usize]
    }

    fn dma_flight(&self, buf: BufId) -> DmaFlight {
        self.flights[buf.0 as usize]
    }

    fn dma_flight_mut(&mut self, buf: BufId) -> &mut DmaFlight {
        &mut self.flights[buf.0 as usize]
    }
}

/// Page map model: explicit entries only; everything else is unmapped.
#[derive(Default)]
pub struct SimMap {
    pub entries: HashMap<(u32, u32), u32>,
}

impl PageMap for SimMap {
    fn ppn(&self, die: u32, die_lpn: u32) -> Option<u32> {
        self.entries.get(&(die, die_lpn)).copied()
    }
}

/// Records bad-block table updates.
#[derive(Default)]
pub struct SimBbt {
    pub updates: Vec<(u8, u8, u32)>,
}

impl BadBlockSink for SimBbt {
    fn update_bad_block(&mut self, ch: u8, way: u8, block: u32) {
        self.updates.push((ch, way, block));
    }
}

/// The full collaborator set.
pub struct Platform {
    pub nand: SimNand,
    pub dma: SimDma,
    pub bufs: SimBufs,
    pub map: SimMap,
    pub bbt: SimBbt,
}

impl Platform {
    pub fn new() -> Self {
        Self {
            nand: SimNand::new(),
            dma: SimDma::new(true),
            bufs: SimBufs::new(),
            map: SimMap::default(),
            bbt: SimBbt::default(),
        }
    }

    pub fn devices(&mut self) -> Devices<'_> {
        Devices {
            nand: &mut self.nand,
            dma: &mut self.dma,
            bufs: &mut self.bufs,
            map: &self.map,
            bad_blocks: &mut self.bbt,
        }
    }
}

/// Backing memory for the scheduler's borrowed regions.
pub struct Backing {
    cache: Vec<CacheSlot>,
    config: Vec<u8>,
    results: Vec<f32>,
    pub scratch: Vec<u8>,
}

impl Backing {
    pub fn new() -> Self {
        Self {
            cache: vec![CacheSlot::EMPTY; 4096],
            config: vec![0; TRANS_BUF_ENTRY_NUM * TRANS_CONFIG_BYTES],
            results: vec![0.0; TRANS_BUF_ENTRY_NUM * RESULT_LANES_PER_ENTRY],
            scratch: vec![0; bbt_scratch_len(CH, W)],
        }
    }

    pub fn sched(&mut self, mode: CellMode, metadata_block: u32) -> Sched<'_> {
        LowLevelScheduler::new(
            mode,
            metadata_block,
            self.cache.as_mut_slice(),
            self.config.as_mut_slice(),
            self.results.as_mut_slice(),
            self.scratch.as_mut_slice(),
        )
    }
}

/// Runs scheduler passes until `done` holds or `max_passes` elapse,
/// checking the way-list membership invariant after every pass.
pub fn run_until(
    sched: &mut Sched<'_>,
    plat: &mut Platform,
    max_passes: usize,
    mut done: impl FnMut(&Sched<'_>, &Platform) -> bool,
) {
    for _ in 0..max_passes {
        let mut dev = plat.devices();
        sched.service(QueueKind::Req, &mut dev);
        drop(dev);
        assert_ways_consistent(sched);
        if done(sched, plat) {
            return;
        }
    }
    panic!("condition not reached in {max_passes} passes");
}

/// Every way must be on exactly one priority list between passes.
pub fn assert_ways_consistent(sched: &Sched<'_>) {
    for ch in 0..CH as u8 {
        for way in 0..W as u8 {
            assert!(
                sched.way_list(ch, way).is_some(),
                "ch{ch} way{way} is on no priority list",
            );
        }
    }
}

/// All rings empty and every die idle.
pub fn all_quiet(sched: &Sched<'_>) -> bool {
    for ch in 0..CH as u8 {
        for way in 0..W as u8 {
            if sched.req_queue_len(ch, way) != 0
                || sched.sub_queue_len(ch, way) != 0
                || sched.die_step(ch, way) != drv_petrel_sched::DieStep::Idle
            {
                return false;
            }
        }
    }
    true
}

/// Idle-list check used by the bad-block scenario.
pub fn all_on_idle_list(sched: &Sched<'_>) -> bool {
    (0..CH as u8).all(|ch| {
        (0..W as u8).all(|w| sched.way_list(ch, w) == Some(WayList::Idle))
    })
}

/// A page image of an embedding table slice: rows of `len` f32 lanes where
/// row `base_id + r` holds the value `base_id + r` in every lane.
pub fn page_image(base_id: u32, len: usize) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_BYTES];
    let rows = PAGE_BYTES / (len * 4);
    for r in 0..rows {
        let value = (base_id + r as u32) as f32;
        for k in 0..len {
            let at = (r * len + k) * 4;
            page[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
    page
}
