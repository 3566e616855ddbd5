// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request execution: ring pops, status polling, the per-die state machine,
//! the per-channel way arbiter, queue drains, and the bad-block table
//! rewrite.
//!
//! The channel-level mutual exclusion rule runs through everything here:
//! while several dies on a channel may be busy servicing operations that
//! were already issued, only one new NAND primitive may be put on the
//! channel's command bus per busy window. Every sweep that issues a
//! primitive checks `is_controller_busy` first and yields the channel as
//! soon as the bus goes busy.

use drv_petrel_flash_api::{
    lsb_row_for_page, phys_block_of_row, row_for_page, CellMode, EccStatus,
    BLOCKS_PER_LUN, LUNS_PER_DIE, PAGE_BYTES, PHY_PAGES_PER_BLOCK,
    RETRY_LIMIT, SECTORS_PER_PAGE, SECTOR_BYTES, SLC_PAGES_PER_BLOCK,
};
use ringlog::ringlog_entry;

use crate::die::{DieStep, PageHandoff, QueueKind, ReqStatus};
use crate::queues::{ReqEntry, Request, StatusOption, SubEntry};
use crate::waylist::WayList;
use crate::{Devices, Event, LowLevelReq, LowLevelScheduler, SubRequest, Summary};

/// Bad-block table bytes per die: one mark byte per physical block.
pub fn bbt_table_bytes() -> usize {
    (BLOCKS_PER_LUN * LUNS_PER_DIE) as usize
}

/// Scratch bytes reserved per die during a table rewrite.
pub fn bbt_die_stride() -> usize {
    (bbt_table_bytes() / PAGE_BYTES + 1) * PAGE_BYTES
}

/// Scratch region size the scheduler requires for a `CH` x `W` array.
pub fn bbt_scratch_len(channels: usize, ways: usize) -> usize {
    channels * ways * bbt_die_stride()
}

fn pages_per_block(mode: CellMode) -> u32 {
    match mode {
        CellMode::Slc => SLC_PAGES_PER_BLOCK,
        CellMode::Mlc => PHY_PAGES_PER_BLOCK,
    }
}

impl<'m, const CH: usize, const W: usize> LowLevelScheduler<'m, CH, W> {
    // ------------------------------------------------------------------
    // Ring producers
    // ------------------------------------------------------------------

    /// Queues a primary-ring operation if the die can take it while keeping
    /// `open_slots` additional slots free.
    pub fn push_req_nonblocking(
        &mut self,
        req: &LowLevelReq,
        open_slots: usize,
    ) -> bool {
        let cell_mode = self.cell_mode;
        let die = &mut self.dies[req.ch as usize][req.way as usize];
        if !die.req_ring.can_accept(open_slots) {
            return false;
        }
        let entry = if req.request.is_dma() {
            ReqEntry {
                request: req.request,
                row_addr: 0,
                buf: req.buf,
                status_option: StatusOption::None,
                translate: None,
                cmd_slot_tag: req.cmd_slot_tag,
                start_dma_index: req.start_dma_index,
                start_sector: req.start_sector,
                sector_count: req.sector_count,
            }
        } else {
            ReqEntry {
                request: req.request,
                row_addr: row_for_page(req.lpage, cell_mode),
                buf: req.buf,
                status_option: StatusOption::StatusCheck,
                translate: req.translate,
                cmd_slot_tag: 0,
                start_dma_index: 0,
                start_sector: 0,
                sector_count: 0,
            }
        };
        die.req_ring.push(entry).is_ok()
    }

    /// Queues an internal operation on the sub ring, running scheduler
    /// passes until there is room.
    pub fn push_sub(
        &mut self,
        ch: u8,
        way: u8,
        cmd: SubRequest,
        lpage: u32,
        scratch_off: u32,
        dev: &mut Devices<'_>,
    ) {
        while !self.dies[ch as usize][way as usize].sub_ring.can_accept(0) {
            self.channels_pass(QueueKind::Req, dev);
        }
        let (request, row_addr, status_option) = match cmd {
            SubRequest::ReadLsbPage => (
                Request::ReadTrigger,
                lsb_row_for_page(lpage, false),
                StatusOption::StatusCheck,
            ),
            SubRequest::WriteLsbPage => (
                Request::Program,
                lsb_row_for_page(lpage, false),
                StatusOption::StatusCheck,
            ),
            SubRequest::ReadRawPage => (
                Request::ReadRaw,
                lsb_row_for_page(lpage, true),
                StatusOption::StatusCheck,
            ),
            SubRequest::EraseBlock => (
                Request::Erase,
                row_for_page(lpage, self.cell_mode),
                StatusOption::StatusCheck,
            ),
            SubRequest::Reset => (Request::Reset, 0, StatusOption::None),
            SubRequest::SetFeatures => {
                (Request::SetFeatures, 0, StatusOption::None)
            }
        };
        let entry = SubEntry {
            request,
            row_addr,
            scratch_off,
            status_option,
        };
        // Room was just ensured above.
        let _ = self.dies[ch as usize][way as usize].sub_ring.push(entry);
    }

    // ------------------------------------------------------------------
    // Ring consumers
    // ------------------------------------------------------------------

    /// Submits the front primary-ring operation to the hardware. Returns
    /// true when the die entered execution; DMA ring operations complete at
    /// issue and do not occupy the die.
    fn pop_req(&mut self, ch: u8, way: u8, dev: &mut Devices<'_>) -> bool {
        let entry = match self.dies[ch as usize][way as usize].req_ring.front()
        {
            Some(e) => *e,
            None => return false,
        };
        match entry.request {
            Request::RxDma => {
                let mut dma_index = entry.start_dma_index;
                for i in 0..entry.sector_count {
                    let sector = (entry.start_sector + i) as usize;
                    dev.dma.set_auto_rx_dma(
                        entry.cmd_slot_tag,
                        dma_index,
                        dev.bufs.sector_mut(entry.buf, sector),
                    );
                    dma_index = dma_index.wrapping_add(1);
                }
                let snap = dev.dma.rx_snapshot();
                dev.bufs.dma_flight_mut(entry.buf).rx = Some(snap);
                self.dies[ch as usize][way as usize].req_ring.advance();
                false
            }
            Request::TxDma => {
                let mut dma_index = entry.start_dma_index;
                for i in 0..entry.sector_count {
                    let sector = (entry.start_sector + i) as usize;
                    dev.dma.set_auto_tx_dma(
                        entry.cmd_slot_tag,
                        dma_index,
                        &dev.bufs.page(entry.buf)[sector * SECTOR_BYTES..]
                            [..SECTOR_BYTES],
                    );
                    dma_index = dma_index.wrapping_add(1);
                }
                let snap = dev.dma.tx_snapshot();
                dev.bufs.dma_flight_mut(entry.buf).tx = Some(snap);
                self.dies[ch as usize][way as usize].req_ring.advance();
                false
            }
            Request::ReadTrigger => {
                dev.nand.read_page_trigger(ch, way, entry.row_addr);
                true
            }
            Request::ReadTransfer => {
                dev.nand.read_page_transfer(
                    ch,
                    way,
                    entry.row_addr,
                    dev.bufs.page_mut(entry.buf),
                    &mut self.spare,
                );
                true
            }
            Request::Program => {
                dev.nand.program_page(
                    ch,
                    way,
                    entry.row_addr,
                    dev.bufs.page(entry.buf),
                    &self.spare,
                );
                true
            }
            _ => {
                ringlog_entry!(self.log, Event::UndefinedRequest { ch, way });
                true
            }
        }
    }

    /// Submits the front sub-ring operation to the hardware.
    fn pop_sub(&mut self, ch: u8, way: u8, dev: &mut Devices<'_>) {
        let entry = match self.dies[ch as usize][way as usize].sub_ring.front()
        {
            Some(e) => *e,
            None => return,
        };
        let off = entry.scratch_off as usize;
        match entry.request {
            Request::ReadTrigger | Request::ReadRaw => {
                dev.nand.read_page_trigger(ch, way, entry.row_addr);
            }
            Request::ReadTransfer => {
                dev.nand.read_page_transfer(
                    ch,
                    way,
                    entry.row_addr,
                    &mut self.bbt_scratch[off..off + PAGE_BYTES],
                    &mut self.spare,
                );
            }
            Request::ReadTransferRaw => {
                dev.nand.read_page_transfer_raw(
                    ch,
                    way,
                    &mut self.bbt_scratch[off..off + PAGE_BYTES],
                );
            }
            Request::Program => {
                dev.nand.program_page(
                    ch,
                    way,
                    entry.row_addr,
                    &self.bbt_scratch[off..off + PAGE_BYTES],
                    &self.spare,
                );
            }
            Request::Erase => {
                dev.nand.erase_block(ch, way, entry.row_addr);
            }
            Request::Reset => dev.nand.reset(ch, way),
            Request::SetFeatures => dev.nand.enter_toggle_mode(ch, way),
            _ => {
                ringlog_entry!(self.log, Event::UndefinedRequest { ch, way });
            }
        }
    }

    // ------------------------------------------------------------------
    // Status polling
    // ------------------------------------------------------------------

    /// Polls the front primary-ring operation. For read transfers the
    /// completion word and ECC information are authoritative; everything
    /// else goes through the two-step status-register protocol.
    fn check_req_status(
        &mut self,
        ch: u8,
        way: u8,
        dev: &mut Devices<'_>,
    ) -> ReqStatus {
        let front = match self.dies[ch as usize][way as usize]
            .req_ring
            .front_mut()
        {
            Some(e) => e,
            None => return ReqStatus::Running,
        };
        if front.request == Request::ReadTransfer {
            if dev.nand.completion_word(ch, way) & 1 != 0 {
                return match dev.nand.ecc_info(ch, way).status() {
                    EccStatus::Pass => ReqStatus::Done,
                    EccStatus::Warning => ReqStatus::Warning,
                    EccStatus::Fail => ReqStatus::Fail,
                };
            }
            return ReqStatus::Running;
        }
        match front.status_option {
            StatusOption::StatusCheck => {
                dev.nand.status_check(ch, way);
                front.status_option = StatusOption::CheckStatusReport;
                ReqStatus::Running
            }
            StatusOption::CheckStatusReport => {
                let word = dev.nand.completion_word(ch, way);
                if word & 1 == 0 {
                    return ReqStatus::Running;
                }
                let status = word >> 1;
                if status & 0x60 == 0x60 {
                    if status & 3 != 0 {
                        ReqStatus::Fail
                    } else {
                        ReqStatus::Done
                    }
                } else {
                    // Stale or garbled report; reissue the status command.
                    front.status_option = StatusOption::StatusCheck;
                    ReqStatus::Running
                }
            }
            StatusOption::None => ReqStatus::Running,
        }
    }

    /// Polls the front sub-ring operation. Raw transfers have no ECC and a
    /// sub-ring ECC check never warns (maintenance reads don't feed the
    /// bad-block flow); reset and set-features trust the ready/busy pin.
    fn check_sub_status(
        &mut self,
        ch: u8,
        way: u8,
        dev: &mut Devices<'_>,
    ) -> ReqStatus {
        let front = match self.dies[ch as usize][way as usize]
            .sub_ring
            .front_mut()
        {
            Some(e) => e,
            None => return ReqStatus::Running,
        };
        if front.request == Request::ReadTransfer {
            if dev.nand.completion_word(ch, way) & 1 != 0 {
                return match dev.nand.ecc_info(ch, way).status() {
                    EccStatus::Fail => ReqStatus::Fail,
                    _ => ReqStatus::Done,
                };
            }
            return ReqStatus::Running;
        }
        if front.request == Request::ReadTransferRaw {
            if dev.nand.completion_word(ch, way) & 1 != 0 {
                return ReqStatus::Done;
            }
            return ReqStatus::Running;
        }
        match front.status_option {
            StatusOption::StatusCheck => {
                dev.nand.status_check(ch, way);
                front.status_option = StatusOption::CheckStatusReport;
                ReqStatus::Running
            }
            StatusOption::CheckStatusReport => {
                let word = dev.nand.completion_word(ch, way);
                if word & 1 == 0 {
                    return ReqStatus::Running;
                }
                let status = word >> 1;
                if status & 0x60 == 0x60 {
                    if status & 3 != 0 {
                        ReqStatus::Fail
                    } else {
                        ReqStatus::Done
                    }
                } else {
                    front.status_option = StatusOption::StatusCheck;
                    ReqStatus::Running
                }
            }
            StatusOption::None => {
                if (dev.nand.ready_busy(ch) >> way) & 1 != 0 {
                    ReqStatus::Done
                } else {
                    ReqStatus::Running
                }
            }
        }
    }

    /// Whether the front entry's buffer has no DMA still in flight. Retired
    /// directions are cleared as they are observed.
    fn check_dma(&mut self, ch: u8, way: u8, dev: &mut Devices<'_>) -> bool {
        let front = match self.dies[ch as usize][way as usize].req_ring.front()
        {
            Some(e) => *e,
            None => return true,
        };
        let flight = dev.bufs.dma_flight_mut(front.buf);
        if let Some(snap) = flight.tx {
            if dev.dma.tx_partial_done(snap) {
                flight.tx = None;
            } else {
                return false;
            }
        }
        if let Some(snap) = flight.rx {
            if dev.dma.rx_partial_done(snap) {
                flight.rx = None;
            } else {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Per-die state machine
    // ------------------------------------------------------------------

    fn exe_per_die(
        &mut self,
        ch: u8,
        way: u8,
        status: ReqStatus,
        dev: &mut Devices<'_>,
    ) {
        let step = self.dies[ch as usize][way as usize].step;
        let select = self.dies[ch as usize][way as usize].queue_select;
        match step {
            DieStep::Idle => match select {
                QueueKind::Req => {
                    if self.pop_req(ch, way, dev) {
                        self.dies[ch as usize][way as usize].step =
                            DieStep::Exe {
                                retries_left: RETRY_LIMIT,
                            };
                    } else {
                        // A DMA operation retired at issue; use the slack to
                        // reduce any parked page.
                        self.drain_mailbox(ch, way, dev);
                    }
                }
                QueueKind::Sub => {
                    self.pop_sub(ch, way, dev);
                    self.dies[ch as usize][way as usize].step = DieStep::Exe {
                        retries_left: RETRY_LIMIT,
                    };
                }
            },
            DieStep::Exe { retries_left } | DieStep::Reexe { retries_left } => {
                match status {
                    ReqStatus::Done => self.on_done(ch, way, dev),
                    ReqStatus::Fail => self.on_fail(ch, way, retries_left),
                    ReqStatus::Warning => self.on_warning(ch, way),
                    ReqStatus::Running => self.drain_mailbox(ch, way, dev),
                }
            }
            DieStep::TrFail { retries_left } => {
                match select {
                    QueueKind::Req => {
                        self.pop_req(ch, way, dev);
                    }
                    QueueKind::Sub => self.pop_sub(ch, way, dev),
                }
                self.dies[ch as usize][way as usize].step =
                    DieStep::TrReexe { retries_left };
            }
            DieStep::TrReexe { retries_left } => match status {
                ReqStatus::Done => {
                    // The reissued trigger sensed the page; re-execute the
                    // transfer that originally failed.
                    let die = &mut self.dies[ch as usize][way as usize];
                    let front = match select {
                        QueueKind::Req => {
                            die.req_ring.front_mut().map(|e| &mut e.request)
                        }
                        QueueKind::Sub => {
                            die.sub_ring.front_mut().map(|e| &mut e.request)
                        }
                    };
                    if let Some(request) = front {
                        *request = Request::ReadTransfer;
                    }
                    die.step = DieStep::Fail { retries_left };
                }
                ReqStatus::Fail => self.on_trigger_refail(ch, way, retries_left),
                ReqStatus::Running => {}
                ReqStatus::Warning => {
                    ringlog_entry!(self.log, Event::BadStatus { ch, way });
                }
            },
            DieStep::Fail { retries_left } => {
                match select {
                    QueueKind::Req => {
                        self.pop_req(ch, way, dev);
                    }
                    QueueKind::Sub => self.pop_sub(ch, way, dev),
                }
                self.dies[ch as usize][way as usize].step =
                    DieStep::Reexe { retries_left };
            }
        }
    }

    fn on_done(&mut self, ch: u8, way: u8, dev: &mut Devices<'_>) {
        let select = self.dies[ch as usize][way as usize].queue_select;
        match select {
            QueueKind::Req => {
                let front = match self.dies[ch as usize][way as usize]
                    .req_ring
                    .front()
                {
                    Some(e) => *e,
                    None => return,
                };
                if front.request == Request::ReadTrigger {
                    if let Some(e) = self.dies[ch as usize][way as usize]
                        .req_ring
                        .front_mut()
                    {
                        e.request = Request::ReadTransfer;
                    }
                } else if let (Request::ReadTransfer, Some(tag)) =
                    (front.request, front.translate)
                {
                    // Publish the read page for reduction. The front is
                    // advanced only after the mailbox holds the handoff, so
                    // the buffer can't be re-targeted before it's reduced.
                    self.drain_mailbox(ch, way, dev);
                    let die = &mut self.dies[ch as usize][way as usize];
                    die.mailbox = Some(PageHandoff {
                        entry: tag.entry,
                        buf: front.buf,
                        page_idx: tag.page_idx,
                    });
                    die.req_ring.advance();
                } else {
                    self.dies[ch as usize][way as usize].req_ring.advance();
                }
            }
            QueueKind::Sub => {
                let die = &mut self.dies[ch as usize][way as usize];
                let front = match die.sub_ring.front_mut() {
                    Some(e) => e,
                    None => return,
                };
                match front.request {
                    Request::ReadTrigger => {
                        front.request = Request::ReadTransfer;
                    }
                    Request::ReadRaw => {
                        front.request = Request::ReadTransferRaw;
                    }
                    _ => die.sub_ring.advance(),
                }
            }
        }
        self.dies[ch as usize][way as usize].step = DieStep::Idle;
    }

    fn on_fail(&mut self, ch: u8, way: u8, retries_left: u8) {
        if retries_left == 0 {
            self.abandon_front(ch, way);
            return;
        }
        let die = &mut self.dies[ch as usize][way as usize];
        let was_transfer = match die.queue_select {
            QueueKind::Req => {
                let front = match die.req_ring.front_mut() {
                    Some(e) => e,
                    None => return,
                };
                front.status_option = StatusOption::StatusCheck;
                if front.request == Request::ReadTransfer {
                    // Re-sense before re-transferring.
                    front.request = Request::ReadTrigger;
                    true
                } else {
                    false
                }
            }
            QueueKind::Sub => {
                let front = match die.sub_ring.front_mut() {
                    Some(e) => e,
                    None => return,
                };
                front.status_option = StatusOption::StatusCheck;
                if front.request == Request::ReadTransfer {
                    front.request = Request::ReadTrigger;
                    true
                } else {
                    false
                }
            }
        };
        die.step = if was_transfer {
            DieStep::TrFail {
                retries_left: retries_left - 1,
            }
        } else {
            DieStep::Fail {
                retries_left: retries_left - 1,
            }
        };
    }

    /// A reissued trigger failed again (TrReexe state).
    fn on_trigger_refail(&mut self, ch: u8, way: u8, retries_left: u8) {
        let select = self.dies[ch as usize][way as usize].queue_select;
        let die = &mut self.dies[ch as usize][way as usize];
        if retries_left > 0 {
            match select {
                QueueKind::Req => {
                    if let Some(e) = die.req_ring.front_mut() {
                        e.status_option = StatusOption::StatusCheck;
                    }
                }
                QueueKind::Sub => {
                    if let Some(e) = die.sub_ring.front_mut() {
                        e.status_option = StatusOption::StatusCheck;
                    }
                }
            }
            die.step = DieStep::TrFail {
                retries_left: retries_left - 1,
            };
        } else {
            self.abandon_front(ch, way);
        }
    }

    /// Retry budget exhausted: log, drop the operation, return to idle.
    fn abandon_front(&mut self, ch: u8, way: u8) {
        let select = self.dies[ch as usize][way as usize].queue_select;
        match select {
            QueueKind::Req => {
                let die = &mut self.dies[ch as usize][way as usize];
                let request = match die.req_ring.front() {
                    Some(e) => e.request,
                    None => return,
                };
                die.req_ring.advance();
                ringlog_entry!(
                    self.log,
                    Event::RetryExhausted { ch, way, request }
                );
            }
            QueueKind::Sub => {
                let die = &mut self.dies[ch as usize][way as usize];
                let front = match die.sub_ring.front() {
                    Some(e) => *e,
                    None => return,
                };
                if front.request == Request::ReadRaw {
                    // The scan interprets the first byte as the bad-block
                    // mark; an unreadable page must scan as "good" so only
                    // verified marks condemn a block.
                    self.bbt_scratch[front.scratch_off as usize] = 0;
                }
                die.sub_ring.advance();
                ringlog_entry!(
                    self.log,
                    Event::RetryExhausted {
                        ch,
                        way,
                        request: front.request
                    }
                );
            }
        }
        self.dies[ch as usize][way as usize].step = DieStep::Idle;
    }

    fn on_warning(&mut self, ch: u8, way: u8) {
        let die = &mut self.dies[ch as usize][way as usize];
        let row_addr = match die.req_ring.front() {
            Some(e) => e.row_addr,
            None => return,
        };
        let block = phys_block_of_row(row_addr);
        die.note_bad_block(block);
        die.req_ring.advance();
        die.step = DieStep::Idle;
        self.bad_block_update = true;
        ringlog_entry!(self.log, Event::BadBlock { ch, way, block });
    }

    // ------------------------------------------------------------------
    // Way classification
    // ------------------------------------------------------------------

    /// Re-files an unlinked way onto the list its next operation calls for,
    /// preferring the `first` ring class.
    fn classify(&mut self, ch: u8, way: u8, first: QueueKind) {
        let die = &mut self.dies[ch as usize][way as usize];
        let (primary_empty, secondary_empty, primary) = match first {
            QueueKind::Req => {
                (die.req_ring.is_empty(), die.sub_ring.is_empty(), QueueKind::Req)
            }
            QueueKind::Sub => {
                (die.sub_ring.is_empty(), die.req_ring.is_empty(), QueueKind::Sub)
            }
        };
        let request = if primary_empty {
            die.queue_select = primary.other();
            if secondary_empty {
                self.ways[ch as usize].push_tail(WayList::Idle, way);
                return;
            }
            match primary.other() {
                QueueKind::Req => die.req_ring.front().map(|e| e.request),
                QueueKind::Sub => die.sub_ring.front().map(|e| e.request),
            }
        } else {
            die.queue_select = primary;
            match primary {
                QueueKind::Req => die.req_ring.front().map(|e| e.request),
                QueueKind::Sub => die.sub_ring.front().map(|e| e.request),
            }
        };
        let list = match request {
            Some(Request::RxDma) | Some(Request::TxDma) => WayList::NvmeDma,
            Some(Request::ReadTrigger) | Some(Request::ReadRaw) => {
                WayList::NandTrigger
            }
            Some(Request::ReadTransfer) | Some(Request::ReadTransferRaw) => {
                WayList::NandTransfer
            }
            Some(Request::Program) => WayList::NandTrigNTrans,
            Some(Request::Erase) => WayList::NandErase,
            _ => WayList::NandStatus,
        };
        self.ways[ch as usize].push_tail(list, way);
    }

    // ------------------------------------------------------------------
    // Translation plumbing
    // ------------------------------------------------------------------

    /// Runs the parked reduction for a die, if any.
    ///
    /// This is the only call site of `translate_page` for flash-read pages,
    /// so reductions never reenter the arbiter.
    fn drain_mailbox(&mut self, ch: u8, way: u8, dev: &mut Devices<'_>) {
        if let Some(h) = self.dies[ch as usize][way as usize].mailbox.take() {
            let page = dev.bufs.page(h.buf);
            self.trans.translate_page(h.entry, page, h.page_idx);
        }
    }

    fn drain_channel_mailboxes(&mut self, ch: u8, dev: &mut Devices<'_>) {
        for way in 0..W as u8 {
            self.drain_mailbox(ch, way, dev);
        }
    }

    /// Drains the first pending reduction on the channel, if any. A
    /// controller-busy yield gives back exactly one reduction's worth of
    /// time before releasing the channel.
    fn drain_one_mailbox(&mut self, ch: u8, dev: &mut Devices<'_>) {
        for way in 0..W as u8 {
            if self.dies[ch as usize][way as usize].mailbox.is_some() {
                self.drain_mailbox(ch, way, dev);
                return;
            }
        }
    }

    /// One pop attempt on the config-processing queue.
    fn pop_trans_rq(&mut self, dev: &mut Devices<'_>) -> bool {
        let cur = match self.trans.rq.current() {
            Some(c) => c,
            None => return false,
        };
        let item = *self.trans.rq.item(cur);
        let configured = self.trans.entry(item.entry).configured()
            || self.trans.check_config_dma(item.entry, &*dev.dma);
        let next = if configured {
            self.translate_pages_nonblocking(item.entry, item.next_page, dev)
        } else {
            Some(item.next_page)
        };
        match next {
            None => self.trans.rq.retire_current(),
            Some(page) => {
                self.trans.rq.item_mut(cur).next_page = page;
                self.trans.rq.advance_current();
            }
        }
        !self.trans.rq.is_empty()
    }

    /// One pop attempt on the read-return queue.
    fn pop_trans_read_rq(&mut self, dev: &mut Devices<'_>) -> bool {
        let cur = match self.trans.read_rq.current() {
            Some(c) => c,
            None => return false,
        };
        let item = *self.trans.read_rq.item(cur);
        let shipped = self.trans.read_translated_sectors(
            item.entry,
            item.first_sector,
            item.next_sector,
            item.nlb,
            item.cmd_slot_tag,
            &mut *dev.dma,
        );
        let node = self.trans.read_rq.item_mut(cur);
        node.nlb -= shipped;
        node.next_sector += shipped;
        if node.nlb == 0 {
            self.trans.read_rq.retire_current();
        } else {
            self.trans.read_rq.advance_current();
        }
        !self.trans.read_rq.is_empty()
    }

    /// Schedules reads (or reduces inline) for the entry's remaining pages.
    /// Returns the page index to resume at if a die's ring was too full, or
    /// `None` when every page is scheduled.
    fn translate_pages_nonblocking(
        &mut self,
        entry: u8,
        start_page: u16,
        dev: &mut Devices<'_>,
    ) -> Option<u16> {
        let n_pages = self.trans.entry(entry).n_pages();
        for page in start_page..n_pages {
            let lpa =
                self.trans.entry(entry).plan(page).slba / SECTORS_PER_PAGE as u32;
            if !self.read_page_to_translate(entry, lpa, page, dev) {
                return Some(page);
            }
        }
        None
    }

    /// Sources one plan page: from the page buffer if cached, otherwise by
    /// queueing a translate-tagged read. Unmapped pages reduce as zeroes.
    /// Returns false if the target die can't take the read yet.
    fn read_page_to_translate(
        &mut self,
        entry: u8,
        lpa: u32,
        page_idx: u16,
        dev: &mut Devices<'_>,
    ) -> bool {
        if let Some(hit) = dev.bufs.check_hit(lpa) {
            let page = dev.bufs.page(hit);
            self.trans.translate_page(entry, page, page_idx);
            return true;
        }

        let die_count = (CH * W) as u32;
        let die = lpa % die_count;
        let die_lpn = lpa / die_count;
        let ch = (die as usize % CH) as u8;
        let way = (die as usize / CH) as u8;

        // Refuse rather than wedge the die: the read needs a trigger slot
        // now and a transfer rewrite later.
        if !self.dies[ch as usize][way as usize].req_ring.can_accept(2) {
            return false;
        }
        let buf = dev.bufs.allocate(lpa);

        match dev.map.ppn(die, die_lpn) {
            Some(ppn) => {
                let req = LowLevelReq {
                    ch,
                    way,
                    request: Request::ReadTrigger,
                    lpage: ppn,
                    buf,
                    translate: Some(crate::queues::TransTag {
                        entry,
                        page_idx,
                    }),
                    cmd_slot_tag: 0,
                    start_dma_index: 0,
                    start_sector: 0,
                    sector_count: 0,
                };
                let pushed = self.push_req_nonblocking(&req, 0);
                debug_assert!(pushed);
            }
            None => {
                dev.bufs.page_mut(buf).fill(0);
                let page = dev.bufs.page(buf);
                self.trans.translate_page(entry, page, page_idx);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // The per-channel arbiter
    // ------------------------------------------------------------------

    /// One arbiter pass over a channel. Returns whether the channel still
    /// has (or produced) work.
    fn service_channel(
        &mut self,
        ch: u8,
        first: QueueKind,
        dev: &mut Devices<'_>,
    ) -> bool {
        let chu = ch as usize;
        let mut trans_waiting = self.pop_trans_read_rq(dev);

        // Idle sweep: put newly loaded ways to work. If the whole channel
        // is idle, spend the pass on translation instead.
        if self.ways[chu].head(WayList::Idle).is_some() {
            let mut idle_ways = 0;
            let mut way = self.ways[chu].head(WayList::Idle);
            while let Some(w) = way {
                let die = &self.dies[chu][w as usize];
                if !die.req_ring.is_empty() || !die.sub_ring.is_empty() {
                    let next = self.ways[chu].next(w);
                    self.ways[chu].unlink(w);
                    self.classify(ch, w, first);
                    way = next;
                } else {
                    idle_ways += 1;
                    way = self.ways[chu].next(w);
                }
            }
            if idle_ways == W {
                trans_waiting |= self.pop_trans_rq(dev);
                self.drain_channel_mailboxes(ch, dev);
                return trans_waiting;
            }
        }

        // Status-report sweep: harvest completions from ready dies.
        if self.ways[chu].head(WayList::StatusReport).is_some() {
            let ready = dev.nand.ready_busy(ch);
            let mut way = self.ways[chu].head(WayList::StatusReport);
            while let Some(w) = way {
                if (ready >> w) & 1 == 0 {
                    way = self.ways[chu].next(w);
                    continue;
                }
                let select = self.dies[chu][w as usize].queue_select;
                let status = match select {
                    QueueKind::Req => self.check_req_status(ch, w, dev),
                    QueueKind::Sub => self.check_sub_status(ch, w, dev),
                };
                if status != ReqStatus::Running {
                    let next = self.ways[chu].next(w);
                    self.ways[chu].unlink(w);
                    self.exe_per_die(ch, w, status, dev);
                    self.classify(ch, w, first);
                    way = next;
                    continue;
                }
                // The protocol bounced back to StatusCheck: the status
                // command must be reissued as a NAND primitive.
                let bounced = match select {
                    QueueKind::Req => self.dies[chu][w as usize]
                        .req_ring
                        .front()
                        .map(|e| e.status_option),
                    QueueKind::Sub => self.dies[chu][w as usize]
                        .sub_ring
                        .front()
                        .map(|e| e.status_option),
                };
                if bounced == Some(StatusOption::StatusCheck) {
                    let next = self.ways[chu].next(w);
                    self.ways[chu].unlink(w);
                    self.ways[chu].push_tail(WayList::NandStatus, w);
                    way = next;
                } else {
                    way = self.ways[chu].next(w);
                }
            }
        }

        // Host DMA sweep: no bus constraint, but a way only advances once
        // its buffer's earlier transfers have retired.
        if self.ways[chu].head(WayList::NvmeDma).is_some() {
            let mut way = self.ways[chu].head(WayList::NvmeDma);
            while let Some(w) = way {
                let enable = match self.dies[chu][w as usize].queue_select {
                    QueueKind::Req => self.check_dma(ch, w, dev),
                    QueueKind::Sub => panic!("dma operation on sub ring"),
                };
                if enable {
                    let next = self.ways[chu].next(w);
                    self.ways[chu].unlink(w);
                    self.exe_per_die(ch, w, ReqStatus::Running, dev);
                    self.classify(ch, w, first);
                    way = next;
                } else {
                    way = self.ways[chu].next(w);
                }
            }
        }

        if !dev.nand.is_controller_busy(ch) {
            // Status issue: ready dies get their status command on the bus.
            if self.ways[chu].head(WayList::NandStatus).is_some() {
                let ready = dev.nand.ready_busy(ch);
                let mut way = self.ways[chu].head(WayList::NandStatus);
                while let Some(w) = way {
                    if (ready >> w) & 1 == 0 {
                        way = self.ways[chu].next(w);
                        continue;
                    }
                    self.ways[chu].unlink(w);
                    match self.dies[chu][w as usize].queue_select {
                        QueueKind::Req => {
                            self.check_req_status(ch, w, dev);
                        }
                        QueueKind::Sub => {
                            self.check_sub_status(ch, w, dev);
                        }
                    }
                    self.ways[chu].push_tail(WayList::StatusReport, w);
                    if dev.nand.is_controller_busy(ch) {
                        self.drain_one_mailbox(ch, dev);
                        return true;
                    }
                    way = None;
                }
            }

            for (list, relink, dma_gated) in [
                (WayList::NandTrigger, WayList::NandStatus, false),
                (WayList::NandErase, WayList::NandStatus, false),
                (WayList::NandTrigNTrans, WayList::NandStatus, true),
                (WayList::NandTransfer, WayList::StatusReport, true),
            ] {
                if self.issue_sweep(ch, list, relink, dma_gated, dev) {
                    self.drain_one_mailbox(ch, dev);
                    return true;
                }
            }
        }

        self.drain_channel_mailboxes(ch, dev);
        true
    }

    /// Issues at most one primitive from `list`, re-filing the way onto
    /// `relink`. Returns true if the channel went busy and must be yielded.
    fn issue_sweep(
        &mut self,
        ch: u8,
        list: WayList,
        relink: WayList,
        dma_gated: bool,
        dev: &mut Devices<'_>,
    ) -> bool {
        let chu = ch as usize;
        let mut way = self.ways[chu].head(list);
        while let Some(w) = way {
            let enable = if dma_gated {
                match self.dies[chu][w as usize].queue_select {
                    QueueKind::Req => self.check_dma(ch, w, dev),
                    QueueKind::Sub => true,
                }
            } else {
                true
            };
            if enable {
                self.ways[chu].unlink(w);
                self.exe_per_die(ch, w, ReqStatus::Running, dev);
                self.ways[chu].push_tail(relink, w);
                if dev.nand.is_controller_busy(ch) {
                    return true;
                }
                way = None;
            } else {
                way = self.ways[chu].next(w);
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Pass drivers and drains
    // ------------------------------------------------------------------

    /// One arbiter pass over every channel.
    pub(crate) fn channels_pass(
        &mut self,
        first: QueueKind,
        dev: &mut Devices<'_>,
    ) -> bool {
        let mut pending = false;
        for ch in 0..CH as u8 {
            pending |= self.service_channel(ch, first, dev);
        }
        pending
    }

    /// One scheduler invocation: a pass over every channel, followed by the
    /// bad-block table rewrite if any die reported a warning.
    pub fn service(
        &mut self,
        first: QueueKind,
        dev: &mut Devices<'_>,
    ) -> Summary {
        let work_pending = self.channels_pass(first, dev);
        let bad_block_update = self.bad_block_update;
        if bad_block_update {
            self.rewrite_bad_block_tables(first, dev);
        }
        Summary {
            work_pending,
            bad_block_update,
        }
    }

    /// Runs passes until no channel reports work.
    fn drain_queues(&mut self, first: QueueKind, dev: &mut Devices<'_>) {
        while self.channels_pass(first, dev) {}
    }

    /// Drains everything (both rings, translation work) and then handles
    /// any pending bad-block update.
    pub fn drain_all(&mut self, first: QueueKind, dev: &mut Devices<'_>) {
        self.drain_queues(first, dev);
        if self.bad_block_update {
            self.rewrite_bad_block_tables(first, dev);
        }
    }

    /// Drains every primary ring to empty, then handles any pending
    /// bad-block update.
    pub fn drain_primary(&mut self, dev: &mut Devices<'_>) {
        loop {
            self.channels_pass(QueueKind::Req, dev);
            let empty = self
                .dies
                .iter()
                .flatten()
                .all(|d| d.req_ring.is_empty());
            if empty {
                break;
            }
        }
        if self.bad_block_update {
            self.rewrite_bad_block_tables(QueueKind::Req, dev);
        }
    }

    /// Drains every sub ring to empty, then handles any pending bad-block
    /// update.
    pub fn drain_sub(&mut self, dev: &mut Devices<'_>) {
        loop {
            self.channels_pass(QueueKind::Sub, dev);
            let empty = self
                .dies
                .iter()
                .flatten()
                .all(|d| d.sub_ring.is_empty());
            if empty {
                break;
            }
        }
        if self.bad_block_update {
            self.rewrite_bad_block_tables(QueueKind::Sub, dev);
        }
    }

    // ------------------------------------------------------------------
    // Bad-block table rewrite
    // ------------------------------------------------------------------

    /// Folds newly discovered bad blocks into each affected die's on-flash
    /// table: drain, read the table's LSB pages, set the mark bytes, erase
    /// the metadata block, write the pages back, drain again.
    fn rewrite_bad_block_tables(
        &mut self,
        first: QueueKind,
        dev: &mut Devices<'_>,
    ) {
        self.drain_queues(first, dev);
        if !self.bad_block_update {
            return;
        }
        self.bad_block_update = false;

        let table_bytes = bbt_table_bytes();
        let stride = bbt_die_stride();
        let first_page = self.metadata_block * SLC_PAGES_PER_BLOCK + 1;

        // Pull the current table images in, one scratch lane per die.
        let mut page = 0u32;
        let mut remaining = table_bytes as isize;
        while remaining > 0 {
            for way in 0..W as u8 {
                for ch in 0..CH as u8 {
                    let off = (way as usize * CH + ch as usize) * stride
                        + page as usize * PAGE_BYTES;
                    self.push_sub(
                        ch,
                        way,
                        SubRequest::ReadLsbPage,
                        first_page + page,
                        off as u32,
                        dev,
                    );
                }
            }
            page += 1;
            remaining -= PAGE_BYTES as isize;
        }
        self.drain_queues(first, dev);

        // Apply the marks and tell the FTL.
        let mut dirty = [[false; W]; CH];
        let mut dirty_dies = 0u8;
        for ch in 0..CH {
            for way in 0..W {
                let blocks =
                    core::mem::take(&mut self.dies[ch][way].new_bad_blocks);
                if blocks.is_empty() {
                    continue;
                }
                dirty[ch][way] = true;
                dirty_dies += 1;
                for &block in &blocks {
                    let off = (way * CH + ch) * stride + block as usize;
                    self.bbt_scratch[off] = 1;
                    dev.bad_blocks.update_bad_block(
                        ch as u8,
                        way as u8,
                        block,
                    );
                }
            }
        }

        // Erase and write back for every die that changed.
        let mut page = 0u32;
        let mut remaining = table_bytes as isize;
        while remaining > 0 {
            for way in 0..W as u8 {
                for ch in 0..CH as u8 {
                    if !dirty[ch as usize][way as usize] {
                        continue;
                    }
                    if page == 0 {
                        let block_first_page = self.metadata_block
                            * pages_per_block(self.cell_mode);
                        self.push_sub(
                            ch,
                            way,
                            SubRequest::EraseBlock,
                            block_first_page,
                            0,
                            dev,
                        );
                    }
                    let off = (way as usize * CH + ch as usize) * stride
                        + page as usize * PAGE_BYTES;
                    self.push_sub(
                        ch,
                        way,
                        SubRequest::WriteLsbPage,
                        first_page + page,
                        off as u32,
                        dev,
                    );
                }
            }
            page += 1;
            remaining -= PAGE_BYTES as isize;
        }
        self.drain_queues(first, dev);
        ringlog_entry!(
            self.log,
            Event::BadBlockTableRewrite { dies: dirty_dies }
        );
    }
}
