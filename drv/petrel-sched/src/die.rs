// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-die scheduling state.

use drv_petrel_ftl_api::BufId;
use heapless::Vec;

use crate::queues::{ReqEntry, ReqRing, SubEntry, SubRing};

/// Capacity of the per-die list of freshly discovered bad blocks. Entries
/// are deduplicated, so this bounds distinct blocks between table rewrites.
pub const NEW_BAD_BLOCK_CAP: usize = 64;

/// Which ring the die is currently draining.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Req,
    Sub,
}

impl QueueKind {
    pub fn other(self) -> Self {
        match self {
            QueueKind::Req => QueueKind::Sub,
            QueueKind::Sub => QueueKind::Req,
        }
    }
}

/// Lifecycle step of the die's current operation. The retrying steps carry
/// their remaining retry budget, so abandoning an operation resets it
/// implicitly. Whether the operation came from the primary or sub ring is
/// `queue_select`; the transition logic is identical for both.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DieStep {
    /// Between operations; eligible to pop.
    Idle,
    /// An operation is in flight.
    Exe { retries_left: u8 },
    /// A read transfer failed; the restored trigger must be reissued.
    TrFail { retries_left: u8 },
    /// The reissued trigger is in flight.
    TrReexe { retries_left: u8 },
    /// A failed operation must be reissued.
    Fail { retries_left: u8 },
    /// The reissued operation is in flight.
    Reexe { retries_left: u8 },
}

/// Outcome of a status poll on the front operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReqStatus {
    Running,
    Done,
    Fail,
    /// Read recovered, but the block is going bad.
    Warning,
}

/// A completed translate-tagged read waiting for its reduction.
///
/// One slot per die: the ring front is advanced only after the handoff is
/// accepted here, and the arbiter drains the slot before the die can
/// publish again, so at most one unreduced page exists per die.
#[derive(Copy, Clone, Debug)]
pub struct PageHandoff {
    pub entry: u8,
    pub buf: BufId,
    pub page_idx: u16,
}

/// Everything the scheduler tracks per die.
pub struct Die {
    pub step: DieStep,
    pub queue_select: QueueKind,
    pub req_ring: ReqRing,
    pub sub_ring: SubRing,
    pub mailbox: Option<PageHandoff>,
    pub new_bad_blocks: Vec<u32, NEW_BAD_BLOCK_CAP>,
}

impl Die {
    pub fn new() -> Self {
        Self {
            step: DieStep::Idle,
            queue_select: QueueKind::Req,
            req_ring: ReqRing::new(ReqEntry::EMPTY),
            sub_ring: SubRing::new(SubEntry::EMPTY),
            mailbox: None,
            new_bad_blocks: Vec::new(),
        }
    }

    /// Records `block` for the next bad-block table rewrite, ignoring
    /// duplicates. Returns false if the list is full (the block will be
    /// rediscovered by a later warning).
    pub fn note_bad_block(&mut self, block: u32) -> bool {
        if self.new_bad_blocks.contains(&block) {
            return true;
        }
        self.new_bad_blocks.push(block).is_ok()
    }
}

impl Default for Die {
    fn default() -> Self {
        Self::new()
    }
}
