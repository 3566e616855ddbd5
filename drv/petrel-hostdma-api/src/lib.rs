// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the petrel host DMA engine.
//!
//! The engine moves one FTL sector per descriptor between host memory
//! (addressed indirectly through the command slot tag and a per-command DMA
//! index) and device memory (handed over as a slice when the descriptor is
//! enqueued). Descriptors retire in FIFO order per direction; completion of
//! a specific batch is detected by snapshotting the engine's tail/overflow
//! counters right after enqueueing it and later asking whether the engine
//! has advanced past the snapshot ("partial done").

#![cfg_attr(not(test), no_std)]

/// Tail/overflow snapshot of one DMA direction, taken just after enqueueing
/// a batch of descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaSnapshot {
    pub tail: u8,
    pub overflow: u32,
}

/// In-flight DMA state of one page-buffer entry.
///
/// Stored with the buffer entry (not the request) because a later request on
/// the same buffer must be able to wait for an earlier request's transfers:
/// a program waits for the RX DMA that filled its buffer, a buffer reuse
/// waits for the TX DMA that drained it.
#[derive(Copy, Clone, Debug, Default)]
pub struct DmaFlight {
    pub rx: Option<DmaSnapshot>,
    pub tx: Option<DmaSnapshot>,
}

impl DmaFlight {
    /// True when no transfer is outstanding in either direction.
    pub fn idle(&self) -> bool {
        self.rx.is_none() && self.tx.is_none()
    }
}

/// Host DMA engine operations.
///
/// `dma_index` is the per-command sector index used to locate the host-side
/// address; it wraps at 256 (the engine's descriptor window), so callers
/// step it with `wrapping_add(1)` on a `u8`.
pub trait HostDma {
    /// Enqueues one host-to-device sector into `dest`.
    fn set_auto_rx_dma(&mut self, cmd_slot_tag: u16, dma_index: u8, dest: &mut [u8]);

    /// Enqueues one device-to-host sector from `src`.
    fn set_auto_tx_dma(&mut self, cmd_slot_tag: u16, dma_index: u8, src: &[u8]);

    /// Snapshot of the RX fifo tail and overflow counter.
    fn rx_snapshot(&self) -> DmaSnapshot;

    /// Snapshot of the TX fifo tail and overflow counter.
    fn tx_snapshot(&self) -> DmaSnapshot;

    /// Whether every RX descriptor enqueued before `snap` was taken has
    /// retired.
    fn rx_partial_done(&self, snap: DmaSnapshot) -> bool;

    /// Whether every TX descriptor enqueued before `snap` was taken has
    /// retired.
    fn tx_partial_done(&self, snap: DmaSnapshot) -> bool;
}
