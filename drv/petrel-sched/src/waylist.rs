// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-channel way-priority lists.
//!
//! Every way on a channel sits on exactly one of eight intrusive
//! doubly-linked lists, according to what it needs from the channel next.
//! The arbiter walks the lists in a fixed priority order each pass. Links
//! are way indices (a channel has at most 15 ways), with `None` standing in
//! for the hardware's 0xf sentinel.

use enum_map::{Enum, EnumMap};

/// The eight priority classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum WayList {
    /// Nothing queued.
    Idle,
    /// A transfer or status command completed; its report needs reading.
    StatusReport,
    /// Front request is a host DMA ring operation.
    NvmeDma,
    /// Front request is a read trigger (or raw scan trigger).
    NandTrigger,
    /// Front request is a program: command and data issue in one
    /// controller-busy window.
    NandTrigNTrans,
    /// Front request is a read transfer.
    NandTransfer,
    /// Front request is an erase.
    NandErase,
    /// Awaiting ready, or a status command needs (re)issuing.
    NandStatus,
}

#[derive(Copy, Clone, Debug, Default)]
struct ListHead {
    head: Option<u8>,
    tail: Option<u8>,
}

#[derive(Copy, Clone, Debug)]
struct WayLink {
    prev: Option<u8>,
    next: Option<u8>,
    on: Option<WayList>,
}

/// The eight lists of one channel, plus the per-way link cells.
pub struct ChannelWays<const W: usize> {
    lists: EnumMap<WayList, ListHead>,
    links: [WayLink; W],
}

impl<const W: usize> Default for ChannelWays<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const W: usize> ChannelWays<W> {
    /// Creates the lists with every way on `Idle`.
    pub fn new() -> Self {
        let mut this = Self {
            lists: EnumMap::default(),
            links: [WayLink {
                prev: None,
                next: None,
                on: None,
            }; W],
        };
        for way in 0..W as u8 {
            this.push_tail(WayList::Idle, way);
        }
        this
    }

    pub fn head(&self, list: WayList) -> Option<u8> {
        self.lists[list].head
    }

    /// The way after `way` on its current list.
    pub fn next(&self, way: u8) -> Option<u8> {
        self.links[way as usize].next
    }

    /// Which list `way` is currently on; `None` only transiently, while the
    /// arbiter holds the way between unlink and reclassification.
    pub fn membership(&self, way: u8) -> Option<WayList> {
        self.links[way as usize].on
    }

    /// Detaches `way` from its current list.
    pub fn unlink(&mut self, way: u8) {
        let link = self.links[way as usize];
        let list = match link.on {
            Some(list) => list,
            None => return,
        };
        match link.prev {
            Some(p) => self.links[p as usize].next = link.next,
            None => self.lists[list].head = link.next,
        }
        match link.next {
            Some(n) => self.links[n as usize].prev = link.prev,
            None => self.lists[list].tail = link.prev,
        }
        let link = &mut self.links[way as usize];
        link.prev = None;
        link.next = None;
        link.on = None;
    }

    /// Appends `way` to the tail of `list`. The way must not be on a list.
    pub fn push_tail(&mut self, list: WayList, way: u8) {
        debug_assert!(self.links[way as usize].on.is_none());
        let tail = self.lists[list].tail;
        {
            let link = &mut self.links[way as usize];
            link.prev = tail;
            link.next = None;
            link.on = Some(list);
        }
        match tail {
            Some(t) => self.links[t as usize].next = Some(way),
            None => self.lists[list].head = Some(way),
        }
        self.lists[list].tail = Some(way);
    }
}
