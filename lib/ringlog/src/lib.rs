// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring for instrumenting driver state machines.
//!
//! A `Ringlog` stores the `N` most recent trace entries recorded by its
//! owner, along with the source line that recorded each one. Entries are
//! de-duplicated: recording the same payload from the same line twice in a
//! row bumps a count on the existing entry instead of consuming a slot, so a
//! polling loop that observes the same condition thousands of times doesn't
//! erase the interesting history around it.
//!
//! Unlike a `static` debug ring inspected from outside the running image,
//! this one is an ordinary owned value: embed it in your driver state and
//! record entries with [`ringlog_entry!`], which captures `line!()` for you:
//!
//! ```
//! use ringlog::{ringlog_entry, Ringlog};
//!
//! #[derive(Copy, Clone, Debug, PartialEq, Eq)]
//! enum Event {
//!     None,
//!     RetryExhausted { ch: u8, way: u8 },
//! }
//!
//! let mut log = Ringlog::<Event, 16>::new(Event::None);
//! ringlog_entry!(log, Event::RetryExhausted { ch: 0, way: 3 });
//! ```
//!
//! The payload type must be `Copy` (entries are stored by value) and
//! `PartialEq` (for de-duplication).

#![cfg_attr(not(test), no_std)]

/// A single recorded entry.
///
/// When an entry is recorded with an identical `line` and `payload` to the
/// most recent one, `count` is incremented rather than a new entry written.
#[derive(Debug, Copy, Clone)]
pub struct Entry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub count: u16,
    pub payload: T,
}

/// A ring of the `N` most recent entries.
#[derive(Debug)]
pub struct Ringlog<T: Copy, const N: usize> {
    last: Option<usize>,
    buffer: [Entry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringlog<T, N> {
    /// Creates an empty ring. `init` fills the unused slots; it is never
    /// reported by [`Self::iter`].
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [Entry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    /// Records `payload` from source line `line`.
    ///
    /// Normally called through [`ringlog_entry!`] rather than directly.
    pub fn record_entry(&mut self, line: u16, payload: T) {
        // Treat "never recorded" as an out-of-range index so the dedup probe
        // below falls through on first use.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Reuse the entry only if the count doesn't saturate.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let next = last.wrapping_add(1);
            if next >= N {
                0
            } else {
                next
            }
        };
        let ent = &mut self.buffer[ndx];
        *ent = Entry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if anything has been recorded.
    pub fn last(&self) -> Option<&Entry<T>> {
        self.last.map(|ndx| &self.buffer[ndx])
    }

    /// Iterates over every live entry, in buffer (not insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.buffer.iter().filter(|e| e.count != 0)
    }

    /// Checks whether `payload` has ever been recorded and is still in the
    /// ring.
    pub fn contains(&self, payload: &T) -> bool {
        self.iter().any(|e| e.payload == *payload)
    }
}

/// Records an entry in a [`Ringlog`], capturing the current source line.
#[macro_export]
macro_rules! ringlog_entry {
    ($buf:expr, $payload:expr) => {{
        let p = $payload;
        $crate::Ringlog::record_entry(&mut $buf, line!() as u16, p);
    }};
}
