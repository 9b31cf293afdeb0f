// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing kernel events
//!
//! A [`Ringbuf`] is a fixed-size record of the most recent events emitted by
//! some piece of code, meant to be read back by a debugger or by tests after
//! the fact. Each entry records the source line that produced it, a
//! generation count for its slot, and a repeat count: when the same line
//! emits the same payload twice in a row, the existing entry's count is bumped
//! instead of burning a new slot. This keeps noisy loops (a scheduler picking
//! the same process over and over, say) from flushing everything else out.
//!
//! ## Constraints
//!
//! The payload type must implement both `Copy` and `PartialEq`.
//!
//! ## Recording entries
//!
//! The buffer is an ordinary value; put it wherever the code that traces can
//! reach it mutably, and use [`ringbuf_entry!`] to record the calling line:
//!
//! ```
//! use ringbuf::{ringbuf_entry, Ringbuf};
//!
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Tick(u32),
//! }
//!
//! let mut buf: Ringbuf<Trace, 16> = Ringbuf::new(Trace::None);
//! ringbuf_entry!(buf, Trace::Tick(1));
//! assert_eq!(buf.iter().count(), 1);
//! ```
//!
//! With the `disabled` feature, [`ringbuf_entry!`] still evaluates its
//! arguments but records nothing.

#![cfg_attr(not(test), no_std)]

/// Inserts data into a ring buffer, tagged with the line of the call site.
///
/// `ringbuf_entry!(buf, expr)` records `expr` into `buf`, which must be a
/// place expression of type `Ringbuf<T, N>` that can be borrowed mutably.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer, so the payload
        // expression is free to read the buffer's owner.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Makes an empty buffer, with every slot holding `init` and a count of
    /// zero.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On first use, last is None; treat it as out of range so that we
        // deposit the first entry in slot 0 without merging into anything.
        let last = self.last.unwrap_or(usize::MAX);

        // Reuse the most recent entry if it's the same line and payload. This
        // uses get_mut so a corrupt `last` just starts us over at 0 instead of
        // panicking.
        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Not a remainder operation: many of our targets have no hardware
        // divide, and this turns usize::MAX into 0 for the starting case.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Zero-length buffer.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Iterates over recorded entries, oldest first. Slots that have never
    /// been written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(l) => l.wrapping_add(1),
            None => 0,
        };
        let (newer, older) =
            self.buffer.split_at(start.min(self.buffer.len()));
        older
            .iter()
            .chain(newer.iter())
            .filter(|e| e.count != 0)
    }

    /// Iterates over the payloads of recorded entries, oldest first.
    pub fn payloads(&self) -> impl Iterator<Item = T> + '_ {
        self.iter().map(|e| e.payload)
    }
}
