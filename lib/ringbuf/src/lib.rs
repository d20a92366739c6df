// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing kernel events.
//!
//! This contains an implementation for a static ring buffer designed to be used
//! to instrument arbitrary contexts, including interrupt handlers and the
//! context switch path. The buffers are plain statics, so they can be read out
//! of a halted target with a debugger, e.g.:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print kern::sched::SCHED_RINGBUF
//! ```
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! Ring buffers are instantiated with the [`ringbuf!`] macro, to which one
//! must provide the type of per-entry payload, the number of entries, and a
//! static initializer:
//!
//! ```
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! Entries are generated with [`ringbuf_entry!`]:
//!
//! ```
//! ringbuf_entry!(Trace::Tick(now));
//! ```
//!
//! or, for a named buffer, `ringbuf_entry!(MY_RINGBUF, payload)`.
//!
//! When an entry is recorded from the same line with the same payload as the
//! most recent entry, the most recent entry's `count` goes up instead of a new
//! slot being consumed, so a hot loop doesn't wash out the history.

#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;
use critical_section::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase,
/// and by convention ends in `RINGBUF`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::StaticRingbuf::record(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single [`Ringbuf`] entry, carrying a payload of arbitrary type.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    /// Bumped each time this slot is overwritten, so a reader can tell a
    /// stale slot from a fresh one.
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
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
        if let Some(ent) = self.last.and_then(|i| self.buffer.get_mut(i)) {
            if ent.line == line && ent.payload == payload {
                // Only fold into the previous entry while the count has room.
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        // Wrap by comparison rather than remainder: several of our targets
        // have no hardware divide. An out-of-range `last` restarts at 0.
        let ndx = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Iterates over the recorded entries, oldest first. Slots that have
    /// never been written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter(|e| e.count != 0)
    }
}

/// A [`Ringbuf`] that can live in a `static` and be written from any
/// context, including interrupt handlers.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize>(
    Mutex<RefCell<Ringbuf<T, N>>>,
);

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self(Mutex::new(RefCell::new(Ringbuf::new(init))))
    }

    pub fn record(&self, line: u16, payload: T) {
        critical_section::with(|cs| {
            self.0.borrow_ref_mut(cs).entry(line, payload)
        });
    }

    /// Runs `body` with shared access to the buffer contents.
    pub fn inspect<R>(&self, body: impl FnOnce(&Ringbuf<T, N>) -> R) -> R {
        critical_section::with(|cs| body(&self.0.borrow_ref(cs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payloads<const N: usize>(rb: &Ringbuf<u32, N>) -> Vec<(u32, u32)> {
        rb.iter().map(|e| (e.payload, e.count)).collect()
    }

    #[test]
    fn repeated_entries_fold_into_count() {
        let mut rb = Ringbuf::<u32, 4>::new(0);
        rb.entry(10, 7);
        rb.entry(10, 7);
        rb.entry(10, 7);
        assert_eq!(payloads(&rb), vec![(7, 3)]);
    }

    #[test]
    fn same_payload_from_another_line_gets_own_slot() {
        let mut rb = Ringbuf::<u32, 4>::new(0);
        rb.entry(10, 7);
        rb.entry(11, 7);
        assert_eq!(payloads(&rb), vec![(7, 1), (7, 1)]);
    }

    #[test]
    fn oldest_entries_are_overwritten() {
        let mut rb = Ringbuf::<u32, 3>::new(0);
        for p in 1..=5 {
            rb.entry(1, p);
        }
        assert_eq!(payloads(&rb), vec![(3, 1), (4, 1), (5, 1)]);
        assert_eq!(rb.buffer[0].generation, 2, "slot 0 written twice");
    }

    #[test]
    fn corrupt_last_restarts_at_zero() {
        let mut rb = Ringbuf::<u32, 3>::new(0);
        rb.last = Some(99);
        rb.entry(1, 5);
        assert_eq!(rb.last, Some(0));
    }

    #[test]
    fn static_ringbuf_records_through_macro() {
        ringbuf!(TEST_RINGBUF, u32, 8, 0);
        ringbuf_entry!(TEST_RINGBUF, 1);
        ringbuf_entry!(TEST_RINGBUF, 2);
        let seen = TEST_RINGBUF
            .inspect(|rb| rb.iter().map(|e| e.payload).collect::<Vec<_>>());
        assert_eq!(seen, vec![1, 2]);
    }

    proptest! {
        #[test]
        fn counts_add_up(entries in prop::collection::vec(0u32..3, 0..64)) {
            // With a buffer large enough to hold every distinct run, the sum
            // of counts equals the number of entries recorded.
            let mut rb = Ringbuf::<u32, 64>::new(0);
            for &p in &entries {
                rb.entry(1, p);
            }
            let total: u32 = rb.iter().map(|e| e.count).sum();
            prop_assert_eq!(total as usize, entries.len());
        }
    }
}
