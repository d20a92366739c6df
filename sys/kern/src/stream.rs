// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream devices, as seen by tasks.
//!
//! A serial port or similar device is something a task can write bytes to
//! and read lines from, blocking while it does. The kernel doesn't drive any
//! hardware itself; a driver implements `ByteStream`, typically by having
//! its interrupt handler feed a byte queue. `QueueStream` is that
//! arrangement, for drivers that don't need anything fancier.

use abi::{KernelError, Timeout};

use crate::api::Queue;

pub trait ByteStream {
    /// Writes as much of `bytes` as the device accepts, blocking as needed.
    /// Returns the number of bytes written.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Reads one line into `buf`, without its terminator, blocking until the
    /// line ends or `buf` is full. Returns the length of the line.
    fn read_line(&mut self, buf: &mut [u8]) -> usize;
}

/// Outcome of feeding a byte to `assemble_line`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineStep {
    More,
    Done,
}

/// Adds one received byte to the line in `buf[..*len]`.
///
/// `\n` ends the line and `\r` is dropped, so both Unix and CRLF line endings
/// work. Backspace and DEL remove the last byte. A full buffer also ends the
/// line.
pub fn assemble_line(buf: &mut [u8], len: &mut usize, byte: u8) -> LineStep {
    match byte {
        b'\n' => return LineStep::Done,
        b'\r' => {}
        0x08 | 0x7f => *len = len.saturating_sub(1),
        _ => {
            if let Some(slot) = buf.get_mut(*len) {
                *slot = byte;
                *len += 1;
            }
        }
    }
    if *len >= buf.len() {
        LineStep::Done
    } else {
        LineStep::More
    }
}

/// Reads a line from a byte source, stopping early if the source fails.
pub fn read_line_from<E>(
    buf: &mut [u8],
    mut next: impl FnMut() -> Result<u8, E>,
) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let mut len = 0;
    while let Ok(byte) = next() {
        if assemble_line(buf, &mut len, byte) == LineStep::Done {
            break;
        }
    }
    len
}

/// A `ByteStream` over a pair of byte queues: one drained by the device's
/// transmit side, one filled by its receive interrupt.
#[derive(Copy, Clone, Debug)]
pub struct QueueStream {
    tx: Queue<u8>,
    rx: Queue<u8>,
}

impl QueueStream {
    /// Creates both queues. Like any queue, this has to happen before the
    /// scheduler starts.
    pub fn create(
        tx_capacity: usize,
        rx_capacity: usize,
    ) -> Result<Self, KernelError> {
        Ok(Self {
            tx: Queue::create(tx_capacity)?,
            rx: Queue::create(rx_capacity)?,
        })
    }

    /// The queue the device should transmit from.
    pub fn tx(&self) -> Queue<u8> {
        self.tx
    }

    /// The queue the device's receive handler should send to, with
    /// `Timeout::NONE`.
    pub fn rx(&self) -> Queue<u8> {
        self.rx
    }
}

impl ByteStream for QueueStream {
    fn write(&mut self, bytes: &[u8]) -> usize {
        bytes
            .iter()
            .take_while(|b| self.tx.send(b, Timeout::Forever).is_ok())
            .count()
    }

    fn read_line(&mut self, buf: &mut [u8]) -> usize {
        let rx = self.rx;
        read_line_from(buf, || rx.receive(Timeout::Forever))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(input: &[u8], room: usize) -> Vec<u8> {
        let mut buf = vec![0; room];
        let mut bytes = input.iter().copied();
        let len = read_line_from(&mut buf, || bytes.next().ok_or(()));
        buf.truncate(len);
        buf
    }

    #[test]
    fn newline_ends_the_line() {
        assert_eq!(line(b"led on\nled off\n", 32), b"led on");
    }

    #[test]
    fn carriage_returns_are_dropped() {
        assert_eq!(line(b"status\r\n", 32), b"status");
    }

    #[test]
    fn full_buffer_ends_the_line() {
        assert_eq!(line(b"abcdefgh\n", 4), b"abcd");
    }

    #[test]
    fn backspace_erases() {
        assert_eq!(line(b"lef\x08d\x7f\x7fed\n", 32), b"led");
        assert_eq!(line(b"\x08\x08x\n", 32), b"x");
    }

    #[test]
    fn source_failure_returns_what_arrived() {
        assert_eq!(line(b"partial", 32), b"partial");
    }

    #[test]
    fn empty_buffer_reads_nothing() {
        let mut pulled = false;
        let n = read_line_from::<()>(&mut [], || {
            pulled = true;
            Ok(b'x')
        });
        assert_eq!(n, 0);
        assert!(!pulled);
    }
}
