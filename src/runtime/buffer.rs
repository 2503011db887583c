//! Per-connection line framing.
//!
//! TCP delivers a byte stream with no message boundaries: a single read may
//! carry half a line, exactly one line, or several lines fused together.
//! `LineBuffer` accumulates those bytes and hands back complete
//! newline-terminated lines.
//!
//! ## Capacity
//!
//! The buffer has a fixed capacity, one byte of which is reserved for a
//! terminator, so at most `capacity - 1` bytes of a line are ever held. What
//! happens to a line longer than that is decided by `OverflowPolicy`.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::collections::VecDeque;

/// What to do with a line that does not fit in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Discard the excess bytes and deliver the line shortened.
    Truncate,
    /// Close the connection.
    Disconnect,
}

/// Sizing and overflow behaviour shared by every connection's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBufferConfig {
    /// Total capacity in bytes, including the reserved terminator byte.
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl Default for LineBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            policy: OverflowPolicy::Truncate,
        }
    }
}

/// Byte accumulator that extracts newline-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    capacity: usize,
    policy: OverflowPolicy,
    /// Lines completed by an overflow, waiting ahead of `buf`.
    ready: VecDeque<Bytes>,
    /// The trailing partial line lost bytes; drop input until its newline.
    truncating: bool,
    /// A line overflowed under `OverflowPolicy::Disconnect`.
    overflowed: bool,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new(config: LineBufferConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(config.capacity),
            capacity: config.capacity,
            policy: config.policy,
            ready: VecDeque::new(),
            truncating: false,
            overflowed: false,
        }
    }

    /// Bytes currently buffered in the partial-line area.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.ready.is_empty()
    }

    /// Bytes that can still be appended without overflowing.
    pub fn remaining(&self) -> usize {
        if self.overflowed {
            return 0;
        }
        self.capacity
            .saturating_sub(1)
            .saturating_sub(self.buf.len())
    }

    /// Whether a line overflowed under the `Disconnect` policy.
    ///
    /// Once set, the connection cannot make progress and should be closed.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Append a chunk of received bytes.
    ///
    /// Copies as many bytes as fit and returns that count. Bytes of a line
    /// that do not fit are discarded; with `OverflowPolicy::Truncate` the
    /// shortened line is completed by the next newline and framing resumes
    /// right after it.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        let mut accepted = 0;
        let mut rest = chunk;

        while !rest.is_empty() && !self.overflowed {
            if self.truncating {
                let Some(pos) = find_newline(rest) else {
                    break;
                };
                self.truncating = false;
                self.finish_truncated();
                rest = &rest[pos + 1..];
                continue;
            }

            let n = rest.len().min(self.remaining());
            self.buf.extend_from_slice(&rest[..n]);
            accepted += n;
            rest = &rest[n..];

            if rest.first() == Some(&b'\n') {
                // The terminator takes the reserved byte.
                self.buf.extend_from_slice(b"\n");
                accepted += 1;
                rest = &rest[1..];
                self.queue_complete_lines();
                continue;
            }

            if !rest.is_empty() {
                // Complete lines are not part of the overflowing line; move
                // them out of the way and retry before giving up on room.
                if find_newline(&self.buf).is_some() {
                    self.queue_complete_lines();
                    continue;
                }
                match self.policy {
                    OverflowPolicy::Truncate => self.truncating = true,
                    OverflowPolicy::Disconnect => self.overflowed = true,
                }
            }
        }

        accepted
    }

    /// Extract every complete line currently buffered.
    ///
    /// Each line is returned without its `\n` and without one trailing `\r`.
    /// Bytes of an incomplete line stay in the buffer for the next call.
    pub fn drain_lines(&mut self) -> Lines<'_> {
        Lines { buffer: self }
    }

    fn next_line(&mut self) -> Option<Bytes> {
        self.ready.pop_front().or_else(|| self.split_line())
    }

    fn split_line(&mut self) -> Option<Bytes> {
        let pos = find_newline(&self.buf)?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        Some(strip_cr(line.freeze()))
    }

    fn queue_complete_lines(&mut self) {
        while let Some(line) = self.split_line() {
            self.ready.push_back(line);
        }
    }

    /// Queue the buffered lines and the clipped partial line behind them.
    fn finish_truncated(&mut self) {
        self.queue_complete_lines();
        let tail = self.buf.split().freeze();
        self.ready.push_back(strip_cr(tail));
    }
}

/// Iterator over the complete lines in a `LineBuffer`.
///
/// Finite: ends as soon as no complete line remains.
pub struct Lines<'a> {
    buffer: &'a mut LineBuffer,
}

impl Iterator for Lines<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.buffer.next_line()
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn strip_cr(mut line: Bytes) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line
}
