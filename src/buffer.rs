// Copyright 2025 The stoker authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection byte buffer with separate read and write cursors.

use std::io::{self, IoSliceMut, Read, Write};

/// Stack scratch used by [`Buffer::read_from`] so a single scatter read can
/// pull in far more than the buffer's current tail.
const SCRATCH_LEN: usize = 128 * 1024;

/// A growable, contiguous byte buffer addressed by two cursors.
///
/// The readable span is `[read_pos, write_pos)`, the writable tail is
/// `[write_pos, capacity)`, and `[0, read_pos)` is space already consumed
/// that compaction may reclaim. Both cursors only move forward until an
/// explicit reset.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with `capacity` bytes of initial backing storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that fit after the write cursor without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Number of already-consumed bytes in front of the read cursor.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable span.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Appends `src`, compacting or growing the backing storage as needed.
    pub fn append(&mut self, src: &[u8]) {
        self.ensure_writable(src.len());
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    /// Consumes `len` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`Buffer::readable_bytes`].
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.read_pos += len;
    }

    /// Consumes everything up to `end`, an offset into the readable span.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Discards all content and rewinds both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Takes the readable span out as a string and resets the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Reads from `src` with a single scatter read across the writable tail
    /// and a large stack scratch; whatever lands in the scratch is appended
    /// afterwards. This is the only path that grows the buffer from socket
    /// I/O. Under edge-triggered readiness the caller loops until the read
    /// reports `WouldBlock`.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let writable = self.writable_bytes();
        let n = {
            let write_pos = self.write_pos;
            let mut segments = [
                IoSliceMut::new(&mut self.data[write_pos..]),
                IoSliceMut::new(&mut scratch),
            ];
            src.read_vectored(&mut segments)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `dst` once, consuming however many bytes
    /// the call accepted.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = dst.write(self.peek())?;
        self.read_pos += n;
        Ok(n)
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Either compacts the readable span to the front (when the reclaimed
    /// head plus the tail can hold `len`) or grows the backing storage.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.data.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(1024)
    }
}
