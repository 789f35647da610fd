//! Write-side replay window.
//!
//! Every byte accepted by `write` gets an absolute offset. The buffer keeps a
//! contiguous window `[start, end)` of those bytes so that, after a
//! reconnect, everything from the peer's confirmed offset onward can be sent
//! again in its original order. The window is bounded by `capacity`; the
//! oldest bytes are evicted first.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default window: 64 MiB.
pub const DEFAULT_REPLAY_CAPACITY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("offset {requested} was evicted; oldest retained offset is {oldest}")]
    Evicted { requested: u64, oldest: u64 },

    #[error("offset {requested} is beyond write offset {end}")]
    Ahead { requested: u64, end: u64 },
}

/// Bounded byte window addressed by absolute stream offsets.
///
/// Writes are kept as the `Bytes` chunks they arrived in. Trimming the
/// front advances into the oldest chunk instead of copying.
#[derive(Debug)]
pub struct ReplayBuffer {
    /// Offset of the first byte of `chunks[0]`.
    start: u64,
    /// Never holds an empty chunk.
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            chunks: VecDeque::new(),
            len: 0,
            capacity: capacity.max(1),
        }
    }

    /// Offset of the oldest retained byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The write offset: total bytes ever appended.
    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks currently retained.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Copy `bytes` in as one chunk. See [`push`](Self::push).
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        self.push(Bytes::copy_from_slice(bytes))
    }

    /// Append a chunk, evicting from the front when over capacity.
    ///
    /// Returns the number of bytes evicted.
    pub fn push(&mut self, chunk: Bytes) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
        let overflow = self.len.saturating_sub(self.capacity);
        self.trim_front(overflow);
        overflow
    }

    /// Drop everything before `offset`; the peer has confirmed it.
    pub fn acknowledge(&mut self, offset: u64) -> Result<(), ReplayError> {
        self.check(offset)?;
        self.trim_front((offset - self.start) as usize);
        Ok(())
    }

    /// The bytes in `[offset, end)`. Shares storage when they sit in a
    /// single chunk; otherwise the chunks are joined into one buffer.
    pub fn slice_from(&self, offset: u64) -> Result<Bytes, ReplayError> {
        self.check(offset)?;
        let mut skip = (offset - self.start) as usize;
        let mut first = 0;
        while first < self.chunks.len() && skip >= self.chunks[first].len() {
            skip -= self.chunks[first].len();
            first += 1;
        }
        match self.chunks.len() - first {
            0 => Ok(Bytes::new()),
            1 => Ok(self.chunks[first].slice(skip..)),
            _ => {
                let mut out = BytesMut::with_capacity((self.end() - offset) as usize);
                for (i, chunk) in self.chunks.range(first..).enumerate() {
                    let from = if i == 0 { skip } else { 0 };
                    out.put_slice(&chunk[from..]);
                }
                Ok(out.freeze())
            }
        }
    }

    fn trim_front(&mut self, n: usize) {
        self.start += n as u64;
        self.len -= n;
        let mut left = n;
        while left > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= left {
                left -= front.len();
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(left);
                left = 0;
            }
        }
    }

    fn check(&self, offset: u64) -> Result<(), ReplayError> {
        if offset < self.start {
            return Err(ReplayError::Evicted {
                requested: offset,
                oldest: self.start,
            });
        }
        if offset > self.end() {
            return Err(ReplayError::Ahead {
                requested: offset,
                end: self.end(),
            });
        }
        Ok(())
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
