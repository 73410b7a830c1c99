//! Chunked request/response storage.
//!
//! A `ChunkBuffer` is a logically flat byte sequence backed by a chain of
//! fixed-size chunks recycled through a `ChunkPool`. Chunked storage lets a
//! buffer grow to arbitrary request size without copying already-scanned
//! bytes, and lets fully-consumed prefixes be reclaimed in O(1).
//!
//! Chunks move between the pool and exactly one buffer; there is no shared
//! arena and no index bookkeeping, so use-after-release is unrepresentable.

use std::collections::VecDeque;
use std::io::{self, Write};
use thiserror::Error;

/// Chunk allocation failed; reported to the client as a 500-class condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("chunk allocation failed")]
pub struct OutOfMemory;

/// Free-list of fixed-size chunks shared by every buffer in the process.
///
/// The pool retains at most `max_pooled` idle chunks; releases beyond that
/// bound return memory to the allocator. Access is strictly sequential (one
/// event-loop thread), so no synchronization is needed.
pub struct ChunkPool {
    free: Vec<Vec<u8>>,
    chunk_size: usize,
    max_pooled: usize,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, max_pooled: usize) -> Self {
        Self {
            free: Vec::new(),
            chunk_size,
            max_pooled,
        }
    }

    /// Size of every chunk handed out by this pool.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of idle chunks currently retained.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    /// Pop a recycled chunk or allocate a fresh one.
    ///
    /// Fails only when the allocator cannot provide `chunk_size` bytes.
    /// Recycled chunks are zeroed; callers must not rely on prior content.
    pub fn acquire(&mut self) -> Result<Vec<u8>, OutOfMemory> {
        if let Some(mut chunk) = self.free.pop() {
            chunk.fill(0);
            return Ok(chunk);
        }
        let mut chunk = Vec::new();
        chunk.try_reserve_exact(self.chunk_size).map_err(|_| OutOfMemory)?;
        chunk.resize(self.chunk_size, 0);
        Ok(chunk)
    }

    /// Return a chunk to the free list, or drop it if the pool is full.
    pub fn release(&mut self, chunk: Vec<u8>) {
        debug_assert_eq!(chunk.len(), self.chunk_size, "foreign chunk released");
        if self.free.len() < self.max_pooled {
            self.free.push(chunk);
        }
    }
}

/// Append-only, shiftable byte sequence backed by a chunk chain.
///
/// Invariant: `size == (chunks - 1) * chunk_size + tail_used` whenever the
/// chain is non-empty. Grows only by append, shrinks only by shift.
pub struct ChunkBuffer {
    chunks: VecDeque<Vec<u8>>,
    chunk_size: usize,
    size: usize,
    tail_used: usize,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            chunk_size,
            size: 0,
            tail_used: 0,
        }
    }

    /// Logical length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks currently in the chain.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Copy `data` into the tail, acquiring chunks from the pool as needed.
    ///
    /// On failure the bytes copied so far remain in the buffer; the caller
    /// treats the whole request as an out-of-memory condition anyway.
    pub fn append(&mut self, data: &[u8], pool: &mut ChunkPool) -> Result<(), OutOfMemory> {
        let mut copied = 0;
        while copied < data.len() {
            if self.chunks.is_empty() || self.tail_used == self.chunk_size {
                self.chunks.push_back(pool.acquire()?);
                self.tail_used = 0;
            }
            let tail = self.chunks.back_mut().unwrap();
            let n = (self.chunk_size - self.tail_used).min(data.len() - copied);
            tail[self.tail_used..self.tail_used + n].copy_from_slice(&data[copied..copied + n]);
            self.tail_used += n;
            self.size += n;
            copied += n;
        }
        Ok(())
    }

    /// Single-byte append, same contract as [`append`](Self::append).
    pub fn append_byte(&mut self, byte: u8, pool: &mut ChunkPool) -> Result<(), OutOfMemory> {
        self.append(&[byte], pool)
    }

    /// Byte at `offset`, or `None` when the offset is past the end.
    pub fn get(&self, offset: usize) -> Option<u8> {
        if offset >= self.size {
            return None;
        }
        Some(self.chunks[offset / self.chunk_size][offset % self.chunk_size])
    }

    /// Does the buffer contain `pat` at `offset`? Case sensitive.
    ///
    /// Returns `false` when fewer than `pat.len()` bytes remain at `offset`.
    pub fn starts_with(&self, offset: usize, pat: &[u8]) -> bool {
        self.compare_at(offset, pat, false)
    }

    /// Case-insensitive variant of [`starts_with`](Self::starts_with).
    pub fn istarts_with(&self, offset: usize, pat: &[u8]) -> bool {
        self.compare_at(offset, pat, true)
    }

    // Compares without copying, splitting the comparison at chunk
    // boundaries: partial head chunk, full middle chunks, partial tail.
    fn compare_at(&self, offset: usize, pat: &[u8], ignore_case: bool) -> bool {
        if self.size < offset || self.size - offset < pat.len() {
            return false;
        }
        let mut done = 0;
        while done < pat.len() {
            let at = offset + done;
            let chunk = &self.chunks[at / self.chunk_size];
            let start = at % self.chunk_size;
            let n = (self.chunk_size - start).min(pat.len() - done);
            let held = &chunk[start..start + n];
            let wanted = &pat[done..done + n];
            let equal = if ignore_case {
                held.eq_ignore_ascii_case(wanted)
            } else {
                held == wanted
            };
            if !equal {
                return false;
            }
            done += n;
        }
        true
    }

    /// Materialize a contiguous copy of `len` bytes starting at `offset`.
    ///
    /// Fails only on allocation failure.
    ///
    /// # Panics
    /// Panics if the range extends past the end of the buffer.
    pub fn copy_out(&self, offset: usize, len: usize) -> Result<Vec<u8>, OutOfMemory> {
        assert!(offset + len <= self.size, "copy_out range out of bounds");
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| OutOfMemory)?;
        let mut done = 0;
        while done < len {
            let at = offset + done;
            let chunk = &self.chunks[at / self.chunk_size];
            let start = at % self.chunk_size;
            let n = (self.chunk_size - start).min(len - done);
            out.extend_from_slice(&chunk[start..start + n]);
            done += n;
        }
        Ok(out)
    }

    /// Drop the head chunk back to the pool, returning the bytes reclaimed.
    ///
    /// Reclaims `chunk_size` bytes when more chunks follow, everything when
    /// the head is the only chunk, and 0 when the buffer is empty. The
    /// caller is responsible for only shifting fully-consumed prefixes.
    pub fn shift(&mut self, pool: &mut ChunkPool) -> usize {
        let Some(head) = self.chunks.pop_front() else {
            return 0;
        };
        let reclaimed = if self.chunks.is_empty() {
            let r = self.size;
            self.size = 0;
            self.tail_used = 0;
            r
        } else {
            self.size -= self.chunk_size;
            self.chunk_size
        };
        pool.release(head);
        reclaimed
    }

    /// Stream buffer content from `offset` into `sink`.
    ///
    /// Honors partial writes: `WouldBlock` ends the call with the bytes
    /// written so far, and the caller tracks its own cursor across repeated
    /// calls. A sink that accepts zero bytes is reported as `WriteZero`.
    pub fn write_to(&self, offset: usize, sink: &mut impl Write) -> io::Result<usize> {
        let mut written = 0;
        while offset + written < self.size {
            let at = offset + written;
            let index = at / self.chunk_size;
            let valid = if index == self.chunks.len() - 1 {
                self.tail_used
            } else {
                self.chunk_size
            };
            let slice = &self.chunks[index][at % self.chunk_size..valid];
            match sink.write(slice) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(written),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Release every chunk back to the pool and reset to empty.
    pub fn clear(&mut self, pool: &mut ChunkPool) {
        while let Some(chunk) = self.chunks.pop_front() {
            pool.release(chunk);
        }
        self.size = 0;
        self.tail_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_acquire_release() {
        let mut pool = ChunkPool::new(64, 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.pooled(), 0);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.pooled(), 2);

        // Beyond the retention bound the chunk is dropped, not pooled.
        pool.release(c);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_pool_recycled_chunk_is_clean() {
        let mut pool = ChunkPool::new(8, 4);

        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"stale!!!", &mut pool).unwrap();
        buf.clear(&mut pool);

        // The recycled chunk carries nothing over.
        let chunk = pool.acquire().unwrap();
        assert!(chunk.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_append_and_get() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());

        buf.append(b"hello world", &mut pool).unwrap();
        assert_eq!(buf.size(), 11);
        assert_eq!(buf.chunk_count(), 3); // 4 + 4 + 3

        assert_eq!(buf.get(0), Some(b'h'));
        assert_eq!(buf.get(4), Some(b'o')); // chunk boundary
        assert_eq!(buf.get(10), Some(b'd'));
        assert_eq!(buf.get(11), None);
    }

    #[test]
    fn test_append_byte() {
        let mut pool = ChunkPool::new(2, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());

        for &b in b"abc" {
            buf.append_byte(b, &mut pool).unwrap();
        }
        assert_eq!(buf.size(), 3);
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.get(2), Some(b'c'));
    }

    #[test]
    fn test_starts_with_across_boundaries() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"Content-Length: 42", &mut pool).unwrap();

        assert!(buf.starts_with(0, b"Content-Length:"));
        assert!(buf.starts_with(8, b"Length"));
        assert!(!buf.starts_with(0, b"Content-Type"));
        // Not enough bytes left at the offset.
        assert!(!buf.starts_with(16, b"421"));
        // Empty pattern always matches.
        assert!(buf.starts_with(5, b""));
    }

    #[test]
    fn test_istarts_with() {
        let mut pool = ChunkPool::new(3, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"cOnTeNt-LeNgTh:", &mut pool).unwrap();

        assert!(buf.istarts_with(0, b"Content-Length:"));
        assert!(buf.istarts_with(0, b"CONTENT-LENGTH:"));
        assert!(!buf.starts_with(0, b"Content-Length:"));
    }

    #[test]
    fn test_copy_out_spanning_chunks() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"0123456789", &mut pool).unwrap();

        assert_eq!(buf.copy_out(0, 10).unwrap(), b"0123456789");
        assert_eq!(buf.copy_out(3, 4).unwrap(), b"3456");
        assert_eq!(buf.copy_out(9, 1).unwrap(), b"9");
        assert_eq!(buf.copy_out(10, 0).unwrap(), b"");
    }

    #[test]
    fn test_shift_conservation() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"0123456789", &mut pool).unwrap();

        let mut reclaimed = 0;
        reclaimed += buf.shift(&mut pool);
        assert_eq!(reclaimed, 4);
        assert_eq!(buf.size(), 6);
        // Logical offsets rebase after a shift.
        assert_eq!(buf.get(0), Some(b'4'));

        reclaimed += buf.shift(&mut pool);
        reclaimed += buf.shift(&mut pool); // last chunk reclaims the remainder
        assert_eq!(reclaimed, 10);
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.shift(&mut pool), 0); // no-op on empty

        // All chunks went back to the pool.
        assert_eq!(pool.pooled(), 3);
    }

    #[test]
    fn test_append_after_shift() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());

        buf.append(b"abcdef", &mut pool).unwrap();
        buf.shift(&mut pool);
        buf.append(b"gh", &mut pool).unwrap();

        assert_eq!(buf.size(), 4);
        assert_eq!(buf.copy_out(0, 4).unwrap(), b"efgh");
    }

    /// Write sink that accepts a fixed budget and then reports WouldBlock.
    struct Throttled {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = data.len().min(self.budget);
            self.accepted.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_to_partial_then_resume() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"hello world", &mut pool).unwrap();

        let mut sink = Throttled {
            accepted: Vec::new(),
            budget: 7,
        };
        let n = buf.write_to(0, &mut sink).unwrap();
        assert_eq!(n, 7);

        // Caller tracks the cursor and resumes where it left off.
        sink.budget = 64;
        let n2 = buf.write_to(n, &mut sink).unwrap();
        assert_eq!(n + n2, 11);
        assert_eq!(sink.accepted, b"hello world");
    }

    #[test]
    fn test_clear_returns_chunks() {
        let mut pool = ChunkPool::new(4, 16);
        let mut buf = ChunkBuffer::new(pool.chunk_size());
        buf.append(b"0123456789", &mut pool).unwrap();

        buf.clear(&mut pool);
        assert!(buf.is_empty());
        assert_eq!(buf.chunk_count(), 0);
        assert_eq!(pool.pooled(), 3);
    }
}
