//! Per-connection handlers and the bounded pool they are drawn from.
//!
//! A handler owns the parser and response buffer for one connection. The
//! pool caps how many connections can be serviced at once and recycles
//! handler allocations across connections, mirroring how the chunk pool
//! recycles buffer chunks.

use crate::http::parser::Parser;
use crate::runtime::buffer::{ChunkBuffer, ChunkPool};

/// Direction a connection is currently driven in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Reading and parsing request bytes.
    Reading,
    /// Flushing the assembled response.
    Writing,
}

/// State for a single connection: parser, pending response, write progress.
pub struct Handler {
    pub state: HandlerState,
    pub parser: Parser,
    pub response: ChunkBuffer,
    /// Bytes of `response` already written to the socket.
    pub write_mark: usize,
}

impl Handler {
    pub fn new(chunk_size: usize) -> Self {
        Handler {
            state: HandlerState::Reading,
            parser: Parser::new(chunk_size),
            response: ChunkBuffer::new(chunk_size),
            write_mark: 0,
        }
    }

    /// Switch from parsing to flushing the response.
    pub fn start_writing(&mut self) {
        self.state = HandlerState::Writing;
        self.write_mark = 0;
    }

    /// Return the handler to its initial state, releasing chunks to the pool.
    pub fn reset(&mut self, pool: &mut ChunkPool) {
        self.state = HandlerState::Reading;
        self.parser.reset(pool);
        self.response.clear(pool);
        self.write_mark = 0;
    }
}

/// Bounded free list of handlers.
///
/// `acquire` refuses once `max_handlers` are live; the caller drops the
/// connection instead of queueing it. Released handlers are reset and kept
/// for reuse so steady-state traffic does not allocate.
pub struct HandlerPool {
    free: Vec<Handler>,
    live: usize,
    max_handlers: usize,
    chunk_size: usize,
}

impl HandlerPool {
    pub fn new(chunk_size: usize, max_handlers: usize) -> Self {
        HandlerPool {
            free: Vec::new(),
            live: 0,
            max_handlers,
            chunk_size,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Take a handler, or `None` if the pool is at capacity.
    pub fn acquire(&mut self) -> Option<Handler> {
        if self.live >= self.max_handlers {
            return None;
        }
        self.live += 1;
        Some(
            self.free
                .pop()
                .unwrap_or_else(|| Handler::new(self.chunk_size)),
        )
    }

    /// Return a handler after its connection closes.
    pub fn release(&mut self, mut handler: Handler, chunks: &mut ChunkPool) {
        handler.reset(chunks);
        self.live -= 1;
        self.free.push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 16;

    #[test]
    fn test_pool_enforces_cap() {
        let mut pool = HandlerPool::new(CHUNK, 2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.live(), 2);

        let mut chunks = ChunkPool::new(CHUNK, 8);
        pool.release(a, &mut chunks);
        assert_eq!(pool.live(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_released_handler_is_clean() {
        let mut chunks = ChunkPool::new(CHUNK, 8);
        let mut pool = HandlerPool::new(CHUNK, 4);

        let mut handler = pool.acquire().unwrap();
        handler.parser.feed(b"GET / HTTP/1.1\r\n\r\n", &mut chunks);
        handler.parser.advance(&mut chunks);
        handler
            .response
            .append(b"HTTP/1.1 200 OK\r\n", &mut chunks)
            .unwrap();
        handler.start_writing();
        handler.write_mark = 5;
        pool.release(handler, &mut chunks);

        let reused = pool.acquire().unwrap();
        assert_eq!(reused.state, HandlerState::Reading);
        assert_eq!(reused.write_mark, 0);
        assert!(reused.response.is_empty());
        assert_eq!(reused.parser.buffered(), 0);
    }

    #[test]
    fn test_release_recycles_chunks() {
        let mut chunks = ChunkPool::new(CHUNK, 8);
        let mut pool = HandlerPool::new(CHUNK, 4);

        let mut handler = pool.acquire().unwrap();
        handler.response.append(&[b'x'; 40], &mut chunks).unwrap();
        assert_eq!(chunks.pooled(), 0);
        pool.release(handler, &mut chunks);
        assert!(chunks.pooled() >= 3);
    }
}
