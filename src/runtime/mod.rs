//! Readiness-driven runtime.
//!
//! Shared pieces:
//! - `ChunkPool` / `ChunkBuffer`: pooled chunked byte buffers
//! - `Handler` / `HandlerPool`: bounded per-connection state
//!
//! `event_loop` wires them to a mio poll loop (epoll on Linux, kqueue on
//! macOS) that owns the listener and every connection on one thread.

pub mod buffer;
mod event_loop;
pub mod handler;

use crate::config::Config;

/// Run the server with the given configuration.
pub fn run(config: Config) -> std::io::Result<()> {
    event_loop::run(config)
}
