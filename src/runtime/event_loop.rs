//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue
//! on macOS.
//!
//! One thread drives the listener and every connection. A connection is
//! readable-registered while its parser wants bytes, then flipped to
//! writable once a response is assembled, then torn down after the flush.

use crate::config::Config;
use crate::http::parser::{ParseError, Status};
use crate::http::response;
use crate::runtime::buffer::ChunkPool;
use crate::runtime::handler::{Handler, HandlerPool, HandlerState};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;

struct Connection {
    stream: TcpStream,
    handler: Handler,
}

/// Outcome of draining a readable socket.
enum SocketRead {
    /// Read until WouldBlock; the peer is still open.
    Drained,
    /// The peer half-closed; no more bytes will arrive.
    Eof,
    /// A hard socket error.
    Failed(io::Error),
}

/// Run the server until the process is killed.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    let listener = create_listener(addr, config.backlog)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut chunks = ChunkPool::new(config.chunk_size, config.max_pooled_chunks);
    let mut handlers = HandlerPool::new(chunks.chunk_size(), config.max_handlers);
    let mut connections: Slab<Connection> = Slab::with_capacity(config.max_handlers);
    // One socket read fills at most one buffer chunk.
    let mut scratch = vec![0u8; config.chunk_size];

    info!(
        addr = %addr,
        chunk_size = config.chunk_size,
        max_handlers = config.max_handlers,
        "Server started"
    );

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        &mut handlers,
                        &mut chunks,
                    );
                }
                Token(conn_id) => {
                    match handle_connection_event(
                        conn_id,
                        event,
                        &mut poll,
                        &mut connections,
                        &mut chunks,
                        &mut scratch,
                    ) {
                        Ok(false) => {}
                        Ok(true) => {
                            close_connection(
                                &mut poll,
                                &mut connections,
                                &mut handlers,
                                &mut chunks,
                                conn_id,
                            );
                        }
                        Err(e) => {
                            debug!(conn_id, error = %e, "Connection error");
                            close_connection(
                                &mut poll,
                                &mut connections,
                                &mut handlers,
                                &mut chunks,
                                conn_id,
                            );
                        }
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    handlers: &mut HandlerPool,
    chunks: &mut ChunkPool,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let handler = match handlers.acquire() {
                    Some(handler) => handler,
                    None => {
                        warn!(peer = %peer_addr, "Handler pool exhausted, dropping connection");
                        continue;
                    }
                };

                let conn_id = connections.insert(Connection { stream, handler });

                // Re-borrow after insert
                let conn = &mut connections[conn_id];
                if let Err(e) =
                    poll.registry()
                        .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                {
                    // A per-descriptor registration failure only costs this
                    // connection; the server keeps serving others.
                    warn!(conn_id, peer = %peer_addr, error = %e, "Failed to register connection, dropping");
                    close_connection(poll, connections, handlers, chunks, conn_id);
                    continue;
                }

                debug!(conn_id, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Dispatch readiness for one connection. `Ok(true)` means the connection
/// finished its exchange and should be closed without logging an error.
fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    chunks: &mut ChunkPool,
    scratch: &mut [u8],
) -> io::Result<bool> {
    if !connections.contains(conn_id) {
        return Ok(false);
    }

    if event.is_readable() {
        handle_readable(conn_id, poll, connections, chunks, scratch)?;
    }

    if event.is_writable() {
        return handle_writable(conn_id, connections);
    }

    Ok(false)
}

/// Drain the socket into the parser's buffer until WouldBlock or EOF.
/// `scratch` sets the read grain; the loop sizes it to one chunk.
fn drain_socket(
    stream: &mut TcpStream,
    handler: &mut Handler,
    chunks: &mut ChunkPool,
    scratch: &mut [u8],
) -> SocketRead {
    loop {
        match stream.read(&mut *scratch) {
            Ok(0) => return SocketRead::Eof,
            Ok(n) => handler.parser.feed(&scratch[..n], chunks),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return SocketRead::Drained,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return SocketRead::Failed(e),
        }
    }
}

fn handle_readable(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    chunks: &mut ChunkPool,
    scratch: &mut [u8],
) -> io::Result<()> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.handler.state != HandlerState::Reading {
        return Ok(());
    }

    let eof = match drain_socket(&mut conn.stream, &mut conn.handler, chunks, scratch) {
        SocketRead::Drained => false,
        SocketRead::Eof => true,
        SocketRead::Failed(e) => {
            conn.handler.parser.fail_read();
            return Err(e);
        }
    };

    match conn.handler.parser.advance(chunks) {
        Status::Wait => {
            if eof {
                // Peer stopped mid-request; nothing sensible to answer.
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF before request completed",
                ));
            }
            // Stay registered for readable.
            Ok(())
        }
        Status::Error(ParseError::Read) => {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "read failed"))
        }
        terminal => {
            if let Status::Error(ref e) = terminal {
                debug!(conn_id, error = %e, "Request rejected");
            }
            if response::build(&conn.handler.parser, &mut conn.handler.response, chunks).is_err() {
                // Could not even assemble an error response.
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "chunk pool exhausted"));
            }
            conn.handler.start_writing();
            poll.registry()
                .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
            Ok(())
        }
    }
}

/// Flush the response. `Ok(true)` once fully sent.
fn handle_writable(conn_id: usize, connections: &mut Slab<Connection>) -> io::Result<bool> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.handler.state != HandlerState::Writing {
        return Ok(false);
    }

    let n = conn
        .handler
        .response
        .write_to(conn.handler.write_mark, &mut conn.stream)?;
    conn.handler.write_mark += n;

    if conn.handler.write_mark >= conn.handler.response.size() {
        // One request per connection; flush complete means we are done.
        debug!(conn_id, bytes = conn.handler.write_mark, "Response sent");
        Ok(true)
    } else {
        // Partial write, stay registered for writable.
        Ok(false)
    }
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    handlers: &mut HandlerPool,
    chunks: &mut ChunkPool,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        handlers.release(conn.handler, chunks);
        debug!(conn_id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const CHUNK: usize = 8;

    /// Connected nonblocking server-side stream plus the client end.
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), client)
    }

    #[test]
    fn test_dropped_connection_restores_pool_accounting() {
        // An accepted connection that never made it past registration is
        // torn down the same way as any other; the handler goes back to
        // the pool and the slab entry disappears.
        let (stream, _client) = socket_pair();

        let mut poll = Poll::new().unwrap();
        let mut chunks = ChunkPool::new(CHUNK, 16);
        let mut handlers = HandlerPool::new(CHUNK, 4);
        let mut connections: Slab<Connection> = Slab::new();

        let handler = handlers.acquire().unwrap();
        let conn_id = connections.insert(Connection { stream, handler });
        assert_eq!(handlers.live(), 1);

        // The stream was never registered; close must tolerate that.
        close_connection(&mut poll, &mut connections, &mut handlers, &mut chunks, conn_id);
        assert!(connections.is_empty());
        assert_eq!(handlers.live(), 0);
        assert!(handlers.acquire().is_some());
    }

    #[test]
    fn test_drain_socket_reads_in_chunk_size_grains() {
        let (mut stream, mut client) = socket_pair();
        let input: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        client.write_all(input).unwrap();

        let mut chunks = ChunkPool::new(CHUNK, 16);
        let mut handler = Handler::new(CHUNK);
        // Scratch smaller than the payload forces several read calls.
        let mut scratch = vec![0u8; CHUNK];

        for _ in 0..100 {
            match drain_socket(&mut stream, &mut handler, &mut chunks, &mut scratch) {
                SocketRead::Drained => {
                    if handler.parser.buffered() == input.len() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                SocketRead::Eof | SocketRead::Failed(_) => panic!("peer still open"),
            }
        }
        assert_eq!(handler.parser.buffered(), input.len());
        assert_eq!(handler.parser.advance(&mut chunks), Status::Done);
    }

    #[test]
    fn test_drain_socket_reports_eof() {
        let (mut stream, client) = socket_pair();
        drop(client);

        let mut chunks = ChunkPool::new(CHUNK, 16);
        let mut handler = Handler::new(CHUNK);
        let mut scratch = vec![0u8; CHUNK];

        for _ in 0..100 {
            match drain_socket(&mut stream, &mut handler, &mut chunks, &mut scratch) {
                SocketRead::Eof => return,
                SocketRead::Drained => std::thread::sleep(Duration::from_millis(10)),
                SocketRead::Failed(e) => panic!("unexpected error: {e}"),
            }
        }
        panic!("EOF never observed");
    }
}

/// Create a non-blocking TCP listener with the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}
