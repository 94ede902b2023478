//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Everything runs on the calling thread; the only blocking call is
//! `Poll::poll`.
//!
//! Each wake:
//! 1. accept pending connections,
//! 2. read readable sockets and dispatch every complete frame in order;
//!    a socket that still has data after [`READ_BUDGET`] chunks is revisited
//!    on the next turn instead of starving the others,
//! 3. flush queued output (partial writes keep WRITABLE interest),
//! 4. reap connections marked for closing and announce departures.

use crate::chat::dispatch::{on_disconnect, CommandTable, Context};
use crate::chat::{ConnId, Router, SessionRegistry};
use crate::config::Config;
use crate::protocol::{Frame, FrameError};
use crate::runtime::connection::{Connection, Connections};
use crate::storage::ConversationStore;
use bytes::Buf;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Chunks read from one socket per turn of the loop.
const READ_BUDGET: usize = 16;

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// The chat server: listener, connections and all chat state.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
    /// Sockets left readable because they hit the read budget.
    read_backlog: Vec<ConnId>,
    sessions: SessionRegistry,
    router: Router,
    commands: CommandTable,
    max_connections: usize,
    max_frame_size: usize,
    events_capacity: usize,
}

impl Server {
    /// Open the store and bind the listener. Failures here are fatal.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}:{}", config.host, config.port),
                )
            })?;

        let store = ConversationStore::open(&config.db_path)?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            listener,
            local_addr,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            connections: Connections::new(config.max_connections, config.max_pending_bytes),
            read_backlog: Vec::new(),
            sessions: SessionRegistry::new(),
            router: Router::new(store),
            commands: CommandTable::new(),
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
            events_capacity: config.events_capacity.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until [`ServerHandle::shutdown`] is called or a fatal error occurs.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        info!(addr = %self.local_addr, "Server listening");

        loop {
            // Edge-triggered: backlogged sockets get no new event, so don't block.
            let timeout = if self.read_backlog.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            // Sockets that hit the read budget last turn; new ones wait for the next.
            let backlog = std::mem::take(&mut self.read_backlog);

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections()?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(conn_id);
                        }
                        if event.is_writable() {
                            self.flush(conn_id);
                        }
                    }
                }
            }

            for conn_id in backlog {
                self.handle_readable(conn_id);
            }

            self.flush_pending();
            self.reap_closed();

            if self.shutdown.load(Ordering::Acquire) {
                self.close_all();
                info!("Server stopped");
                return Ok(());
            }
        }
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let conn_id = self
                        .connections
                        .insert(Connection::new(stream, peer, self.max_frame_size));
                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    info!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if is_transient_accept_error(e) => {
                    warn!(error = %e, "Accept failed");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read up to [`READ_BUDGET`] chunks, decoding after each one, then
    /// dispatch every complete frame in arrival order.
    ///
    /// A malformed header closes the connection before more input is buffered.
    fn handle_readable(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        if !conn.is_open() {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut frames: Vec<Frame> = Vec::new();
        let mut closed = false;
        let mut drained = false;
        let mut reads = 0;
        while reads < READ_BUDGET {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(conn_id, peer = %conn.peer, "Peer disconnected");
                    closed = true;
                    break;
                }
                Ok(n) => {
                    reads += 1;
                    conn.decoder.extend(&chunk[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, peer = %conn.peer, error = %e, "Read failed");
                    closed = true;
                    break;
                }
            }

            if let Err(e) = drain_frames(conn, &mut frames) {
                warn!(conn_id, peer = %conn.peer, error = %e, "Malformed frame");
                closed = true;
                break;
            }
        }

        if closed {
            conn.close();
        } else if !drained {
            self.read_backlog.push(conn_id);
        }

        for frame in &frames {
            self.dispatch(conn_id, frame);
        }
    }

    fn dispatch(&mut self, conn_id: ConnId, frame: &Frame) {
        let mut ctx = Context {
            sessions: &mut self.sessions,
            router: &self.router,
            outbox: &mut self.connections,
        };
        self.commands.dispatch(&mut ctx, conn_id, frame);
    }

    fn flush_pending(&mut self) {
        for conn_id in self.connections.take_dirty() {
            self.flush(conn_id);
        }
    }

    /// Write as much queued output as the socket takes.
    fn flush(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        if !conn.is_open() {
            return;
        }

        while !conn.outbound.is_empty() {
            match conn.stream.write(&conn.outbound) {
                Ok(0) => {
                    debug!(conn_id, peer = %conn.peer, "Write returned 0");
                    conn.close();
                    return;
                }
                Ok(n) => conn.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, peer = %conn.peer, error = %e, "Write failed");
                    conn.close();
                    return;
                }
            }
        }

        let wanted = if conn.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != conn.interest {
            match self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), wanted)
            {
                Ok(()) => conn.interest = wanted,
                Err(e) => {
                    debug!(conn_id, error = %e, "Reregister failed");
                    conn.close();
                }
            }
        }
    }

    /// Remove closing connections and notify the remaining sessions.
    ///
    /// Departure notices can fail further writes, so repeat until stable.
    fn reap_closed(&mut self) {
        loop {
            let closing = self.connections.closing();
            if closing.is_empty() {
                break;
            }

            for conn_id in closing {
                if let Some(mut conn) = self.connections.remove(conn_id) {
                    let _ = self.poll.registry().deregister(&mut conn.stream);
                    info!(conn_id, peer = %conn.peer, "Connection closed");
                }
                let mut ctx = Context {
                    sessions: &mut self.sessions,
                    router: &self.router,
                    outbox: &mut self.connections,
                };
                on_disconnect(&mut ctx, conn_id);
            }

            self.flush_pending();
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.sessions.connections();
        for conn_id in ids {
            self.sessions.logout(conn_id);
        }
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(peer = %conn.peer, "Connection closed on shutdown");
        }
    }
}

/// Pop every complete frame buffered on `conn`.
fn drain_frames(conn: &mut Connection, frames: &mut Vec<Frame>) -> Result<(), FrameError> {
    while let Some(frame) = conn.decoder.next_frame()? {
        frames.push(frame);
    }
    Ok(())
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
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
    socket.listen(1024)?;

    Ok(socket.into())
}
