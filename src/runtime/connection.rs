//! Connection state machine for client sockets.
//!
//! Each connection owns its inbound frame decoder and its outbound byte
//! queue. The reactor flushes the queue; handlers only append to it through
//! the [`Outbox`] implementation on [`Connections`].

use crate::chat::{ConnId, Outbox};
use crate::protocol::FrameDecoder;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use tracing::warn;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered with the poller, reading and writing normally.
    Open,
    /// Marked for removal; reaped at the end of the current wake.
    Closing,
}

/// A single client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub decoder: FrameDecoder,
    /// Encoded frames not yet accepted by the kernel.
    pub outbound: BytesMut,
    /// Interest currently registered with the poller.
    pub interest: Interest,
    /// Listed in `Connections::dirty` awaiting a flush.
    queued: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Open,
            decoder: FrameDecoder::new(max_frame_size),
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
            queued: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }
}

/// Registry of live connections using slab allocation.
///
/// Slab keys double as [`ConnId`]s and as poll tokens.
pub struct Connections {
    slab: Slab<Connection>,
    max_pending_bytes: usize,
    dirty: Vec<ConnId>,
}

impl Connections {
    pub fn new(capacity: usize, max_pending_bytes: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            max_pending_bytes,
            dirty: Vec::new(),
        }
    }

    pub fn insert(&mut self, conn: Connection) -> ConnId {
        self.slab.insert(conn)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slab.get_mut(id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.slab.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Connections marked for closing.
    pub fn closing(&self) -> Vec<ConnId> {
        self.slab
            .iter()
            .filter(|(_, conn)| !conn.is_open())
            .map(|(id, _)| id)
            .collect()
    }

    /// Connections with output queued since the last call.
    pub fn take_dirty(&mut self) -> Vec<ConnId> {
        let dirty = std::mem::take(&mut self.dirty);
        for &id in &dirty {
            if let Some(conn) = self.slab.get_mut(id) {
                conn.queued = false;
            }
        }
        dirty
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.dirty.clear();
        self.slab.drain()
    }
}

impl Outbox for Connections {
    fn send(&mut self, id: ConnId, frame: &[u8]) -> io::Result<()> {
        let conn = self
            .slab
            .get_mut(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        if !conn.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closing"));
        }

        if conn.outbound.len() + frame.len() > self.max_pending_bytes {
            warn!(
                conn_id = id,
                peer = %conn.peer,
                pending = conn.outbound.len(),
                "Slow consumer, dropping connection"
            );
            conn.close();
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "outbound queue full"));
        }

        conn.outbound.extend_from_slice(frame);
        if !conn.queued {
            conn.queued = true;
            self.dirty.push(id);
        }
        Ok(())
    }
}
