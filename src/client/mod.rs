//! Chat client core.
//!
//! Two producer threads feed one channel:
//! - the receive thread decodes frames from the socket,
//! - the input thread forwards lines typed by the user.
//!
//! The presentation thread drains the channel in [`run_session`] and is the
//! only owner of UI state.

pub mod presentation;

pub use presentation::{present, ConsoleView, Presentation};

use crate::chat::session::DEFAULT_NAME;
use crate::protocol::{encode, Frame, FrameDecoder, FrameType};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::ffi::CStr;
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

const CONNECT_TOKEN: Token = Token(0);

/// Number of readiness waits the connect timeout is split into.
pub const CONNECT_ATTEMPTS: u32 = 10;

/// Something for the presentation thread to handle.
#[derive(Debug)]
pub enum ClientEvent {
    Frame(Frame),
    Input(String),
    InputClosed,
    /// The server went away; carries the error if it was not a clean EOF.
    Disconnected(Option<String>),
}

/// Client-side failures.
#[derive(Debug)]
pub enum ClientError {
    Resolve(String),
    Connect(io::Error),
    ConnectTimeout(Duration),
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Resolve(target) => write!(f, "Cannot resolve server address '{target}'"),
            ClientError::Connect(e) => write!(f, "Connection failed: {e}"),
            ClientError::ConnectTimeout(timeout) => {
                write!(f, "Connection timed out after {}ms", timeout.as_millis())
            }
            ClientError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ClientError::Resolve(format!("{host}:{port}")))
}

/// Non-blocking connect, then wait for writability at most `attempts` times.
///
/// Returns a blocking stream once the handshake has completed.
pub fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
    attempts: u32,
) -> Result<TcpStream, ClientError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(ClientError::Connect(e)),
    }

    let mut poll = Poll::new()?;
    let fd = socket.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), CONNECT_TOKEN, Interest::WRITABLE)?;

    let attempts = attempts.max(1);
    let wait = timeout / attempts;
    let mut events = Events::with_capacity(4);
    let mut connected = false;

    for attempt in 1..=attempts {
        match poll.poll(&mut events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ClientError::Io(e)),
        }
        if events.is_empty() {
            debug!(attempt, "Still connecting");
            continue;
        }
        if let Some(e) = socket.take_error()? {
            return Err(ClientError::Connect(e));
        }
        match socket.peer_addr() {
            Ok(_) => {
                connected = true;
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
            Err(e) => return Err(ClientError::Connect(e)),
        }
    }

    poll.registry().deregister(&mut SourceFd(&fd))?;
    if !connected {
        return Err(ClientError::ConnectTimeout(timeout));
    }

    socket.set_nonblocking(false)?;
    Ok(socket.into())
}

/// A connected client socket.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Client {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let stream = connect_with_timeout(addr, timeout, CONNECT_ATTEMPTS)?;
        info!(peer = %addr, "Connected");
        Ok(Self { stream, peer: addr })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, frame_type: FrameType, body: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode(body, frame_type))
    }

    pub fn login(&mut self, name: &str) -> io::Result<()> {
        self.send(FrameType::Login, name.as_bytes())
    }

    /// Lines starting with `/` are commands, everything else is chat text.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let frame_type = if line.starts_with('/') {
            FrameType::Command
        } else {
            FrameType::Simple
        };
        self.send(frame_type, line.as_bytes())
    }

    /// Start the receive thread on a clone of the socket.
    pub fn spawn_receiver(&self, tx: UnboundedSender<ClientEvent>) -> io::Result<JoinHandle<()>> {
        let reader = self.stream.try_clone()?;
        thread::Builder::new()
            .name("receiver".to_string())
            .spawn(move || receive_loop(reader, tx))
    }
}

/// Blocking read-and-decode loop. Each frame owns a fresh payload buffer.
pub fn receive_loop<R: Read>(mut reader: R, tx: UnboundedSender<ClientEvent>) {
    let mut decoder = FrameDecoder::default();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(ClientEvent::Disconnected(None));
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(ClientEvent::Disconnected(Some(e.to_string())));
                return;
            }
        };

        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if tx.send(ClientEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(ClientEvent::Disconnected(Some(e.to_string())));
                    return;
                }
            }
        }
    }
}

/// Forward input lines until EOF.
pub fn input_loop<R: BufRead>(reader: R, tx: UnboundedSender<ClientEvent>) {
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if tx.send(ClientEvent::Input(line)).is_err() {
            return;
        }
    }
    let _ = tx.send(ClientEvent::InputClosed);
}

/// Drain events on the presentation thread until input ends, the user
/// types `/quit`, or the server disconnects.
pub fn run_session(
    client: &mut Client,
    events: &mut UnboundedReceiver<ClientEvent>,
    view: &mut dyn Presentation,
) -> io::Result<()> {
    while let Some(event) = events.blocking_recv() {
        match event {
            ClientEvent::Frame(frame) => present(view, &frame),
            ClientEvent::Input(line) => {
                let line = line.trim_end();
                if line.trim().is_empty() {
                    continue;
                }
                if line.trim() == "/quit" {
                    break;
                }
                client.send_line(line)?;
            }
            ClientEvent::InputClosed => break,
            ClientEvent::Disconnected(reason) => {
                view.on_disconnected(reason.as_deref());
                break;
            }
        }
    }
    Ok(())
}

/// `explicit` if given, else the OS account name, else a fixed fallback.
pub fn display_name(explicit: Option<&str>) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    for var in ["USER", "LOGNAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    passwd_name().unwrap_or_else(|| DEFAULT_NAME.to_string())
}

/// Account name of the current uid from the passwd database.
fn passwd_name() -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    // SAFETY: passwd is plain data; getpwuid_r fills it with pointers into `buf`.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: all pointers are valid for the duration of the call and `buf.len()`
    // is the true buffer size.
    let rc = unsafe {
        libc::getpwuid_r(
            libc::getuid(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }

    // SAFETY: on success pw_name points at a NUL-terminated string inside `buf`.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned();
    (!name.is_empty()).then_some(name)
}
