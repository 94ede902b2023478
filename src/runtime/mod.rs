//! Connection multiplexer.
//!
//! A single-threaded mio reactor (epoll on Linux, kqueue on macOS) owning the
//! listening socket and every client socket:
//! - `Connection`: per-socket state, frame decoder and outbound queue
//! - `Server`: the event loop that feeds frames to the command table

mod connection;
mod event_loop;

pub use connection::{ConnState, Connection, Connections};
pub use event_loop::{Server, ServerHandle};

