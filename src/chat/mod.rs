//! Chat semantics on top of the frame protocol.
//!
//! - `session`: connection ↔ display name registry
//! - `router`: broadcast fan-out and private delivery
//! - `dispatch`: frame type → handler table and slash commands
//!
//! None of this touches sockets. Outgoing frames go through the [`Outbox`]
//! trait, which the reactor implements over its connection slab.

pub mod dispatch;
pub mod router;
pub mod session;

pub use dispatch::{CommandTable, Context};
pub use router::{RouteError, Router};
pub use session::{Session, SessionRegistry};

use std::io;

/// Identifier of a live connection (the reactor's slab key).
pub type ConnId = usize;

/// Sink for encoded frames addressed to a connection.
pub trait Outbox {
    /// Queue `frame` for delivery to `conn`.
    ///
    /// An error means this one connection is unusable; callers log it and
    /// carry on with the others.
    fn send(&mut self, conn: ConnId, frame: &[u8]) -> io::Result<()>;
}
