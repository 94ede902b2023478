//! Message routing: broadcast fan-out and private delivery.

use crate::chat::session::SessionRegistry;
use crate::chat::{ConnId, Outbox};
use crate::protocol::{encode, FrameType, MAX_PAYLOAD_SIZE};
use crate::storage::ConversationStore;
use std::fmt;
use tracing::{debug, warn};

/// Why a private message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The sending connection has no session.
    NotAuthenticated(ConnId),
    /// No active session holds the target name.
    UnknownRecipient(String),
    /// The relayed payload would exceed what receivers accept.
    TooLong { len: usize, max: usize },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NotAuthenticated(conn) => write!(f, "connection {conn} is not logged in"),
            RouteError::UnknownRecipient(name) => write!(f, "no such user '{name}'"),
            RouteError::TooLong { len, max } => {
                write!(f, "message too long ({len} > {max} bytes)")
            }
        }
    }
}

impl std::error::Error for RouteError {}

pub struct Router {
    store: ConversationStore,
    max_payload: usize,
}

impl Router {
    /// Relayed payloads are capped at [`MAX_PAYLOAD_SIZE`], the limit every
    /// client decodes with.
    pub fn new(store: ConversationStore) -> Self {
        Self {
            store,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Fails when `text` cannot be relayed; the sender is told why.
    pub fn check_relay(
        &self,
        outbox: &mut dyn Outbox,
        from: ConnId,
        text: &str,
    ) -> Result<(), RouteError> {
        if text.len() <= self.max_payload {
            return Ok(());
        }
        let err = RouteError::TooLong {
            len: text.len(),
            max: self.max_payload,
        };
        Self::reply(outbox, from, FrameType::Simple, format!("error: {err}").as_bytes());
        Err(err)
    }

    /// Queue one frame to a single connection.
    pub fn reply(outbox: &mut dyn Outbox, conn: ConnId, frame_type: FrameType, body: &[u8]) {
        let frame = encode(body, frame_type);
        if let Err(e) = outbox.send(conn, &frame) {
            debug!(conn_id = conn, error = %e, "Reply failed");
        }
    }

    /// Encode once and queue to every authenticated connection except `except`.
    ///
    /// A failed send is logged and skipped. Returns the number of deliveries.
    pub fn broadcast(
        &self,
        sessions: &SessionRegistry,
        outbox: &mut dyn Outbox,
        frame_type: FrameType,
        body: &[u8],
        except: Option<ConnId>,
    ) -> usize {
        let frame = encode(body, frame_type);
        let mut delivered = 0;
        for conn in sessions.connections() {
            if Some(conn) == except {
                continue;
            }
            match outbox.send(conn, &frame) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(conn_id = conn, error = %e, "Broadcast send failed"),
            }
        }
        delivered
    }

    /// Broadcast the current user list.
    pub fn broadcast_user_list(
        &self,
        sessions: &SessionRegistry,
        outbox: &mut dyn Outbox,
        except: Option<ConnId>,
    ) -> usize {
        let list = user_list(sessions);
        self.broadcast(sessions, outbox, FrameType::ListUsers, list.as_bytes(), except)
    }

    /// Deliver `body` from the session on `from` to the session named `to_name`.
    ///
    /// The message is appended to the pair's conversation log before delivery;
    /// a logging failure does not prevent delivery. The sender gets no echo,
    /// only an error line when the target does not exist or the message is
    /// too long to relay.
    pub fn send_private(
        &self,
        sessions: &SessionRegistry,
        outbox: &mut dyn Outbox,
        from: ConnId,
        to_name: &str,
        body: &str,
    ) -> Result<(), RouteError> {
        let sender = sessions
            .name_of(from)
            .ok_or(RouteError::NotAuthenticated(from))?;

        let Some(recipient) = sessions.resolve(to_name) else {
            let err = RouteError::UnknownRecipient(to_name.to_string());
            Self::reply(outbox, from, FrameType::Simple, format!("error: {err}").as_bytes());
            return Err(err);
        };

        let text = format!("[private] {sender}: {body}");
        self.check_relay(outbox, from, &text)?;

        if let Err(e) = self.store.append_private(sender, to_name, body) {
            warn!(from = sender, to = to_name, error = %e, "Failed to log private message");
        }

        Self::reply(outbox, recipient, FrameType::Simple, text.as_bytes());
        debug!(from = sender, to = to_name, "Private message delivered");
        Ok(())
    }
}

/// Newline-joined active names in login order.
pub fn user_list(sessions: &SessionRegistry) -> String {
    sessions.names().join("\n")
}
