//! Session registry: which connection is logged in under which name.
//!
//! Only touched from the reactor thread, so no locking.

use crate::chat::ConnId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Longest display name accepted before a disambiguating suffix.
pub const MAX_NAME_LEN: usize = 32;

/// Name given to logins that request an empty name.
pub const DEFAULT_NAME: &str = "guest";

/// An authenticated identity bound to one live connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn: ConnId,
    pub name: String,
    pub logged_in_at: DateTime<Utc>,
    login_seq: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_conn: HashMap<ConnId, Session>,
    by_name: HashMap<String, ConnId>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `conn` in and return the name actually assigned.
    ///
    /// A taken name gets the smallest numeric suffix that makes it unique.
    /// A connection that already has a session keeps its current name.
    pub fn login(&mut self, conn: ConnId, requested: &str) -> String {
        if let Some(session) = self.by_conn.get(&conn) {
            return session.name.clone();
        }

        let base = sanitize_name(requested);
        let mut name = base.clone();
        let mut suffix = 1u32;
        while self.by_name.contains_key(&name) {
            name = format!("{base}{suffix}");
            suffix += 1;
        }

        let session = Session {
            conn,
            name: name.clone(),
            logged_in_at: Utc::now(),
            login_seq: self.next_seq,
        };
        self.next_seq += 1;
        self.by_name.insert(name.clone(), conn);
        self.by_conn.insert(conn, session);

        debug!(conn_id = conn, name = %name, "Session created");
        name
    }

    pub fn resolve(&self, name: &str) -> Option<ConnId> {
        self.by_name.get(name).copied()
    }

    /// Remove the session of `conn`, if any. Calling it again is a no-op.
    pub fn logout(&mut self, conn: ConnId) -> Option<Session> {
        let session = self.by_conn.remove(&conn)?;
        self.by_name.remove(&session.name);
        debug!(conn_id = conn, name = %session.name, "Session removed");
        Some(session)
    }

    pub fn get(&self, conn: ConnId) -> Option<&Session> {
        self.by_conn.get(&conn)
    }

    pub fn name_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(|s| s.name.as_str())
    }

    pub fn is_authenticated(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    /// Active sessions in login order.
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.by_conn.values().collect();
        sessions.sort_by_key(|s| s.login_seq);
        sessions
    }

    /// Active display names in login order.
    pub fn names(&self) -> Vec<String> {
        self.sessions().into_iter().map(|s| s.name.clone()).collect()
    }

    /// Connections of all authenticated sessions, in login order.
    pub fn connections(&self) -> Vec<ConnId> {
        self.sessions().into_iter().map(|s| s.conn).collect()
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}

/// Normalise a requested display name.
///
/// Names end up as directory names and as whitespace-separated command
/// tokens, so only `[A-Za-z0-9_.-]` survives; everything else becomes `_`.
pub fn sanitize_name(requested: &str) -> String {
    let mut name: String = requested
        .trim()
        .chars()
        .take(MAX_NAME_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }
    if name.is_empty() {
        name = DEFAULT_NAME.to_string();
    }
    name
}
