//! Command dispatch.
//!
//! The handler tables are built once by [`CommandTable::new`] and only
//! borrowed afterwards. Each incoming frame is looked up by type; COMMAND
//! frames are looked up a second time by slash-command name.
//!
//! A connection without a session may only send LOGIN. Anything else is
//! dropped without a reply.

use crate::chat::router::{user_list, Router};
use crate::chat::session::SessionRegistry;
use crate::chat::{ConnId, Outbox};
use crate::protocol::{Frame, FrameType};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const HELP_TEXT: &str = "Available commands:\n\
    /help               show this message\n\
    /list               list connected users\n\
    /msg <name> <text>  send a private message";

const MSG_USAGE: &str = "usage: /msg <name> <text>";

/// Mutable state a handler may touch while processing one frame.
pub struct Context<'a> {
    pub sessions: &'a mut SessionRegistry,
    pub router: &'a Router,
    pub outbox: &'a mut dyn Outbox,
}

/// A slash command split into name, optional target and remaining text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand<'a> {
    pub name: &'a str,
    pub target: Option<&'a str>,
    pub rest: &'a str,
}

type FrameHandler = fn(&CommandTable, &mut Context<'_>, ConnId, &Frame);
type SlashHandler = fn(&mut Context<'_>, ConnId, &SlashCommand<'_>);

pub struct CommandTable {
    frames: HashMap<FrameType, FrameHandler>,
    slash: HashMap<&'static str, SlashHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut frames: HashMap<FrameType, FrameHandler> = HashMap::new();
        frames.insert(FrameType::Login, handle_login);
        frames.insert(FrameType::ListUsers, handle_list_users);
        frames.insert(FrameType::Simple, handle_simple);
        frames.insert(FrameType::Command, handle_command);

        let mut slash: HashMap<&'static str, SlashHandler> = HashMap::new();
        slash.insert("help", slash_help);
        slash.insert("list", slash_list);
        slash.insert("users", slash_list);
        slash.insert("msg", slash_msg);

        Self { frames, slash }
    }

    /// Route one decoded frame from `conn` to its handler.
    pub fn dispatch(&self, ctx: &mut Context<'_>, conn: ConnId, frame: &Frame) {
        if frame.frame_type != FrameType::Login && !ctx.sessions.is_authenticated(conn) {
            debug!(
                conn_id = conn,
                frame_type = ?frame.frame_type,
                "Ignoring frame before login"
            );
            return;
        }

        match self.frames.get(&frame.frame_type) {
            Some(handler) => handler(self, ctx, conn, frame),
            None => warn!(conn_id = conn, frame_type = ?frame.frame_type, "No handler"),
        }
    }

    fn run_slash(&self, ctx: &mut Context<'_>, conn: ConnId, command: &SlashCommand<'_>) {
        let name = command.name.to_ascii_lowercase();
        match self.slash.get(name.as_str()) {
            Some(handler) => handler(ctx, conn, command),
            None => warn!(conn_id = conn, command = command.name, "Unknown command"),
        }
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Tear down the session of a closed connection and tell everyone else.
///
/// Safe to call for connections that never logged in, and more than once.
pub fn on_disconnect(ctx: &mut Context<'_>, conn: ConnId) {
    let Some(session) = ctx.sessions.logout(conn) else {
        return;
    };
    info!(conn_id = conn, name = %session.name, "User left");

    let notice = format!("* {} left the chat", session.name);
    ctx.router
        .broadcast(ctx.sessions, ctx.outbox, FrameType::Simple, notice.as_bytes(), None);
    ctx.router.broadcast_user_list(ctx.sessions, ctx.outbox, None);
}

/// Split a command body: optional leading `/`, then name, target and text.
pub fn parse_slash(body: &str) -> Option<SlashCommand<'_>> {
    let body = body.trim();
    let body = body.strip_prefix('/').unwrap_or(body);
    let (name, after) = split_token(body);
    if name.is_empty() {
        return None;
    }
    let (target, rest) = split_token(after);
    Some(SlashCommand {
        name,
        target: (!target.is_empty()).then_some(target),
        rest,
    })
}

fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn handle_login(_table: &CommandTable, ctx: &mut Context<'_>, conn: ConnId, frame: &Frame) {
    if let Some(current) = ctx.sessions.name_of(conn) {
        let current = current.to_string();
        debug!(conn_id = conn, name = %current, "Already logged in");
        Router::reply(ctx.outbox, conn, FrameType::Login, current.as_bytes());
        return;
    }

    let requested = frame.text();
    let name = ctx.sessions.login(conn, &requested);
    if let Err(e) = ctx.router.store().record_login(&name) {
        warn!(name = %name, error = %e, "Failed to record login");
    }
    info!(conn_id = conn, requested = %requested.trim(), name = %name, "User logged in");

    Router::reply(ctx.outbox, conn, FrameType::Login, name.as_bytes());
    Router::reply(
        ctx.outbox,
        conn,
        FrameType::ListUsers,
        user_list(ctx.sessions).as_bytes(),
    );

    let notice = format!("* {name} joined the chat");
    ctx.router.broadcast(
        ctx.sessions,
        ctx.outbox,
        FrameType::Simple,
        notice.as_bytes(),
        Some(conn),
    );
    ctx.router
        .broadcast_user_list(ctx.sessions, ctx.outbox, Some(conn));
}

fn handle_list_users(_table: &CommandTable, ctx: &mut Context<'_>, conn: ConnId, _frame: &Frame) {
    send_user_list(ctx, conn);
}

fn handle_simple(table: &CommandTable, ctx: &mut Context<'_>, conn: ConnId, frame: &Frame) {
    let body = frame.text();

    if let Some(command) = private_marker(&body) {
        table.run_slash(ctx, conn, &command);
        return;
    }
    if body.trim().is_empty() {
        return;
    }

    let Some(sender) = ctx.sessions.name_of(conn) else {
        return;
    };
    let line = format!("{sender}: {body}");
    if let Err(e) = ctx.router.check_relay(ctx.outbox, conn, &line) {
        debug!(conn_id = conn, error = %e, "Broadcast rejected");
        return;
    }
    let delivered = ctx.router.broadcast(
        ctx.sessions,
        ctx.outbox,
        FrameType::Simple,
        line.as_bytes(),
        Some(conn),
    );
    debug!(conn_id = conn, delivered, "Broadcast message");
}

/// A chat line written as `/msg <name> <text>`, matched like a COMMAND frame.
fn private_marker(body: &str) -> Option<SlashCommand<'_>> {
    if !body.trim_start().starts_with('/') {
        return None;
    }
    parse_slash(body).filter(|command| command.name.eq_ignore_ascii_case("msg"))
}

fn handle_command(table: &CommandTable, ctx: &mut Context<'_>, conn: ConnId, frame: &Frame) {
    let body = frame.text();
    match parse_slash(&body) {
        Some(command) => table.run_slash(ctx, conn, &command),
        None => debug!(conn_id = conn, "Empty command"),
    }
}

fn slash_help(ctx: &mut Context<'_>, conn: ConnId, _command: &SlashCommand<'_>) {
    Router::reply(ctx.outbox, conn, FrameType::Simple, HELP_TEXT.as_bytes());
}

fn slash_list(ctx: &mut Context<'_>, conn: ConnId, _command: &SlashCommand<'_>) {
    send_user_list(ctx, conn);
}

fn slash_msg(ctx: &mut Context<'_>, conn: ConnId, command: &SlashCommand<'_>) {
    let target = match command.target {
        Some(target) if !command.rest.is_empty() => target,
        _ => {
            Router::reply(ctx.outbox, conn, FrameType::Simple, MSG_USAGE.as_bytes());
            return;
        }
    };

    if let Err(e) = ctx
        .router
        .send_private(ctx.sessions, ctx.outbox, conn, target, command.rest)
    {
        debug!(conn_id = conn, error = %e, "Private message not delivered");
    }
}

fn send_user_list(ctx: &mut Context<'_>, conn: ConnId) {
    Router::reply(
        ctx.outbox,
        conn,
        FrameType::ListUsers,
        user_list(ctx.sessions).as_bytes(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::RecordingOutbox;
    use crate::storage::ConversationStore;
    use tempfile::TempDir;

    struct Harness {
        table: CommandTable,
        sessions: SessionRegistry,
        router: Router,
        outbox: RecordingOutbox,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = ConversationStore::open(dir.path()).unwrap();
            Self {
                table: CommandTable::new(),
                sessions: SessionRegistry::new(),
                router: Router::new(store),
                outbox: RecordingOutbox::default(),
                dir,
            }
        }

        fn send(&mut self, conn: ConnId, frame_type: FrameType, body: &str) {
            let mut ctx = Context {
                sessions: &mut self.sessions,
                router: &self.router,
                outbox: &mut self.outbox,
            };
            self.table
                .dispatch(&mut ctx, conn, &Frame::new(frame_type, body.to_string()));
        }

        fn disconnect(&mut self, conn: ConnId) {
            let mut ctx = Context {
                sessions: &mut self.sessions,
                router: &self.router,
                outbox: &mut self.outbox,
            };
            on_disconnect(&mut ctx, conn);
        }

        fn login(&mut self, conn: ConnId, name: &str) {
            self.send(conn, FrameType::Login, name);
        }
    }

    #[test]
    fn test_login_replies_and_announces() {
        let mut h = Harness::new();
        h.login(1, "bob");
        h.outbox.clear();
        h.login(2, "alice");

        let to_alice: Vec<(FrameType, String)> = h
            .outbox
            .frames_for(2)
            .iter()
            .map(|f| (f.frame_type, f.text()))
            .collect();
        assert_eq!(
            to_alice,
            vec![
                (FrameType::Login, "alice".to_string()),
                (FrameType::ListUsers, "bob\nalice".to_string()),
            ]
        );
        assert_eq!(
            h.outbox.texts_for(1),
            vec!["* alice joined the chat", "bob\nalice"]
        );
    }

    #[test]
    fn test_duplicate_name_scenario() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.outbox.clear();
        h.login(2, "alice");

        assert_eq!(h.outbox.of_type(FrameType::Login), vec![(2, "alice1".to_string())]);
        let lists = h.outbox.of_type(FrameType::ListUsers);
        assert_eq!(lists.len(), 2);
        for (_, list) in lists {
            assert_eq!(list, "alice\nalice1");
        }
        assert_eq!(h.sessions.resolve("alice"), Some(1));
        assert_eq!(h.sessions.resolve("alice1"), Some(2));
    }

    #[test]
    fn test_frames_ignored_before_login() {
        let mut h = Harness::new();
        h.login(1, "bob");
        h.outbox.clear();

        h.send(2, FrameType::Simple, "hello?");
        h.send(2, FrameType::Command, "/help");
        h.send(2, FrameType::ListUsers, "");

        assert!(h.outbox.sent.is_empty());
        assert!(!h.sessions.is_authenticated(2));
    }

    #[test]
    fn test_broadcast_fan_out() {
        let mut h = Harness::new();
        for (conn, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            h.login(conn, name);
        }
        h.outbox.clear();

        h.send(1, FrameType::Simple, "hello all");

        assert_eq!(h.outbox.recipients(), vec![2, 3, 4]);
        for conn in [2, 3, 4] {
            assert_eq!(h.outbox.texts_for(conn), vec!["a: hello all"]);
        }
    }

    #[test]
    fn test_simple_msg_marker_routes_privately() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.login(2, "bob");
        h.login(3, "carol");
        h.outbox.clear();

        h.send(1, FrameType::Simple, "/msg bob see you at  noon");

        assert_eq!(h.outbox.recipients(), vec![2]);
        assert_eq!(h.outbox.texts_for(2), vec!["[private] alice: see you at  noon"]);
    }

    #[test]
    fn test_simple_msg_marker_is_case_insensitive() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.login(2, "bob");
        h.login(3, "carol");
        h.outbox.clear();

        h.send(1, FrameType::Simple, "/MSG bob hi");
        h.send(1, FrameType::Simple, "  /Msg\tbob tab");
        assert_eq!(h.outbox.recipients(), vec![2, 2]);
        assert_eq!(
            h.outbox.texts_for(2),
            vec!["[private] alice: hi", "[private] alice: tab"]
        );
        h.outbox.clear();

        h.send(1, FrameType::Simple, "/msg");
        assert_eq!(h.outbox.texts_for(1), vec![MSG_USAGE]);
        h.outbox.clear();

        h.send(1, FrameType::Simple, "msg bob not a command");
        assert_eq!(h.outbox.recipients(), vec![2, 3]);
    }

    #[test]
    fn test_oversized_chat_line_rejected() {
        let mut h = Harness::new();
        h.router = Router::new(ConversationStore::open(h.dir.path()).unwrap())
            .with_max_payload(16);
        h.login(1, "alice");
        h.login(2, "bob");
        h.outbox.clear();

        // "alice: " is 7 bytes
        h.send(1, FrameType::Simple, "123456789");
        assert_eq!(h.outbox.texts_for(2), vec!["alice: 123456789"]);
        h.outbox.clear();

        h.send(1, FrameType::Simple, "1234567890");
        assert_eq!(h.outbox.recipients(), vec![1]);
        assert_eq!(
            h.outbox.texts_for(1),
            vec!["error: message too long (17 > 16 bytes)"]
        );
    }

    #[test]
    fn test_command_frames() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.login(2, "bob");
        h.outbox.clear();

        h.send(1, FrameType::Command, "/help");
        assert_eq!(h.outbox.texts_for(1), vec![HELP_TEXT]);
        h.outbox.clear();

        h.send(1, FrameType::Command, "/LIST");
        assert_eq!(h.outbox.of_type(FrameType::ListUsers), vec![(1, "alice\nbob".to_string())]);
        h.outbox.clear();

        h.send(1, FrameType::Command, "msg bob hi");
        assert_eq!(h.outbox.texts_for(2), vec!["[private] alice: hi"]);
        h.outbox.clear();

        h.send(1, FrameType::Command, "/msg bob");
        assert_eq!(h.outbox.texts_for(1), vec![MSG_USAGE]);
        h.outbox.clear();

        h.send(1, FrameType::Command, "/dance wildly");
        h.send(1, FrameType::Command, "   ");
        assert!(h.outbox.sent.is_empty());
    }

    #[test]
    fn test_list_users_frame() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.login(2, "bob");
        h.outbox.clear();

        h.send(2, FrameType::ListUsers, "");
        assert_eq!(h.outbox.of_type(FrameType::ListUsers), vec![(2, "alice\nbob".to_string())]);
    }

    #[test]
    fn test_relogin_keeps_name() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.outbox.clear();
        h.login(1, "eve");
        assert_eq!(h.outbox.of_type(FrameType::Login), vec![(1, "alice".to_string())]);
        assert_eq!(h.outbox.sent.len(), 1);
    }

    #[test]
    fn test_disconnect_cleanup() {
        let mut h = Harness::new();
        h.login(1, "alice");
        h.login(2, "bob");
        h.login(3, "carol");
        h.outbox.clear();

        h.disconnect(1);
        assert_eq!(h.outbox.texts_for(2), vec!["* alice left the chat", "bob\ncarol"]);
        h.outbox.clear();

        h.disconnect(1);
        assert!(h.outbox.sent.is_empty());

        h.send(3, FrameType::ListUsers, "");
        assert_eq!(h.outbox.texts_for(3), vec!["bob\ncarol"]);
    }

    #[test]
    fn test_parse_slash() {
        assert_eq!(
            parse_slash("/msg bob hello  there"),
            Some(SlashCommand {
                name: "msg",
                target: Some("bob"),
                rest: "hello  there",
            })
        );
        assert_eq!(
            parse_slash("help"),
            Some(SlashCommand {
                name: "help",
                target: None,
                rest: "",
            })
        );
        assert_eq!(parse_slash("  /  "), None);
    }
}
