//! Presentation interface for the client.
//!
//! The receive thread never touches UI state. Decoded frames travel over a
//! channel to the presentation thread, which calls [`present`] to fan each
//! frame out to the callbacks below.

use crate::protocol::{Frame, FrameType};
use std::io::Write;
use tracing::debug;

/// Callbacks the client core invokes on the presentation thread.
pub trait Presentation {
    /// Every decoded frame, before the type-specific callback.
    fn on_frame_decoded(&mut self, _frame_type: FrameType, _payload: &[u8]) {}

    fn on_user_list_changed(&mut self, names: &[String]);

    fn on_message_received(&mut self, text: &str);

    /// The server confirmed the login under `name`.
    fn on_login_accepted(&mut self, _name: &str) {}

    fn on_disconnected(&mut self, _reason: Option<&str>) {}
}

/// Deliver one frame to `view`.
pub fn present(view: &mut dyn Presentation, frame: &Frame) {
    view.on_frame_decoded(frame.frame_type, &frame.payload);
    match frame.frame_type {
        FrameType::ListUsers => view.on_user_list_changed(&parse_user_list(&frame.text())),
        FrameType::Simple => view.on_message_received(&frame.text()),
        FrameType::Login => view.on_login_accepted(&frame.text()),
        FrameType::Command => debug!("Ignoring COMMAND frame from server"),
    }
}

/// Split a LIST_USERS payload. Accepts newline or comma separators.
pub fn parse_user_list(payload: &str) -> Vec<String> {
    payload
        .split(['\n', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Line-oriented view writing to any `Write` (stdout in the binary).
pub struct ConsoleView<W: Write> {
    out: W,
    users: Vec<String>,
    name: Option<String>,
}

impl<W: Write> ConsoleView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            users: Vec::new(),
            name: None,
        }
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        // Nothing useful to do if the terminal is gone.
        let _ = writeln!(self.out, "{text}");
        let _ = self.out.flush();
    }
}

impl<W: Write> Presentation for ConsoleView<W> {
    fn on_user_list_changed(&mut self, names: &[String]) {
        self.users = names.to_vec();
        let line = format!("Online ({}): {}", names.len(), names.join(", "));
        self.line(&line);
    }

    fn on_message_received(&mut self, text: &str) {
        self.line(text);
    }

    fn on_login_accepted(&mut self, name: &str) {
        self.name = Some(name.to_string());
        let line = format!("Logged in as {name}");
        self.line(&line);
    }

    fn on_disconnected(&mut self, reason: Option<&str>) {
        match reason {
            Some(reason) => self.line(&format!("Disconnected: {reason}")),
            None => self.line("Server closed the connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        decoded: Vec<FrameType>,
        lists: Vec<Vec<String>>,
        messages: Vec<String>,
        logins: Vec<String>,
    }

    impl Presentation for Recorder {
        fn on_frame_decoded(&mut self, frame_type: FrameType, _payload: &[u8]) {
            self.decoded.push(frame_type);
        }

        fn on_user_list_changed(&mut self, names: &[String]) {
            self.lists.push(names.to_vec());
        }

        fn on_message_received(&mut self, text: &str) {
            self.messages.push(text.to_string());
        }

        fn on_login_accepted(&mut self, name: &str) {
            self.logins.push(name.to_string());
        }
    }

    #[test]
    fn test_present_routes_by_type() {
        let mut view = Recorder::default();
        present(&mut view, &Frame::new(FrameType::Login, "alice1"));
        present(&mut view, &Frame::new(FrameType::ListUsers, "alice\nalice1"));
        present(&mut view, &Frame::new(FrameType::Simple, "bob: hi"));
        present(&mut view, &Frame::new(FrameType::Command, "/noop"));

        assert_eq!(
            view.decoded,
            vec![
                FrameType::Login,
                FrameType::ListUsers,
                FrameType::Simple,
                FrameType::Command
            ]
        );
        assert_eq!(view.logins, vec!["alice1"]);
        assert_eq!(view.lists, vec![vec!["alice", "alice1"]]);
        assert_eq!(view.messages, vec!["bob: hi"]);
    }

    #[test]
    fn test_parse_user_list() {
        assert_eq!(parse_user_list("a\nb"), vec!["a", "b"]);
        assert_eq!(parse_user_list("a, b,\n"), vec!["a", "b"]);
        assert!(parse_user_list("").is_empty());
    }

    #[test]
    fn test_console_view_output() {
        let mut view = ConsoleView::new(Vec::new());
        view.on_login_accepted("alice");
        view.on_user_list_changed(&["alice".to_string(), "bob".to_string()]);
        view.on_message_received("bob: hi");
        view.on_disconnected(None);

        assert_eq!(view.name(), Some("alice"));
        assert_eq!(view.users(), ["alice".to_string(), "bob".to_string()]);
        let output = String::from_utf8(view.into_inner()).unwrap();
        assert_eq!(
            output,
            "Logged in as alice\nOnline (2): alice, bob\nbob: hi\nServer closed the connection\n"
        );
    }
}
