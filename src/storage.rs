//! Append-only conversation store.
//!
//! Layout on disk:
//! ```text
//! <root>/<name>/info.txt               created / last_login timestamps
//! <root>/<name>/messages/<partner>.log one line per private message
//! ```
//!
//! A conversation between two users lives in exactly one file: under the
//! directory of the lexicographically smaller name, named after the other.
//! Files are opened in append mode and closed after every write.

use chrono::{SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INFO_FILE: &str = "info.txt";
const MESSAGES_DIR: &str = "messages";
const LOG_EXTENSION: &str = "log";

/// Per-user append log rooted at a database directory.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    root: PathBuf,
}

impl ConversationStore {
    /// Open (creating if needed) the database root.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        info!(
            root = %store.root.display(),
            known_users = store.known_users()?.len(),
            "Opened conversation store"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names that have a directory under the root, sorted.
    pub fn known_users(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create the user's directory on first login and refresh `info.txt`.
    pub fn record_login(&self, name: &str) -> io::Result<()> {
        let dir = self.root.join(name);
        fs::create_dir_all(dir.join(MESSAGES_DIR))?;

        let info_path = dir.join(INFO_FILE);
        let now = timestamp();
        let created = match fs::read_to_string(&info_path) {
            Ok(contents) => contents
                .lines()
                .find_map(|line| line.strip_prefix("created: "))
                .map(str::to_string)
                .unwrap_or_else(|| now.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => now.clone(),
            Err(e) => return Err(e),
        };

        fs::write(&info_path, format!("created: {created}\nlast_login: {now}\n"))?;
        debug!(name, "Recorded login");
        Ok(())
    }

    /// Path of the single log file holding the conversation between `a` and `b`.
    pub fn conversation_path(&self, a: &str, b: &str) -> PathBuf {
        let (owner, partner) = if a <= b { (a, b) } else { (b, a) };
        self.root
            .join(owner)
            .join(MESSAGES_DIR)
            .join(format!("{partner}.{LOG_EXTENSION}"))
    }

    /// Append `<timestamp> <from>: <body>` to the conversation file.
    ///
    /// Returns the path written to.
    pub fn append_private(&self, from: &str, to: &str, body: &str) -> io::Result<PathBuf> {
        let path = self.conversation_path(from, to);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = format!("{} {}: {}\n", timestamp(), from, escape_newlines(body));
        file.write_all(line.as_bytes())?;
        Ok(path)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Keep one entry per line.
fn escape_newlines(body: &str) -> String {
    body.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (ConversationStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path().join("db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_creates_root() {
        let (store, _dir) = store();
        assert!(store.root().is_dir());
        assert!(store.known_users().unwrap().is_empty());
    }

    #[test]
    fn test_record_login_keeps_created() {
        let (store, _dir) = store();
        store.record_login("alice").unwrap();
        let info_path = store.root().join("alice").join(INFO_FILE);
        let first = fs::read_to_string(&info_path).unwrap();
        let created = first.lines().next().unwrap().to_string();
        assert!(created.starts_with("created: "));

        store.record_login("alice").unwrap();
        let second = fs::read_to_string(&info_path).unwrap();
        assert_eq!(second.lines().next().unwrap(), created);
        assert!(second.lines().nth(1).unwrap().starts_with("last_login: "));
        assert!(store.root().join("alice").join(MESSAGES_DIR).is_dir());
        assert_eq!(store.known_users().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_conversation_is_one_file() {
        let (store, _dir) = store();
        let p1 = store.append_private("bob", "alice", "hi alice").unwrap();
        let p2 = store.append_private("alice", "bob", "hi bob").unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1, store.root().join("alice").join("messages").join("bob.log"));

        let contents = fs::read_to_string(&p1).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" bob: hi alice"));
        assert!(lines[1].ends_with(" alice: hi bob"));
    }

    #[test]
    fn test_multiline_body_stays_on_one_line() {
        let (store, _dir) = store();
        let path = store.append_private("a", "b", "line one\nline two").unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("line one\\nline two"));
    }
}
