//! relay-chat: a multi-user text chat server and console client.
//!
//! Clients connect over TCP, log in with a display name, and exchange
//! broadcast and private messages framed as `type (u8) | length (u32 BE) |
//! payload`.
//!
//! Layout:
//! - `protocol`: frame codec shared by server and client
//! - `chat`: sessions, routing and command dispatch
//! - `runtime`: single-threaded mio reactor owning every socket
//! - `storage`: append-only per-user conversation logs
//! - `client`: connect, receive thread and presentation interface
//! - `config`: CLI arguments and TOML configuration

pub mod chat;
pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod storage;
