//! Presence Daemon - Connection registry, chat sessions and file transfers
//!
//! This crate provides the runtime of a serverless chat endpoint:
//! - `server` - TCP listener, live-session registry and broadcaster
//! - `server::connection` - per-connection read/parse/dispatch loop
//! - `commands` - chat command table and the built-in commands
//! - `transfer` - SOCKS5 bytestream and HTTP out-of-band file retrieval
//! - `config` - daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      presenced daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ PresenceServer  │────▶│   live set (Mutex<HashMap>)  │    │
//! │  │  (TcpListener)  │     │   id -> outbox, cancel      │    │
//! │  └────────┬────────┘     └──────────────▲──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ broadcast /       │
//! │           ▼                             │ on_stopped        │
//! │  ┌─────────────────┐                    │                   │
//! │  │     Session     │────────────────────┘                   │
//! │  │ (per connection)│──▶ StanzaParser ──▶ commands/transfer  │
//! │  └─────────────────┘                                        │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod commands;
pub mod config;
pub mod server;
pub mod transfer;
