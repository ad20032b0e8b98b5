//! Presence Protocol - Wire layer for the presence chat endpoint
//!
//! This crate turns streamed XML into typed [`StanzaEvent`]s, renders the
//! stanzas an endpoint sends back, and encodes/decodes the SOCKS5 handshake
//! used by bytestream file transfers.

pub mod compose;
pub mod event;
pub mod parse;
pub mod socks5;

pub use event::StanzaEvent;
pub use parse::{Flag, FlagSet, Mode, StanzaParser};
pub use socks5::Socks5Error;
