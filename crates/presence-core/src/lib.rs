//! Presence Core - Shared domain types for the presence chat endpoint
//!
//! This crate provides the records exchanged between the stanza parser
//! (`presence-protocol`) and the connection runtime (`presenced`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod message;
pub mod namespace;
pub mod stanza;
pub mod transfer;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use message::{escape_text, markup_to_plain, plain_to_markup, Message};
pub use stanza::{FeatureNeg, IqContext, Stream};
pub use transfer::{
    OobTransfer, Socks5Transfer, StreamHost, Transfer, TransferInfo, TransferKind,
};
