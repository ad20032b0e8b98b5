//! Outgoing stanza rendering.
//!
//! Every function returns the stanza as a string without a trailing newline;
//! the connection appends one when writing, so a stanza never contains a raw
//! line break. Attribute values and plain text are escaped here, markup is
//! inserted as-is apart from its line breaks.

use std::borrow::Cow;

use presence_core::namespace;
use presence_core::{escape_text, Message, Transfer};

/// Closes the stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Stream header sent in reply to the peer's stream open.
pub fn stream_open(identity: &str, other: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?><stream:stream xmlns='{}' xmlns:stream='{}' from='{}' to='{}' version='1.0'>",
        namespace::JABBER_CLIENT,
        namespace::STREAMS,
        escape_text(identity),
        escape_text(other),
    )
}

/// Chat message from `message.identity` to `message.other`.
///
/// The message should be synchronized first so both renderings are present.
pub fn chat_message(message: &Message) -> String {
    format!(
        "<message from='{}' to='{}' type='chat'><body>{}</body><html xmlns='{}'><body>{}</body></html></message>",
        escape_text(&message.identity),
        escape_text(&message.other),
        encode_line_breaks(&escape_text(&message.plain)),
        namespace::XHTML,
        encode_line_breaks(&message.markup),
    )
}

/// Replaces CR and LF in character data with character references.
fn encode_line_breaks(text: &str) -> Cow<'_, str> {
    if !text.contains(['\n', '\r']) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace('\r', "&#13;").replace('\n', "&#10;"))
}

/// Accepts a feature negotiation by choosing SOCKS5 bytestreams.
pub fn si_result(from: &str, to: &str, request_id: &str) -> String {
    format!(
        "<iq type='result' from='{}' to='{}' id='{}'><si xmlns='{}'><feature xmlns='{}'><x xmlns='{}' type='submit'><field var='stream-method'><value>{}</value></field></x></feature></si></iq>",
        escape_text(from),
        escape_text(to),
        escape_text(request_id),
        namespace::SI,
        namespace::FEATURE_NEG,
        namespace::X_DATA,
        namespace::BYTESTREAMS,
    )
}

/// Refuses a SOCKS5 transfer.
pub fn socks5_failure(from: &str, to: &str, request_id: &str) -> String {
    format!(
        "<iq from='{}' id='{}' to='{}' type='error'><error type='modify'><not-acceptable xmlns='{}'/></error></iq>",
        escape_text(from),
        escape_text(request_id),
        escape_text(to),
        namespace::STANZAS,
    )
}

/// Acknowledges an IQ out-of-band transfer.
pub fn oob_success(from: &str, to: &str, request_id: &str) -> String {
    format!(
        "<iq type='result' from='{}' to='{}' id='{}'/>",
        escape_text(from),
        escape_text(to),
        escape_text(request_id),
    )
}

/// Why an out-of-band transfer was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    /// The URL could not be retrieved
    ItemNotFound,
    /// The offer itself was not acceptable
    NotAcceptable,
}

impl ErrorCondition {
    fn code(self) -> u16 {
        match self {
            Self::ItemNotFound => 404,
            Self::NotAcceptable => 406,
        }
    }

    fn error_type(self) -> &'static str {
        match self {
            Self::ItemNotFound => "cancel",
            Self::NotAcceptable => "modify",
        }
    }

    fn element(self) -> &'static str {
        match self {
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
        }
    }
}

/// Refuses an IQ out-of-band transfer, echoing the offered URL.
pub fn oob_failure(
    from: &str,
    to: &str,
    request_id: &str,
    url: &str,
    condition: ErrorCondition,
) -> String {
    format!(
        "<iq type='error' from='{}' to='{}' id='{}'><query xmlns='{}'><url>{}</url></query><error code='{}' type='{}'><{} xmlns='{}'/></error></iq>",
        escape_text(from),
        escape_text(to),
        escape_text(request_id),
        namespace::IQ_OOB,
        escape_text(url),
        condition.code(),
        condition.error_type(),
        condition.element(),
        namespace::STANZAS,
    )
}

/// Reply refusing a transfer offer without attempting it.
///
/// Message-extension OOB offers have no request to answer, so they get
/// `None`.
pub fn rejection(transfer: &Transfer) -> Option<String> {
    let info = transfer.info();
    let from = info.identity.as_deref().unwrap_or_default();
    let to = info.other.as_deref().unwrap_or_default();
    let request_id = transfer.iq_id()?;
    match transfer {
        Transfer::Socks5(_) => Some(socks5_failure(from, to, request_id)),
        Transfer::Oob(oob) => Some(oob_failure(
            from,
            to,
            request_id,
            oob.info.filename.as_deref().unwrap_or_default(),
            ErrorCondition::NotAcceptable,
        )),
    }
}

/// Reply reporting the outcome of an attempted retrieval.
///
/// Only IQ out-of-band offers define one; SOCKS5 bytestreams and
/// message-extension OOB offers return `None`.
pub fn completion(transfer: &Transfer, success: bool) -> Option<String> {
    let Transfer::Oob(oob) = transfer else {
        return None;
    };
    let request_id = oob.iq_id.as_deref()?;
    let from = oob.info.identity.as_deref().unwrap_or_default();
    let to = oob.info.other.as_deref().unwrap_or_default();
    if success {
        Some(oob_success(from, to, request_id))
    } else {
        Some(oob_failure(
            from,
            to,
            request_id,
            oob.info.filename.as_deref().unwrap_or_default(),
            ErrorCondition::ItemNotFound,
        ))
    }
}
