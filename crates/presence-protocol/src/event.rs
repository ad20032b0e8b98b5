//! Parser output.

use presence_core::{FeatureNeg, Message, Stream, Transfer};

/// One complete protocol event produced by the [`StanzaParser`].
///
/// Events are queued in the order their closing (or, for stream open, opening)
/// tag was seen and are consumed exactly once.
///
/// [`StanzaParser`]: crate::parse::StanzaParser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaEvent {
    /// `<stream:stream>` opened
    StreamOpen(Stream),

    /// `</stream:stream>` seen
    StreamClose,

    /// A complete `<message>` stanza
    ChatMessage(Message),

    /// A complete file transfer offer (OOB or SOCKS5)
    FileTransfer(Transfer),

    /// A complete `<feature>` negotiation request
    FeatureNegotiation(FeatureNeg),
}

impl StanzaEvent {
    /// Short name used in log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamOpen(_) => "stream_open",
            Self::StreamClose => "stream_close",
            Self::ChatMessage(_) => "chat_message",
            Self::FileTransfer(_) => "file_transfer",
            Self::FeatureNegotiation(_) => "feature_negotiation",
        }
    }
}
