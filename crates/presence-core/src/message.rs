//! Dual-format chat messages.
//!
//! A chat message travels with two renderings of the same text:
//! - `plain` - the canonical chat-log form (`<body>`)
//! - `markup` - inline XHTML-IM markup (`<html><body>`), limited in practice
//!   to bold and line breaks
//!
//! Whenever one rendering is missing it is derived from the other
//! (see [`Message::synchronize`]).

use std::borrow::Cow;

use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

/// Line break tag used in the markup rendering.
const LINE_BREAK: &str = "<br/>";

// ============================================================================
// Message
// ============================================================================

/// A chat message with both its plain and markup renderings.
///
/// `identity` is the local endpoint name and `other` the remote one. For a
/// received message they are taken from the wire `to`/`from` attributes
/// respectively; for an outgoing message they name the sender and recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Local endpoint name
    pub identity: String,

    /// Remote endpoint name
    pub other: String,

    /// Plain text (unescaped)
    pub plain: String,

    /// Inline markup (already valid XML content)
    pub markup: String,
}

impl Message {
    /// Creates an empty message between two endpoints.
    pub fn new(identity: impl Into<String>, other: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            other: other.into(),
            plain: String::new(),
            markup: String::new(),
        }
    }

    /// Creates a message from plain text only.
    pub fn from_plain(
        identity: impl Into<String>,
        other: impl Into<String>,
        plain: impl Into<String>,
    ) -> Self {
        Self {
            plain: plain.into(),
            ..Self::new(identity, other)
        }
    }

    /// Creates a message from markup only.
    pub fn from_markup(
        identity: impl Into<String>,
        other: impl Into<String>,
        markup: impl Into<String>,
    ) -> Self {
        Self {
            markup: markup.into(),
            ..Self::new(identity, other)
        }
    }

    /// Returns true when neither rendering carries visible text.
    ///
    /// The markup rendering is reduced to text before the check, so a
    /// message consisting only of tags or whitespace counts as empty.
    pub fn is_empty(&self) -> bool {
        self.plain.trim().is_empty() && markup_to_plain(&self.markup).trim().is_empty()
    }

    /// Whitespace-separated words of the plain rendering.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.plain.split_whitespace()
    }

    /// Fills in whichever rendering is missing from the other one.
    ///
    /// - markup only: `<br/>` becomes a newline, all other tags are dropped
    ///   and the result is trimmed
    /// - plain only: the trimmed text is escaped and newlines become `<br/>`
    pub fn synchronize(&mut self) {
        if self.plain.is_empty() && !self.markup.is_empty() {
            self.plain = markup_to_plain(&self.markup);
        } else if self.markup.is_empty() && !self.plain.is_empty() {
            self.markup = plain_to_markup(&self.plain);
        }
    }
}

// ============================================================================
// Derivation helpers
// ============================================================================

/// Escapes text for use inside XML content or a quoted attribute.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    escape(text)
}

/// Converts plain text into the markup rendering.
pub fn plain_to_markup(plain: &str) -> String {
    partial_escape(plain.trim()).replace('\n', LINE_BREAK)
}

/// Reduces markup to plain text.
///
/// Line breaks (`<br>`, `<br/>`) become newlines, every other tag is dropped
/// and entities are resolved. Markup that is not well-formed falls back to a
/// lexical tag strip.
pub fn markup_to_plain(markup: &str) -> String {
    if markup.is_empty() {
        return String::new();
    }

    match collect_text(markup) {
        Some(text) => text.trim().to_string(),
        None => {
            debug!("Markup is not well-formed, stripping tags lexically");
            strip_tags(markup).trim().to_string()
        }
    }
}

/// Collects the text content of a markup fragment, or `None` on an XML error.
fn collect_text(markup: &str) -> Option<String> {
    let wrapped = format!("<p>{markup}</p>");
    let mut reader = Reader::from_str(&wrapped);
    let config = reader.config_mut();
    config.trim_text(false);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.name().as_ref().eq_ignore_ascii_case(b"br") {
                    text.push('\n');
                }
            }
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().ok()?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    Some(text)
}

/// Drops everything between `<` and `>`, turning line-break tags into newlines.
fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for c in markup.chars() {
        match (in_tag, c) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (false, _) => out.push(c),
            (true, '>') => {
                in_tag = false;
                let name = tag.trim_start_matches('/').trim_end_matches('/').trim();
                if name.eq_ignore_ascii_case("br") {
                    out.push('\n');
                }
            }
            (true, _) => tag.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_line_break_becomes_newline() {
        let mut msg = Message::from_markup("me", "you", "a<br/>b");
        msg.synchronize();
        assert_eq!(msg.plain, "a\nb");
        assert_eq!(msg.markup, "a<br/>b");
    }

    #[test]
    fn test_markup_tags_are_stripped() {
        assert_eq!(markup_to_plain("<b>users:</b><br/>alice"), "users:\nalice");
        assert_eq!(markup_to_plain("  <i>x</i> &amp; y "), "x & y");
        assert_eq!(markup_to_plain("one<br>two"), "one\ntwo");
    }

    #[test]
    fn test_malformed_markup_falls_back_to_lexical_strip() {
        assert_eq!(markup_to_plain("a &bogus; <b>b</b>"), "a &bogus; b");
    }

    #[test]
    fn test_plain_to_markup_escapes_and_breaks_lines() {
        let mut msg = Message::from_plain("me", "you", " 1 < 2\nok ");
        msg.synchronize();
        assert_eq!(msg.markup, "1 &lt; 2<br/>ok");
        assert_eq!(msg.plain, " 1 < 2\nok ");
    }

    #[test]
    fn test_synchronize_keeps_both_when_present() {
        let mut msg = Message {
            identity: "me".into(),
            other: "you".into(),
            plain: "plain".into(),
            markup: "<b>rich</b>".into(),
        };
        msg.synchronize();
        assert_eq!(msg.plain, "plain");
        assert_eq!(msg.markup, "<b>rich</b>");
    }

    #[test]
    fn test_whitespace_only_message_is_empty() {
        let msg = Message {
            markup: "   ".into(),
            ..Message::new("me", "you")
        };
        assert!(msg.is_empty());

        let tags_only = Message::from_markup("me", "you", "<b> </b><br/>");
        assert!(tags_only.is_empty());

        let text = Message::from_plain("me", "you", " hi ");
        assert!(!text.is_empty());
    }

    #[test]
    fn test_words() {
        let msg = Message::from_plain("me", "you", "  echo hello\n there ");
        let words: Vec<_> = msg.words().collect();
        assert_eq!(words, vec!["echo", "hello", "there"]);
    }

    #[test]
    fn test_escape_text_quotes() {
        assert_eq!(escape_text("a'b\"<&>"), "a&apos;b&quot;&lt;&amp;&gt;");
    }
}
