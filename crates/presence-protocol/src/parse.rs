//! Incremental stanza parser.
//!
//! Bytes arrive in arbitrarily sized chunks. The parser buffers them, runs the
//! complete portion through quick-xml and feeds the resulting tag/text tokens
//! into a [`ParserState`] machine which emits [`StanzaEvent`]s into a FIFO
//! queue.
//!
//! # State machine
//!
//! - `mode` - exactly one stanza type under construction at a time
//! - `flags` - nesting inside `<body>`, `<html>`, `<html><body>`, `<option>`,
//!   `<value>` and an OOB `<url>`
//!
//! While inside `<html><body>` every tag except `html`/`body` is markup
//! content and is re-serialized into the message rather than interpreted.
//!
//! # Chunk boundaries
//!
//! Only bytes up to the last `>` are tokenized, a tag cut by the chunk edge
//! stays buffered, and text is delivered only once the next tag terminates it.
//! The event sequence is therefore the same however the input is split.

use std::collections::VecDeque;

use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, error, trace, warn};

use presence_core::namespace;
use presence_core::{
    FeatureNeg, IqContext, Message, OobTransfer, Socks5Transfer, StreamHost, Stream, Transfer,
    TransferInfo,
};

use crate::event::StanzaEvent;

/// Most input held back waiting for a closing `>`.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Structural tags without payload of their own.
const IGNORED_TAGS: [&str; 5] = ["font", "composing", "id", "si", "field"];

// ============================================================================
// Mode and flags
// ============================================================================

/// Stanza type currently under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    Message,
    FileOob,
    FileSocks5,
    FeatureNeg,
}

/// Nesting markers tracked independently of the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Inside a plain `<body>`
    Body,
    /// Inside `<html>`
    Html,
    /// Inside `<html><body>`: tags are markup content
    HtmlBody,
    /// Inside a feature-negotiation `<option>`
    Option,
    /// Inside a `<value>`
    Value,
    /// Inside an OOB `<url>`
    Url,
}

impl Flag {
    const COUNT: usize = 6;

    fn slot(self) -> usize {
        match self {
            Self::Body => 0,
            Self::Html => 1,
            Self::HtmlBody => 2,
            Self::Option => 3,
            Self::Value => 4,
            Self::Url => 5,
        }
    }
}

/// Set of raised [`Flag`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagSet([bool; Flag::COUNT]);

impl FlagSet {
    pub fn insert(&mut self, flag: Flag) {
        if let Some(slot) = self.0.get_mut(flag.slot()) {
            *slot = true;
        }
    }

    pub fn remove(&mut self, flag: Flag) {
        if let Some(slot) = self.0.get_mut(flag.slot()) {
            *slot = false;
        }
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.0.get(flag.slot()).copied().unwrap_or(false)
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// A start tag with decoded attributes.
#[derive(Debug, Clone)]
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let attrs = start
            .attributes()
            .with_checks(false)
            .filter_map(|attr| match attr {
                Ok(attr) => {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = match attr.unescape_value() {
                        Ok(value) => value.into_owned(),
                        Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
                    };
                    Some((key, value))
                }
                Err(e) => {
                    debug!(tag = %name, error = %e, "Skipping malformed attribute");
                    None
                }
            })
            .collect();
        Self { name, attrs }
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, or an empty string when absent.
    fn attr_or_empty(&self, key: &str) -> String {
        self.attr(key).unwrap_or_default().to_string()
    }

    fn is_markup_container(&self) -> bool {
        self.name == "html" || self.name == "body"
    }

    /// Re-serializes the tag as markup content.
    fn to_markup(&self, self_closing: bool) -> String {
        let mut out = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }
        out.push_str(if self_closing { "/>" } else { ">" });
        out
    }
}

// ============================================================================
// Parser state
// ============================================================================

/// Stanza under construction.
#[derive(Debug, Default)]
enum Current {
    #[default]
    None,
    Message(Message),
    Transfer(Transfer),
    FeatureNeg(FeatureNeg),
}

/// File metadata from an SI offer, waiting for its bytestream `<query>`.
#[derive(Debug, Default)]
struct PendingFile {
    name: Option<String>,
    size: Option<u64>,
}

/// Mode, flags and partial stanza shared by the tokenizer callbacks.
#[derive(Debug, Default)]
pub struct ParserState {
    mode: Mode,
    flags: FlagSet,
    iq: Option<IqContext>,
    pending_file: PendingFile,
    current: Current,
}

impl ParserState {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn flags(&self) -> FlagSet {
        self.flags
    }

    fn set_mode(&mut self, mode: Mode) {
        trace!(from = ?self.mode, to = ?mode, "Setting parser mode");
        self.mode = mode;
    }

    fn check_mode(&self, expected: Mode) {
        if self.mode != expected {
            error!(expected = ?expected, actual = ?self.mode, "Wrong parser mode");
        }
    }

    fn append_markup(&mut self, markup: &str) {
        self.check_mode(Mode::Message);
        if let Current::Message(message) = &mut self.current {
            message.markup.push_str(markup);
        }
    }

    /// Completes the current stanza and returns to `Idle`.
    fn finish(&mut self, events: &mut VecDeque<StanzaEvent>) {
        let event = match std::mem::take(&mut self.current) {
            Current::None => None,
            Current::Message(message) => Some(StanzaEvent::ChatMessage(message)),
            Current::Transfer(mut transfer) => {
                if let Some(filename) = transfer.info_mut().filename.as_mut() {
                    *filename = filename.trim().to_string();
                }
                if let Err(e) = transfer.validate() {
                    warn!(error = %e, "Transfer offer is incomplete");
                }
                Some(StanzaEvent::FileTransfer(transfer))
            }
            Current::FeatureNeg(fneg) => Some(StanzaEvent::FeatureNegotiation(fneg)),
        };
        if let Some(event) = event {
            debug!(event = event.kind(), "Adding parser result");
            events.push_back(event);
        }
        self.set_mode(Mode::Idle);
    }

    fn start_element(&mut self, tag: &Tag, events: &mut VecDeque<StanzaEvent>) {
        if self.flags.contains(Flag::HtmlBody) && !tag.is_markup_container() {
            self.append_markup(&tag.to_markup(false));
            return;
        }
        if IGNORED_TAGS.contains(&tag.name.as_str()) {
            return;
        }

        match tag.name.as_str() {
            "stream:stream" => {
                let stream = Stream::new(tag.attr_or_empty("to"), tag.attr_or_empty("from"));
                debug!(event = "stream_open", "Adding parser result");
                events.push_back(StanzaEvent::StreamOpen(stream));
            }
            "message" => {
                self.check_mode(Mode::Idle);
                self.set_mode(Mode::Message);
                self.current = Current::Message(Message::new(
                    tag.attr_or_empty("to"),
                    tag.attr_or_empty("from"),
                ));
            }
            "iq" => {
                self.iq = Some(IqContext {
                    identity: tag.attr_or_empty("to"),
                    other: tag.attr_or_empty("from"),
                    id: tag.attr_or_empty("id"),
                    kind: tag.attr_or_empty("type"),
                });
            }
            "x" => self.start_x(tag),
            "url" => self.start_url(tag),
            "html" => self.flags.insert(Flag::Html),
            "body" => {
                if self.flags.contains(Flag::Html) {
                    self.flags.insert(Flag::HtmlBody);
                } else {
                    self.flags.insert(Flag::Body);
                }
            }
            "file" => {
                if tag.attr("xmlns") == Some(namespace::SI_FILE_TRANSFER) {
                    self.pending_file = PendingFile {
                        name: tag.attr("name").map(str::to_string),
                        size: parse_size(tag.attr("size")),
                    };
                }
            }
            "feature" => {
                if tag.attr("xmlns") == Some(namespace::FEATURE_NEG) {
                    self.set_mode(Mode::FeatureNeg);
                    let iq = self.iq.clone().unwrap_or_default();
                    self.current = Current::FeatureNeg(FeatureNeg::new(&iq));
                }
            }
            "option" => self.flags.insert(Flag::Option),
            "value" => self.flags.insert(Flag::Value),
            "query" => self.start_query(tag),
            "streamhost" => self.add_streamhost(tag),
            _ => debug!(name = %tag.name, attrs = ?tag.attrs, "Start element"),
        }
    }

    fn start_x(&mut self, tag: &Tag) {
        if tag.attr("xmlns") != Some(namespace::X_OOB) {
            return;
        }
        let Current::Message(message) = &self.current else {
            error!(mode = ?self.mode, "Out-of-band offer outside of a message, ignoring");
            return;
        };
        let info = TransferInfo::between(message.identity.clone(), message.other.clone());
        self.set_mode(Mode::FileOob);
        self.current = Current::Transfer(Transfer::Oob(OobTransfer { info, iq_id: None }));
    }

    fn start_url(&mut self, tag: &Tag) {
        if self.mode != Mode::FileOob {
            return;
        }
        let Current::Transfer(transfer) = &mut self.current else {
            return;
        };
        let info = transfer.info_mut();
        if matches!(tag.attr("type"), None | Some("file")) {
            if let Some(size) = parse_size(tag.attr("size")) {
                info.filesize = Some(size);
            }
        }
        info.filename = Some(String::new());
        self.flags.insert(Flag::Url);
    }

    fn start_query(&mut self, tag: &Tag) {
        let iq = self.iq.clone();
        match tag.attr("xmlns") {
            Some(namespace::BYTESTREAMS) => {
                self.check_mode(Mode::Idle);
                self.set_mode(Mode::FileSocks5);
                let pending = std::mem::take(&mut self.pending_file);
                let info = TransferInfo {
                    filename: pending.name,
                    filesize: pending.size,
                    identity: iq.as_ref().map(|iq| iq.identity.clone()),
                    other: iq.as_ref().map(|iq| iq.other.clone()),
                };
                self.current = Current::Transfer(Transfer::Socks5(Socks5Transfer {
                    info,
                    sid: tag.attr("sid").map(str::to_string),
                    iq_id: iq.map(|iq| iq.id),
                    streamhosts: Vec::new(),
                }));
            }
            Some(namespace::IQ_OOB) => {
                self.check_mode(Mode::Idle);
                self.set_mode(Mode::FileOob);
                let info = TransferInfo {
                    identity: iq.as_ref().map(|iq| iq.identity.clone()),
                    other: iq.as_ref().map(|iq| iq.other.clone()),
                    ..TransferInfo::default()
                };
                self.current = Current::Transfer(Transfer::Oob(OobTransfer {
                    info,
                    iq_id: iq.map(|iq| iq.id),
                }));
            }
            _ => debug!(xmlns = ?tag.attr("xmlns"), "Ignoring query"),
        }
    }

    fn add_streamhost(&mut self, tag: &Tag) {
        let Current::Transfer(Transfer::Socks5(transfer)) = &mut self.current else {
            debug!("Stream host outside of a bytestream offer");
            return;
        };
        let port = tag.attr("port").and_then(|p| p.trim().parse::<u16>().ok());
        match (tag.attr("host"), port) {
            (Some(host), Some(port)) => transfer.streamhosts.push(StreamHost {
                host: host.to_string(),
                port,
                jid: tag.attr_or_empty("jid"),
            }),
            _ => warn!(attrs = ?tag.attrs, "Skipping stream host without host/port"),
        }
    }

    fn end_element(&mut self, name: &str, events: &mut VecDeque<StanzaEvent>) {
        match name {
            "html" => {
                self.flags.remove(Flag::Html);
                self.flags.remove(Flag::HtmlBody);
                return;
            }
            "body" => {
                if self.flags.contains(Flag::Html) {
                    self.flags.remove(Flag::HtmlBody);
                } else {
                    self.flags.remove(Flag::Body);
                }
                return;
            }
            _ => {}
        }
        if self.flags.contains(Flag::HtmlBody) {
            self.append_markup(&format!("</{name}>"));
            return;
        }
        if IGNORED_TAGS.contains(&name) {
            return;
        }

        match name {
            "stream:stream" => {
                debug!(event = "stream_close", "Adding parser result");
                events.push_back(StanzaEvent::StreamClose);
            }
            "message" => {
                if self.mode == Mode::Message {
                    self.finish(events);
                }
            }
            "x" => {
                if self.mode == Mode::FileOob && self.current_is_oob(false) {
                    self.finish(events);
                }
            }
            "url" => self.flags.remove(Flag::Url),
            "iq" => self.iq = None,
            "feature" => {
                if self.mode == Mode::FeatureNeg {
                    self.finish(events);
                } else {
                    error!(mode = ?self.mode, "Closing feature outside of feature negotiation");
                }
            }
            "option" => self.flags.remove(Flag::Option),
            "value" => self.flags.remove(Flag::Value),
            "query" => {
                if self.mode == Mode::FileSocks5
                    || (self.mode == Mode::FileOob && self.current_is_oob(true))
                {
                    self.finish(events);
                }
            }
            "streamhost" | "file" => {}
            _ => debug!(name = %name, "End element"),
        }
    }

    /// True if the current stanza is an OOB offer of the given form.
    fn current_is_oob(&self, iq_form: bool) -> bool {
        matches!(
            &self.current,
            Current::Transfer(Transfer::Oob(oob)) if oob.iq_id.is_some() == iq_form
        )
    }

    fn char_data(&mut self, text: &str) {
        match (self.mode, &mut self.current) {
            (Mode::Message, Current::Message(message)) => {
                if self.flags.contains(Flag::HtmlBody) {
                    message.markup.push_str(&partial_escape(text));
                } else if self.flags.contains(Flag::Body) {
                    message.plain.push_str(text);
                }
            }
            (Mode::FeatureNeg, Current::FeatureNeg(fneg)) => {
                if self.flags.contains(Flag::Option) && self.flags.contains(Flag::Value) {
                    let value = text.trim();
                    if !value.is_empty() {
                        fneg.offered.push(value.to_string());
                    }
                }
            }
            (Mode::FileOob, Current::Transfer(transfer)) => {
                if self.flags.contains(Flag::Url) {
                    if let Some(url) = transfer.info_mut().filename.as_mut() {
                        url.push_str(text);
                    }
                }
            }
            _ => {
                if !text.trim().is_empty() {
                    debug!(data = %text, "Data");
                }
            }
        }
    }
}

fn parse_size(value: Option<&str>) -> Option<u64> {
    let value = value?;
    match value.trim().parse() {
        Ok(size) => Some(size),
        Err(_) => {
            warn!(size = %value, "Ignoring unparsable file size");
            None
        }
    }
}

/// Errors that mean "the input stops inside a token", not malformed XML.
fn is_incomplete(error: &XmlError) -> bool {
    matches!(
        error,
        XmlError::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::InvalidBangMarkup
        )
    )
}

// ============================================================================
// Parser
// ============================================================================

/// Incremental XML-to-[`StanzaEvent`] parser for one connection.
#[derive(Debug, Default)]
pub struct StanzaParser {
    /// Bytes received but not yet tokenized
    pending: Vec<u8>,
    state: ParserState,
    results: VecDeque<StanzaEvent>,
}

impl StanzaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of input.
    ///
    /// Returns `true` ("more needed") for an empty chunk, which carries no
    /// data, and `false` once a non-empty chunk has been consumed. Completed
    /// events are available through [`next`](Self::next).
    pub fn process(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.pending.extend_from_slice(chunk);
        self.tokenize_pending();
        if self.pending.len() > MAX_PENDING_BYTES {
            error!(
                buffered = self.pending.len(),
                limit = MAX_PENDING_BYTES,
                "Unterminated input exceeds limit, discarding it"
            );
            self.pending = Vec::new();
        }
        false
    }

    /// Bytes received but not yet tokenized.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Pops the oldest completed event, or `None` when the queue is empty.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<StanzaEvent> {
        self.results.pop_front()
    }

    /// Number of completed events waiting in the queue.
    pub fn queued(&self) -> usize {
        self.results.len()
    }

    /// Current parser state (mode and flags).
    pub fn state(&self) -> &ParserState {
        &self.state
    }

    fn tokenize_pending(&mut self) {
        let Some(last_close) = self.pending.iter().rposition(|&b| b == b'>') else {
            return;
        };
        let pending = std::mem::take(&mut self.pending);
        let consumed = match pending.get(..=last_close) {
            Some(complete) => self.tokenize(complete),
            None => 0,
        };
        self.pending = pending.get(consumed..).map(<[u8]>::to_vec).unwrap_or_default();
    }

    /// Runs the tokenizer over `input`, returning how many bytes were used.
    fn tokenize(&mut self, input: &[u8]) -> usize {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let state = &mut self.state;
        let results = &mut self.results;
        let mut consumed = 0;

        loop {
            let event = reader.read_event();
            let position = reader.buffer_position() as usize;

            match event {
                Ok(Event::Eof) => break,
                Ok(Event::Start(start)) => {
                    state.start_element(&Tag::from_start(&start), results);
                }
                Ok(Event::Empty(start)) => {
                    let tag = Tag::from_start(&start);
                    if state.flags.contains(Flag::HtmlBody) && !tag.is_markup_container() {
                        state.append_markup(&tag.to_markup(true));
                    } else {
                        state.start_element(&tag, results);
                        state.end_element(&tag.name, results);
                    }
                }
                Ok(Event::End(end)) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    state.end_element(&name, results);
                }
                Ok(Event::Text(text)) => {
                    if position >= input.len() {
                        // Not yet terminated by a tag; wait for more input.
                        break;
                    }
                    match text.unescape() {
                        Ok(text) => state.char_data(&text),
                        // Markup may use XHTML entities; keep them as written.
                        Err(_) if state.flags.contains(Flag::HtmlBody) => {
                            state.append_markup(&String::from_utf8_lossy(&text));
                        }
                        Err(e) => {
                            warn!(error = %e, "Undecodable character data, using it verbatim");
                            state.char_data(&String::from_utf8_lossy(&text));
                        }
                    }
                }
                Ok(Event::CData(data)) => state.char_data(&String::from_utf8_lossy(&data)),
                Ok(_) => {}
                Err(e) if is_incomplete(&e) => break,
                Err(e) => {
                    error!(error = %e, "XML parse error, discarding buffered input");
                    return input.len();
                }
            }
            consumed = position;
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM_OPEN: &str = "<?xml version='1.0' encoding='UTF-8'?>\
        <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
        to='me@host' from='you@peer' version='1.0'>";

    const CHAT: &str = "<message to='me@host' from='you@peer' type='chat'>\
        <body>hello there</body>\
        <html xmlns='http://www.w3.org/1999/xhtml'>\
        <body><font face='Helvetica'>hello <b>there</b></font><br/></body></html>\
        <x xmlns='jabber:x:event'><composing/></x></message>";

    const SOCKS5_OFFER: &str = "<iq type='set' id='iq-si' to='me@host' from='you@peer'>\
        <si xmlns='http://jabber.org/protocol/si' id='sid-1' profile='http://jabber.org/protocol/si/profile/file-transfer'>\
        <file xmlns='http://jabber.org/protocol/si/profile/file-transfer' name='photo.jpg' size='1024'/>\
        <feature xmlns='http://jabber.org/protocol/feature-neg'>\
        <x xmlns='jabber:x:data' type='form'>\
        <field var='stream-method' type='list-single'>\
        <option><value>http://jabber.org/protocol/bytestreams</value></option>\
        <option><value>http://jabber.org/protocol/ibb</value></option>\
        </field></x></feature></si></iq>\
        <iq type='set' id='iq-bs' to='me@host' from='you@peer'>\
        <query xmlns='http://jabber.org/protocol/bytestreams' sid='sid-1' mode='tcp'>\
        <streamhost jid='you@peer' host='192.168.1.2' port='7777'/>\
        <streamhost jid='proxy.peer' host='10.0.0.1' port='7778'/>\
        </query></iq>";

    fn parse_all(chunks: &[&[u8]]) -> Vec<StanzaEvent> {
        let mut parser = StanzaParser::new();
        for chunk in chunks {
            parser.process(chunk);
        }
        std::iter::from_fn(|| parser.next()).collect()
    }

    fn full_session() -> String {
        format!("{STREAM_OPEN}{CHAT}{SOCKS5_OFFER}</stream:stream>")
    }

    #[test]
    fn test_stream_open_then_message() {
        let events = parse_all(&[STREAM_OPEN.as_bytes(), CHAT.as_bytes()]);
        assert_eq!(events.len(), 2);

        match &events[0] {
            StanzaEvent::StreamOpen(stream) => {
                assert_eq!(stream.identity, "me@host");
                assert_eq!(stream.other, "you@peer");
            }
            other => panic!("Expected StreamOpen, got {other:?}"),
        }
        match &events[1] {
            StanzaEvent::ChatMessage(message) => {
                assert_eq!(message.identity, "me@host");
                assert_eq!(message.other, "you@peer");
                assert_eq!(message.plain, "hello there");
                assert_eq!(
                    message.markup,
                    "<font face=\"Helvetica\">hello <b>there</b></font><br/>"
                );
            }
            other => panic!("Expected ChatMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_xhtml_entity_kept_in_markup() {
        let input = "<message to='me' from='you'><body>a b</body>\
            <html xmlns='http://www.w3.org/1999/xhtml'><body>a&nbsp;<b>b</b> &amp; c</body></html></message>";
        let events = parse_all(&[input.as_bytes()]);
        match events.as_slice() {
            [StanzaEvent::ChatMessage(message)] => {
                assert_eq!(message.markup, "a&nbsp;<b>b</b> &amp; c");
            }
            other => panic!("Expected one message, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_input_is_bounded() {
        let mut parser = StanzaParser::new();
        let junk = vec![b'x'; 64 * 1024];
        for _ in 0..(MAX_PENDING_BYTES / junk.len()) {
            parser.process(&junk);
        }
        assert_eq!(parser.buffered(), MAX_PENDING_BYTES);

        parser.process(&junk);
        assert_eq!(parser.buffered(), 0);
        assert!(parser.next().is_none());

        parser.process(STREAM_OPEN.as_bytes());
        assert!(matches!(parser.next(), Some(StanzaEvent::StreamOpen(_))));
    }

    #[test]
    fn test_next_on_empty_queue_is_idempotent() {
        let mut parser = StanzaParser::new();
        assert!(parser.next().is_none());
        parser.process(b"</stream:stream>");
        assert_eq!(parser.next(), Some(StanzaEvent::StreamClose));
        for _ in 0..3 {
            assert!(parser.next().is_none());
        }
    }

    #[test]
    fn test_process_return_value() {
        let mut parser = StanzaParser::new();
        assert!(parser.process(b""));
        assert!(!parser.process(b"<message"));
        assert_eq!(parser.queued(), 0);
    }

    #[test]
    fn test_single_byte_chunks_match_whole_buffer() {
        let input = full_session();
        let whole = parse_all(&[input.as_bytes()]);
        let bytes: Vec<&[u8]> = input.as_bytes().chunks(1).collect();
        let split = parse_all(&bytes);

        assert_eq!(whole.len(), 5);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_multibyte_text_split_across_chunks() {
        let input = "<message to='a' from='b'><body>grüße ✓</body></message>";
        let bytes: Vec<&[u8]> = input.as_bytes().chunks(3).collect();
        let events = parse_all(&bytes);
        match events.as_slice() {
            [StanzaEvent::ChatMessage(message)] => assert_eq!(message.plain, "grüße ✓"),
            other => panic!("Expected one message, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_stanzas_in_one_chunk() {
        let input = format!("{CHAT}{CHAT}{CHAT}");
        let mut parser = StanzaParser::new();
        parser.process(input.as_bytes());
        assert_eq!(parser.queued(), 3);
    }

    #[test]
    fn test_markup_entities_stay_escaped() {
        let input = "<message to='a' from='b'><body>1 &lt; 2</body>\
            <html xmlns='http://www.w3.org/1999/xhtml'><body>1 &lt; <i>2</i></body></html></message>";
        match parse_all(&[input.as_bytes()]).as_slice() {
            [StanzaEvent::ChatMessage(message)] => {
                assert_eq!(message.plain, "1 < 2");
                assert_eq!(message.markup, "1 &lt; <i>2</i>");
            }
            other => panic!("Expected one message, got {other:?}"),
        }
    }

    #[test]
    fn test_feature_negotiation_and_socks5_offer() {
        let events = parse_all(&[SOCKS5_OFFER.as_bytes()]);
        assert_eq!(events.len(), 2);

        match &events[0] {
            StanzaEvent::FeatureNegotiation(fneg) => {
                assert_eq!(fneg.request_id, "iq-si");
                assert_eq!(
                    fneg.offered,
                    vec![
                        "http://jabber.org/protocol/bytestreams".to_string(),
                        "http://jabber.org/protocol/ibb".to_string(),
                    ]
                );
            }
            other => panic!("Expected FeatureNegotiation, got {other:?}"),
        }

        match &events[1] {
            StanzaEvent::FileTransfer(Transfer::Socks5(transfer)) => {
                assert_eq!(transfer.sid.as_deref(), Some("sid-1"));
                assert_eq!(transfer.iq_id.as_deref(), Some("iq-bs"));
                assert_eq!(transfer.info.filename.as_deref(), Some("photo.jpg"));
                assert_eq!(transfer.info.filesize, Some(1024));
                assert_eq!(transfer.info.identity.as_deref(), Some("me@host"));
                assert_eq!(transfer.info.other.as_deref(), Some("you@peer"));
                let hosts: Vec<_> = transfer
                    .streamhosts
                    .iter()
                    .map(|h| (h.host.as_str(), h.port, h.jid.as_str()))
                    .collect();
                assert_eq!(
                    hosts,
                    vec![("192.168.1.2", 7777, "you@peer"), ("10.0.0.1", 7778, "proxy.peer")]
                );
            }
            other => panic!("Expected SOCKS5 FileTransfer, got {other:?}"),
        }
    }

    #[test]
    fn test_bytestream_query_without_file_is_incomplete() {
        let input = "<iq type='set' id='q1' to='a' from='b'>\
            <query xmlns='http://jabber.org/protocol/bytestreams' sid='s'>\
            <streamhost jid='b' host='h' port='1'/></query></iq>";
        match parse_all(&[input.as_bytes()]).as_slice() {
            [StanzaEvent::FileTransfer(transfer)] => {
                assert_eq!(transfer.missing_fields(), vec!["filename", "filesize"]);
            }
            other => panic!("Expected one transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_message_oob_offer() {
        let input = "<message to='me' from='you'><body>file</body>\
            <x xmlns='jabber:x:oob'><url type='file' size='42' mimeType='text/plain'>\
            http://you.local:8000/docs/a.txt</url></x></message>";
        let events = parse_all(&[input.as_bytes()]);
        match events.as_slice() {
            [StanzaEvent::FileTransfer(Transfer::Oob(oob))] => {
                assert_eq!(
                    oob.info.filename.as_deref(),
                    Some("http://you.local:8000/docs/a.txt")
                );
                assert_eq!(oob.info.filesize, Some(42));
                assert_eq!(oob.info.identity.as_deref(), Some("me"));
                assert_eq!(oob.info.other.as_deref(), Some("you"));
                assert_eq!(oob.iq_id, None);
            }
            other => panic!("Expected one OOB transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_iq_oob_offer_carries_request_id() {
        let input = "<iq type='set' id='oob-7' to='me' from='you'>\
            <query xmlns='jabber:iq:oob'><url size='5'>http://you/f.bin</url>\
            <desc>a file</desc></query></iq>";
        match parse_all(&[input.as_bytes()]).as_slice() {
            [StanzaEvent::FileTransfer(Transfer::Oob(oob))] => {
                assert_eq!(oob.iq_id.as_deref(), Some("oob-7"));
                assert_eq!(oob.info.filename.as_deref(), Some("http://you/f.bin"));
                assert_eq!(oob.info.filesize, Some(5));
            }
            other => panic!("Expected one OOB transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_closing_feature_in_wrong_mode_is_not_fatal() {
        let input = "</feature><message to='a' from='b'><body>still here</body></message>";
        match parse_all(&[input.as_bytes()]).as_slice() {
            [StanzaEvent::ChatMessage(message)] => assert_eq!(message.plain, "still here"),
            other => panic!("Expected one message, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_input_is_discarded() {
        let mut parser = StanzaParser::new();
        parser.process(b"<message to='a' from='b'><body>x</body></message><a b=c>");
        parser.process(b"<message to='a' from='b'><body>y</body></message>");
        let plains: Vec<_> = std::iter::from_fn(|| parser.next())
            .filter_map(|event| match event {
                StanzaEvent::ChatMessage(message) => Some(message.plain),
                _ => None,
            })
            .collect();
        assert_eq!(plains.last().map(String::as_str), Some("y"));
    }

    #[test]
    fn test_flags_track_nesting() {
        let mut parser = StanzaParser::new();
        parser.process(b"<message to='a' from='b'><html><body>");
        assert_eq!(parser.state().mode(), Mode::Message);
        assert!(parser.state().flags().contains(Flag::Html));
        assert!(parser.state().flags().contains(Flag::HtmlBody));
        assert!(!parser.state().flags().contains(Flag::Body));

        parser.process(b"</body></html>");
        assert!(!parser.state().flags().contains(Flag::HtmlBody));
        assert!(!parser.state().flags().contains(Flag::Html));
    }

    #[test]
    fn test_flag_set() {
        let mut flags = FlagSet::default();
        flags.insert(Flag::Option);
        flags.insert(Flag::Value);
        assert!(flags.contains(Flag::Option) && flags.contains(Flag::Value));
        flags.remove(Flag::Option);
        assert!(!flags.contains(Flag::Option));
        assert!(flags.contains(Flag::Value));
    }
}
