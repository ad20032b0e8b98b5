//! Per-connection session.
//!
//! Each accepted connection gets its own `Session` that:
//! - Feeds received bytes through a [`StanzaParser`]
//! - Dispatches the resulting events strictly in order
//! - Answers commands, feature negotiations and transfer offers
//! - Writes messages relayed from other sessions via its outbox
//!
//! The socket is owned by the session task alone. Other tasks reach it only
//! through the [`SessionHandle`] returned at construction: an outbox for
//! relayed messages and a cancellation token.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use presence_core::namespace;
use presence_core::{FeatureNeg, Message, Stream, Transfer};
use presence_protocol::compose;
use presence_protocol::{StanzaEvent, StanzaParser};

use crate::commands::{welcome_text, CommandContext, CommandTable, Dispatch};
use crate::config::Config;
use crate::transfer::{self, TransferSettings};

/// Socket read size
const READ_BUFFER_SIZE: usize = 4096;

/// Identifier of one accepted connection.
pub type ConnectionId = u64;

/// Callbacks from a session into whatever owns it.
pub trait SessionHooks: Send + Sync {
    /// Called exactly once, after the session has closed its socket.
    fn on_stopped(&self, id: ConnectionId);

    /// Relays a message that named no command to the other sessions.
    fn broadcast(&self, from: ConnectionId, message: &Message);
}

/// Endpoint names of a session, readable from other tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Local name used on this connection
    pub identity: String,

    /// Remote name, known once the stream is open
    pub other: Option<String>,
}

/// Shared view of a session's [`PeerInfo`].
pub type SharedPeerInfo = Arc<RwLock<PeerInfo>>;

/// Reads a peer info snapshot, recovering from a poisoned lock.
pub fn read_peer(info: &SharedPeerInfo) -> PeerInfo {
    info.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Per-session settings taken from the daemon configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub identity: String,
    pub download_dir: Option<PathBuf>,
    pub write_timeout: Duration,
    pub greet_on_open: bool,
    pub transfer: TransferSettings,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.identity.clone(),
            download_dir: config.download_dir.clone(),
            write_timeout: config.write_timeout(),
            greet_on_open: config.greet_on_open,
            transfer: TransferSettings::from_config(config),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the registry keeps of a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Messages to be written by the session
    pub outbox: mpsc::UnboundedSender<Message>,

    /// Stops the session
    pub cancel: CancellationToken,

    pub peer: SharedPeerInfo,

    /// Remote socket address
    pub addr: SocketAddr,
}

/// One connection's read-parse-dispatch loop.
pub struct Session<S> {
    id: ConnectionId,
    addr: SocketAddr,
    reader: ReadHalf<S>,
    writer: BufWriter<WriteHalf<S>>,
    parser: StanzaParser,
    settings: SessionSettings,
    commands: CommandTable,

    /// Peer name, adopted from the first stream open
    other: Option<String>,

    /// A stream header has been sent and no close tag yet
    stream_open: bool,

    /// The peer closed its stream
    closed: bool,

    peer: SharedPeerInfo,
    inbox: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    hooks: Arc<dyn SessionHooks>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Creates a session for an accepted socket.
    ///
    /// # Arguments
    ///
    /// * `stream` - The connected socket
    /// * `id` - Unique number for this connection
    /// * `addr` - Remote socket address
    /// * `settings` - Identity, download directory and timeouts
    /// * `commands` - Merged command table
    /// * `hooks` - Cleanup and broadcast callbacks
    /// * `cancel` - Token that stops the session
    pub fn new(
        stream: S,
        id: ConnectionId,
        addr: SocketAddr,
        settings: SessionSettings,
        commands: CommandTable,
        hooks: Arc<dyn SessionHooks>,
        cancel: CancellationToken,
    ) -> (Self, SessionHandle) {
        let (reader, writer) = tokio::io::split(stream);
        let (outbox, inbox) = mpsc::unbounded_channel();
        let peer = Arc::new(RwLock::new(PeerInfo {
            identity: settings.identity.clone(),
            other: None,
        }));

        let handle = SessionHandle {
            outbox,
            cancel: cancel.clone(),
            peer: Arc::clone(&peer),
            addr,
        };
        let session = Self {
            id,
            addr,
            reader,
            writer: BufWriter::new(writer),
            parser: StanzaParser::new(),
            settings,
            commands,
            other: None,
            stream_open: false,
            closed: false,
            peer,
            inbox,
            cancel,
            hooks,
        };
        (session, handle)
    }

    /// Runs the session until the peer disconnects, closes its stream, or
    /// the session is cancelled. Cleanup always runs before returning.
    pub async fn run(mut self) {
        info!(connection = self.id, peer_addr = %self.addr, "Client connected");

        if let Err(e) = self.process().await {
            debug!(connection = self.id, error = %e, "Connection closed");
        }

        self.finish().await;
    }

    async fn process(&mut self) -> Result<(), ConnectionError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(connection = self.id, "Session stop requested");
                    return Ok(());
                }

                Some(message) = self.inbox.recv() => {
                    self.send_message(message).await?;
                }

                result = self.reader.read(&mut buf) => {
                    let n = result.map_err(|e| ConnectionError::Io(e.to_string()))?;
                    if n == 0 {
                        debug!(connection = self.id, "Client sent EOF");
                        return Ok(());
                    }
                    let chunk = buf.get(..n).unwrap_or_default();
                    trace!(connection = self.id, data = %String::from_utf8_lossy(chunk), "READ");
                    self.parser.process(chunk);
                    self.dispatch_events().await?;
                    if self.closed {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatches queued parser events in order.
    async fn dispatch_events(&mut self) -> Result<(), ConnectionError> {
        while let Some(event) = self.parser.next() {
            debug!(connection = self.id, event = event.kind(), "Dispatching event");
            match event {
                StanzaEvent::StreamOpen(stream) => self.handle_stream_open(stream).await?,
                StanzaEvent::StreamClose => {
                    self.close_stream().await?;
                    self.closed = true;
                    return Ok(());
                }
                StanzaEvent::ChatMessage(message) => self.handle_chat_message(message).await?,
                StanzaEvent::FileTransfer(transfer) => self.handle_transfer(transfer).await?,
                StanzaEvent::FeatureNegotiation(fneg) => {
                    self.handle_feature_negotiation(fneg).await?
                }
            }
        }
        Ok(())
    }

    async fn handle_stream_open(&mut self, stream: Stream) -> Result<(), ConnectionError> {
        if self.stream_open {
            error!(connection = self.id, "Stream already open, ignoring stream open");
            return Ok(());
        }

        if !stream.identity.is_empty() && stream.identity != self.settings.identity {
            error!(
                connection = self.id,
                expected = %self.settings.identity,
                received = %stream.identity,
                "Identity mismatch"
            );
        }
        match &self.other {
            Some(other) if *other != stream.other => {
                error!(
                    connection = self.id,
                    expected = %other,
                    received = %stream.other,
                    "Peer mismatch"
                );
            }
            Some(_) => {}
            None => self.other = Some(stream.other.clone()),
        }
        {
            let mut peer = self.peer.write().unwrap_or_else(PoisonError::into_inner);
            peer.other = self.other.clone();
        }

        let header = compose::stream_open(&self.settings.identity, self.peer_name());
        self.write_line(&header).await?;
        self.stream_open = true;
        info!(connection = self.id, peer = %self.peer_name(), "Stream opened");

        if self.settings.greet_on_open {
            let banner = welcome_text(&self.settings.identity, &self.commands);
            let message = Message::from_markup(&self.settings.identity, self.peer_name(), banner);
            self.send_message(message).await?;
        }
        Ok(())
    }

    async fn handle_chat_message(&mut self, mut message: Message) -> Result<(), ConnectionError> {
        message.synchronize();
        if message.is_empty() {
            debug!(connection = self.id, "Dropping empty message");
            return Ok(());
        }

        let reply = {
            let ctx = CommandContext {
                identity: &self.settings.identity,
                other: self.peer_name(),
                download_dir: self.settings.download_dir.as_deref(),
                commands: &self.commands,
            };
            match self.commands.resolve(&message) {
                Dispatch::Run(command) => {
                    debug!(connection = self.id, command = %command.name, "Running command");
                    Some(command.run(&ctx, &message))
                }
                Dispatch::Ignored(command) => {
                    debug!(
                        connection = self.id,
                        command = %command.name,
                        "Command does not take arguments, ignoring message"
                    );
                    None
                }
                Dispatch::Broadcast => {
                    self.hooks.broadcast(self.id, &message);
                    None
                }
            }
        };

        // Replies go back to the sender: the received `to` becomes our `from`.
        if let Some(reply) = reply.and_then(|r| r.into_message(&message.identity, &message.other)) {
            self.send_message(reply).await?;
        }
        Ok(())
    }

    async fn handle_transfer(&mut self, transfer: Transfer) -> Result<(), ConnectionError> {
        let Some(download_dir) = self.settings.download_dir.clone() else {
            info!(connection = self.id, kind = %transfer.kind(), "Downloads disabled, rejecting transfer");
            return self.reject_transfer(&transfer).await;
        };
        if let Err(e) = transfer.validate() {
            warn!(connection = self.id, error = %e, "Rejecting transfer");
            return self.reject_transfer(&transfer).await;
        }

        let result = tokio::select! {
            result = transfer::retrieve(&transfer, &download_dir, &self.settings.transfer) => result,
            _ = self.cancel.cancelled() => {
                debug!(connection = self.id, "Transfer abandoned on stop");
                return Ok(());
            }
        };
        let success = match result {
            Ok(retrieved) => {
                info!(
                    connection = self.id,
                    path = %retrieved.path.display(),
                    bytes = retrieved.bytes,
                    "File received"
                );
                true
            }
            Err(e) => {
                warn!(connection = self.id, kind = %transfer.kind(), error = %e, "File transfer failed");
                false
            }
        };

        if let Some(reply) = compose::completion(&transfer, success) {
            self.write_line(&reply).await?;
        }
        Ok(())
    }

    async fn reject_transfer(&mut self, transfer: &Transfer) -> Result<(), ConnectionError> {
        match compose::rejection(transfer) {
            Some(reply) => self.write_line(&reply).await,
            None => {
                debug!(connection = self.id, "Transfer offer has no request to reject");
                Ok(())
            }
        }
    }

    async fn handle_feature_negotiation(&mut self, fneg: FeatureNeg) -> Result<(), ConnectionError> {
        for value in fneg.offered.iter().filter(|v| *v != namespace::BYTESTREAMS) {
            warn!(connection = self.id, value = %value, "Unhandled option value");
        }
        if fneg.offers_bytestreams() {
            let reply = compose::si_result(&self.settings.identity, self.peer_name(), &fneg.request_id);
            self.write_line(&reply).await?;
        }
        Ok(())
    }

    /// Writes a chat message after deriving any missing rendering.
    async fn send_message(&mut self, mut message: Message) -> Result<(), ConnectionError> {
        message.synchronize();
        if message.identity != self.settings.identity {
            warn!(
                connection = self.id,
                expected = %self.settings.identity,
                actual = %message.identity,
                "Outgoing message identity differs from session identity"
            );
        }
        if let Some(other) = &self.other {
            if message.other != *other {
                warn!(
                    connection = self.id,
                    expected = %other,
                    actual = %message.other,
                    "Outgoing message peer differs from session peer"
                );
            }
        }
        self.write_line(&compose::chat_message(&message)).await
    }

    async fn close_stream(&mut self) -> Result<(), ConnectionError> {
        if !self.stream_open {
            return Ok(());
        }
        self.stream_open = false;
        self.write_line(compose::STREAM_CLOSE).await
    }

    /// Writes one stanza followed by a newline.
    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        trace!(connection = self.id, data = %line, "WRITE");
        let writer = &mut self.writer;
        match timeout(self.settings.write_timeout, async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Closes the stream if open, shuts the socket down and notifies the owner.
    async fn finish(mut self) {
        if let Err(e) = self.close_stream().await {
            debug!(connection = self.id, error = %e, "Failed to close stream");
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!(connection = self.id, error = %e, "Failed to shut down socket");
        }
        self.hooks.on_stopped(self.id);
        info!(connection = self.id, peer_addr = %self.addr, "Client disconnected");
    }

    /// Peer name used when addressing this connection.
    fn peer_name(&self) -> &str {
        self.other.as_deref().unwrap_or_default()
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,
}
