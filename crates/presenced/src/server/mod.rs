//! TCP server and live-session registry.
//!
//! The server:
//! - Listens on a TCP port for peer connections
//! - Spawns a [`Session`] for each accepted connection
//! - Keeps the set of live sessions and relays broadcasts between them
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ PresenceServer  │
//! │                 │
//! │  TcpListener    │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  broadcast   ┌─────────────────┐
//! │     Session     │─────────────▶│    Registry     │
//! │ (per connection)│◀─────────────│ id -> handle    │
//! └─────────────────┘    outbox    └─────────────────┘
//! ```
//!
//! The registry lock is held only to copy or edit the session map, never
//! across I/O: broadcasts snapshot the recipients, release the lock and then
//! queue one copy per recipient on that session's outbox.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

pub mod connection;

pub use connection::{
    read_peer, ConnectionError, ConnectionId, PeerInfo, Session, SessionHandle, SessionHooks,
    SessionSettings, SharedPeerInfo,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use presence_core::{escape_text, Message};

use crate::commands::{Command, CommandTable, Reply};
use crate::config::Config;

/// Pending connection backlog
const LISTEN_BACKLOG: u32 = 1024;

// ============================================================================
// Registry
// ============================================================================

/// Live sessions keyed by connection id.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<ConnectionId, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: ConnectionId, handle: SessionHandle) {
        self.lock().insert(id, handle);
    }

    /// Removes a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<(ConnectionId, SessionHandle)> {
        self.lock()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// Names of the peers whose stream is open, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter_map(|(_, handle)| read_peer(&handle.peer).other)
            .collect();
        peers.sort();
        peers
    }

    /// Queues a sender-prefixed copy of `message` for every other session.
    ///
    /// Returns the number of sessions the copy was queued for.
    pub fn broadcast_from(&self, from: ConnectionId, message: &Message) -> usize {
        let mut original = message.clone();
        original.synchronize();
        let sender = original.other.clone();
        let markup = format!("<b>{}:</b> {}", escape_text(&sender), original.markup);
        let plain = format!("{}: {}", sender, original.plain);

        let mut delivered = 0;
        for (id, handle) in self.snapshot() {
            if id == from {
                continue;
            }
            let peer = read_peer(&handle.peer);
            let Some(other) = peer.other else {
                debug!(connection = id, "Skipping broadcast to session without open stream");
                continue;
            };
            let copy = Message {
                identity: peer.identity,
                other,
                plain: plain.clone(),
                markup: markup.clone(),
            };
            match handle.outbox.send(copy) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(connection = id, peer_addr = %handle.addr, "Broadcast recipient is gone"),
            }
        }
        debug!(connection = from, recipients = delivered, "Broadcast message");
        delivered
    }

    /// Cancels every live session and returns how many were asked to stop.
    fn cancel_all(&self) -> usize {
        let sessions = self.snapshot();
        for (_, handle) in &sessions {
            handle.cancel.cancel();
        }
        sessions.len()
    }
}

impl SessionHooks for Registry {
    fn on_stopped(&self, id: ConnectionId) {
        if self.remove(id) {
            debug!(connection = id, "Removed stopped session");
        }
    }

    fn broadcast(&self, from: ConnectionId, message: &Message) {
        self.broadcast_from(from, message);
    }
}

/// `users` command listing the peers connected to `registry`.
fn users_command(registry: Weak<Registry>) -> Command {
    Command::new("users", "print list of connected users", false, move |_, _| {
        let peers = registry
            .upgrade()
            .map(|registry| registry.peers())
            .unwrap_or_default();
        let names: Vec<String> = peers.iter().map(|p| escape_text(p).into_owned()).collect();
        Reply::Markup(format!("<b>users:</b><br/>{}", names.join("<br/>")))
    })
}

// ============================================================================
// Server
// ============================================================================

/// TCP server accepting peer connections.
pub struct PresenceServer {
    bind_address: String,
    port: u16,

    /// Settings handed to every session
    settings: SessionSettings,

    /// Commands supplied by the embedding program
    extra_commands: CommandTable,

    registry: Arc<Registry>,
    listener: Mutex<Option<Arc<TcpListener>>>,

    /// Cancellation token for graceful shutdown, a child of the caller's
    cancel_token: CancellationToken,

    /// Held by `accept_loop` for as long as it runs
    accepting: tokio::sync::Mutex<()>,

    tracker: TaskTracker,

    /// Connection counter for generating connection ids
    connection_counter: AtomicU64,
}

impl PresenceServer {
    /// Creates a server from the daemon configuration.
    pub fn new(config: &Config, cancel_token: CancellationToken) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            settings: SessionSettings::from_config(config),
            extra_commands: CommandTable::new(),
            registry: Arc::new(Registry::new()),
            listener: Mutex::new(None),
            cancel_token: cancel_token.child_token(),
            accepting: tokio::sync::Mutex::new(()),
            tracker: TaskTracker::new(),
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Adds commands offered on every connection. Built-in and registry
    /// commands of the same name take precedence.
    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.extra_commands.merge(&commands);
        self
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_listener()
            .and_then(|listener| listener.local_addr().ok())
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Binds the listening socket with address reuse enabled.
    ///
    /// Calling it again while listening is a no-op returning the bound
    /// address.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr() {
            debug!(address = %addr, "Already listening");
            return Ok(addr);
        }

        let address = format!("{}:{}", self.bind_address, self.port);
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            address: address.clone(),
            error: e.to_string(),
        };

        let addr = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(setup_error)?
            .next()
            .ok_or_else(|| ServerError::SocketSetup {
                address: address.clone(),
                error: "address does not resolve".to_string(),
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(setup_error)?;
        socket.set_reuseaddr(true).map_err(setup_error)?;
        socket.bind(addr).map_err(setup_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(setup_error)?;
        let local = listener.local_addr().map_err(setup_error)?;

        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            // Lost a race with a concurrent listen(); keep the first socket.
            Some(existing) => existing.local_addr().map_err(setup_error),
            None => {
                *slot = Some(Arc::new(listener));
                info!(address = %local, "Presence server listening");
                Ok(local)
            }
        }
    }

    /// Listens, accepts connections until cancelled, then shuts down.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.listen().await?;
        self.accept_loop().await;
        self.shutdown().await;
        Ok(())
    }

    /// Accepts connections until the cancellation token is triggered.
    ///
    /// Accept failures are logged and do not stop the loop. The loop's
    /// handle on the listener is released when it returns.
    pub async fn accept_loop(&self) {
        let _accepting = self.accepting.lock().await;
        let Some(listener) = self.current_listener() else {
            error!("Accept loop started without a listener");
            return;
        };

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// Registers and spawns a session for an accepted connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, peer_addr = %addr, "Accepted connection");

        let mut commands = CommandTable::builtin();
        let mut registry_commands = CommandTable::new();
        registry_commands.insert(users_command(Arc::downgrade(&self.registry)));
        commands.merge(&registry_commands);
        commands.merge(&self.extra_commands);

        let hooks: Arc<dyn SessionHooks> = Arc::clone(&self.registry) as Arc<dyn SessionHooks>;
        let (session, handle) = Session::new(
            stream,
            id,
            addr,
            self.settings.clone(),
            commands,
            hooks,
            self.cancel_token.child_token(),
        );

        self.registry.insert(id, handle);
        self.tracker.spawn(session.run());
    }

    /// Stops accepting, stops every live session, waits for them to finish
    /// and closes the listening socket.
    ///
    /// Safe to call while `accept_loop` runs on another task: the loop is
    /// cancelled and has returned before the live sessions are snapshotted,
    /// so no session can be admitted after the snapshot.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        drop(self.accepting.lock().await);

        let stopping = self.registry.cancel_all();
        debug!(sessions = stopping, "Stopping sessions");

        self.tracker.close();
        self.tracker.wait().await;

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(listener);

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to set up listener on {address}: {error}")]
    SocketSetup { address: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(identity: &str, other: Option<&str>) -> (SessionHandle, mpsc::UnboundedReceiver<Message>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let peer = Arc::new(std::sync::RwLock::new(PeerInfo {
            identity: identity.to_string(),
            other: other.map(str::to_string),
        }));
        let handle = SessionHandle {
            outbox,
            cancel: CancellationToken::new(),
            peer,
            addr: "127.0.0.1:5298".parse().unwrap(),
        };
        (handle, inbox)
    }

    #[test]
    fn test_broadcast_skips_sender_and_survives_dead_recipient() {
        let registry = Registry::new();
        let (a, mut a_rx) = handle("me", Some("alice"));
        let (b, b_rx) = handle("me", Some("bob"));
        let (c, mut c_rx) = handle("me", Some("carol"));
        registry.insert(1, a);
        registry.insert(2, b);
        registry.insert(3, c);
        drop(b_rx);

        let message = Message::from_plain("me", "alice", "hi <all>");
        let delivered = registry.broadcast_from(1, &message);
        assert_eq!(delivered, 1);

        assert!(a_rx.try_recv().is_err());
        let copy = c_rx.try_recv().unwrap();
        assert_eq!(copy.identity, "me");
        assert_eq!(copy.other, "carol");
        assert_eq!(copy.plain, "alice: hi <all>");
        assert_eq!(copy.markup, "<b>alice:</b> hi &lt;all&gt;");
    }

    #[test]
    fn test_broadcast_skips_sessions_without_stream() {
        let registry = Registry::new();
        let (a, _a_rx) = handle("me", Some("alice"));
        let (b, mut b_rx) = handle("me", None);
        registry.insert(1, a);
        registry.insert(2, b);

        let message = Message::from_plain("me", "alice", "anyone?");
        assert_eq!(registry.broadcast_from(1, &message), 0);
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_on_stopped_is_idempotent() {
        let registry = Registry::new();
        let (a, _a_rx) = handle("me", Some("alice"));
        registry.insert(1, a);

        registry.on_stopped(1);
        registry.on_stopped(1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_users_command_lists_open_peers() {
        let registry = Arc::new(Registry::new());
        let (a, _a_rx) = handle("me", Some("bob"));
        let (b, _b_rx) = handle("me", Some("alice"));
        let (c, _c_rx) = handle("me", None);
        registry.insert(1, a);
        registry.insert(2, b);
        registry.insert(3, c);

        let command = users_command(Arc::downgrade(&registry));
        let table = CommandTable::new();
        let ctx = crate::commands::CommandContext {
            identity: "me",
            other: "alice",
            download_dir: None,
            commands: &table,
        };
        let reply = command.run(&ctx, &Message::from_plain("me", "alice", "users"));
        assert_eq!(
            reply,
            Reply::Markup("<b>users:</b><br/>alice<br/>bob".to_string())
        );
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            address: "0.0.0.0:5298".to_string(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:5298"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let config = Config {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let server = PresenceServer::new(&config, CancellationToken::new());
        let first = server.listen().await.unwrap();
        let second = server.listen().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);
    }
}
