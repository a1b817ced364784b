//! Connection state: the single source of truth for "can we send now".

use tokio::sync::watch;
use tracing::info;

/// Lifecycle position of a channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live link. Sends are queued.
    #[default]
    Disconnected,
    /// Credentials are being verified.
    Authenticating,
    /// Credentials accepted; waiting for the first sync to finish.
    SyncingInitial,
    /// Initial sync complete; live traffic may flow.
    Connected,
}

/// Shared connection state, written by the lifecycle and read by everything else.
///
/// Backed by a [`watch`] channel so observers (the queue flusher) can react
/// to transitions without polling.
#[derive(Debug)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    /// Create a tracker in [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Whether the state is [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Enter [`ConnectionState::Authenticating`].
    pub fn mark_connecting(&self) {
        self.set(ConnectionState::Authenticating);
    }

    /// Enter [`ConnectionState::SyncingInitial`].
    pub fn mark_syncing(&self) {
        self.set(ConnectionState::SyncingInitial);
    }

    /// Enter [`ConnectionState::Connected`].
    ///
    /// Subscribers are notified; the delivery queue's flusher drains any
    /// backlog asynchronously in response.
    pub fn mark_connected(&self) {
        self.set(ConnectionState::Connected);
    }

    /// Enter [`ConnectionState::Disconnected`]. Later sends queue.
    pub fn mark_disconnected(&self) {
        self.set(ConnectionState::Disconnected);
    }

    fn set(&self, next: ConnectionState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "connection state changed");
        }
    }
}
