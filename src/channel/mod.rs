//! Network-agnostic channel core: connection state, outbound delivery queue,
//! and inbound event classification.
//!
//! A concrete network adapter (see [`crate::matrix`]) owns one instance of
//! each piece and drives them from its lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{NewMessage, RegisteredGroup};

pub mod classifier;
pub mod queue;
pub mod state;

pub use classifier::{Classification, InboundClassifier};
pub use queue::{Deliver, DeliveryQueue, QueuedMessage};
pub use state::{ConnectionState, ConnectionTracker};

/// Errors that cross the channel boundary.
///
/// Only configuration and authentication/sync failures are surfaced; send,
/// join and typing failures are absorbed and logged.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Required configuration is missing or invalid. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The network rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Initial sync did not complete within the allowed window.
    #[error("initial sync timed out after {0} seconds")]
    SyncTimeout(u64),

    /// Initial sync failed or the event stream closed before it completed.
    #[error("initial sync failed: {0}")]
    Sync(String),

    /// A single transport operation failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result of a send request. Both variants are successful outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The network accepted the message.
    Sent,
    /// The message is waiting in the outbound queue.
    Queued,
}

/// Called with `(chat_jid, message)` for each deliverable message.
pub type OnInboundMessage = Arc<dyn Fn(&str, NewMessage) + Send + Sync>;

/// Called with `(chat_jid, iso_timestamp, room_name)` for every visible conversation.
pub type OnChatMetadata = Arc<dyn Fn(&str, &str, Option<&str>) + Send + Sync>;

/// Returns the current registered-group registry, keyed by chat jid.
pub type RegisteredGroups = Arc<dyn Fn() -> HashMap<String, RegisteredGroup> + Send + Sync>;

/// Hooks into the rest of the system, injected at construction.
#[derive(Clone)]
pub struct ChannelOpts {
    /// Full-message callback.
    pub on_message: OnInboundMessage,
    /// Conversation discovery callback.
    pub on_chat_metadata: OnChatMetadata,
    /// Live registry query. Called on every classification, never cached.
    pub registered_groups: RegisteredGroups,
}

impl std::fmt::Debug for ChannelOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOpts").finish_non_exhaustive()
    }
}

/// A messaging network attached to the bridge.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short channel name used in logs (e.g. "matrix").
    fn name(&self) -> &str;

    /// Authenticate, start the event stream and wait for initial sync.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Send a text message, queuing it when the link is not ready.
    async fn send_message(&self, jid: &str, text: &str) -> SendOutcome;

    /// Whether live traffic can flow right now.
    fn is_connected(&self) -> bool;

    /// Whether the destination id belongs to this channel's namespace.
    fn owns_jid(&self, jid: &str) -> bool;

    /// Stop the event stream. Safe to call repeatedly and at any point.
    async fn disconnect(&self);

    /// Best-effort typing indicator. Never fails and never queues.
    async fn set_typing(&self, _jid: &str, _is_typing: bool) {}
}
