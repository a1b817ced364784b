//! Network-agnostic message shapes shared by the channel core and adapters.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A normalized inbound message handed to the rest of the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Network-assigned event identifier.
    pub id: String,
    /// Destination id of the conversation (e.g. `mx:!room:server`).
    pub chat_jid: String,
    /// Sender's network identity.
    pub sender: String,
    /// Human-readable sender name, falling back to the sender id.
    pub sender_name: String,
    /// Message body. May be empty.
    pub content: String,
    /// ISO 8601 timestamp with millisecond precision.
    pub timestamp: String,
    /// Whether the network reported this as sent by our own account.
    pub is_from_me: bool,
    /// Whether the body carries the assistant's reply prefix.
    pub is_bot_message: bool,
}

/// Per-conversation settings owned by the wider system.
///
/// The channel only checks whether a conversation is in the registry and
/// never mutates these fields. They are loaded from the `[groups]` config
/// table and listed by `matrix-relay check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Display name of the group.
    pub name: String,
    /// Working folder assigned to the group.
    pub folder: String,
    /// Trigger phrase that addresses the assistant, if any.
    #[serde(default)]
    pub trigger: Option<String>,
    /// Whether messages must contain the trigger to be acted on.
    #[serde(default = "default_requires_trigger")]
    pub requires_trigger: bool,
}

fn default_requires_trigger() -> bool {
    true
}

/// A raw inbound message event as produced by a network transport.
///
/// Ephemeral: classified, optionally forwarded, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Network event id.
    pub id: String,
    /// Room or channel the event belongs to (transport-native id, no prefix).
    pub room_id: String,
    /// Sender id. Empty when the network omitted it.
    pub sender_id: String,
    /// Sender display name, if the transport could resolve one.
    pub sender_display_name: Option<String>,
    /// Room display name, if known.
    pub room_name: Option<String>,
    /// Message body.
    pub body: String,
    /// Origin server timestamp in milliseconds since the Unix epoch.
    pub timestamp_millis: i64,
    /// Whether the transport flagged the event as sent by our own account.
    pub self_originated: bool,
}

/// Format a millisecond Unix timestamp as ISO 8601 (`2024-01-01T00:00:00.000Z`).
///
/// Out-of-range values fall back to the current time.
pub fn iso_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
