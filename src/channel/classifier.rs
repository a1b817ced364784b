//! Inbound event classification.
//!
//! Decides which raw network events reach the rest of the system:
//!
//! 1. events sent by our own account are dropped (network echo),
//! 2. events seen before the link is live are dropped (startup backfill),
//! 3. every surviving event reports conversation metadata,
//! 4. only registered conversations receive the full message, tagged with
//!    whether the body is one of the assistant's own replies.

use tracing::debug;

use super::state::ConnectionState;
use super::ChannelOpts;
use crate::types::{iso_timestamp, InboundEvent, NewMessage};

/// Separator between the assistant name and the reply body.
pub const BOT_PREFIX_DELIMITER: char = ':';

/// Outcome of classifying one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Sent by our own account; no callbacks.
    SelfOriginated,
    /// Arrived before initial sync completed; no callbacks.
    NotLive,
    /// Visible conversation that is not registered; metadata only.
    MetadataOnly {
        /// Conversation jid.
        chat_jid: String,
        /// ISO 8601 event time.
        timestamp: String,
        /// Room display name, if known.
        room_name: Option<String>,
    },
    /// Registered conversation; metadata plus full message.
    Deliverable {
        /// Conversation jid.
        chat_jid: String,
        /// Room display name, if known.
        room_name: Option<String>,
        /// Normalized message.
        message: NewMessage,
    },
}

/// Stateless classifier bound to our identity and assistant name.
#[derive(Debug, Clone)]
pub struct InboundClassifier {
    self_user_id: String,
    assistant_name: String,
}

impl InboundClassifier {
    /// Create a classifier for the given account and assistant name.
    pub fn new(self_user_id: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            assistant_name: assistant_name.into(),
        }
    }

    /// Whether `body` starts with `"<assistant name>:"`.
    pub fn is_bot_message(&self, body: &str) -> bool {
        body.strip_prefix(self.assistant_name.as_str())
            .is_some_and(|rest| rest.starts_with(BOT_PREFIX_DELIMITER))
    }

    /// Classify `event` for the jid `chat_jid`.
    ///
    /// `is_registered` is queried at most once, and only for events that
    /// survive the self and liveness checks.
    pub fn classify(
        &self,
        chat_jid: &str,
        event: &InboundEvent,
        state: ConnectionState,
        is_registered: impl FnOnce(&str) -> bool,
    ) -> Classification {
        if event.self_originated || event.sender_id == self.self_user_id {
            return Classification::SelfOriginated;
        }
        if state != ConnectionState::Connected {
            return Classification::NotLive;
        }

        let timestamp = iso_timestamp(event.timestamp_millis);
        if !is_registered(chat_jid) {
            return Classification::MetadataOnly {
                chat_jid: chat_jid.to_owned(),
                timestamp,
                room_name: event.room_name.clone(),
            };
        }

        let sender_name = event
            .sender_display_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| event.sender_id.clone());

        Classification::Deliverable {
            chat_jid: chat_jid.to_owned(),
            room_name: event.room_name.clone(),
            message: NewMessage {
                id: event.id.clone(),
                chat_jid: chat_jid.to_owned(),
                sender: event.sender_id.clone(),
                sender_name,
                content: event.body.clone(),
                timestamp,
                is_from_me: false,
                is_bot_message: self.is_bot_message(&event.body),
            },
        }
    }

    /// Classify `event` and fire the matching callbacks in `opts`.
    ///
    /// The registry is read fresh from `opts` for this event.
    pub fn dispatch(
        &self,
        chat_jid: &str,
        event: &InboundEvent,
        state: ConnectionState,
        opts: &ChannelOpts,
    ) -> Classification {
        let classification = self.classify(chat_jid, event, state, |jid| {
            (opts.registered_groups)().contains_key(jid)
        });

        match &classification {
            Classification::SelfOriginated => {
                debug!(event_id = %event.id, "dropping self-originated event");
            }
            Classification::NotLive => {
                debug!(event_id = %event.id, ?state, "dropping event received before sync");
            }
            Classification::MetadataOnly {
                chat_jid,
                timestamp,
                room_name,
            } => {
                (opts.on_chat_metadata)(chat_jid, timestamp, room_name.as_deref());
            }
            Classification::Deliverable {
                chat_jid,
                room_name,
                message,
            } => {
                (opts.on_chat_metadata)(chat_jid, &message.timestamp, room_name.as_deref());
                (opts.on_message)(chat_jid, message.clone());
            }
        }
        classification
    }
}
