//! Matrix adapter: a `matrix-sdk` backed transport and the channel
//! lifecycle that ties it to the queue and classifier.
//!
//! Conversations are addressed as `mx:<room id>` so the wider system can
//! route outbound sends by prefix.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::ChannelError;
use crate::types::InboundEvent;

pub mod channel;
pub mod client;

pub use channel::MatrixChannel;
pub use client::MatrixClient;

/// Destination-id prefix owned by this adapter.
pub const JID_PREFIX: &str = "mx:";

/// Whether `jid` belongs to the Matrix namespace.
pub fn owns_jid(jid: &str) -> bool {
    jid.starts_with(JID_PREFIX)
}

/// Build the jid for a room id.
pub fn jid_for_room(room_id: &str) -> String {
    format!("{JID_PREFIX}{room_id}")
}

/// Strip the namespace prefix from a jid. Unprefixed input is returned as-is.
pub fn room_id_from_jid(jid: &str) -> &str {
    jid.strip_prefix(JID_PREFIX).unwrap_or(jid)
}

/// Errors from the Matrix transport.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// The SDK reported a failure (HTTP, homeserver or store).
    #[error("Matrix client error: {0}")]
    Sdk(#[from] matrix_sdk::Error),

    /// The SDK client could not be built.
    #[error("failed to build Matrix client: {0}")]
    Build(#[from] matrix_sdk::ClientBuildError),

    /// The homeserver URL does not parse.
    #[error("invalid homeserver URL: {0}")]
    InvalidUrl(String),

    /// A user or room id is malformed.
    #[error("invalid Matrix identifier: {0}")]
    InvalidId(String),

    /// The room is not known to the current session.
    #[error("unknown room: {0}")]
    UnknownRoom(String),

    /// A room operation was attempted before the event stream started.
    #[error("no active session")]
    NotLoggedIn,
}

impl MatrixError {
    /// HTTP status of a homeserver error response, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Sdk(err) => err
                .as_client_api_error()
                .map(|api| api.status_code.as_u16()),
            _ => None,
        }
    }

    /// Whether the homeserver rejected our credentials or token.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Sdk(matrix_sdk::Error::AuthenticationRequired))
            || matches!(self.status(), Some(401 | 403))
    }

    /// Whether retrying the same request later can succeed: network
    /// failures, rate limiting and server-side errors.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Sdk(matrix_sdk::Error::Http(_)) => match self.status() {
                Some(status) => status == 429 || status >= 500,
                None => true,
            },
            _ => false,
        }
    }
}

impl From<MatrixError> for ChannelError {
    fn from(err: MatrixError) -> Self {
        if err.is_auth_failure() {
            return ChannelError::Auth(err.to_string());
        }
        match err {
            MatrixError::InvalidUrl(_) | MatrixError::Build(_) => {
                ChannelError::Config(err.to_string())
            }
            other => ChannelError::Transport(other.to_string()),
        }
    }
}

/// Credentials resolved from configuration.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Pre-issued access token and the user id it belongs to.
    AccessToken {
        /// Access token.
        token: String,
        /// Owning user id, e.g. `@bot:example.org`.
        user_id: String,
    },
    /// Interactive username/password login.
    Password {
        /// Localpart or full user id.
        username: String,
        /// Account password.
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken { user_id, .. } => f
                .debug_struct("AccessToken")
                .field("token", &"[REDACTED]")
                .field("user_id", user_id)
                .finish(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// A durable authenticated session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Fully-qualified user id, e.g. `@bot:example.org`.
    pub user_id: String,
    /// Access token for subsequent requests.
    pub access_token: String,
    /// Device id assigned at login, if any.
    pub device_id: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Room membership carried by a member event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Invited to the room.
    Invite,
    /// Joined the room.
    Join,
    /// Left or was kicked.
    Leave,
    /// Banned from the room.
    Ban,
    /// Any other membership value.
    Other(String),
}

impl Membership {
    /// Parse a Matrix `membership` value.
    pub fn parse(value: &str) -> Self {
        match value {
            "invite" => Self::Invite,
            "join" => Self::Join,
            "leave" => Self::Leave,
            "ban" => Self::Ban,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A membership change for some user in some room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// New membership.
    pub membership: Membership,
    /// Affected user id.
    pub user_id: String,
    /// Room id.
    pub room_id: String,
}

/// Sync progress signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// The first sync response has been fully delivered.
    Prepared,
    /// A sync request failed.
    ///
    /// When `auth_rejected` is set the homeserver refused our token and the
    /// stream ends after this signal; otherwise the loop retries.
    Error {
        /// Rendered error.
        message: String,
        /// The homeserver answered 401/403.
        auth_rejected: bool,
    },
}

/// Events produced by the timeline stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived in a room timeline.
    Timeline(InboundEvent),
    /// Sync progress.
    SyncState(SyncState),
}

/// Receivers handed back by [`Transport::start`].
///
/// Timeline and membership traffic arrive on separate subscriptions so a
/// slow consumer of one never holds up the other.
#[derive(Debug)]
pub struct EventStreams {
    /// Timeline events and sync progress, in sync order.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Membership changes, including invites for our own user.
    pub memberships: mpsc::Receiver<MembershipChange>,
}

/// The network client the channel delegates protocol work to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchange a username/password for a session.
    async fn login(&self, username: &str, password: &str) -> Result<Session, MatrixError>;

    /// Bind `session` and start the event streams.
    async fn start(&self, session: Session) -> Result<EventStreams, MatrixError>;

    /// Stop the event streams. Idempotent.
    async fn stop(&self);

    /// Join a room by id.
    async fn join_room(&self, room_id: &str) -> Result<(), MatrixError>;

    /// Send a plain-text message to a room.
    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), MatrixError>;

    /// Set or clear our typing indicator in a room.
    async fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<(), MatrixError>;
}
