//! [`Transport`] over `matrix-sdk`.
//!
//! Every `start` builds a fresh SDK client, restores the session on it, and
//! registers two event handlers: room messages feed the timeline stream and
//! stripped member events feed the membership stream. A background task
//! drives `sync_once`, reports progress on the timeline stream, and owns
//! both streams; when it stops, they close.

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use matrix_sdk::{
    authentication::matrix::MatrixSession,
    config::SyncSettings,
    ruma::{
        events::room::{
            member::StrippedRoomMemberEvent,
            message::{OriginalSyncRoomMessageEvent, RoomMessageEventContent},
        },
        OwnedDeviceId, OwnedRoomId, OwnedUserId,
    },
    Client, Room, SessionMeta, SessionTokens,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    EventStreams, MatrixError, Membership, MembershipChange, Session, SyncState, Transport,
    TransportEvent,
};
use crate::types::InboundEvent;

/// Buffer of the timeline stream.
const EVENT_BUFFER: usize = 256;

/// Buffer of the membership stream.
const MEMBERSHIP_BUFFER: usize = 32;

/// Device id used when a pre-issued token comes without one.
const DEFAULT_DEVICE_ID: &str = "MATRIXRELAY";

/// Initial backoff after a failed sync, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff after repeated sync failures, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Default long-poll timeout for incremental syncs, in milliseconds.
pub const DEFAULT_SYNC_POLL_TIMEOUT_MS: u64 = 30_000;

/// Matrix transport backed by `matrix_sdk::Client`.
pub struct MatrixClient {
    homeserver: Url,
    device_name: String,
    poll_timeout_ms: u64,
    active: RwLock<Option<Client>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("homeserver", &self.homeserver.as_str())
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Create a transport for `homeserver_url`. Nothing touches the network
    /// until [`Transport::login`] or [`Transport::start`].
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::InvalidUrl`] if the URL does not parse.
    pub fn new(homeserver_url: &str, device_name: &str) -> Result<Self, MatrixError> {
        let homeserver = Url::parse(homeserver_url)
            .map_err(|e| MatrixError::InvalidUrl(format!("{homeserver_url}: {e}")))?;
        if homeserver.cannot_be_a_base() {
            return Err(MatrixError::InvalidUrl(homeserver_url.to_owned()));
        }
        Ok(Self {
            homeserver,
            device_name: device_name.to_owned(),
            poll_timeout_ms: DEFAULT_SYNC_POLL_TIMEOUT_MS,
            active: RwLock::new(None),
            sync_task: Mutex::new(None),
        })
    }

    /// Override the long-poll timeout used once the initial sync is done.
    #[must_use]
    pub fn with_poll_timeout_ms(mut self, poll_timeout_ms: u64) -> Self {
        self.poll_timeout_ms = poll_timeout_ms;
        self
    }

    /// Homeserver base URL.
    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    async fn build_client(&self) -> Result<Client, MatrixError> {
        Ok(Client::builder()
            .homeserver_url(self.homeserver.as_str())
            .build()
            .await?)
    }

    fn active(&self) -> Result<Client, MatrixError> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MatrixError::NotLoggedIn)
    }

    fn room(&self, room_id: &str) -> Result<Room, MatrixError> {
        let id = parse_room_id(room_id)?;
        self.active()?
            .get_room(&id)
            .ok_or_else(|| MatrixError::UnknownRoom(room_id.to_owned()))
    }
}

fn parse_room_id(room_id: &str) -> Result<OwnedRoomId, MatrixError> {
    room_id
        .parse::<OwnedRoomId>()
        .map_err(|e| MatrixError::InvalidId(format!("{room_id}: {e}")))
}

fn sdk_session(session: &Session) -> Result<MatrixSession, MatrixError> {
    let user_id = session
        .user_id
        .parse::<OwnedUserId>()
        .map_err(|e| MatrixError::InvalidId(format!("{}: {e}", session.user_id)))?;
    let device_id = OwnedDeviceId::from(session.device_id.as_deref().unwrap_or(DEFAULT_DEVICE_ID));
    Ok(MatrixSession {
        meta: SessionMeta { user_id, device_id },
        tokens: SessionTokens {
            access_token: session.access_token.clone(),
            refresh_token: None,
        },
    })
}

/// Translate a room message into the network-agnostic inbound shape.
pub(crate) fn message_event(
    event: &OriginalSyncRoomMessageEvent,
    room_id: &str,
    room_name: Option<String>,
    sender_display_name: Option<String>,
    own_user_id: Option<&str>,
) -> InboundEvent {
    let sender_id = event.sender.to_string();
    let timestamp_millis = i64::try_from(u64::from(event.origin_server_ts.get()))
        .unwrap_or_else(|_| Utc::now().timestamp_millis());
    InboundEvent {
        id: event.event_id.to_string(),
        room_id: room_id.to_owned(),
        self_originated: own_user_id == Some(sender_id.as_str()),
        sender_id,
        sender_display_name,
        room_name,
        body: event.content.body().to_owned(),
        timestamp_millis,
    }
}

async fn timeline_event(
    event: &OriginalSyncRoomMessageEvent,
    room: &Room,
    own_user_id: Option<&str>,
) -> InboundEvent {
    let display_name = match room.get_member_no_sync(&event.sender).await {
        Ok(member) => member.and_then(|m| m.display_name().map(str::to_owned)),
        Err(e) => {
            debug!(error = %e, "member lookup failed");
            None
        }
    };
    let room_name = room
        .name()
        .or_else(|| room.canonical_alias().map(|alias| alias.to_string()));
    message_event(
        event,
        room.room_id().as_str(),
        room_name,
        display_name,
        own_user_id,
    )
}

/// Drive `sync_once` until the receiver goes away or the homeserver
/// returns an error retrying cannot fix.
///
/// The event handlers only hold weak senders, so both streams close when
/// this returns.
async fn run_sync(
    client: Client,
    tx: mpsc::Sender<TransportEvent>,
    _memberships: mpsc::Sender<MembershipChange>,
    poll_timeout_ms: u64,
) {
    let mut settings = SyncSettings::default();
    let mut prepared = false;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match client.sync_once(settings.clone()).await {
            Ok(response) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                settings = SyncSettings::default()
                    .token(response.next_batch)
                    .timeout(Duration::from_millis(poll_timeout_ms));
                if !prepared {
                    prepared = true;
                    info!("initial Matrix sync complete");
                    if tx
                        .send(TransportEvent::SyncState(SyncState::Prepared))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Err(e) => {
                let err = MatrixError::from(e);
                let state = SyncState::Error {
                    message: err.to_string(),
                    auth_rejected: err.is_auth_failure(),
                };
                if tx.send(TransportEvent::SyncState(state)).await.is_err() {
                    break;
                }
                if !err.is_recoverable() {
                    warn!(error = %err, "Matrix sync stopped");
                    break;
                }
                warn!(error = %err, backoff_ms, "Matrix sync failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }
    }
    debug!("Matrix sync loop exited");
}

#[async_trait]
impl Transport for MatrixClient {
    async fn login(&self, username: &str, password: &str) -> Result<Session, MatrixError> {
        let client = self.build_client().await?;
        let response = client
            .matrix_auth()
            .login_username(username, password)
            .initial_device_display_name(&self.device_name)
            .send()
            .await?;
        let session = Session {
            user_id: response.user_id.to_string(),
            access_token: response.access_token,
            device_id: Some(response.device_id.to_string()),
        };
        info!(user_id = %session.user_id, "logged in to homeserver");
        Ok(session)
    }

    async fn start(&self, session: Session) -> Result<EventStreams, MatrixError> {
        self.stop().await;

        let client = self.build_client().await?;
        client.restore_session(sdk_session(&session)?).await?;

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (member_tx, memberships) = mpsc::channel(MEMBERSHIP_BUFFER);

        let timeline_tx = event_tx.downgrade();
        client.add_event_handler(
            move |event: OriginalSyncRoomMessageEvent, room: Room, client: Client| {
                let tx = timeline_tx.clone();
                async move {
                    let Some(tx) = tx.upgrade() else { return };
                    let own = client.user_id().map(ToString::to_string);
                    let inbound = timeline_event(&event, &room, own.as_deref()).await;
                    if tx.send(TransportEvent::Timeline(inbound)).await.is_err() {
                        debug!("timeline stream closed");
                    }
                }
            },
        );
        let invite_tx = member_tx.downgrade();
        client.add_event_handler(move |event: StrippedRoomMemberEvent, room: Room| {
            let tx = invite_tx.clone();
            async move {
                let Some(tx) = tx.upgrade() else { return };
                let change = MembershipChange {
                    membership: Membership::parse(event.content.membership.as_str()),
                    user_id: event.state_key.to_string(),
                    room_id: room.room_id().to_string(),
                };
                if tx.send(change).await.is_err() {
                    debug!("membership stream closed");
                }
            }
        });

        let task = tokio::spawn(run_sync(
            client.clone(),
            event_tx,
            member_tx,
            self.poll_timeout_ms,
        ));
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
        *self.sync_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        debug!(user_id = %session.user_id, "Matrix sync started");
        Ok(EventStreams {
            events,
            memberships,
        })
    }

    async fn stop(&self) {
        let handle = self
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Matrix sync stopped");
        }
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn join_room(&self, room_id: &str) -> Result<(), MatrixError> {
        let id = parse_room_id(room_id)?;
        self.active()?.join_room_by_id(&id).await?;
        Ok(())
    }

    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), MatrixError> {
        let room = self.room(room_id)?;
        room.send(RoomMessageEventContent::text_plain(text)).await?;
        debug!(room_id, "message sent to Matrix");
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<(), MatrixError> {
        self.room(room_id)?.typing_notice(is_typing).await?;
        Ok(())
    }
}
