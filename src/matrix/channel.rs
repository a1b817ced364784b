//! Matrix channel lifecycle.
//!
//! `connect` walks `Authenticating -> SyncingInitial -> Connected`: resolve
//! credentials, log in (or reuse a token), start the sync stream, and wait
//! for the first sync within a fixed window. Once connected the delivery
//! queue drains in the background.
//!
//! Two workers run per connection. The dispatcher consumes the timeline
//! stream and feeds the classifier. The invite handler consumes the
//! membership stream on its own and auto-joins rooms we are invited to; its
//! failures never touch message delivery.
//!
//! A homeserver rejection of our token, during or after the initial sync,
//! drops the cached session so the next `connect` authenticates afresh.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    jid_for_room, owns_jid, room_id_from_jid, Credentials, Membership, MembershipChange, Session,
    SyncState, Transport, TransportEvent,
};
use crate::channel::{
    Channel, ChannelError, ChannelOpts, ConnectionState, ConnectionTracker, Deliver,
    DeliveryQueue, InboundClassifier, SendOutcome,
};
use crate::config::MatrixConfig;

/// Sends queued messages through the transport, translating jids to room ids.
struct RoomDelivery {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl Deliver for RoomDelivery {
    async fn deliver(&self, destination_id: &str, text: &str) -> Result<(), ChannelError> {
        self.transport
            .send_text(room_id_from_jid(destination_id), text)
            .await
            .map_err(ChannelError::from)
    }
}

/// Cached session shared between the channel and its dispatcher.
type SessionSlot = Arc<Mutex<Option<Session>>>;

fn forget_session(slot: &SessionSlot) {
    if slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .is_some()
    {
        info!("dropped cached Matrix session");
    }
}

/// Matrix implementation of [`Channel`].
pub struct MatrixChannel {
    transport: Arc<dyn Transport>,
    config: MatrixConfig,
    assistant_name: String,
    opts: ChannelOpts,
    state: Arc<ConnectionTracker>,
    queue: Arc<DeliveryQueue>,
    session: SessionSlot,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MatrixChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixChannel")
            .field("state", &self.state.state())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl MatrixChannel {
    /// Create a disconnected channel. No network calls are made until
    /// [`Channel::connect`].
    pub fn new(
        transport: Arc<dyn Transport>,
        config: MatrixConfig,
        assistant_name: impl Into<String>,
        opts: ChannelOpts,
    ) -> Self {
        let state = Arc::new(ConnectionTracker::new());
        let delivery = Arc::new(RoomDelivery {
            transport: Arc::clone(&transport),
        });
        let queue = Arc::new(DeliveryQueue::new(Arc::clone(&state), delivery));
        Self {
            transport,
            config,
            assistant_name: assistant_name.into(),
            opts,
            state,
            queue,
            session: Arc::new(Mutex::new(None)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// The outbound delivery queue.
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Our own user id, once authenticated.
    pub fn user_id(&self) -> Option<String> {
        self.stored_session().map(|s| s.user_id)
    }

    fn stored_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, ChannelError> {
        if let Some(session) = self.stored_session() {
            debug!(user_id = %session.user_id, "reusing existing session");
            return Ok(session);
        }

        let session = match credentials {
            Credentials::AccessToken { token, user_id } => Session {
                user_id,
                access_token: token,
                device_id: None,
            },
            Credentials::Password { username, password } => self
                .transport
                .login(&username, &password)
                .await
                .map_err(|e| ChannelError::Auth(e.to_string()))?,
        };

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(session)
    }

    fn replace_workers(&self, next: Vec<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
            next,
        );
        for handle in previous {
            handle.abort();
        }
    }

    async fn establish(&self, credentials: Credentials) -> Result<(), ChannelError> {
        let session = self.authenticate(credentials).await?;
        info!(user_id = %session.user_id, "authenticated with homeserver");

        self.state.mark_syncing();
        let self_user_id = session.user_id.clone();
        let streams = self.transport.start(session).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let dispatcher = EventDispatcher {
            classifier: InboundClassifier::new(self_user_id.clone(), self.assistant_name.clone()),
            opts: self.opts.clone(),
            state: Arc::clone(&self.state),
            session: Arc::clone(&self.session),
            ready: Some(ready_tx),
        };
        let invites = InviteHandler {
            transport: Arc::clone(&self.transport),
            self_user_id,
        };
        self.replace_workers(vec![
            tokio::spawn(dispatcher.run(streams.events)),
            tokio::spawn(invites.run(streams.memberships)),
        ]);
        // Detached; exits on its own once the link is Disconnected.
        let _flusher = self.queue.spawn_flusher();

        let timeout_secs = self.config.initial_sync_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(timeout_secs), ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Sync(
                "event stream closed before initial sync".to_owned(),
            )),
            Err(_) => Err(ChannelError::SyncTimeout(timeout_secs)),
        }
    }

    fn kick_flush(&self) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move { queue.flush().await });
    }

    async fn teardown(&self) {
        self.state.mark_disconnected();
        self.replace_workers(Vec::new());
        self.transport.stop().await;
    }
}

#[async_trait]
impl Channel for MatrixChannel {
    fn name(&self) -> &str {
        "matrix"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        // Both checks happen before any network call.
        self.config.homeserver_url()?;
        let credentials = self.config.credentials()?;

        self.state.mark_connecting();
        match self.establish(credentials).await {
            Ok(()) => {
                info!(queued = self.queue.len(), "Matrix channel connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Matrix connect failed");
                if matches!(e, ChannelError::Auth(_)) {
                    forget_session(&self.session);
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn send_message(&self, jid: &str, text: &str) -> SendOutcome {
        // With a backlog, a fresh message goes behind it so it cannot
        // overtake older traffic.
        if self.state.is_connected() && !self.queue.is_empty() {
            self.queue.enqueue(jid, text);
            self.kick_flush();
            return SendOutcome::Queued;
        }
        self.queue.try_send(jid, text).await
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn owns_jid(&self, jid: &str) -> bool {
        owns_jid(jid)
    }

    async fn disconnect(&self) {
        self.teardown().await;
        info!("Matrix channel disconnected");
    }

    async fn set_typing(&self, jid: &str, is_typing: bool) {
        if !self.state.is_connected() {
            debug!(jid, "skipping typing indicator while not connected");
            return;
        }
        if let Err(e) = self
            .transport
            .set_typing(room_id_from_jid(jid), is_typing)
            .await
        {
            warn!(jid, error = %e, "failed to set typing indicator");
        }
    }
}

/// Feeds timeline events to the classifier and resolves the waiting
/// `connect` on the first sync signal.
struct EventDispatcher {
    classifier: InboundClassifier,
    opts: ChannelOpts,
    state: Arc<ConnectionTracker>,
    session: SessionSlot,
    ready: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

impl EventDispatcher {
    async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Timeline(event) => {
                    let jid = jid_for_room(&event.room_id);
                    self.classifier
                        .dispatch(&jid, &event, self.state.state(), &self.opts);
                }
                TransportEvent::SyncState(SyncState::Prepared) => {
                    if let Some(ready) = self.ready.take() {
                        self.state.mark_connected();
                        let _ = ready.send(Ok(()));
                    }
                }
                TransportEvent::SyncState(SyncState::Error {
                    message,
                    auth_rejected,
                }) => self.on_sync_error(message, auth_rejected),
            }
        }
        if self.ready.is_none() && self.state.is_connected() {
            warn!("Matrix event stream ended while connected");
            self.state.mark_disconnected();
        } else {
            debug!("Matrix event stream ended");
        }
    }

    fn on_sync_error(&mut self, message: String, auth_rejected: bool) {
        if let Some(ready) = self.ready.take() {
            let err = if auth_rejected {
                ChannelError::Auth(message)
            } else {
                ChannelError::Sync(message)
            };
            let _ = ready.send(Err(err));
            return;
        }
        if auth_rejected {
            warn!(error = %message, "homeserver rejected the session");
            forget_session(&self.session);
            self.state.mark_disconnected();
        } else {
            warn!(error = %message, "Matrix sync error");
        }
    }
}

/// Auto-joins rooms our own user is invited to. Failures are logged and
/// otherwise ignored.
struct InviteHandler {
    transport: Arc<dyn Transport>,
    self_user_id: String,
}

impl InviteHandler {
    async fn run(self, mut memberships: mpsc::Receiver<MembershipChange>) {
        while let Some(change) = memberships.recv().await {
            if change.membership != Membership::Invite || change.user_id != self.self_user_id {
                continue;
            }
            match self.transport.join_room(&change.room_id).await {
                Ok(()) => info!(room_id = %change.room_id, "auto-joined room after invite"),
                Err(e) => warn!(room_id = %change.room_id, error = %e, "failed to auto-join room"),
            }
        }
    }
}
