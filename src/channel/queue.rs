//! Outbound delivery queue.
//!
//! Buffers `(destination, text)` pairs created while the link is down or
//! after a failed transmission, and drains them strictly FIFO once the
//! connection is live. Transmission errors never reach the caller; they
//! degrade into a requeue at the tail.
//!
//! There is no retry cap or dead-letter path: a destination that never
//! accepts messages accumulates them indefinitely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{ConnectionState, ConnectionTracker};
use super::{ChannelError, SendOutcome};

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Destination id (chat jid).
    pub destination_id: String,
    /// Message text.
    pub text: String,
}

/// Network transmission of a single text message.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Transmit `text` to `destination_id`.
    async fn deliver(&self, destination_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// FIFO outbound queue gated on [`ConnectionTracker`].
pub struct DeliveryQueue {
    pending: Mutex<VecDeque<QueuedMessage>>,
    flushing: AtomicBool,
    flush_requested: AtomicBool,
    state: Arc<ConnectionTracker>,
    transport: Arc<dyn Deliver>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("pending", &self.len())
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the flushing flag when a flush ends, including on cancellation.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DeliveryQueue {
    /// Create an empty queue that transmits through `transport`.
    pub fn new(state: Arc<ConnectionTracker>, transport: Arc<dyn Deliver>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            state,
            transport,
        }
    }

    /// Append a message to the tail. Never fails.
    pub fn enqueue(&self, destination_id: &str, text: &str) {
        let depth = {
            let mut pending = self.pending();
            pending.push_back(QueuedMessage {
                destination_id: destination_id.to_owned(),
                text: text.to_owned(),
            });
            pending.len()
        };
        debug!(destination_id, depth, "message queued");
    }

    /// Send now if connected, otherwise queue.
    ///
    /// A transmission error is logged and turned into [`SendOutcome::Queued`].
    pub async fn try_send(&self, destination_id: &str, text: &str) -> SendOutcome {
        if !self.state.is_connected() {
            self.enqueue(destination_id, text);
            return SendOutcome::Queued;
        }
        self.transmit(QueuedMessage {
            destination_id: destination_id.to_owned(),
            text: text.to_owned(),
        })
        .await
    }

    /// Drain the queue while connected.
    ///
    /// Each pass attempts at most the number of messages present when it
    /// began, so a failing destination is retried on the next trigger rather
    /// than spun on. A call that finds a flush already running only leaves a
    /// request behind; the running flush honors it with one more pass.
    pub async fn flush(&self) {
        // Raised before the ownership check so a holder that is about to
        // release the guard still sees it.
        self.flush_requested.store(true, Ordering::SeqCst);
        loop {
            if self
                .flushing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("flush already running");
                return;
            }
            {
                let _guard = FlushGuard(&self.flushing);
                while self.flush_requested.swap(false, Ordering::SeqCst)
                    && self.state.is_connected()
                {
                    self.drain_pass().await;
                }
            }
            // A request that landed after the last check but before the
            // guard dropped found the flag still held and returned.
            if !self.flush_requested.load(Ordering::SeqCst)
                || !self.state.is_connected()
                || self.is_empty()
            {
                return;
            }
        }
    }

    /// Spawn a task that flushes every time the connection becomes live.
    ///
    /// The task exits once it observes [`ConnectionState::Disconnected`], so
    /// spawn it after leaving that state. It is never aborted mid-send: an
    /// in-flight message either lands or is requeued.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut rx = self.state.subscribe();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => queue.flush().await,
                    ConnectionState::Disconnected => break,
                    ConnectionState::Authenticating | ConnectionState::SyncingInitial => {}
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            debug!("queue flusher stopped");
        })
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Copy of the queue contents, head first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.pending().iter().cloned().collect()
    }

    async fn drain_pass(&self) {
        let mut budget = self.len();
        if budget == 0 {
            return;
        }
        info!(pending = budget, "flushing outbound queue");

        let mut sent: usize = 0;
        while budget > 0 && self.state.is_connected() {
            budget = budget.saturating_sub(1);
            let Some(item) = self.pending().pop_front() else {
                break;
            };
            // Link dropped between the guard and the pop: the item was never
            // attempted, so it goes back to the head.
            if !self.state.is_connected() {
                self.pending().push_front(item);
                break;
            }
            if self.transmit(item).await == SendOutcome::Sent {
                sent = sent.saturating_add(1);
            }
        }

        info!(sent, remaining = self.len(), "outbound flush pass finished");
    }

    async fn transmit(&self, item: QueuedMessage) -> SendOutcome {
        match self
            .transport
            .deliver(&item.destination_id, &item.text)
            .await
        {
            Ok(()) => {
                debug!(destination_id = %item.destination_id, "message sent");
                SendOutcome::Sent
            }
            Err(e) => {
                warn!(
                    destination_id = %item.destination_id,
                    error = %e,
                    "send failed, message requeued"
                );
                self.pending().push_back(item);
                SendOutcome::Queued
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
