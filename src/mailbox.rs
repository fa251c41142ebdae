//! Mailbox collaborator: asynchronous per-recipient message delivery.
//!
//! The mailbox itself (a remote key-value document store in production) is
//! external; the core only needs `send(collection, recipient, payload)` and
//! `subscribe(collection, recipient) -> stream` semantics with
//! at-least-once delivery. Implementations delete each entry after it is
//! handed to the subscriber, and every consumer tolerates duplicates.
//!
//! Two logical collections are used: negotiation signals and application
//! events (transfer accept/reject). Payloads are explicit versioned
//! schemas validated on decode; malformed documents are rejected at the
//! boundary.

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::identity::UserId;
use crate::session::{Role, SessionRecord};
use crate::transport::{Candidate, SessionDescription};
use crate::util::stop::Stop;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Wire schema version. Bumped on any incompatible payload change.
pub const WIRE_VERSION: u32 = 1;

/// The two logical mailbox collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Session negotiation traffic: records, answers, candidates.
    Signals,
    /// Application-level events: transfer accept/reject.
    Events,
}

/// One delivered mailbox entry: who sent it and the raw document bytes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sender: UserId,
    pub payload: Vec<u8>,
}

/// Negotiation traffic carried on [`Collection::Signals`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    /// A freshly created session record (caller -> callee).
    SessionCreated { session: SessionRecord },
    /// The callee's answer for an existing session.
    SessionAnswered {
        session_id: Uuid,
        answer: SessionDescription,
    },
    /// One connectivity candidate, tagged with its originating role so
    /// each peer consumes only the opposite side's entries.
    Candidate {
        session_id: Uuid,
        origin: Role,
        candidate: Candidate,
    },
    /// The session record and all of its candidate entries were deleted.
    SessionEnded { session_id: Uuid },
}

/// Application events carried on [`Collection::Events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppMessage {
    TransferAccept { session_id: Uuid },
    TransferReject { session_id: Uuid },
}

/// Versioned envelope wrapped around every payload on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Wire<T> {
    v: u32,
    #[serde(flatten)]
    msg: T,
}

/// Encode a payload with the current wire version.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(&Wire {
        v: WIRE_VERSION,
        msg,
    })
    .context("encoding mailbox payload")
}

/// Decode and validate a payload, rejecting unknown versions.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let wire: Wire<T> = serde_json::from_slice(payload).context("malformed mailbox payload")?;
    if wire.v != WIRE_VERSION {
        bail!("unsupported mailbox payload version {}", wire.v);
    }
    Ok(wire.msg)
}

/// The mailbox collaborator interface.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Deliver a payload to a recipient's collection.
    async fn send(
        &self,
        collection: Collection,
        recipient: &UserId,
        sender: &UserId,
        payload: Vec<u8>,
    ) -> Result<()>;

    /// Subscribe to a recipient's collection. Entries are removed from
    /// the store as they are pushed into the returned channel; delivery
    /// is at-least-once, so consumers must tolerate duplicates.
    async fn subscribe(
        &self,
        collection: Collection,
        recipient: &UserId,
    ) -> Result<mpsc::Receiver<Delivery>>;
}

// ── MailboxService ───────────────────────────────────────────────────────────

/// Application-events pump with an explicit `start`/`stop` lifecycle.
///
/// Constructed once by the application root and injected wherever needed;
/// there is no process-global mailbox state. `start` subscribes to the
/// local user's events collection and re-broadcasts decoded
/// [`AppMessage`]s to any number of in-process consumers.
pub struct MailboxService {
    mailbox: Arc<dyn Mailbox>,
    local_user: UserId,
    app_tx: broadcast::Sender<(UserId, AppMessage)>,
    stop: Mutex<Option<Stop>>,
}

impl MailboxService {
    pub fn new(mailbox: Arc<dyn Mailbox>, local_user: UserId) -> Self {
        let (app_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mailbox,
            local_user,
            app_tx,
            stop: Mutex::new(None),
        }
    }

    pub fn mailbox(&self) -> Arc<dyn Mailbox> {
        self.mailbox.clone()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Subscribe to decoded application messages.
    pub fn subscribe_app_messages(&self) -> broadcast::Receiver<(UserId, AppMessage)> {
        self.app_tx.subscribe()
    }

    /// Start the events pump. Idempotent: a second call while running is
    /// a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.stop.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut rx = self
            .mailbox
            .subscribe(Collection::Events, &self.local_user)
            .await?;
        let stop = Stop::new();
        let pump_stop = stop.clone();
        let app_tx = self.app_tx.clone();
        tokio::spawn(async move {
            while let Some(Some(delivery)) = pump_stop.select(rx.recv()).await {
                match decode::<AppMessage>(&delivery.payload) {
                    Ok(msg) => {
                        debug!(event = "app_message", sender = %delivery.sender, ?msg);
                        let _ = app_tx.send((delivery.sender, msg));
                    }
                    Err(e) => {
                        warn!(event = "app_message_rejected", error = %e, "Dropping malformed event payload");
                    }
                }
            }
        });

        *guard = Some(stop);
        Ok(())
    }

    /// Stop the events pump and release the subscription. Idempotent.
    pub async fn stop(&self) {
        if let Some(stop) = self.stop.lock().await.take() {
            stop.cancel();
        }
    }

    /// Publish an application event to a remote user.
    pub async fn send_app_message(&self, recipient: &UserId, msg: AppMessage) -> Result<()> {
        let payload = encode(&msg)?;
        self.mailbox
            .send(Collection::Events, recipient, &self.local_user, payload)
            .await
    }
}
