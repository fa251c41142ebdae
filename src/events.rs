//! Application event bus.
//!
//! Discovery callbacks, mailbox deliveries, and channel events all arrive
//! on independent execution contexts. Instead of wiring producers to a
//! fixed set of listeners, every producer publishes onto a per-category
//! broadcast channel and any number of consumers subscribe, decoupling
//! producers from the number and lifetime of consumers.

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::discovery::registry::DiscoveredPeer;
use crate::discovery::verifier::VerificationOutcome;
use crate::session::{FileMetadata, SessionStatus};
use crate::transfer::TransferProgress;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Discovery-side events.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer was inserted or its signal strength updated.
    PeerObserved(DiscoveredPeer),
    /// The visible peer set was cleared by an explicit refresh.
    Cleared,
    /// A verification attempt changed state (at most one terminal
    /// outcome per attempt).
    Verification {
        address: String,
        outcome: VerificationOutcome,
    },
}

/// Session negotiation events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An inbound transfer request awaiting an accept/reject decision.
    IncomingRequest {
        session_id: Uuid,
        caller_id: String,
        file: FileMetadata,
    },
    /// The session advanced to a new status.
    StatusChanged {
        session_id: Uuid,
        status: SessionStatus,
    },
    /// The session terminated with an error.
    Failed { session_id: Uuid, reason: String },
}

/// Transfer-side events.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(TransferProgress),
    /// A complete file arrived and is ready for the file-save collaborator.
    Completed { filename: String, bytes: Vec<u8> },
    Failed { reason: String },
}

/// Per-category broadcast channels shared by the whole application.
///
/// Cheap to clone; all clones publish into the same channels.
#[derive(Clone)]
pub struct EventBus {
    discovery: broadcast::Sender<DiscoveryEvent>,
    session: broadcast::Sender<SessionEvent>,
    transfer: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (discovery, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (session, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (transfer, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            discovery,
            session,
            transfer,
        }
    }

    pub fn publish_discovery(&self, event: DiscoveryEvent) {
        let _ = self.discovery.send(event);
    }

    pub fn publish_session(&self, event: SessionEvent) {
        let _ = self.session.send(event);
    }

    pub fn publish_transfer(&self, event: TransferEvent) {
        let _ = self.transfer.send(event);
    }

    pub fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe()
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn subscribe_transfer(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfer.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
