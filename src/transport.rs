//! Transport collaborator interfaces.
//!
//! The core never opens a peer-to-peer channel itself: it emits and
//! consumes opaque session-description and candidate blobs, and once the
//! collaborator reports the channel open it drives a byte-oriented
//! send/receive surface with an observable outstanding-buffer gauge.
//! Address-family negotiation, encryption, and NAT traversal all live
//! behind these traits.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the negotiation a description came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description (offer or answer) produced and consumed
/// by the transport collaborator. The core never inspects `description`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub description: String,
}

/// An opaque connectivity candidate: one possible network path for
/// establishing the peer-to-peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
    pub description: String,
}

/// Events pushed by the transport once a session is being established.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A locally gathered connectivity candidate that must be signaled
    /// to the remote peer. May arrive before the session id is known.
    LocalCandidate(Candidate),
    /// The byte channel is open; transfer may begin.
    Open,
    /// An inbound frame from the remote peer.
    Frame(Bytes),
    /// The channel closed (remotely or after a local `close`).
    Closed,
}

/// The session-level transport collaborator.
///
/// One instance per negotiation attempt. Descriptions and candidates are
/// opaque; the trait mirrors the offer/answer lifecycle the negotiation
/// engine drives.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Construct the local offer (caller role).
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Construct the local answer (callee role, after the remote offer
    /// has been applied).
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the remote peer's description (offer on the callee, answer
    /// on the caller). Must precede any `add_candidate` call.
    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Feed a remote connectivity candidate into the transport.
    async fn add_candidate(&self, candidate: Candidate) -> Result<()>;

    /// Subscribe to channel lifecycle events (candidates, open, frames,
    /// close). Each transport instance supports a single subscriber.
    fn events(&self) -> mpsc::Receiver<ChannelEvent>;

    /// Send one frame on the open byte channel.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Outstanding unacknowledged send-buffer occupancy in bytes.
    async fn buffered_amount(&self) -> u64;

    /// Close the channel and release transport resources.
    async fn close(&self) -> Result<()>;
}

/// Produces one fresh [`SessionTransport`] per negotiation attempt.
/// Transports are single-use; a failed or ended session never reuses one.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn SessionTransport>>;
}
