//! neardrop: proximity file-drop core.
//!
//! Pairs nearby people and moves one file between them in three stages:
//!
//! 1. **Discovery** — a short-range radio scan builds a deduplicated,
//!    signal-ranked set of nearby devices; possession-based verification
//!    maps a chosen device to a durable user identity.
//! 2. **Negotiation** — offer, answer, and connectivity candidates are
//!    relayed through an asynchronous per-user mailbox until the
//!    transport collaborator reports its byte channel open. Early
//!    arrivals on either side are buffered, never dropped.
//! 3. **Transfer** — the file streams as fixed-size chunks framed by
//!    Start/End control messages, throttled against the channel's
//!    outstanding-buffer gauge.
//!
//! Radio hardware, the mailbox store, the peer-to-peer transport, and
//! identity lookup are collaborator traits ([`discovery::RadioAdapter`],
//! [`mailbox::Mailbox`], [`transport::SessionTransport`],
//! [`identity::IdentityDirectory`]); everything above them is plain
//! portable logic.

pub mod config;
pub mod discovery;
pub mod events;
pub mod identity;
pub mod mailbox;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod testing;

pub use discovery::registry::{DiscoveredPeer, ProximityRegistry};
pub use discovery::verifier::{IdentityVerifier, VerificationOutcome};
pub use discovery::DiscoveryService;
pub use events::{DiscoveryEvent, EventBus, SessionEvent, TransferEvent};
pub use mailbox::MailboxService;
pub use session::runner::{SessionRunner, SessionService};
pub use session::{FileMetadata, SessionStatus};
pub use transfer::{TransferProgress, TransferReceiver, TransferSender};
