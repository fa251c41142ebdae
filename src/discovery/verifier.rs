//! Possession-based identity verification.
//!
//! Verification maps a physical nearby device to a durable user identity:
//! open a dedicated point-to-point link, read the identity once, and close
//! the link no matter what happened. There is no cryptography here — the
//! device that answers on the radio link is trusted to own the identity it
//! reports.

use crate::config::{MAX_IDENTITY_LEN, VERIFY_CONNECT_TIMEOUT, VERIFY_READ_TIMEOUT};
use crate::discovery::RadioAdapter;
use crate::events::{DiscoveryEvent, EventBus};
use crate::identity::UserId;
use crate::util::format::short_user_id;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of one verification attempt. Exactly one terminal variant
/// (`Success` or `Failure`) is produced per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    InProgress,
    Success(UserId),
    Failure(String),
}

impl VerificationOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VerificationOutcome::InProgress)
    }
}

/// Verifies nearby devices, one in-flight attempt per address.
pub struct IdentityVerifier {
    adapter: Arc<dyn RadioAdapter>,
    bus: EventBus,
    /// Addresses with an attempt currently in flight. Attempts on
    /// distinct addresses run independently; a failure on one never
    /// touches another's state.
    in_flight: Mutex<HashSet<String>>,
}

impl IdentityVerifier {
    pub fn new(adapter: Arc<dyn RadioAdapter>, bus: EventBus) -> Self {
        Self {
            adapter,
            bus,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Verify the device at `address` and return the terminal outcome.
    ///
    /// Publishes `InProgress` on the discovery bus immediately so the
    /// presentation layer can show a waiting state, then exactly one
    /// terminal outcome. The radio link is released on every exit path,
    /// including timeouts.
    pub async fn verify(&self, address: &str) -> VerificationOutcome {
        {
            let mut in_flight = self.in_flight.lock().expect("verifier mutex poisoned");
            if !in_flight.insert(address.to_string()) {
                return VerificationOutcome::Failure(format!(
                    "verification already in progress for {address}"
                ));
            }
        }

        self.publish(address, VerificationOutcome::InProgress);
        debug!(event = "verification_started", address);

        let outcome = self.run_attempt(address).await;

        self.in_flight
            .lock()
            .expect("verifier mutex poisoned")
            .remove(address);

        match &outcome {
            VerificationOutcome::Success(uid) => {
                info!(event = "verification_success", address, uid = %short_user_id(uid))
            }
            VerificationOutcome::Failure(reason) => {
                warn!(event = "verification_failure", address, reason)
            }
            VerificationOutcome::InProgress => unreachable!("attempt returned non-terminal outcome"),
        }
        self.publish(address, outcome.clone());
        outcome
    }

    /// One bounded connect + read + close cycle. Never returns
    /// `InProgress`.
    async fn run_attempt(&self, address: &str) -> VerificationOutcome {
        let mut link = match timeout(VERIFY_CONNECT_TIMEOUT, self.adapter.connect(address)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                return VerificationOutcome::Failure(format!(
                    "device does not have the app or is not ready: {e}"
                ))
            }
            Err(_) => {
                return VerificationOutcome::Failure(format!(
                    "connection to {address} timed out after {:?}",
                    VERIFY_CONNECT_TIMEOUT
                ))
            }
        };

        let read = timeout(VERIFY_READ_TIMEOUT, link.read_identity()).await;
        // The link is released before the outcome is interpreted so no
        // exit path below can leak it.
        link.close().await;

        let bytes = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return VerificationOutcome::Failure(format!("identity read failed: {e}")),
            Err(_) => {
                return VerificationOutcome::Failure(format!(
                    "identity read timed out after {:?}",
                    VERIFY_READ_TIMEOUT
                ))
            }
        };

        if bytes.is_empty() {
            return VerificationOutcome::Failure("peer sent an empty identity".into());
        }
        if bytes.len() > MAX_IDENTITY_LEN {
            return VerificationOutcome::Failure(format!(
                "identity exceeds {MAX_IDENTITY_LEN} bytes"
            ));
        }
        match String::from_utf8(bytes) {
            Ok(uid) => VerificationOutcome::Success(uid),
            Err(_) => VerificationOutcome::Failure("identity is not valid UTF-8".into()),
        }
    }

    fn publish(&self, address: &str, outcome: VerificationOutcome) {
        self.bus.publish_discovery(DiscoveryEvent::Verification {
            address: address.to_string(),
            outcome,
        });
    }
}
