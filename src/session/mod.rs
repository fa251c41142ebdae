//! Session negotiation: record types, the pure state machine, and the
//! runner that connects it to the mailbox and transport collaborators.

pub mod early_queue;
pub mod negotiation;
pub mod runner;

use crate::identity::UserId;
use crate::transport::SessionDescription;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which peer originated a message or candidate within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

/// Lifecycle status stored on the shared session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Caller published the offer; callee has not decided yet.
    Created,
    /// Callee accepted and is preparing an answer. Set before the answer
    /// is published so a redelivered Created record cannot re-prompt.
    Accepting,
    /// Answer published by the callee.
    Answered,
    /// Byte channel open on both sides.
    Connected,
    Ended,
}

/// Metadata for the single file a session will carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
}

/// The negotiation record exchanged through the mailbox.
///
/// Created by the caller, mutated by both sides as negotiation proceeds,
/// deleted together with its buffered candidates when the session ends,
/// is rejected, or fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: SessionStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub file: FileMetadata,
}

impl SessionRecord {
    /// Validate the structural invariants a record must satisfy at the
    /// boundary. Malformed records are rejected here rather than letting
    /// partially-populated state propagate inward.
    pub fn validate(&self) -> Result<()> {
        if self.caller_id.is_empty() || self.callee_id.is_empty() {
            bail!("session {}: missing participant id", self.session_id);
        }
        if self.file.filename.is_empty() {
            bail!("session {}: missing file name", self.session_id);
        }
        match self.status {
            SessionStatus::Created if self.offer.is_none() => {
                bail!("session {}: created without an offer", self.session_id)
            }
            SessionStatus::Answered if self.answer.is_none() => {
                bail!("session {}: answered without an answer", self.session_id)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpKind;

    fn record(status: SessionStatus) -> SessionRecord {
        SessionRecord {
            session_id: Uuid::new_v4(),
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            status,
            offer: Some(SessionDescription {
                kind: SdpKind::Offer,
                description: "o".into(),
            }),
            answer: None,
            file: FileMetadata {
                filename: "report.pdf".into(),
                size: 500_000,
            },
        }
    }

    #[test]
    fn valid_created_record_passes() {
        assert!(record(SessionStatus::Created).validate().is_ok());
    }

    #[test]
    fn created_without_offer_is_rejected() {
        let mut rec = record(SessionStatus::Created);
        rec.offer = None;
        assert!(rec.validate().is_err());
    }

    #[test]
    fn answered_without_answer_is_rejected() {
        let rec = record(SessionStatus::Answered);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn missing_participant_is_rejected() {
        let mut rec = record(SessionStatus::Created);
        rec.callee_id = String::new();
        assert!(rec.validate().is_err());
    }
}
