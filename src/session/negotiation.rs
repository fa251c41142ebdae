//! NegotiationEngine: the session-negotiation state machine.
//!
//! This is a pure state machine: every input returns the declarative
//! [`SignalAction`]s the runner must execute, in order. The engine never
//! performs I/O, which keeps the out-of-order and early-arrival handling
//! directly testable.
//!
//! **Architecture rule**: no negotiation logic may exist outside this
//! module. The runner executes actions and pumps subscriptions; the
//! transport opens channels. All sequencing decisions happen here.
//!
//! Two early-arrival windows are bridged by [`EarlyQueue`]s:
//! - locally gathered candidates before the session identifier is
//!   assigned by the mailbox write;
//! - inbound candidates before the remote description is applied.
//! Both drain FIFO the moment their gate opens and are empty afterwards.

use crate::identity::UserId;
use crate::session::early_queue::EarlyQueue;
use crate::session::{FileMetadata, Role, SessionRecord, SessionStatus};
use crate::transport::{Candidate, SdpKind, SessionDescription};
use anyhow::{bail, Result};
use tracing::{debug, warn};
use uuid::Uuid;

// ── Actions ──────────────────────────────────────────────────────────────────

/// Side-effects the engine instructs the runner to execute. The runner
/// must preserve list order: a drained candidate is only valid after the
/// `ApplyRemoteDescription` emitted in the same batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalAction {
    /// Publish a brand-new session record (status Created, offer + file
    /// metadata) to the callee's signals mailbox. The store assigns the
    /// session identifier; the runner reports it back through
    /// [`NegotiationEngine::session_assigned`].
    PublishSession {
        callee_id: UserId,
        offer: SessionDescription,
        file: FileMetadata,
    },
    /// Publish the local answer for the session (status becomes Answered).
    PublishAnswer {
        session_id: Uuid,
        answer: SessionDescription,
    },
    /// Publish one locally gathered connectivity candidate.
    PublishCandidate {
        session_id: Uuid,
        origin: Role,
        candidate: Candidate,
    },
    /// Notify the remote peer the transfer was rejected (application
    /// events collection).
    PublishReject { session_id: Uuid },
    /// Apply the remote description on the transport.
    ApplyRemoteDescription(SessionDescription),
    /// Feed one remote candidate into the transport.
    ApplyCandidate(Candidate),
    /// Ask the transport for an answer (after the offer was applied).
    CreateAnswer,
    /// Surface the accept/reject decision to the presentation layer.
    SurfaceRequest {
        session_id: Uuid,
        caller_id: UserId,
        file: FileMetadata,
    },
    /// Delete the session record and every buffered candidate entry,
    /// caller- and callee-origin alike.
    DeleteSession { session_id: Uuid },
}

// ── Phase ────────────────────────────────────────────────────────────────────

/// Engine lifecycle. `Failed` is reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    OfferCreated,
    AnswerCreated,
    Connected,
    Ended,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Failed)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct NegotiationEngine {
    role: Role,
    remote_user: UserId,
    phase: Phase,
    status: SessionStatus,
    session_id: Option<Uuid>,
    file: FileMetadata,
    offer: Option<SessionDescription>,
    answer: Option<SessionDescription>,
    /// Gate: session identifier assigned.
    local_candidates: EarlyQueue<Candidate>,
    /// Gate: remote description applied.
    remote_candidates: EarlyQueue<Candidate>,
}

impl NegotiationEngine {
    /// Caller role: transfer intent toward `callee_id`. The offer is
    /// reported via [`offer_created`](Self::offer_created) once the
    /// transport produces it.
    pub fn caller(callee_id: UserId, file: FileMetadata) -> Self {
        Self {
            role: Role::Caller,
            remote_user: callee_id,
            phase: Phase::Idle,
            status: SessionStatus::Created,
            session_id: None,
            file,
            offer: None,
            answer: None,
            local_candidates: EarlyQueue::new(),
            remote_candidates: EarlyQueue::new(),
        }
    }

    /// Callee role: constructed from a received status=Created record.
    /// The session identifier is already known, so the local candidate
    /// gate opens immediately; the returned actions surface the
    /// accept/reject decision.
    pub fn callee(record: SessionRecord) -> Result<(Self, Vec<SignalAction>)> {
        record.validate()?;
        if record.status != SessionStatus::Created {
            bail!(
                "session {}: callee engine requires a created record, got {:?}",
                record.session_id,
                record.status
            );
        }
        let offer = record.offer.clone();
        let mut engine = Self {
            role: Role::Callee,
            remote_user: record.caller_id.clone(),
            phase: Phase::OfferCreated,
            status: SessionStatus::Created,
            session_id: Some(record.session_id),
            file: record.file.clone(),
            offer,
            answer: None,
            local_candidates: EarlyQueue::new(),
            remote_candidates: EarlyQueue::new(),
        };
        let drained = engine.local_candidates.open();
        debug_assert!(drained.is_empty());

        let actions = vec![SignalAction::SurfaceRequest {
            session_id: record.session_id,
            caller_id: record.caller_id,
            file: record.file,
        }];
        Ok((engine, actions))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    pub fn file(&self) -> &FileMetadata {
        &self.file
    }

    // ── Caller path ──────────────────────────────────────────────────────

    /// The transport produced the local offer. At most one outstanding
    /// offer per session: a second call is an error.
    pub fn offer_created(&mut self, offer: SessionDescription) -> Result<Vec<SignalAction>> {
        if self.role != Role::Caller {
            bail!("only the caller creates offers");
        }
        if self.phase != Phase::Idle || self.offer.is_some() {
            bail!("offer already outstanding");
        }
        if offer.kind != SdpKind::Offer {
            bail!("expected an offer description, got {:?}", offer.kind);
        }
        self.phase = Phase::OfferCreated;
        self.offer = Some(offer.clone());
        Ok(vec![SignalAction::PublishSession {
            callee_id: self.remote_user.clone(),
            offer,
            file: self.file.clone(),
        }])
    }

    /// The mailbox write completed and assigned the session identifier.
    /// Opens the local candidate gate and drains it in generation order.
    pub fn session_assigned(&mut self, session_id: Uuid) -> Vec<SignalAction> {
        if self.session_id.is_some() {
            return Vec::new();
        }
        self.session_id = Some(session_id);
        self.local_candidates
            .open()
            .into_iter()
            .map(|candidate| SignalAction::PublishCandidate {
                session_id,
                origin: self.role,
                candidate,
            })
            .collect()
    }

    /// The remote answer arrived. Applies it and drains any inbound
    /// candidates that raced ahead of it, in arrival order. Duplicate
    /// answers (at-least-once delivery) are ignored.
    pub fn on_answer(&mut self, answer: SessionDescription) -> Result<Vec<SignalAction>> {
        if self.role != Role::Caller {
            bail!("answer delivered to callee engine");
        }
        if self.phase.is_terminal() {
            return Ok(Vec::new());
        }
        if self.answer.is_some() {
            debug!(event = "duplicate_answer_ignored", session = ?self.session_id);
            return Ok(Vec::new());
        }
        if answer.kind != SdpKind::Answer {
            bail!("expected an answer description, got {:?}", answer.kind);
        }
        self.answer = Some(answer.clone());
        self.status = SessionStatus::Answered;

        let mut actions = vec![SignalAction::ApplyRemoteDescription(answer)];
        self.drain_remote_into(&mut actions);
        Ok(actions)
    }

    /// The callee rejected the transfer: tear down without an answer.
    pub fn on_reject(&mut self) -> Vec<SignalAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        self.finish(Phase::Ended)
    }

    // ── Callee path ──────────────────────────────────────────────────────

    /// The user accepted the incoming transfer. Marks the record
    /// Accepting (so a redelivered Created record cannot re-prompt),
    /// applies the buffered offer, and asks the transport for an answer.
    pub fn accept(&mut self) -> Result<Vec<SignalAction>> {
        if self.role != Role::Callee {
            bail!("only the callee accepts a session");
        }
        if self.phase != Phase::OfferCreated || self.status != SessionStatus::Created {
            bail!("session is not awaiting a decision");
        }
        let offer = self
            .offer
            .clone()
            .ok_or_else(|| anyhow::anyhow!("created record lost its offer"))?;

        self.status = SessionStatus::Accepting;
        let mut actions = vec![SignalAction::ApplyRemoteDescription(offer)];
        self.drain_remote_into(&mut actions);
        actions.push(SignalAction::CreateAnswer);
        Ok(actions)
    }

    /// The user rejected the incoming transfer. Deletes the record and
    /// terminates; no further negotiation occurs.
    pub fn reject(&mut self) -> Result<Vec<SignalAction>> {
        if self.role != Role::Callee {
            bail!("only the callee rejects a session");
        }
        let Some(session_id) = self.session_id else {
            bail!("callee session without an identifier");
        };
        if self.phase.is_terminal() {
            return Ok(Vec::new());
        }
        let mut actions = vec![SignalAction::PublishReject { session_id }];
        actions.extend(self.finish(Phase::Ended));
        Ok(actions)
    }

    /// The transport produced the local answer. At most one outstanding
    /// answer per session.
    pub fn answer_created(&mut self, answer: SessionDescription) -> Result<Vec<SignalAction>> {
        if self.role != Role::Callee {
            bail!("only the callee creates answers");
        }
        if self.status != SessionStatus::Accepting || self.answer.is_some() {
            bail!("answer already outstanding or session not accepting");
        }
        if answer.kind != SdpKind::Answer {
            bail!("expected an answer description, got {:?}", answer.kind);
        }
        let Some(session_id) = self.session_id else {
            bail!("callee session without an identifier");
        };
        self.answer = Some(answer.clone());
        self.status = SessionStatus::Answered;
        self.phase = Phase::AnswerCreated;
        Ok(vec![SignalAction::PublishAnswer { session_id, answer }])
    }

    // ── Both roles ───────────────────────────────────────────────────────

    /// A locally gathered candidate. Buffered in generation order while
    /// the session identifier is unknown, published immediately after.
    pub fn local_candidate(&mut self, candidate: Candidate) -> Vec<SignalAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        match (self.local_candidates.offer(candidate), self.session_id) {
            (Some(candidate), Some(session_id)) => vec![SignalAction::PublishCandidate {
                session_id,
                origin: self.role,
                candidate,
            }],
            _ => Vec::new(),
        }
    }

    /// An inbound candidate from the opposite peer. Buffered in arrival
    /// order until the remote description is applied; never discarded,
    /// never reordered.
    pub fn remote_candidate(&mut self, origin: Role, candidate: Candidate) -> Vec<SignalAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        if origin == self.role {
            // Our own candidate echoed back by an at-least-once mailbox.
            warn!(event = "own_candidate_echoed", session = ?self.session_id);
            return Vec::new();
        }
        match self.remote_candidates.offer(candidate) {
            Some(candidate) => vec![SignalAction::ApplyCandidate(candidate)],
            None => Vec::new(),
        }
    }

    /// The transport reports the byte channel open.
    pub fn channel_connected(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            bail!("channel opened on a terminated session");
        }
        self.phase = Phase::Connected;
        self.status = SessionStatus::Connected;
        Ok(())
    }

    /// End the session: delete the record and every buffered candidate.
    pub fn end(&mut self) -> Vec<SignalAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        self.finish(Phase::Ended)
    }

    /// Terminal failure (mailbox I/O error, malformed signal, transport
    /// fault). Cleans up exactly like `end` but records the failed phase.
    pub fn fail(&mut self, reason: &str) -> Vec<SignalAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        warn!(event = "session_failed", session = ?self.session_id, reason);
        self.finish(Phase::Failed)
    }

    /// Shared terminal transition: drop both candidate buffers and emit
    /// the record deletion. Partial cleanup here would be a correctness
    /// bug, so both queues are reset unconditionally.
    fn finish(&mut self, phase: Phase) -> Vec<SignalAction> {
        self.phase = phase;
        self.status = SessionStatus::Ended;
        self.local_candidates.reset();
        self.remote_candidates.reset();
        match self.session_id {
            Some(session_id) => vec![SignalAction::DeleteSession { session_id }],
            None => Vec::new(),
        }
    }

    fn drain_remote_into(&mut self, actions: &mut Vec<SignalAction>) {
        actions.extend(
            self.remote_candidates
                .open()
                .into_iter()
                .map(SignalAction::ApplyCandidate),
        );
    }
}
