//! SessionRunner and SessionService: the async shell around the
//! negotiation engine.
//!
//! The engine decides, the runner executes. Every engine input produces an
//! ordered action list; [`SessionRunner::execute`] carries those actions
//! out against the mailbox and transport collaborators, feeding derived
//! inputs (assigned session id, created answer) straight back into the
//! engine so the resulting actions run in the same batch.
//!
//! [`SessionService`] is the per-user front: it pumps the local signals
//! subscription, routes messages to the runner that owns each session id,
//! and enforces one active session per remote peer.

use crate::config::{ANSWER_TIMEOUT, EVENT_CHANNEL_CAPACITY};
use crate::events::{EventBus, SessionEvent};
use crate::identity::UserId;
use crate::mailbox::{decode, encode, AppMessage, Collection, Mailbox, MailboxService, SignalMessage};
use crate::session::negotiation::{NegotiationEngine, SignalAction};
use crate::session::{FileMetadata, Role, SessionRecord, SessionStatus};
use crate::transport::{ChannelEvent, SessionTransport, TransportFactory};
use crate::util::stop::Stop;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── SessionRunner ────────────────────────────────────────────────────────────

/// Drives one session: holds the engine, executes its actions, and pumps
/// the transport's channel events.
pub struct SessionRunner {
    local_user: UserId,
    mailbox: Arc<dyn Mailbox>,
    transport: Arc<dyn SessionTransport>,
    bus: EventBus,
    engine: Mutex<NegotiationEngine>,
    /// Set when the remote peer already tore the session down, so local
    /// teardown does not echo a SessionEnded back.
    remote_ended: AtomicBool,
    /// Inbound raw frames, handed to the transfer receiver exactly once.
    frames_rx: std::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    frames_tx: mpsc::Sender<Bytes>,
    connected_tx: watch::Sender<bool>,
    last_status: std::sync::Mutex<SessionStatus>,
    stop: Stop,
}

impl SessionRunner {
    fn new(
        local_user: UserId,
        mailbox: Arc<dyn Mailbox>,
        transport: Arc<dyn SessionTransport>,
        bus: EventBus,
        engine: NegotiationEngine,
    ) -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (connected_tx, _) = watch::channel(false);
        let runner = Arc::new(Self {
            local_user,
            mailbox,
            transport,
            bus,
            engine: Mutex::new(engine),
            remote_ended: AtomicBool::new(false),
            frames_rx: std::sync::Mutex::new(Some(frames_rx)),
            frames_tx,
            connected_tx,
            last_status: std::sync::Mutex::new(SessionStatus::Created),
            stop: Stop::new(),
        });
        runner.spawn_channel_pump();
        runner
    }

    /// Caller role: create the offer, publish the session record, start
    /// the answer timer.
    pub async fn start_caller(
        local_user: UserId,
        callee_id: UserId,
        file: FileMetadata,
        mailbox: Arc<dyn Mailbox>,
        transport: Arc<dyn SessionTransport>,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        let engine = NegotiationEngine::caller(callee_id, file);
        let runner = Self::new(local_user, mailbox, transport, bus, engine);

        let offer = runner
            .transport
            .create_offer()
            .await
            .context("creating local offer")?;
        let actions = runner.engine.lock().await.offer_created(offer)?;
        runner.run(actions).await;
        runner.spawn_answer_timer();
        Ok(runner)
    }

    /// Callee role: constructed from a received Created record. Surfaces
    /// the accept/reject decision; negotiation continues only on accept.
    pub async fn start_callee(
        local_user: UserId,
        record: SessionRecord,
        mailbox: Arc<dyn Mailbox>,
        transport: Arc<dyn SessionTransport>,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        let (engine, actions) = NegotiationEngine::callee(record)?;
        let runner = Self::new(local_user, mailbox, transport, bus, engine);
        runner.run(actions).await;
        Ok(runner)
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.engine.lock().await.session_id()
    }

    pub async fn remote_user(&self) -> UserId {
        self.engine.lock().await.remote_user().clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.engine.lock().await.status()
    }

    pub async fn is_terminal(&self) -> bool {
        self.engine.lock().await.phase().is_terminal()
    }

    pub fn transport(&self) -> Arc<dyn SessionTransport> {
        self.transport.clone()
    }

    /// Resolves once the byte channel is open. Returns false if the
    /// session terminated first.
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.connected_tx.subscribe();
        loop {
            if *rx.borrow() {
                return true;
            }
            if self.stop.cancelled() || rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Hand over the inbound frame stream. Single consumer.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.frames_rx
            .lock()
            .expect("frames mutex poisoned")
            .take()
    }

    // ── Decisions and inbound signals ────────────────────────────────────

    pub async fn accept(&self) -> Result<()> {
        let actions = self.engine.lock().await.accept()?;
        self.run(actions).await;
        Ok(())
    }

    pub async fn reject(&self) -> Result<()> {
        let actions = self.engine.lock().await.reject()?;
        self.run(actions).await;
        Ok(())
    }

    pub async fn end(&self) {
        let actions = self.engine.lock().await.end();
        self.run(actions).await;
    }

    async fn on_answer(&self, answer: crate::transport::SessionDescription) {
        let actions = match self.engine.lock().await.on_answer(answer) {
            Ok(actions) => actions,
            Err(e) => return self.abort(&format!("invalid answer: {e}")).await,
        };
        self.run(actions).await;
    }

    async fn on_remote_candidate(&self, origin: Role, candidate: crate::transport::Candidate) {
        let actions = self.engine.lock().await.remote_candidate(origin, candidate);
        self.run(actions).await;
    }

    async fn on_remote_end(&self) {
        self.remote_ended.store(true, Ordering::SeqCst);
        let actions = self.engine.lock().await.end();
        self.run(actions).await;
    }

    async fn on_rejected_by_peer(&self) {
        self.remote_ended.store(true, Ordering::SeqCst);
        let actions = self.engine.lock().await.on_reject();
        let session_id = self.engine.lock().await.session_id();
        if let Some(session_id) = session_id {
            self.bus.publish_session(SessionEvent::Failed {
                session_id,
                reason: "transfer rejected by peer".into(),
            });
        }
        self.run(actions).await;
    }

    // ── Action execution ─────────────────────────────────────────────────

    /// Execute actions; any mailbox or transport error is terminal for
    /// the session.
    async fn run(&self, actions: Vec<SignalAction>) {
        if let Err(e) = self.execute(actions).await {
            self.abort(&e.to_string()).await;
        }
        self.publish_status_change().await;
    }

    /// Carry out an ordered action batch. Actions that produce a derived
    /// engine input (session id assignment, answer creation) splice the
    /// resulting actions at the front of the work list so relative order
    /// is preserved.
    async fn execute(&self, actions: Vec<SignalAction>) -> Result<()> {
        let mut work: VecDeque<SignalAction> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                SignalAction::PublishSession {
                    callee_id,
                    offer,
                    file,
                } => {
                    // The store assigns the identifier at write time.
                    let session_id = Uuid::new_v4();
                    let record = SessionRecord {
                        session_id,
                        caller_id: self.local_user.clone(),
                        callee_id: callee_id.clone(),
                        status: SessionStatus::Created,
                        offer: Some(offer),
                        answer: None,
                        file,
                    };
                    let payload = encode(&SignalMessage::SessionCreated { session: record })?;
                    self.mailbox
                        .send(Collection::Signals, &callee_id, &self.local_user, payload)
                        .await
                        .context("publishing session record")?;
                    info!(event = "session_published", session = %session_id, callee = %callee_id);
                    // The backlog must reach the mailbox before any
                    // candidate gathered after the gate opens, so the
                    // drained publishes run under the engine lock. The
                    // channel pump blocks on that lock until the last
                    // buffered candidate is out.
                    let mut engine = self.engine.lock().await;
                    let recipient = engine.remote_user().clone();
                    for drained in engine.session_assigned(session_id) {
                        let SignalAction::PublishCandidate {
                            session_id,
                            origin,
                            candidate,
                        } = drained
                        else {
                            continue;
                        };
                        let payload = encode(&SignalMessage::Candidate {
                            session_id,
                            origin,
                            candidate,
                        })?;
                        self.mailbox
                            .send(Collection::Signals, &recipient, &self.local_user, payload)
                            .await
                            .context("publishing candidate")?;
                    }
                }
                SignalAction::PublishAnswer { session_id, answer } => {
                    let recipient = self.remote_user().await;
                    let payload = encode(&SignalMessage::SessionAnswered { session_id, answer })?;
                    self.mailbox
                        .send(Collection::Signals, &recipient, &self.local_user, payload)
                        .await
                        .context("publishing answer")?;
                }
                SignalAction::PublishCandidate {
                    session_id,
                    origin,
                    candidate,
                } => {
                    let recipient = self.remote_user().await;
                    let payload = encode(&SignalMessage::Candidate {
                        session_id,
                        origin,
                        candidate,
                    })?;
                    self.mailbox
                        .send(Collection::Signals, &recipient, &self.local_user, payload)
                        .await
                        .context("publishing candidate")?;
                }
                SignalAction::PublishReject { session_id } => {
                    let recipient = self.remote_user().await;
                    let payload = encode(&AppMessage::TransferReject { session_id })?;
                    self.mailbox
                        .send(Collection::Events, &recipient, &self.local_user, payload)
                        .await
                        .context("publishing rejection")?;
                }
                SignalAction::ApplyRemoteDescription(description) => {
                    self.transport
                        .apply_remote_description(description)
                        .await
                        .context("applying remote description")?;
                }
                SignalAction::ApplyCandidate(candidate) => {
                    self.transport
                        .add_candidate(candidate)
                        .await
                        .context("adding remote candidate")?;
                }
                SignalAction::CreateAnswer => {
                    let answer = self
                        .transport
                        .create_answer()
                        .await
                        .context("creating local answer")?;
                    let publish = self.engine.lock().await.answer_created(answer)?;
                    splice_front(&mut work, publish);
                }
                SignalAction::SurfaceRequest {
                    session_id,
                    caller_id,
                    file,
                } => {
                    self.bus.publish_session(SessionEvent::IncomingRequest {
                        session_id,
                        caller_id,
                        file,
                    });
                }
                SignalAction::DeleteSession { session_id } => {
                    self.teardown(session_id).await;
                }
            }
        }
        Ok(())
    }

    /// Terminal cleanup: notify the remote side (unless it initiated the
    /// teardown), close the transport, stop the pumps.
    async fn teardown(&self, session_id: Uuid) {
        if !self.remote_ended.load(Ordering::SeqCst) {
            if let Ok(payload) = encode(&SignalMessage::SessionEnded { session_id }) {
                let recipient = self.remote_user().await;
                if let Err(e) = self
                    .mailbox
                    .send(Collection::Signals, &recipient, &self.local_user, payload)
                    .await
                {
                    // Already tearing down; nothing else to do with this.
                    warn!(event = "session_end_notify_failed", session = %session_id, error = %e);
                }
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(event = "transport_close_failed", session = %session_id, error = %e);
        }
        self.stop.cancel();
        // Wake anyone blocked in wait_connected.
        self.connected_tx.send_modify(|_| {});
        info!(event = "session_closed", session = %session_id);
    }

    /// Force the session into the failed state and clean up.
    async fn abort(&self, reason: &str) {
        let (actions, session_id) = {
            let mut engine = self.engine.lock().await;
            (engine.fail(reason), engine.session_id())
        };
        if let Some(session_id) = session_id {
            self.bus.publish_session(SessionEvent::Failed {
                session_id,
                reason: reason.to_string(),
            });
        }
        // Teardown sends are best-effort here.
        if let Err(e) = self.execute(actions).await {
            warn!(event = "session_abort_cleanup_failed", error = %e);
        }
        self.stop.cancel();
        self.connected_tx.send_modify(|_| {});
    }

    async fn publish_status_change(&self) {
        let (status, session_id) = {
            let engine = self.engine.lock().await;
            (engine.status(), engine.session_id())
        };
        let Some(session_id) = session_id else { return };
        let changed = {
            let mut last = self.last_status.lock().expect("status mutex poisoned");
            if *last == status {
                false
            } else {
                *last = status;
                true
            }
        };
        if changed {
            self.bus
                .publish_session(SessionEvent::StatusChanged { session_id, status });
        }
    }

    // ── Background tasks ─────────────────────────────────────────────────

    fn spawn_channel_pump(self: &Arc<Self>) {
        let runner = self.clone();
        let mut events = self.transport.events();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            while let Some(Some(event)) = stop.select(events.recv()).await {
                match event {
                    ChannelEvent::LocalCandidate(candidate) => {
                        let actions = runner.engine.lock().await.local_candidate(candidate);
                        runner.run(actions).await;
                    }
                    ChannelEvent::Open => {
                        let connected = runner.engine.lock().await.channel_connected();
                        match connected {
                            Ok(()) => {
                                // send_replace: the open state must stick
                                // even when nobody subscribed yet.
                                runner.connected_tx.send_replace(true);
                                runner.publish_status_change().await;
                            }
                            Err(e) => runner.abort(&e.to_string()).await,
                        }
                    }
                    ChannelEvent::Frame(frame) => {
                        if runner.frames_tx.send(frame).await.is_err() {
                            warn!(event = "frame_dropped", "Inbound frame with no consumer");
                        }
                    }
                    ChannelEvent::Closed => {
                        debug!(event = "channel_closed");
                        runner.on_remote_end().await;
                        break;
                    }
                }
            }
        });
    }

    /// Caller-side guard: if no answer arrives within the window the
    /// session is failed and its record deleted.
    fn spawn_answer_timer(self: &Arc<Self>) {
        let runner = self.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if stop.select(sleep(ANSWER_TIMEOUT)).await.is_none() {
                return;
            }
            let waiting = {
                let engine = runner.engine.lock().await;
                !engine.phase().is_terminal() && engine.status() == SessionStatus::Created
            };
            if waiting {
                runner.abort("no answer before the timeout").await;
            }
        });
    }
}

fn splice_front(work: &mut VecDeque<SignalAction>, actions: Vec<SignalAction>) {
    for action in actions.into_iter().rev() {
        work.push_front(action);
    }
}

// ── SessionService ───────────────────────────────────────────────────────────

/// Routes the local user's signal traffic to per-session runners and
/// enforces one active session per remote peer.
pub struct SessionService {
    mailbox_service: Arc<MailboxService>,
    transports: Arc<dyn TransportFactory>,
    bus: EventBus,
    active: Arc<Mutex<HashMap<Uuid, Arc<SessionRunner>>>>,
    /// Peers with a caller session mid-setup, reserved before the first
    /// await in `send_file` so concurrent calls cannot both pass the
    /// one-session-per-peer check.
    pending_peers: Mutex<HashSet<UserId>>,
    stop: Mutex<Option<Stop>>,
}

impl SessionService {
    pub fn new(
        mailbox_service: Arc<MailboxService>,
        transports: Arc<dyn TransportFactory>,
        bus: EventBus,
    ) -> Self {
        Self {
            mailbox_service,
            transports,
            bus,
            active: Arc::new(Mutex::new(HashMap::new())),
            pending_peers: Mutex::new(HashSet::new()),
            stop: Mutex::new(None),
        }
    }

    fn local_user(&self) -> UserId {
        self.mailbox_service.local_user().clone()
    }

    /// Start the signals dispatch pump and the peer-rejection listener.
    /// Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.stop.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let local_user = self.local_user();
        let mut signals = self
            .mailbox_service
            .mailbox()
            .subscribe(Collection::Signals, &local_user)
            .await?;
        let mut app_rx = self.mailbox_service.subscribe_app_messages();

        let stop = Stop::new();

        let pump_stop = stop.clone();
        let service = self.clone_refs();
        tokio::spawn(async move {
            while let Some(Some(delivery)) = pump_stop.select(signals.recv()).await {
                match decode::<SignalMessage>(&delivery.payload) {
                    Ok(msg) => service.dispatch(delivery.sender, msg).await,
                    Err(e) => {
                        warn!(event = "signal_rejected", sender = %delivery.sender, error = %e,
                            "Dropping malformed signal payload");
                    }
                }
            }
        });

        let app_stop = stop.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            while let Some(Ok((_, msg))) = app_stop.select(app_rx.recv()).await {
                if let AppMessage::TransferReject { session_id } = msg {
                    let runner = active.lock().await.remove(&session_id);
                    if let Some(runner) = runner {
                        runner.on_rejected_by_peer().await;
                    }
                }
            }
        });

        *guard = Some(stop);
        info!(event = "session_service_started", user = %local_user);
        Ok(())
    }

    /// Stop dispatching and end every active session.
    pub async fn stop(&self) {
        if let Some(stop) = self.stop.lock().await.take() {
            stop.cancel();
        }
        let runners: Vec<_> = self.active.lock().await.drain().collect();
        for (_, runner) in runners {
            runner.end().await;
        }
    }

    /// Caller entry point: offer `file` to `callee_id`. At most one
    /// active session per remote peer.
    pub async fn send_file(&self, callee_id: UserId, file: FileMetadata) -> Result<Arc<SessionRunner>> {
        {
            let mut pending = self.pending_peers.lock().await;
            if pending.contains(&callee_id) || self.runner_for_peer(&callee_id).await.is_some() {
                bail!("a session with {callee_id} is already active");
            }
            pending.insert(callee_id.clone());
        }
        let result = self.start_caller_session(callee_id.clone(), file).await;
        self.pending_peers.lock().await.remove(&callee_id);
        result
    }

    async fn start_caller_session(
        &self,
        callee_id: UserId,
        file: FileMetadata,
    ) -> Result<Arc<SessionRunner>> {
        let transport = self.transports.create().await?;
        let runner = SessionRunner::start_caller(
            self.local_user(),
            callee_id,
            file,
            self.mailbox_service.mailbox(),
            transport,
            self.bus.clone(),
        )
        .await?;
        if let Some(session_id) = runner.session_id().await {
            self.active.lock().await.insert(session_id, runner.clone());
        }
        Ok(runner)
    }

    /// Callee decision: accept a surfaced incoming request.
    pub async fn accept(&self, session_id: Uuid) -> Result<()> {
        let runner = self
            .runner(session_id)
            .await
            .context("no such pending session")?;
        let caller = runner.remote_user().await;
        runner.accept().await?;
        self.mailbox_service
            .send_app_message(&caller, AppMessage::TransferAccept { session_id })
            .await
    }

    /// Callee decision: reject a surfaced incoming request. The record
    /// is deleted and the caller is notified.
    pub async fn reject(&self, session_id: Uuid) -> Result<()> {
        let runner = self
            .active
            .lock()
            .await
            .remove(&session_id)
            .context("no such pending session")?;
        runner.reject().await
    }

    /// End an active session from either side.
    pub async fn end(&self, session_id: Uuid) {
        let runner = self.active.lock().await.remove(&session_id);
        if let Some(runner) = runner {
            runner.end().await;
        }
    }

    pub async fn runner(&self, session_id: Uuid) -> Option<Arc<SessionRunner>> {
        self.active.lock().await.get(&session_id).cloned()
    }

    async fn runner_for_peer(&self, peer: &UserId) -> Option<Arc<SessionRunner>> {
        let runners: Vec<_> = self.active.lock().await.values().cloned().collect();
        for runner in runners {
            if !runner.is_terminal().await && runner.remote_user().await == *peer {
                return Some(runner);
            }
        }
        None
    }

    fn clone_refs(&self) -> ServiceRefs {
        ServiceRefs {
            mailbox_service: self.mailbox_service.clone(),
            transports: self.transports.clone(),
            bus: self.bus.clone(),
            active: self.active.clone(),
        }
    }
}

/// The subset of service state the dispatch pump needs.
struct ServiceRefs {
    mailbox_service: Arc<MailboxService>,
    transports: Arc<dyn TransportFactory>,
    bus: EventBus,
    active: Arc<Mutex<HashMap<Uuid, Arc<SessionRunner>>>>,
}

impl ServiceRefs {
    async fn dispatch(&self, sender: UserId, msg: SignalMessage) {
        match msg {
            SignalMessage::SessionCreated { session } => {
                self.on_session_created(sender, session).await;
            }
            SignalMessage::SessionAnswered { session_id, answer } => {
                if let Some(runner) = self.runner(session_id).await {
                    runner.on_answer(answer).await;
                } else {
                    debug!(event = "answer_for_unknown_session", session = %session_id);
                }
            }
            SignalMessage::Candidate {
                session_id,
                origin,
                candidate,
            } => {
                if let Some(runner) = self.runner(session_id).await {
                    runner.on_remote_candidate(origin, candidate).await;
                } else {
                    debug!(event = "candidate_for_unknown_session", session = %session_id);
                }
            }
            SignalMessage::SessionEnded { session_id } => {
                let runner = self.active.lock().await.remove(&session_id);
                if let Some(runner) = runner {
                    runner.on_remote_end().await;
                }
            }
        }
    }

    async fn on_session_created(&self, sender: UserId, record: SessionRecord) {
        if let Err(e) = record.validate() {
            warn!(event = "session_record_rejected", sender = %sender, error = %e);
            return;
        }
        let session_id = record.session_id;

        // At-least-once delivery: a redelivered record for a known
        // session never re-prompts.
        if self.runner(session_id).await.is_some() {
            debug!(event = "session_record_redelivered", session = %session_id);
            return;
        }

        // One active session per remote peer: concurrent offers from the
        // same caller are rejected outright.
        if self.runner_for_peer(&record.caller_id).await.is_some() {
            info!(event = "concurrent_session_rejected", session = %session_id, caller = %record.caller_id);
            self.reject_without_runner(&record.caller_id, session_id).await;
            return;
        }

        let transport = match self.transports.create().await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(event = "transport_create_failed", session = %session_id, error = %e);
                return;
            }
        };
        match SessionRunner::start_callee(
            self.mailbox_service.local_user().clone(),
            record,
            self.mailbox_service.mailbox(),
            transport,
            self.bus.clone(),
        )
        .await
        {
            Ok(runner) => {
                self.active.lock().await.insert(session_id, runner);
            }
            Err(e) => {
                warn!(event = "session_start_failed", session = %session_id, error = %e);
            }
        }
    }

    /// Reject a session we never instantiated a runner for.
    async fn reject_without_runner(&self, caller: &UserId, session_id: Uuid) {
        if let Err(e) = self
            .mailbox_service
            .send_app_message(caller, AppMessage::TransferReject { session_id })
            .await
        {
            warn!(event = "reject_notify_failed", session = %session_id, error = %e);
        }
    }

    async fn runner(&self, session_id: Uuid) -> Option<Arc<SessionRunner>> {
        self.active.lock().await.get(&session_id).cloned()
    }

    async fn runner_for_peer(&self, peer: &UserId) -> Option<Arc<SessionRunner>> {
        let runners: Vec<_> = self.active.lock().await.values().cloned().collect();
        for runner in runners {
            if !runner.is_terminal().await && runner.remote_user().await == *peer {
                return Some(runner);
            }
        }
        None
    }
}
