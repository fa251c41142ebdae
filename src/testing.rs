//! In-memory collaborator doubles shared by the unit tests.
//!
//! Each double implements one collaborator trait with just enough
//! behavior to exercise the real logic: the radio hosts canned
//! identities, the mailbox queues until subscribed and deletes on
//! delivery, and the transport pairs two endpoints through a hub so
//! offer/answer negotiation and frame delivery actually round-trip
//! in-process.

use crate::config::MAILBOX_CHANNEL_CAPACITY;
use crate::discovery::registry::Observation;
use crate::discovery::{RadioAdapter, RadioLink};
use crate::events::EventBus;
use crate::identity::{IdentityDirectory, Profile, UserId};
use crate::mailbox::{Collection, Delivery, Mailbox, MailboxService};
use crate::session::runner::SessionService;
use crate::transport::{
    Candidate, ChannelEvent, SdpKind, SessionDescription, SessionTransport, TransportFactory,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Route log output through the test harness. Call at the top of a test
/// and run with `RUST_LOG=neardrop=debug` to see structured events.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MemoryRadio ──────────────────────────────────────────────────────────────

enum Host {
    Identity(String),
    /// Accepts the connection but never answers the identity read.
    Silent,
}

#[derive(Default)]
struct RadioState {
    available: bool,
    scan_tx: Option<mpsc::Sender<Observation>>,
    scan_starts: usize,
    scan_stops: usize,
    hosts: HashMap<String, Host>,
    published: Option<UserId>,
}

/// Scriptable [`RadioAdapter`].
pub struct MemoryRadio {
    state: Mutex<RadioState>,
    open_links: Arc<AtomicUsize>,
}

impl MemoryRadio {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RadioState {
                available: true,
                ..RadioState::default()
            }),
            open_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RadioState> {
        self.state.lock().expect("radio state poisoned")
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Push one observation into the active scan.
    pub fn emit(&self, obs: Observation) {
        let tx = self.state().scan_tx.clone();
        if let Some(tx) = tx {
            tx.try_send(obs).expect("scan channel full");
        }
    }

    /// Make `address` connectable, answering the identity read with `uid`.
    pub fn host_identity(&self, address: &str, uid: &str) {
        self.state()
            .hosts
            .insert(address.into(), Host::Identity(uid.into()));
    }

    /// Make `address` connectable but unresponsive to the identity read.
    pub fn host_silent(&self, address: &str) {
        self.state().hosts.insert(address.into(), Host::Silent);
    }

    pub fn scan_starts(&self) -> usize {
        self.state().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state().scan_stops
    }

    /// Links connected but not yet released.
    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    /// The identity currently advertised to verification reads, if any.
    pub fn published_identity(&self) -> Option<UserId> {
        self.state().published.clone()
    }
}

impl Default for MemoryRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    fn is_available(&self) -> bool {
        self.state().available
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Observation>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state();
        state.scan_tx = Some(tx);
        state.scan_starts += 1;
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state();
        state.scan_tx = None;
        state.scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn RadioLink>> {
        let link = {
            let state = self.state();
            match state.hosts.get(address) {
                Some(Host::Identity(uid)) => MemoryLink {
                    identity: Some(uid.clone().into_bytes()),
                    open_links: self.open_links.clone(),
                },
                Some(Host::Silent) => MemoryLink {
                    identity: None,
                    open_links: self.open_links.clone(),
                },
                None => bail!("no radio service at {address}"),
            }
        };
        self.open_links.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(link))
    }

    async fn publish_identity(&self, uid: &UserId) -> Result<()> {
        self.state().published = Some(uid.clone());
        Ok(())
    }

    async fn stop_publishing(&self) -> Result<()> {
        self.state().published = None;
        Ok(())
    }
}

struct MemoryLink {
    identity: Option<Vec<u8>>,
    open_links: Arc<AtomicUsize>,
}

#[async_trait]
impl RadioLink for MemoryLink {
    async fn read_identity(&mut self) -> Result<Vec<u8>> {
        match self.identity.clone() {
            Some(bytes) => Ok(bytes),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn close(&mut self) {
        self.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── MemoryDirectory ──────────────────────────────────────────────────────────

/// [`IdentityDirectory`] double backed by a fixed profile table.
pub struct MemoryDirectory {
    local: Profile,
    known: HashMap<UserId, Profile>,
}

impl MemoryDirectory {
    pub fn new(local_uid: &str, local_name: &str) -> Self {
        let local = Profile {
            uid: local_uid.into(),
            username: local_name.into(),
        };
        let mut known = HashMap::new();
        known.insert(local.uid.clone(), local.clone());
        Self { local, known }
    }

    pub fn insert(&mut self, uid: &str, username: &str) {
        self.known.insert(
            uid.into(),
            Profile {
                uid: uid.into(),
                username: username.into(),
            },
        );
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn current_user(&self) -> Result<Profile> {
        Ok(self.local.clone())
    }

    async fn resolve(&self, uids: &[UserId]) -> Result<Vec<Profile>> {
        Ok(uids
            .iter()
            .filter_map(|uid| self.known.get(uid).cloned())
            .collect())
    }
}

// ── MemoryMailbox ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    queued: VecDeque<Delivery>,
    subscriber: Option<mpsc::Sender<Delivery>>,
}

/// [`Mailbox`] double: queues until subscribed, deletes on delivery.
pub struct MemoryMailbox {
    boxes: tokio::sync::Mutex<HashMap<(Collection, UserId), Slot>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self {
            boxes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// True when no undelivered entry remains in the store.
    pub fn is_empty(&self) -> bool {
        self.boxes
            .try_lock()
            .map(|boxes| boxes.values().all(|slot| slot.queued.is_empty()))
            .unwrap_or(false)
    }
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn send(
        &self,
        collection: Collection,
        recipient: &UserId,
        sender: &UserId,
        payload: Vec<u8>,
    ) -> Result<()> {
        let delivery = Delivery {
            sender: sender.clone(),
            payload,
        };
        let mut boxes = self.boxes.lock().await;
        let slot = boxes.entry((collection, recipient.clone())).or_default();
        if let Some(tx) = &slot.subscriber {
            if tx.send(delivery.clone()).await.is_ok() {
                return Ok(());
            }
            // Subscriber went away; fall back to queueing.
            slot.subscriber = None;
        }
        slot.queued.push_back(delivery);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        recipient: &UserId,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(MAILBOX_CHANNEL_CAPACITY);
        let mut boxes = self.boxes.lock().await;
        let slot = boxes.entry((collection, recipient.clone())).or_default();
        // Backlog drains first, preserving arrival order.
        while let Some(delivery) = slot.queued.pop_front() {
            tx.send(delivery)
                .await
                .context("draining mailbox backlog")?;
        }
        slot.subscriber = Some(tx);
        Ok(rx)
    }
}

// ── MemoryTransport ──────────────────────────────────────────────────────────

#[derive(Default)]
struct HubState {
    endpoints: HashMap<Uuid, mpsc::Sender<ChannelEvent>>,
    links: HashMap<Uuid, Uuid>,
}

/// Connects [`MemoryTransport`] endpoints by the ids they exchange in
/// their descriptions.
#[derive(Default)]
pub struct TransportHub {
    state: Mutex<HubState>,
}

impl TransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().expect("hub state poisoned")
    }

    fn register(&self, id: Uuid, events: mpsc::Sender<ChannelEvent>) {
        self.state().endpoints.insert(id, events);
    }

    /// Link both endpoints and announce the open channel to each.
    fn connect(&self, a: Uuid, b: Uuid) {
        let (to_a, to_b) = {
            let mut state = self.state();
            state.links.insert(a, b);
            state.links.insert(b, a);
            (
                state.endpoints.get(&a).cloned(),
                state.endpoints.get(&b).cloned(),
            )
        };
        for tx in [to_a, to_b].into_iter().flatten() {
            let _ = tx.try_send(ChannelEvent::Open);
        }
    }

    fn peer_sender(&self, id: Uuid) -> Option<mpsc::Sender<ChannelEvent>> {
        let state = self.state();
        let peer = state.links.get(&id)?;
        state.endpoints.get(peer).cloned()
    }

    fn unlink(&self, id: Uuid) -> Option<mpsc::Sender<ChannelEvent>> {
        let mut state = self.state();
        let peer = state.links.remove(&id)?;
        state.links.remove(&peer);
        state.endpoints.get(&peer).cloned()
    }
}

/// [`SessionTransport`] double with a controllable buffer gauge.
pub struct MemoryTransport {
    id: Uuid,
    hub: Arc<TransportHub>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    events_tx: mpsc::Sender<ChannelEvent>,
    buffered: AtomicU64,
    sent: AtomicUsize,
    candidates: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(hub: Arc<TransportHub>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let transport = Arc::new(Self {
            id: Uuid::new_v4(),
            hub: hub.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            events_tx: events_tx.clone(),
            buffered: AtomicU64::new(0),
            sent: AtomicUsize::new(0),
            candidates: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        hub.register(transport.id, events_tx);
        transport
    }

    /// Override the reported outstanding-buffer occupancy.
    pub fn set_buffered_amount(&self, bytes: u64) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Push a gathered local candidate with the given description into
    /// the transport's event stream.
    pub fn emit_candidate(&self, description: &str) {
        self.events_tx
            .try_send(ChannelEvent::LocalCandidate(Candidate {
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
                description: description.into(),
            }))
            .expect("transport event channel full");
    }

    pub fn sent_frames(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn candidates_added(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            description: self.id.to_string(),
        }
    }

    async fn emit_local_candidate(&self) {
        let _ = self
            .events_tx
            .send(ChannelEvent::LocalCandidate(Candidate {
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
                description: format!("cand-{}", self.id),
            }))
            .await;
    }
}

#[async_trait]
impl SessionTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.emit_local_candidate().await;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.emit_local_candidate().await;
        Ok(self.description(SdpKind::Answer))
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote: Uuid = description
            .description
            .parse()
            .context("unintelligible remote description")?;
        // The answering side applying the offer just learns the peer;
        // the offering side applying the answer completes the pair.
        if description.kind == SdpKind::Answer {
            self.hub.connect(self.id, remote);
        }
        Ok(())
    }

    async fn add_candidate(&self, _candidate: Candidate) -> Result<()> {
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> mpsc::Receiver<ChannelEvent> {
        self.events_rx
            .lock()
            .expect("events mutex poisoned")
            .take()
            .expect("transport events already subscribed")
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport closed");
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        if let Some(peer) = self.hub.peer_sender(self.id) {
            let _ = peer.send(ChannelEvent::Frame(frame)).await;
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(peer) = self.hub.unlink(self.id) {
            let _ = peer.try_send(ChannelEvent::Closed);
        }
        Ok(())
    }
}

/// A directly linked transport pair with the channel already open, for
/// transfer tests that skip negotiation.
pub fn loop_transport_pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let hub = TransportHub::new();
    let a = MemoryTransport::new(hub.clone());
    let b = MemoryTransport::new(hub.clone());
    {
        let mut state = hub.state();
        state.links.insert(a.id, b.id);
        state.links.insert(b.id, a.id);
    }
    (a, b)
}

/// [`TransportFactory`] producing hub-connected [`MemoryTransport`]s.
pub struct MemoryTransportFactory {
    hub: Arc<TransportHub>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self {
            hub: TransportHub::new(),
        }
    }

    pub fn with_hub(hub: Arc<TransportHub>) -> Self {
        Self { hub }
    }
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self) -> Result<Arc<dyn SessionTransport>> {
        Ok(MemoryTransport::new(self.hub.clone()))
    }
}

// ── Paired session services ──────────────────────────────────────────────────

/// Two fully started [`SessionService`]s sharing one mailbox and one
/// transport hub.
pub struct TestPair {
    pub mailbox: Arc<MemoryMailbox>,
    pub caller: SessionService,
    pub callee: SessionService,
    pub caller_bus: EventBus,
    pub callee_bus: EventBus,
}

pub async fn pair_services(caller: &str, callee: &str) -> TestPair {
    let mailbox = Arc::new(MemoryMailbox::new());
    let hub = TransportHub::new();

    let mut services = Vec::new();
    for user in [caller, callee] {
        let bus = EventBus::new();
        let mailbox_service = Arc::new(MailboxService::new(mailbox.clone(), user.to_string()));
        mailbox_service
            .start()
            .await
            .expect("starting mailbox service");
        let service = SessionService::new(
            mailbox_service,
            Arc::new(MemoryTransportFactory::with_hub(hub.clone())),
            bus.clone(),
        );
        service.start().await.expect("starting session service");
        services.push((service, bus));
    }
    let (callee_service, callee_bus) = services.pop().expect("callee service");
    let (caller_service, caller_bus) = services.pop().expect("caller service");

    TestPair {
        mailbox,
        caller: caller_service,
        callee: callee_service,
        caller_bus,
        callee_bus,
    }
}
