//! Proximity discovery: radio adapter interface, scan lifecycle, and the
//! possession-based identity verifier.

pub mod registry;
pub mod verifier;

use crate::events::{DiscoveryEvent, EventBus};
use crate::identity::UserId;
use crate::util::stop::Stop;
use anyhow::{bail, Result};
use async_trait::async_trait;
use registry::{Observation, ProximityRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// A short-lived point-to-point radio connection used for verification.
#[async_trait]
pub trait RadioLink: Send {
    /// Perform the single identity read.
    async fn read_identity(&mut self) -> Result<Vec<u8>>;

    /// Release the connection. Safe to call after any outcome.
    async fn close(&mut self);
}

/// The short-range radio collaborator.
///
/// One mechanism, specified precisely: a generic device scan that reports
/// `Observation`s, plus an addressed point-to-point link over which the
/// remote peer answers a single read with its durable user id. The local
/// side of that exchange is `publish_identity`, which makes this device
/// answer verification reads with the given id.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Whether the radio hardware is present and enabled.
    fn is_available(&self) -> bool;

    /// Begin scanning; observations flow until `stop_scan`.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Observation>>;

    /// Halt scanning and release scan resources. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a point-to-point link to a scanned address.
    async fn connect(&self, address: &str) -> Result<Box<dyn RadioLink>>;

    /// Start answering verification reads with `uid`.
    async fn publish_identity(&self, uid: &UserId) -> Result<()>;

    /// Stop answering verification reads. Idempotent.
    async fn stop_publishing(&self) -> Result<()>;
}

// ── DiscoveryService ─────────────────────────────────────────────────────────

/// Owns the scan lifecycle: starts and stops the radio scan, pumps
/// observations into the [`ProximityRegistry`], and publishes
/// [`DiscoveryEvent`]s.
pub struct DiscoveryService {
    adapter: Arc<dyn RadioAdapter>,
    registry: Arc<ProximityRegistry>,
    bus: EventBus,
    scan: Mutex<Option<Stop>>,
}

impl DiscoveryService {
    pub fn new(adapter: Arc<dyn RadioAdapter>, bus: EventBus) -> Self {
        Self {
            adapter,
            registry: Arc::new(ProximityRegistry::new()),
            bus,
            scan: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<ProximityRegistry> {
        self.registry.clone()
    }

    /// Begin continuous scanning.
    ///
    /// Fails fast when the radio is unavailable: fatal for this attempt,
    /// never retried here. Starting while already running re-validates
    /// the adapter and is otherwise a no-op.
    pub async fn start(&self) -> Result<()> {
        if !self.adapter.is_available() {
            bail!("radio adapter unavailable or disabled");
        }

        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            debug!(event = "discovery_already_running");
            return Ok(());
        }

        let mut observations = self.adapter.start_scan().await?;
        let stop = Stop::new();
        let pump_stop = stop.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(Some(obs)) = pump_stop.select(observations.recv()).await {
                let peer = registry.observe(obs);
                bus.publish_discovery(DiscoveryEvent::PeerObserved(peer));
            }
        });

        *scan = Some(stop);
        info!(event = "discovery_started");
        Ok(())
    }

    /// Halt scanning, release scan resources, and discard the peer set.
    /// Idempotent: stopping while idle is a no-op and releases nothing
    /// twice.
    pub async fn stop(&self) -> Result<()> {
        let mut scan = self.scan.lock().await;
        let Some(stop) = scan.take() else {
            debug!(event = "discovery_already_stopped");
            return Ok(());
        };

        stop.cancel();
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(event = "scan_release_failure", error = %e);
        }
        self.registry.clear();
        self.bus.publish_discovery(DiscoveryEvent::Cleared);
        info!(event = "discovery_stopped");
        Ok(())
    }

    /// Clear the visible peer set without stopping the scan.
    pub fn refresh(&self) {
        self.registry.clear();
        self.bus.publish_discovery(DiscoveryEvent::Cleared);
    }

    /// Make this device answer verification reads with `uid`, so the
    /// local peer is discoverable and verifiable by others.
    pub async fn advertise(&self, uid: &UserId) -> Result<()> {
        self.adapter.publish_identity(uid).await?;
        info!(event = "advertising_started", uid = %uid);
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.adapter.stop_publishing().await?;
        info!(event = "advertising_stopped");
        Ok(())
    }
}
