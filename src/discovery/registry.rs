//! ProximityRegistry: the live set of nearby physical devices.
//!
//! Observations arrive from the radio scan callback; user-triggered
//! clears arrive from another task. The registry is the single point of
//! truth for both, so every mutation goes through one mutex and there is
//! no read-modify-write window between an observation and a clear.

use crate::config::{
    PATH_LOSS_COEFF, PATH_LOSS_EXPONENT, PATH_LOSS_OFFSET, TX_REFERENCE_POWER,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// One nearby physical device, keyed by its physical address.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    /// Physical radio address — the deduplication key.
    pub address: String,
    /// Human-readable name, when the device advertises one.
    pub display_name: Option<String>,
    /// Most recent signal strength reading (dBm).
    pub rssi: i32,
}

impl DiscoveredPeer {
    /// Estimated distance in meters from the latest RSSI reading, using
    /// the standard path-loss curve: below the 1-meter reference the
    /// ratio is raised directly to the 10th power, beyond it the
    /// empirical non-linear branch applies.
    pub fn estimated_distance(&self) -> f64 {
        estimate_distance(self.rssi)
    }
}

/// RSSI (dBm) to estimated distance (meters).
pub fn estimate_distance(rssi: i32) -> f64 {
    let ratio = rssi as f64 / TX_REFERENCE_POWER;
    if ratio < 1.0 {
        ratio.powi(10)
    } else {
        PATH_LOSS_COEFF * ratio.powf(PATH_LOSS_EXPONENT) + PATH_LOSS_OFFSET
    }
}

/// A single radio observation, as delivered by the scan callback.
#[derive(Debug, Clone)]
pub struct Observation {
    pub address: String,
    pub display_name: Option<String>,
    pub rssi: i32,
}

/// Deduplicated view of currently known peers.
///
/// The stored set is never sorted: display ordering (descending signal
/// strength) and the named-only filter are applied at read time.
#[derive(Debug, Default)]
pub struct ProximityRegistry {
    peers: Mutex<HashMap<String, DiscoveredPeer>>,
}

impl ProximityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new peer or refresh an existing one. Matching is by
    /// physical address, never by name. Returns the stored entry.
    pub fn observe(&self, obs: Observation) -> DiscoveredPeer {
        let mut peers = self.peers.lock().expect("registry mutex poisoned");
        let entry = peers
            .entry(obs.address.clone())
            .and_modify(|peer| {
                peer.rssi = obs.rssi;
                // A name can show up on a later advertisement; never
                // downgrade a known name to None.
                if obs.display_name.is_some() {
                    peer.display_name = obs.display_name.clone();
                }
            })
            .or_insert_with(|| DiscoveredPeer {
                address: obs.address,
                display_name: obs.display_name,
                rssi: obs.rssi,
            });
        entry.clone()
    }

    /// Discard every known peer (explicit refresh or scan teardown).
    pub fn clear(&self) {
        self.peers.lock().expect("registry mutex poisoned").clear();
    }

    /// Read-time presentation view: optionally hides peers with no
    /// human-readable name, always ordered by descending signal strength.
    pub fn visible_peers(&self, named_only: bool) -> Vec<DiscoveredPeer> {
        let peers = self.peers.lock().expect("registry mutex poisoned");
        let mut view: Vec<DiscoveredPeer> = peers
            .values()
            .filter(|p| !named_only || p.display_name.is_some())
            .cloned()
            .collect();
        view.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        view
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
