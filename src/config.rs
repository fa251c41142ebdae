//! Centralized configuration constants for neardrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (control frame JSON tags) stay
//! in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Chunk size in bytes (64 KiB).
///
/// Sized to fit comfortably within a single data-channel message on every
/// transport we delegate to, while keeping per-chunk overhead negligible.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// High water mark for the channel's outstanding unacknowledged buffer
/// (bytes). When `buffered_amount()` exceeds this value the sender pauses
/// chunk transmission until the buffer drains below it. 1 MiB bounds
/// memory growth on a slow or congested channel without starving fast ones.
pub const BUFFERED_AMOUNT_HIGH: u64 = 1024 * 1024;

/// Polling interval while the sender is paused on backpressure.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum continuous time the send buffer may stay above the high water
/// mark before the transfer is treated as stalled and failed. The throttle
/// itself is not an error; never draining is.
pub const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the receive buffer's initial allocation (bytes). The
/// announced total size comes from the remote peer and must not size an
/// allocation on its own; the buffer starts at most here and grows as
/// chunks actually arrive.
pub const RECEIVE_PREALLOC_LIMIT: usize = 8 * 1024 * 1024;

// ── Discovery / Verification ─────────────────────────────────────────────────

/// Reference received power (dBm) measured at 1 meter, used by the
/// RSSI-to-distance path-loss estimate.
pub const TX_REFERENCE_POWER: f64 = -59.0;

/// Path-loss curve parameters for the non-linear branch
/// (`A * ratio^B + C`, applied when `rssi / reference >= 1`).
pub const PATH_LOSS_COEFF: f64 = 0.89976;
pub const PATH_LOSS_EXPONENT: f64 = 7.7095;
pub const PATH_LOSS_OFFSET: f64 = 0.111;

/// Timeout for opening the point-to-point radio link during verification.
pub const VERIFY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the single identity read once the link is open.
pub const VERIFY_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum identity length accepted from a verification read. Anything
/// longer is a misbehaving peer, not a durable user identifier.
pub const MAX_IDENTITY_LEN: usize = 1024;

// ── Session negotiation ──────────────────────────────────────────────────────

/// How long the caller waits for the remote answer before the session
/// is considered failed.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(120);

/// Capacity of each per-category broadcast event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of mailbox subscription delivery channels.
pub const MAILBOX_CHANNEL_CAPACITY: usize = 64;
