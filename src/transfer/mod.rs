//! Chunked file transfer over the open byte channel.
//!
//! One file per session. The sender announces the file with a Start
//! control frame, streams fixed-size raw chunks under a backpressure
//! gate, and closes with an End control frame; the receiver accumulates
//! chunks with exact byte accounting and finalizes on End.

pub mod control;
pub mod receiver;
pub mod sender;

pub use receiver::TransferReceiver;
pub use sender::TransferSender;

/// Progress of one directionally tracked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub filename: String,
    /// Bytes moved so far. Exact: counts payload bytes only, never
    /// control frames.
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.transferred * 100) / self.total).min(100) as u8
    }
}
