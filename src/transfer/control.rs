//! Transfer control frames.
//!
//! Control frames and raw file chunks share one byte channel. Control
//! frames are small JSON documents with a mandatory `type` tag; anything
//! that does not parse as one is file payload. The receiver classifies
//! every inbound frame through [`classify`] so the distinction lives in
//! exactly one place.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control messages framing a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferControl {
    /// Announces the file before the first chunk.
    Start { filename: String, total_size: u64 },
    /// Marks the final chunk as already delivered.
    End,
}

/// One inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(TransferControl),
    Chunk(Bytes),
}

/// Encode a control frame for the wire.
pub fn encode_control(msg: &TransferControl) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Classify an inbound frame: a valid control document or a raw chunk.
pub fn classify(frame: Bytes) -> Frame {
    match serde_json::from_slice::<TransferControl>(&frame) {
        Ok(msg) => Frame::Control(msg),
        Err(_) => Frame::Chunk(frame),
    }
}
