//! Receiving side of a file transfer.
//!
//! Consumes the session's inbound frame stream: a Start control frame
//! opens the transfer, raw chunks accumulate with exact byte accounting,
//! and the End frame finalizes. A chunk before Start is a protocol
//! violation, not a tolerable reordering: the channel is ordered and
//! reliable, so it can only mean a broken sender.

use crate::config::RECEIVE_PREALLOC_LIMIT;
use crate::events::{EventBus, TransferEvent};
use crate::transfer::control::{classify, Frame, TransferControl};
use crate::transfer::TransferProgress;
use crate::util::format::format_file_size;
use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct TransferReceiver {
    bus: EventBus,
}

impl TransferReceiver {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Run one transfer to completion over the inbound frame stream.
    /// Publishes progress along the way and `Completed` on success.
    pub async fn receive(&self, frames: mpsc::Receiver<Bytes>) -> Result<ReceivedFile> {
        match self.run(frames).await {
            Ok(file) => {
                self.bus.publish_transfer(TransferEvent::Completed {
                    filename: file.filename.clone(),
                    bytes: file.bytes.clone(),
                });
                Ok(file)
            }
            Err(e) => {
                self.bus.publish_transfer(TransferEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, mut frames: mpsc::Receiver<Bytes>) -> Result<ReceivedFile> {
        let mut current: Option<(String, u64, Vec<u8>)> = None;

        while let Some(frame) = frames.recv().await {
            match classify(frame) {
                Frame::Control(TransferControl::Start {
                    filename,
                    total_size,
                }) => {
                    if current.is_some() {
                        bail!("second start frame during an active transfer");
                    }
                    info!(
                        event = "transfer_receiving",
                        filename = %filename,
                        size = %format_file_size(total_size as i64),
                    );
                    current = Some((
                        filename,
                        total_size,
                        Vec::with_capacity(total_size.min(RECEIVE_PREALLOC_LIMIT as u64) as usize),
                    ));
                }
                Frame::Chunk(chunk) => {
                    let Some((filename, total, buffer)) = current.as_mut() else {
                        bail!("chunk received before the start frame");
                    };
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() as u64 > *total {
                        bail!(
                            "received {} bytes, announced {total}",
                            buffer.len()
                        );
                    }
                    debug!(event = "chunk_received", bytes = chunk.len(), received = buffer.len());
                    self.bus
                        .publish_transfer(TransferEvent::Progress(TransferProgress {
                            filename: filename.clone(),
                            transferred: buffer.len() as u64,
                            total: *total,
                        }));
                }
                Frame::Control(TransferControl::End) => {
                    let Some((filename, total, buffer)) = current.take() else {
                        bail!("end frame before the start frame");
                    };
                    if buffer.len() as u64 != total {
                        bail!(
                            "transfer ended at {} bytes, announced {total}",
                            buffer.len()
                        );
                    }
                    info!(event = "transfer_received", filename = %filename, bytes = buffer.len());
                    return Ok(ReceivedFile {
                        filename,
                        bytes: buffer,
                    });
                }
            }
        }
        bail!("channel closed before the transfer completed");
    }
}
