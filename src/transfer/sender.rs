//! Sending side of a file transfer.
//!
//! Start frame, then fixed-size chunks under the backpressure gate, then
//! the End frame. The gate polls the transport's outstanding-buffer gauge:
//! while it sits above the high water mark no chunk is sent; the pause is
//! normal flow control, but a buffer that never drains fails the transfer.

use crate::config::{
    BUFFERED_AMOUNT_HIGH, BUFFER_POLL_INTERVAL, CHUNK_SIZE, SEND_STALL_TIMEOUT,
};
use crate::events::{EventBus, TransferEvent};
use crate::session::FileMetadata;
use crate::transfer::control::{encode_control, TransferControl};
use crate::transfer::TransferProgress;
use crate::transport::SessionTransport;
use crate::util::format::format_file_size;
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

pub struct TransferSender {
    transport: Arc<dyn SessionTransport>,
    bus: EventBus,
}

impl TransferSender {
    pub fn new(transport: Arc<dyn SessionTransport>, bus: EventBus) -> Self {
        Self { transport, bus }
    }

    /// Stream a file from disk. The announced size is the file's size at
    /// open time; a file that changes length mid-read fails the transfer.
    pub async fn send_path(&self, path: &Path) -> Result<FileMetadata> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("unusable file name: {}", path.display()))?
            .to_string();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata().await?.len();
        let meta = FileMetadata { filename, size };
        self.send(&meta, file).await?;
        Ok(meta)
    }

    /// Stream `meta.size` bytes from `reader` as one transfer.
    pub async fn send<R>(&self, meta: &FileMetadata, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        match self.run(meta, reader).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.bus.publish_transfer(TransferEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run<R>(&self, meta: &FileMetadata, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let start = encode_control(&TransferControl::Start {
            filename: meta.filename.clone(),
            total_size: meta.size,
        })?;
        self.transport.send(start).await.context("sending start frame")?;
        info!(
            event = "transfer_started",
            filename = %meta.filename,
            size = %format_file_size(meta.size as i64),
        );

        let mut transferred: u64 = 0;
        loop {
            let chunk = read_chunk(&mut reader).await?;
            if chunk.is_empty() {
                break;
            }
            self.wait_for_capacity().await?;
            transferred += chunk.len() as u64;
            self.transport.send(chunk).await.context("sending chunk")?;
            self.bus
                .publish_transfer(TransferEvent::Progress(TransferProgress {
                    filename: meta.filename.clone(),
                    transferred,
                    total: meta.size,
                }));
        }

        if transferred != meta.size {
            bail!(
                "source ended at {transferred} bytes, announced {}",
                meta.size
            );
        }

        self.transport
            .send(encode_control(&TransferControl::End)?)
            .await
            .context("sending end frame")?;
        info!(event = "transfer_sent", filename = %meta.filename, bytes = transferred);
        Ok(())
    }

    /// Block while the outstanding buffer sits above the high water mark,
    /// re-checking every poll interval. A buffer that stays above the
    /// mark for the whole stall window fails the transfer.
    async fn wait_for_capacity(&self) -> Result<()> {
        let stalled_since = Instant::now();
        loop {
            let buffered = self.transport.buffered_amount().await;
            if buffered <= BUFFERED_AMOUNT_HIGH {
                return Ok(());
            }
            if stalled_since.elapsed() >= SEND_STALL_TIMEOUT {
                bail!(
                    "send buffer stayed above {BUFFERED_AMOUNT_HIGH} bytes for {:?}",
                    SEND_STALL_TIMEOUT
                );
            }
            debug!(event = "send_throttled", buffered);
            sleep(BUFFER_POLL_INTERVAL).await;
        }
    }
}

/// Fill one chunk from the reader. Short reads are coalesced so every
/// chunk except the last is exactly `CHUNK_SIZE` bytes.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut buf = BytesMut::zeroed(CHUNK_SIZE);
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let n = reader.read(&mut buf[filled..]).await.context("reading source")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}
