use std::sync::Arc;

use bytes::BytesMut;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::handle::{Checkpoint, Claim, DownloadHandle};
use crate::integrity::{verify_sha256, IntegrityError};
use crate::protocol::{Connection, Protocol};

/// Faults raised while a transfer is running.
///
/// These never cross the handle boundary as errors; they turn the transfer
/// into `Failed` and their text is kept as the failure reason.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server responded with {0}")]
    Status(StatusCode),
    #[error("server ignored the range request starting at byte {offset}")]
    RangeIgnored { offset: u64 },
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("transfer interrupted")]
    Interrupted,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// How a run of the streaming loop ended.
enum Exit {
    EndOfStream(BytesMut),
    Failed(Option<BytesMut>, TransferError),
    Released,
    Cancelled,
}

/// One connection's worth of streaming into a handle.
///
/// Created for every dispatch and every redispatch; consumed by [`run`].
///
/// [`run`]: TransferTask::run
pub(crate) struct TransferTask<P: Protocol> {
    protocol: Arc<P>,
    handle: DownloadHandle,
    config: Arc<ManagerConfig>,
    interrupt: CancellationToken,
}

impl<P: Protocol> TransferTask<P> {
    pub(crate) fn new(
        protocol: Arc<P>,
        handle: DownloadHandle,
        config: Arc<ManagerConfig>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            handle,
            config,
            interrupt,
        }
    }

    pub(crate) async fn run(self) {
        let id = self.handle.id();
        let spec = self.handle.spec_arc();
        tracing::debug!(id, url = %spec.url(), "Opening connection");

        let opened = tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => Err(TransferError::Interrupted),
            conn = self.protocol.open(&spec) => conn,
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(error) => {
                self.handle.settle(None, Err(error), &self.interrupt).await;
                return;
            }
        };

        let exit = self.stream(&mut conn).await;
        self.protocol.close(conn).await;

        match exit {
            Exit::EndOfStream(buffer) => {
                let outcome = match spec.expected_sha256() {
                    Some(expected) => verify_sha256(&buffer, expected).map_err(TransferError::from),
                    None => Ok(()),
                };
                if outcome.is_ok() {
                    tracing::info!(id, bytes = buffer.len(), "Transfer finished");
                }
                self.handle.settle(Some(buffer), outcome, &self.interrupt).await;
            }
            Exit::Failed(buffer, error) => {
                self.handle.settle(buffer, Err(error), &self.interrupt).await;
            }
            Exit::Released => tracing::debug!(id, "Worker released"),
            Exit::Cancelled => tracing::debug!(id, "Worker stopped after cancel"),
        }
    }

    /// The streaming loop. The caller closes `conn` whatever this returns.
    async fn stream(&self, conn: &mut P::Connection) -> Exit {
        let (mut buffer, content_length) = match self.handle.claim_buffer().await {
            Claim::Cancelled => return Exit::Cancelled,
            Claim::Resume {
                buffer,
                content_length,
            } => {
                let offset = buffer.len() as u64;
                if content_length.is_some_and(|total| offset >= total) {
                    // Released right after the last chunk; nothing left to ask for.
                    return Exit::EndOfStream(buffer);
                }
                tracing::debug!(id = self.handle.id(), offset, "Continuing from offset");
                self.protocol.apply_resume_offset(conn, offset);
                (buffer, None)
            }
            Claim::Fresh => match self.read(conn.content_length()).await {
                Ok(length) => (BytesMut::with_capacity(self.config.capacity_for(length)), length),
                Err(error) => return Exit::Failed(None, error),
            },
        };

        if !self.handle.begin(content_length).await {
            return Exit::Cancelled;
        }

        loop {
            let chunk = match self.read(conn.read_chunk(self.config.chunk_size)).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Exit::EndOfStream(buffer),
                Err(error) => return Exit::Failed(Some(buffer), error),
            };
            buffer.extend_from_slice(&chunk);

            let ranged = self.protocol.supports_ranged_resume(conn);
            buffer = match self.handle.checkpoint(buffer, ranged, &self.interrupt).await {
                Checkpoint::Continue(buffer) => buffer,
                Checkpoint::Released => return Exit::Released,
                Checkpoint::Cancelled => return Exit::Cancelled,
                Checkpoint::Interrupted(buffer) => {
                    return Exit::Failed(Some(buffer), TransferError::Interrupted)
                }
            };
        }
    }

    /// Runs one connection call, giving up if the worker is interrupted.
    async fn read<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => Err(TransferError::Interrupted),
            result = call => result,
        }
    }
}
