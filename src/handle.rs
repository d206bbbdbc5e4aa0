//! The caller-facing transfer handle.
//!
//! A [`DownloadHandle`] owns the state machine of one transfer: its status,
//! the bytes collected so far and the released-worker flag. The caller and
//! the transfer task that currently works on the handle share it; every
//! status read or write goes through one guard, and every status change wakes
//! all waiters while that guard is still held.
//!
//! ```text
//! NotStarted -> InProgress -> Paused -> InProgress ...
//!      |            |  \         \
//!      |            |   Finished  Cancelled
//!      +--> Paused  +-> Failed
//!      +--> Cancelled   Cancelled
//! ```

use crate::downloader::TransferError;
use crate::error::DownloadError;
use crate::models::{DownloadStatus, HandleSnapshot, RequestSpec};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Starts a fresh transfer task for a handle whose worker was released.
pub(crate) trait Redispatch: Send + Sync {
    fn redispatch(&self, handle: &DownloadHandle) -> Result<(), DownloadError>;
}

/// Control surface and result holder of one transfer.
///
/// Cloning is cheap; all clones refer to the same transfer.
#[derive(Clone)]
pub struct DownloadHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    spec: Arc<RequestSpec>,
    state: Mutex<HandleState>,
    changed: Notify,
    received: AtomicU64,
    manager: Arc<dyn Redispatch>,
}

struct HandleState {
    status: DownloadStatus,
    /// Partial content, parked here whenever no task is writing to it.
    buffer: Option<BytesMut>,
    result: Option<Bytes>,
    /// Set when the last worker left while paused on a resumable source.
    released: bool,
    content_length: Option<u64>,
    failure: Option<String>,
}

/// What the task does with its buffer when it starts.
#[derive(Debug)]
pub(crate) enum Claim {
    Fresh,
    /// Continue into the parked buffer; `content_length` is what the first
    /// connection announced.
    Resume {
        buffer: BytesMut,
        content_length: Option<u64>,
    },
    Cancelled,
}

/// Outcome of the per-chunk status check.
#[derive(Debug)]
pub(crate) enum Checkpoint {
    Continue(BytesMut),
    /// The buffer went back to the handle and the worker may exit.
    Released,
    Cancelled,
    Interrupted(BytesMut),
}

impl Shared {
    fn transition(&self, state: &mut HandleState, next: DownloadStatus) {
        tracing::debug!(id = self.id, from = %state.status, to = %next, "Status change");
        state.status = next;
        self.changed.notify_waiters();
    }
}

impl DownloadHandle {
    pub(crate) fn new(id: u64, spec: Arc<RequestSpec>, manager: Arc<dyn Redispatch>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                spec,
                state: Mutex::new(HandleState {
                    status: DownloadStatus::NotStarted,
                    buffer: None,
                    result: None,
                    released: false,
                    content_length: None,
                    failure: None,
                }),
                changed: Notify::new(),
                received: AtomicU64::new(0),
                manager,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.shared.spec
    }

    pub(crate) fn spec_arc(&self) -> Arc<RequestSpec> {
        Arc::clone(&self.shared.spec)
    }

    pub async fn status(&self) -> DownloadStatus {
        self.shared.state.lock().await.status
    }

    /// Bytes collected so far. Lock-free, so it may trail the status by one
    /// chunk.
    pub fn bytes_received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> HandleSnapshot {
        let state = self.shared.state.lock().await;
        HandleSnapshot {
            id: self.shared.id,
            url: self.shared.spec.url().to_string(),
            status: state.status,
            bytes_received: self.bytes_received(),
            content_length: state.content_length,
            failure: state.failure.clone(),
        }
    }

    /// Pauses a transfer that has not started or is in progress.
    ///
    /// Whether the worker is released or parked is decided by the task the
    /// next time it looks at the status.
    pub async fn pause(&self) -> Result<(), DownloadError> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            DownloadStatus::NotStarted | DownloadStatus::InProgress => {
                self.shared.transition(&mut state, DownloadStatus::Paused);
                tracing::info!(id = self.shared.id, "Transfer paused");
                Ok(())
            }
            status => Err(DownloadError::invalid_state("pause", status)),
        }
    }

    /// Resumes a paused transfer.
    ///
    /// If the worker was released, a new task is dispatched that continues
    /// from the current buffer length; otherwise the parked worker is woken
    /// and keeps reading from its open connection.
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let mut state = self.shared.state.lock().await;
        if state.status != DownloadStatus::Paused {
            return Err(DownloadError::invalid_state("resume", state.status));
        }
        if state.released {
            // The new task blocks on this guard until the status below is set.
            self.shared.manager.redispatch(self)?;
            state.released = false;
            tracing::info!(
                id = self.shared.id,
                offset = state.buffer.as_ref().map_or(0, |b| b.len()),
                "Transfer resumed on a new worker"
            );
        } else {
            tracing::info!(id = self.shared.id, "Transfer resumed in place");
        }
        self.shared.transition(&mut state, DownloadStatus::InProgress);
        Ok(())
    }

    /// Cancels the transfer and throws away everything collected so far.
    pub async fn cancel(&self) -> Result<(), DownloadError> {
        let mut state = self.shared.state.lock().await;
        if state.status.is_terminal() {
            return Err(DownloadError::invalid_state("cancel", state.status));
        }
        state.buffer = None;
        state.result = None;
        state.released = false;
        self.shared.received.store(0, Ordering::SeqCst);
        self.shared.transition(&mut state, DownloadStatus::Cancelled);
        tracing::info!(id = self.shared.id, "Transfer cancelled");
        Ok(())
    }

    /// Waits for a terminal status.
    ///
    /// Returns the content for `Finished`, the partial content for `Failed`
    /// (check [`status`](Self::status) to tell them apart) and `None` for
    /// `Cancelled`.
    pub async fn await_result(&self) -> Option<Bytes> {
        loop {
            // Registered before the check so a change in between is not lost.
            let changed = self.shared.changed.notified();
            {
                let state = self.shared.state.lock().await;
                match state.status {
                    DownloadStatus::Finished | DownloadStatus::Failed => {
                        return Some(state.result.clone().unwrap_or_default());
                    }
                    DownloadStatus::Cancelled => return None,
                    _ => {}
                }
            }
            changed.await;
        }
    }

    /// Like [`await_result`](Self::await_result) but gives up after
    /// `timeout`, returning `None` and leaving the transfer untouched.
    pub async fn await_result_timeout(&self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.await_result())
            .await
            .ok()
            .flatten()
    }

    // ---- task side ----

    /// Takes the buffer out of the handle for the duration of a task run.
    pub(crate) async fn claim_buffer(&self) -> Claim {
        let mut state = self.shared.state.lock().await;
        if state.status == DownloadStatus::Cancelled {
            return Claim::Cancelled;
        }
        match state.buffer.take() {
            Some(buffer) => Claim::Resume {
                buffer,
                content_length: state.content_length,
            },
            None => Claim::Fresh,
        }
    }

    /// Marks the transfer as running. Returns `false` if it was cancelled.
    pub(crate) async fn begin(&self, content_length: Option<u64>) -> bool {
        let mut state = self.shared.state.lock().await;
        if state.status == DownloadStatus::Cancelled {
            return false;
        }
        if content_length.is_some() {
            state.content_length = content_length;
        }
        if state.status == DownloadStatus::NotStarted {
            self.shared.transition(&mut state, DownloadStatus::InProgress);
        }
        true
    }

    fn record_progress(&self, len: usize) {
        self.shared.received.store(len as u64, Ordering::SeqCst);
    }

    /// Status check after a chunk was appended to `buffer`. Also publishes
    /// the new length unless the transfer was cancelled.
    ///
    /// On a paused resumable source the buffer goes back to the handle and
    /// the released flag is set under the same guard `resume` takes, so a
    /// concurrent resume sees either the parked or the released worker,
    /// never something in between. On a non-resumable source the call waits
    /// here until the status leaves `Paused`.
    pub(crate) async fn checkpoint(
        &self,
        buffer: BytesMut,
        ranged: bool,
        interrupt: &CancellationToken,
    ) -> Checkpoint {
        loop {
            let changed = self.shared.changed.notified();
            let mut state = self.shared.state.lock().await;
            if state.status != DownloadStatus::Cancelled {
                self.record_progress(buffer.len());
            }
            match state.status {
                DownloadStatus::Paused if ranged => {
                    tracing::info!(
                        id = self.shared.id,
                        bytes = buffer.len(),
                        "Paused on resumable source, releasing worker"
                    );
                    state.buffer = Some(buffer);
                    state.released = true;
                    return Checkpoint::Released;
                }
                DownloadStatus::Paused => {
                    drop(state);
                    tracing::debug!(id = self.shared.id, "Paused, parking worker");
                    tokio::select! {
                        _ = changed => {}
                        _ = interrupt.cancelled() => return Checkpoint::Interrupted(buffer),
                    }
                }
                DownloadStatus::Cancelled => return Checkpoint::Cancelled,
                _ => return Checkpoint::Continue(buffer),
            }
        }
    }

    /// Records the end of a transfer: `Finished` on success, `Failed` with
    /// the partial content otherwise.
    ///
    /// While the caller holds the transfer paused, the outcome is applied
    /// only once it resumes; a cancel in the meantime drops the content.
    /// Interruption applies the outcome immediately.
    pub(crate) async fn settle(
        &self,
        buffer: Option<BytesMut>,
        outcome: Result<(), TransferError>,
        interrupt: &CancellationToken,
    ) {
        let mut forced = false;
        loop {
            let changed = self.shared.changed.notified();
            let mut state = self.shared.state.lock().await;
            match state.status {
                DownloadStatus::Cancelled => return,
                DownloadStatus::Paused if !forced => {
                    drop(state);
                    tokio::select! {
                        _ = changed => {}
                        _ = interrupt.cancelled() => forced = true,
                    }
                }
                _ => {
                    let content = buffer
                        .or_else(|| state.buffer.take())
                        .unwrap_or_default();
                    self.record_progress(content.len());
                    state.result = Some(content.freeze());
                    state.released = false;
                    let next = match outcome {
                        Ok(()) => DownloadStatus::Finished,
                        Err(error) => {
                            tracing::warn!(id = self.shared.id, %error, "Transfer failed");
                            state.failure = Some(error.to_string());
                            DownloadStatus::Failed
                        }
                    };
                    self.shared.transition(&mut state, next);
                    return;
                }
            }
        }
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.shared.id)
            .field("url", &self.shared.spec.url().as_str())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingManager {
        redispatched: AtomicUsize,
    }

    impl Redispatch for RecordingManager {
        fn redispatch(&self, _handle: &DownloadHandle) -> Result<(), DownloadError> {
            self.redispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handle() -> (DownloadHandle, Arc<RecordingManager>) {
        let manager = Arc::new(RecordingManager::default());
        let spec = RequestSpec::builder("http://127.0.0.1/file").build().unwrap();
        let handle = DownloadHandle::new(7, Arc::new(spec), manager.clone());
        (handle, manager)
    }

    fn bytes(content: &[u8]) -> BytesMut {
        BytesMut::from(content)
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let (handle, manager) = handle();
        let err = handle.resume().await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::InvalidState { operation: "resume", status: DownloadStatus::NotStarted }
        ));
        assert_eq!(handle.status().await, DownloadStatus::NotStarted);
        assert_eq!(manager.redispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pause_twice_is_rejected() {
        let (handle, _) = handle();
        handle.pause().await.unwrap();
        assert!(matches!(
            handle.pause().await,
            Err(DownloadError::InvalidState { status: DownloadStatus::Paused, .. })
        ));
        assert_eq!(handle.status().await, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn cancel_twice_is_rejected() {
        let (handle, _) = handle();
        handle.cancel().await.unwrap();
        assert!(matches!(
            handle.cancel().await,
            Err(DownloadError::InvalidState { status: DownloadStatus::Cancelled, .. })
        ));
        assert_eq!(handle.await_result().await, None);
    }

    #[tokio::test]
    async fn finished_handle_rejects_every_control_call() {
        let (handle, _) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(Some(5)).await);
        handle.settle(Some(bytes(b"hello")), Ok(()), &interrupt).await;

        assert!(handle.pause().await.is_err());
        assert!(handle.resume().await.is_err());
        assert!(handle.cancel().await.is_err());
        assert_eq!(handle.status().await, DownloadStatus::Finished);
        assert_eq!(handle.await_result().await.unwrap(), &b"hello"[..]);
    }

    #[tokio::test]
    async fn timed_wait_leaves_state_alone() {
        let (handle, _) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(None).await);

        let early = handle.await_result_timeout(Duration::from_millis(20)).await;
        assert_eq!(early, None);
        assert_eq!(handle.status().await, DownloadStatus::InProgress);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_result_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.settle(Some(bytes(b"abc")), Ok(()), &interrupt).await;
        assert_eq!(waiter.await.unwrap().unwrap(), &b"abc"[..]);
    }

    #[tokio::test]
    async fn release_then_resume_redispatches_once() {
        let (handle, manager) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(None).await);
        handle.pause().await.unwrap();

        let checkpoint = handle.checkpoint(bytes(b"0123"), true, &interrupt).await;
        assert!(matches!(checkpoint, Checkpoint::Released));

        handle.resume().await.unwrap();
        assert_eq!(manager.redispatched.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status().await, DownloadStatus::InProgress);

        // The released flag was consumed: the next pause/resume wakes in place.
        match handle.claim_buffer().await {
            Claim::Resume { buffer, .. } => assert_eq!(&buffer[..], b"0123"),
            other => panic!("unexpected claim {:?}", other),
        }
        handle.pause().await.unwrap();
        handle.resume().await.unwrap();
        assert_eq!(manager.redispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parked_worker_continues_after_resume() {
        let (handle, manager) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(None).await);
        handle.pause().await.unwrap();

        let parked = {
            let handle = handle.clone();
            let interrupt = interrupt.clone();
            tokio::spawn(async move { handle.checkpoint(bytes(b"xy"), false, &interrupt).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!parked.is_finished());

        handle.resume().await.unwrap();
        match parked.await.unwrap() {
            Checkpoint::Continue(buffer) => assert_eq!(&buffer[..], b"xy"),
            other => panic!("unexpected checkpoint {:?}", other),
        }
        assert_eq!(manager.redispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parked_worker_observes_cancel() {
        let (handle, _) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(None).await);
        handle.pause().await.unwrap();

        let parked = {
            let handle = handle.clone();
            let interrupt = interrupt.clone();
            tokio::spawn(async move { handle.checkpoint(bytes(b"xy"), false, &interrupt).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel().await.unwrap();
        assert!(matches!(parked.await.unwrap(), Checkpoint::Cancelled));
        assert_eq!(handle.await_result().await, None);
    }

    #[tokio::test]
    async fn settle_waits_out_a_pause() {
        let (handle, _) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(None).await);
        handle.pause().await.unwrap();

        let settling = {
            let handle = handle.clone();
            let interrupt = interrupt.clone();
            tokio::spawn(async move { handle.settle(Some(bytes(b"done")), Ok(()), &interrupt).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.status().await, DownloadStatus::Paused);

        handle.resume().await.unwrap();
        settling.await.unwrap();
        assert_eq!(handle.status().await, DownloadStatus::Finished);
        assert_eq!(handle.await_result().await.unwrap(), &b"done"[..]);
    }

    #[tokio::test]
    async fn failure_keeps_partial_content() {
        let (handle, _) = handle();
        let interrupt = CancellationToken::new();
        assert!(handle.begin(Some(10)).await);
        handle
            .settle(Some(bytes(b"part")), Err(TransferError::Interrupted), &interrupt)
            .await;

        assert_eq!(handle.status().await, DownloadStatus::Failed);
        assert_eq!(handle.await_result().await.unwrap(), &b"part"[..]);
        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.bytes_received, 4);
        assert_eq!(snapshot.content_length, Some(10));
        assert_eq!(snapshot.failure.as_deref(), Some("transfer interrupted"));
    }

    #[tokio::test]
    async fn cancel_before_start_stops_the_task() {
        let (handle, _) = handle();
        handle.cancel().await.unwrap();
        assert!(matches!(handle.claim_buffer().await, Claim::Cancelled));
        assert!(!handle.begin(None).await);
    }
}
