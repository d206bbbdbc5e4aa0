//! Per-scheme protocol hooks.
//!
//! A protocol plugs into the transfer loop through four operations:
//! `open`, `supports_ranged_resume`, `apply_resume_offset` and `close`.
//! The loop itself, and the handle state machine it drives, never know which
//! protocol they are talking to.

pub mod http;

use crate::downloader::{TransferError, TransferTask};
use crate::handle::DownloadHandle;
use crate::manager::Workers;
use crate::models::RequestSpec;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

pub use http::{HttpConnection, HttpProtocol};

/// An open (or about to be opened) byte source.
///
/// Implementations may defer the actual exchange with the remote end until
/// the first call to either method, so that [`Protocol::apply_resume_offset`]
/// can still shape the request.
#[async_trait]
pub trait Connection: Send {
    /// Length of the body this connection will deliver, if announced.
    async fn content_length(&mut self) -> Result<Option<u64>, TransferError>;

    /// Reads the next chunk of at most `max_len` bytes.
    ///
    /// Returns `Ok(None)` at end of stream and never yields an empty chunk.
    async fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError>;
}

/// The hook-set a URL scheme registers with the manager.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    type Connection: Connection + 'static;

    /// Prepares a connection for `spec`.
    async fn open(&self, spec: &RequestSpec) -> Result<Self::Connection, TransferError>;

    /// Whether the source behind `conn` can restart at an arbitrary offset.
    fn supports_ranged_resume(&self, conn: &Self::Connection) -> bool;

    /// Asks the source to start delivering at `offset` (inclusive).
    fn apply_resume_offset(&self, conn: &mut Self::Connection, offset: u64);

    /// Releases everything held by `conn`. Called exactly once per opened
    /// connection, on every exit path of the transfer loop.
    async fn close(&self, conn: Self::Connection);
}

/// Type-erased entry point that starts a transfer task for one protocol.
pub(crate) trait Launch: Send + Sync {
    fn launch(&self, handle: DownloadHandle, workers: &Workers);
}

struct Registered<P>(Arc<P>);

impl<P: Protocol> Launch for Registered<P> {
    fn launch(&self, handle: DownloadHandle, workers: &Workers) {
        let task = TransferTask::new(
            Arc::clone(&self.0),
            handle,
            workers.config(),
            workers.interrupt_token(),
        );
        workers.spawn(task.run());
    }
}

/// Hook-sets keyed by lower-case URL scheme.
#[derive(Clone, Default)]
pub(crate) struct ProtocolRegistry {
    launchers: HashMap<String, Arc<dyn Launch>>,
}

impl ProtocolRegistry {
    pub(crate) fn register<P: Protocol>(&mut self, scheme: &str, protocol: Arc<P>) {
        self.launchers
            .insert(scheme.to_ascii_lowercase(), Arc::new(Registered(protocol)));
    }

    pub(crate) fn get(&self, scheme: &str) -> Option<&Arc<dyn Launch>> {
        self.launchers.get(&scheme.to_ascii_lowercase())
    }

    pub(crate) fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.launchers.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}
