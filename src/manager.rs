// src/manager.rs

use crate::config::ManagerConfig;
use crate::error::DownloadError;
use crate::handle::{DownloadHandle, Redispatch};
use crate::models::RequestSpec;
use crate::protocol::{HttpProtocol, Protocol, ProtocolRegistry};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle as RuntimeHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The worker substrate: spawns transfer tasks on demand and keeps track of
/// them. Holds no per-transfer state.
pub(crate) struct Workers {
    runtime: RuntimeHandle,
    tracker: TaskTracker,
    interrupt: CancellationToken,
    config: Arc<ManagerConfig>,
}

impl Workers {
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.runtime);
    }

    pub(crate) fn config(&self) -> Arc<ManagerConfig> {
        Arc::clone(&self.config)
    }

    pub(crate) fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }
}

struct ManagerInner {
    protocols: ProtocolRegistry,
    workers: Workers,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

impl Redispatch for ManagerInner {
    fn redispatch(&self, handle: &DownloadHandle) -> Result<(), DownloadError> {
        let scheme = handle.spec().scheme();
        let launcher = self
            .protocols
            .get(scheme)
            .ok_or_else(|| DownloadError::UnsupportedProtocol(scheme.to_string()))?;
        tracing::debug!(id = handle.id(), "Redispatching transfer");
        launcher.launch(handle.clone(), &self.workers);
        Ok(())
    }
}

/// Starts transfers and hands out their handles.
///
/// Every transfer runs on its own worker task; there is no queue and no
/// limit on how many run at once.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// A manager for `http` and `https` on the current tokio runtime.
    pub fn new() -> Result<Self, DownloadError> {
        let http = HttpProtocol::default();
        Self::builder()
            .register("http", http.clone())
            .register("https", http)
            .build()
    }

    pub fn builder() -> DownloadManagerBuilder {
        DownloadManagerBuilder::default()
    }

    /// Starts fetching `spec` and returns its handle.
    ///
    /// Fails before any worker is spent if the URL scheme has no registered
    /// protocol or the manager has been shut down.
    pub fn dispatch(&self, spec: RequestSpec) -> Result<DownloadHandle, DownloadError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(DownloadError::ShutDown);
        }
        let launcher = self
            .inner
            .protocols
            .get(spec.scheme())
            .ok_or_else(|| DownloadError::UnsupportedProtocol(spec.scheme().to_string()))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::info!(id, url = %spec.url(), "Dispatching transfer");
        let manager: Arc<dyn Redispatch> = self.inner.clone();
        let handle = DownloadHandle::new(id, Arc::new(spec), manager);
        launcher.launch(handle.clone(), &self.inner.workers);
        Ok(handle)
    }

    /// Stops accepting new dispatches. Running transfers carry on, and
    /// paused ones can still be resumed.
    pub fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!(active = self.active_workers(), "Download manager shutting down");
        }
        self.inner.workers.tracker.close();
    }

    /// Shuts down and interrupts every worker. Interrupted transfers end up
    /// `Failed`, keeping whatever they had collected.
    pub fn shutdown_now(&self) {
        self.shutdown();
        self.inner.workers.interrupt.cancel();
    }

    /// Waits until every worker has exited. Only returns after
    /// [`shutdown`](Self::shutdown) or [`shutdown_now`](Self::shutdown_now).
    pub async fn join(&self) {
        self.inner.workers.tracker.wait().await;
    }

    pub fn is_shut_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Number of workers currently running a transfer, parked ones included.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.tracker.len()
    }

    pub fn schemes(&self) -> Vec<String> {
        self.inner.protocols.schemes()
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager")
            .field("schemes", &self.schemes())
            .field("active_workers", &self.active_workers())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builder for [`DownloadManager`].
#[derive(Default)]
pub struct DownloadManagerBuilder {
    protocols: ProtocolRegistry,
    config: ManagerConfig,
    runtime: Option<RuntimeHandle>,
}

impl DownloadManagerBuilder {
    /// Registers `protocol` for URLs with the given scheme, replacing any
    /// previous registration.
    pub fn register<P: Protocol>(mut self, scheme: &str, protocol: P) -> Self {
        self.protocols.register(scheme, Arc::new(protocol));
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime the workers are spawned on. Defaults to the current one.
    pub fn runtime(mut self, runtime: RuntimeHandle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<DownloadManager, DownloadError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => RuntimeHandle::try_current().map_err(|_| DownloadError::NoRuntime)?,
        };
        tracing::debug!(schemes = ?self.protocols.schemes(), "Download manager ready");
        Ok(DownloadManager {
            inner: Arc::new(ManagerInner {
                protocols: self.protocols,
                workers: Workers {
                    runtime,
                    tracker: TaskTracker::new(),
                    interrupt: CancellationToken::new(),
                    config: Arc::new(self.config),
                },
                accepting: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        })
    }
}
