//! Network transfers that can be paused, resumed and cancelled while they
//! run.
//!
//! [`DownloadManager::dispatch`] starts a transfer on its own worker and
//! returns a [`DownloadHandle`]. On pause, a source that supports ranged
//! resume lets the worker go and a new one continues from the current byte
//! offset on resume; any other source keeps its worker parked on the open
//! connection until the transfer is resumed or cancelled.

pub mod config;
pub mod downloader;
pub mod error;
pub mod handle;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod protocol;

pub use config::{ConfigError, ManagerConfig};
pub use downloader::TransferError;
pub use error::DownloadError;
pub use handle::DownloadHandle;
pub use manager::{DownloadManager, DownloadManagerBuilder};
pub use models::{DownloadStatus, HandleSnapshot, RequestSpec, RequestSpecBuilder};
pub use protocol::{Connection, HttpProtocol, Protocol};

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::error::DownloadError;
    pub use crate::handle::DownloadHandle;
    pub use crate::manager::DownloadManager;
    pub use crate::models::{DownloadStatus, HandleSnapshot, RequestSpec};
    pub use crate::protocol::{Connection, HttpProtocol, Protocol};
}
