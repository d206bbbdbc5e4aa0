// src/error.rs

use crate::models::DownloadStatus;
use thiserror::Error;

/// Errors surfaced synchronously to the caller by dispatch and by the
/// control operations on a handle.
///
/// Faults that happen while bytes are moving never show up here; they are
/// absorbed into [`DownloadStatus::Failed`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("cannot {operation} a download that is {status}")]
    InvalidState {
        operation: &'static str,
        status: DownloadStatus,
    },
    #[error("no protocol registered for scheme `{0}`")]
    UnsupportedProtocol(String),
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("download manager is shut down")]
    ShutDown,
    #[error("no tokio runtime available to run transfers")]
    NoRuntime,
}

impl DownloadError {
    pub(crate) fn invalid_state(operation: &'static str, status: DownloadStatus) -> Self {
        DownloadError::InvalidState { operation, status }
    }
}
