// src/models.rs

use crate::error::DownloadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Connection timeout applied when the builder is not told otherwise.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(5000);

/// The status of a transfer.
///
/// `Finished`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    NotStarted,
    InProgress,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Finished | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadStatus::NotStarted => "not started",
            DownloadStatus::InProgress => "in progress",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Finished => "finished",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Immutable description of what to fetch and how.
///
/// Built once through [`RequestSpec::builder`] and shared read-only by every
/// task that works on the same transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    url: Url,
    connection_timeout: Duration,
    follow_redirects: bool,
    expected_sha256: Option<String>,
}

impl RequestSpec {
    pub fn builder(url: impl Into<String>) -> RequestSpecBuilder {
        RequestSpecBuilder {
            url: url.into(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            follow_redirects: false,
            expected_sha256: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Lower-case URL scheme used to pick the protocol hooks.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// Hex-encoded SHA-256 the finished content must match, if any.
    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }
}

/// Builder for [`RequestSpec`].
#[derive(Debug, Clone)]
pub struct RequestSpecBuilder {
    url: String,
    connection_timeout: Duration,
    follow_redirects: bool,
    expected_sha256: Option<String>,
}

impl RequestSpecBuilder {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Requires the finished content to hash to `digest` (hex, any case).
    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    /// Parses the URL and freezes the request.
    pub fn build(self) -> Result<RequestSpec, DownloadError> {
        let url = Url::parse(&self.url).map_err(|source| DownloadError::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;
        Ok(RequestSpec {
            url,
            connection_timeout: self.connection_timeout,
            follow_redirects: self.follow_redirects,
            expected_sha256: self.expected_sha256,
        })
    }
}

/// A point-in-time view of a transfer, taken under the handle's guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub id: u64,
    pub url: String,
    pub status: DownloadStatus,
    pub bytes_received: u64,
    /// Length announced by the source when the transfer first connected.
    pub content_length: Option<u64>,
    /// Reason recorded when the transfer failed.
    pub failure: Option<String>,
}

impl HandleSnapshot {
    /// Calculates download progress as a fraction from 0.0 to 1.0, if the
    /// total size is known.
    pub fn progress(&self) -> Option<f32> {
        match self.content_length {
            Some(total) if total > 0 => {
                Some((self.bytes_received as f32 / total as f32).min(1.0))
            }
            _ => None,
        }
    }
}
