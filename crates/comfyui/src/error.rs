//! Error taxonomy of the monitoring subsystem.
//!
//! Every public operation of [`MonitorSession`](crate::session::MonitorSession)
//! fails with a [`MonitorError`]. Lower layers have their own error enums
//! ([`ComfyUIClientError`], [`ComfyUIApiError`]) which convert into it.

use std::time::Duration;

use dhgen_core::error::CoreError;
use dhgen_core::types::JobId;

use crate::api::ComfyUIApiError;
use crate::client::ComfyUIClientError;

/// One artifact that could not be retrieved.
///
/// Never fatal on its own: the fetcher collects these next to the
/// artifacts that did succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to download '{filename}': {reason}")]
pub struct DownloadError {
    pub filename: String,
    pub reason: String,
}

/// Errors surfaced by the monitor facade.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Dial or handshake failure. Fatal to the session.
    #[error("Connection error: {0}")]
    Connection(#[from] ComfyUIClientError),

    /// The descriptor was rejected (unknown key, unuploaded asset,
    /// backend-side validation). Never retried.
    #[error("Submission rejected: {0}")]
    Submission(String),

    /// The submission or history endpoint could not be reached or
    /// answered with a server error.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The wait deadline passed. The remote job keeps running.
    #[error("Timed out after {}s waiting for job {job_id}", timeout.as_secs())]
    Timeout { job_id: JobId, timeout: Duration },

    /// A node reported failure.
    #[error("Job {job_id} failed at node {}: {message}", node_id.as_deref().unwrap_or("<unknown>"))]
    RemoteExecution {
        job_id: JobId,
        node_id: Option<String>,
        message: String,
        exception_type: Option<String>,
    },

    /// History had no entry for the job after every retry.
    #[error("No history for job {job_id} after {attempts} attempts")]
    ResultNotFound { job_id: JobId, attempts: u32 },

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The stream dropped and the reconnect policy gave up.
    #[error("Connection lost while monitoring job {job_id}")]
    ConnectionLost { job_id: JobId },

    /// The caller detached the waiter.
    #[error("Wait for job {job_id} was cancelled")]
    Cancelled { job_id: JobId },

    #[error(transparent)]
    Core(CoreError),
}

impl MonitorError {
    /// Whether the caller may retry with the same JobId without
    /// resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MonitorError::Timeout { .. }
                | MonitorError::ResultNotFound { .. }
                | MonitorError::BackendUnavailable(_)
                | MonitorError::ConnectionLost { .. }
        )
    }
}

impl From<ComfyUIApiError> for MonitorError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::NodeErrors(detail) => MonitorError::Submission(detail),
            ComfyUIApiError::ApiError { status: 400, body } => MonitorError::Submission(body),
            io @ ComfyUIApiError::Io { .. } => MonitorError::Submission(io.to_string()),
            other => MonitorError::BackendUnavailable(other.to_string()),
        }
    }
}

/// A descriptor that fails validation is a rejected submission; other
/// core failures (I/O, config) pass through.
impl From<CoreError> for MonitorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => MonitorError::Submission(msg),
            other => MonitorError::Core(other),
        }
    }
}
