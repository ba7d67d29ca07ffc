//! Completion detection.
//!
//! [`wait_for_terminal`] blocks until a watched job reaches `done` or
//! `errored`, the deadline passes, the caller cancels, or the
//! connection is declared lost. Neither timing out nor cancelling
//! touches the remote job; the same JobId can be waited on again.

use std::time::Duration;

use dhgen_core::types::JobId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::MonitorError;
use crate::tracker::{JobState, JobStatus};

/// Health of the session's WebSocket link, as seen by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection has been attempted yet.
    Idle,
    Connected,
    /// Dropped; the reconnect policy is retrying.
    Reconnecting,
    /// Dropped and the reconnect policy gave up.
    Lost,
}

/// Wait until `job` reaches a terminal state.
///
/// A terminal state always wins over a lost link, so a completion that
/// was recorded before the drop is still reported.
pub async fn wait_for_terminal(
    job_id: &JobId,
    mut job: watch::Receiver<JobState>,
    mut link: watch::Receiver<LinkState>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<JobState, MonitorError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        {
            let state = job.borrow_and_update();
            match &state.status {
                JobStatus::Done => return Ok(state.clone()),
                JobStatus::Errored {
                    node_id,
                    message,
                    exception_type,
                } => {
                    return Err(MonitorError::RemoteExecution {
                        job_id: job_id.clone(),
                        node_id: node_id.clone(),
                        message: message.clone(),
                        exception_type: exception_type.clone(),
                    })
                }
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        if *link.borrow_and_update() == LinkState::Lost {
            return Err(MonitorError::ConnectionLost {
                job_id: job_id.clone(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, "Wait cancelled by caller");
                return Err(MonitorError::Cancelled { job_id: job_id.clone() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Timed out waiting for job");
                return Err(MonitorError::Timeout { job_id: job_id.clone(), timeout });
            }
            changed = job.changed() => {
                if changed.is_err() {
                    // The session stopped watching this job.
                    return Err(MonitorError::ConnectionLost { job_id: job_id.clone() });
                }
            }
            changed = link.changed() => {
                if changed.is_err() {
                    return Err(MonitorError::ConnectionLost { job_id: job_id.clone() });
                }
            }
        }
    }
}
