//! Events broadcast by a monitoring session.
//!
//! Produced by the connection loop and the stream processor after
//! interpreting raw WebSocket messages. Subscribe through
//! [`MonitorSession::subscribe`](crate::session::MonitorSession::subscribe).

use dhgen_core::types::JobId;
use serde::Serialize;

use crate::progress::JobProgress;

/// A session-level event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// The WebSocket connection was established (or re-established).
    Connected { client_id: String },

    /// The WebSocket connection was lost.
    Disconnected { client_id: String },

    /// A watched job changed state without finishing.
    JobProgress {
        job_id: JobId,
        progress: JobProgress,
        /// The node currently executing, if known.
        current_node: Option<String>,
    },

    /// A watched job finished successfully.
    JobCompleted { job_id: JobId },

    /// A watched job failed.
    JobFailed {
        job_id: JobId,
        node_id: Option<String>,
        /// Human-readable error description.
        message: String,
    },
}

impl MonitorEvent {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            MonitorEvent::JobProgress { job_id, .. }
            | MonitorEvent::JobCompleted { job_id }
            | MonitorEvent::JobFailed { job_id, .. } => Some(job_id),
            MonitorEvent::Connected { .. } | MonitorEvent::Disconnected { .. } => None,
        }
    }
}
