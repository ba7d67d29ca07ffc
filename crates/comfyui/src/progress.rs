//! Per-node progress state and the aggregate progress computation.
//!
//! Node sets are discovered dynamically, so the aggregate is the mean of
//! each known node's own fraction. When a new node shows up mid-run the
//! denominator grows and the aggregate can dip. That dip is reported as
//! is, never smoothed.

use serde::Serialize;

/// Lifecycle of one node. Transitions only move forward:
/// `Pending -> Running -> {Done, Errored}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Done,
    Errored,
}

impl NodeStatus {
    fn rank(self) -> u8 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Running => 1,
            NodeStatus::Done | NodeStatus::Errored => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Errored)
    }

    /// Map a backend state string onto a status. Unknown strings yield
    /// `None` so the caller can fall back to inference.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "waiting" => Some(NodeStatus::Pending),
            "running" | "executing" | "in_progress" => Some(NodeStatus::Running),
            "finished" | "done" | "completed" | "success" | "cached" => Some(NodeStatus::Done),
            "error" | "errored" | "failed" => Some(NodeStatus::Errored),
            _ => None,
        }
    }
}

/// Progress of one node within a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    /// Monotonic work counter.
    pub value: Option<f64>,
    /// Expected total; may be refined mid-run.
    pub max: Option<f64>,
}

impl NodeState {
    /// Fold one observation into the node. Returns `true` when anything
    /// changed.
    ///
    /// A status that would move the node backward is discarded, as is a
    /// `value` lower than the one already recorded. `max` is accepted
    /// whenever it differs.
    pub fn observe(
        &mut self,
        status: Option<NodeStatus>,
        value: Option<f64>,
        max: Option<f64>,
    ) -> bool {
        let mut changed = false;

        if let Some(next) = status {
            if !self.status.is_terminal() && next.rank() > self.status.rank() {
                self.status = next;
                changed = true;
            }
        }

        if let Some(max) = max.filter(|m| m.is_finite()) {
            if self.max != Some(max) {
                self.max = Some(max);
                changed = true;
            }
        }

        if let Some(value) = value.filter(|v| v.is_finite()) {
            if self.value.map_or(true, |current| value > current) {
                self.value = Some(value);
                changed = true;
            }
        }

        changed
    }

    /// This node's contribution to the aggregate, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        match self.status {
            NodeStatus::Done | NodeStatus::Errored => 1.0,
            NodeStatus::Pending => 0.0,
            NodeStatus::Running => match (self.value, self.max) {
                (Some(value), Some(max)) if max > 0.0 => (value / max).clamp(0.0, 1.0),
                _ => 0.0,
            },
        }
    }
}

/// Derived progress of a job over all of its known nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JobProgress {
    /// Completion fraction in `[0, 1]`.
    pub fraction: f64,
    pub completed: usize,
    pub running: usize,
    pub pending: usize,
    pub errored: usize,
    pub total: usize,
}

impl JobProgress {
    pub fn percent(&self) -> f64 {
        self.fraction * 100.0
    }
}

/// Aggregate node states into a single [`JobProgress`].
///
/// Errored nodes count as complete for the fraction but are reported in
/// `errored`, not `completed`. An empty node set yields `0.0`.
pub fn aggregate<'a, I>(nodes: I) -> JobProgress
where
    I: IntoIterator<Item = &'a NodeState>,
{
    let mut progress = JobProgress::default();
    let mut sum = 0.0;

    for node in nodes {
        progress.total += 1;
        sum += node.fraction();
        match node.status {
            NodeStatus::Pending => progress.pending += 1,
            NodeStatus::Running => progress.running += 1,
            NodeStatus::Done => progress.completed += 1,
            NodeStatus::Errored => progress.errored += 1,
        }
    }

    if progress.total > 0 {
        progress.fraction = (sum / progress.total as f64).clamp(0.0, 1.0);
    }
    progress
}
