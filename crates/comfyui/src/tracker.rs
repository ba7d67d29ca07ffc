//! Per-job state and the table the stream interpreter publishes into.
//!
//! Each watched job owns a [`tokio::sync::watch`] channel. The processor
//! task (and history resync) are the only writers; callers read
//! copy-on-read snapshots or await changes without ever blocking the
//! event path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use dhgen_core::types::{JobId, Timestamp};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::messages::ComfyUIMessage;
use crate::progress::{aggregate, JobProgress, NodeState, NodeStatus};

/// Message recorded for `execution_interrupted`.
pub const INTERRUPTED_MESSAGE: &str = "execution interrupted";

/// Job-level lifecycle. `Done` and `Errored` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Errored {
        node_id: Option<String>,
        message: String,
        exception_type: Option<String>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Errored { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Errored { .. } => "errored",
        }
    }
}

/// Progress observed for one node in one update.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeObservation {
    pub node_id: String,
    pub status: Option<NodeStatus>,
    pub value: Option<f64>,
    pub max: Option<f64>,
}

/// A state change derived from one stream message or history entry.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Started,
    NodeRunning { node_id: String },
    NodesDone { node_ids: Vec<String> },
    /// Step progress; without a node id it applies to the node currently
    /// executing.
    NodeProgress {
        node_id: Option<String>,
        value: f64,
        max: f64,
    },
    Snapshot { nodes: Vec<NodeObservation> },
    Finished,
    Failed {
        node_id: Option<String>,
        message: String,
        exception_type: Option<String>,
    },
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Nodes in discovery order of their ids. Entries are never removed.
    pub nodes: BTreeMap<String, NodeState>,
    pub current_node: Option<String>,
    pub updated_at: Timestamp,
}

impl JobState {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            nodes: BTreeMap::new(),
            current_node: None,
            updated_at: Utc::now(),
        }
    }

    pub fn progress(&self) -> JobProgress {
        aggregate(self.nodes.values())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn observe(
        &mut self,
        node_id: &str,
        status: Option<NodeStatus>,
        value: Option<f64>,
        max: Option<f64>,
    ) -> bool {
        let created = !self.nodes.contains_key(node_id);
        let node = self.nodes.entry(node_id.to_string()).or_default();
        node.observe(status, value, max) || created
    }

    fn mark_running(&mut self) -> bool {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
            true
        } else {
            false
        }
    }

    /// Fold one update into the state. Returns `true` when anything
    /// changed. Once terminal, every update is ignored.
    pub fn apply(&mut self, update: &JobUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }

        let changed = match update {
            JobUpdate::Started => self.mark_running(),
            JobUpdate::NodeRunning { node_id } => {
                // A re-delivered notice for a finished node is stale.
                if self.nodes.get(node_id).is_some_and(|n| n.status.is_terminal()) {
                    return false;
                }
                let mut changed = self.mark_running();
                // Nodes execute one at a time; a new node means the
                // previous one finished.
                match self.current_node.replace(node_id.clone()) {
                    Some(previous) if previous == *node_id => {}
                    Some(previous) => {
                        self.observe(&previous, Some(NodeStatus::Done), None, None);
                        changed = true;
                    }
                    None => changed = true,
                }
                changed |= self.observe(node_id, Some(NodeStatus::Running), None, None);
                changed
            }
            JobUpdate::NodesDone { node_ids } => {
                let mut changed = false;
                for node_id in node_ids {
                    changed |= self.observe(node_id, Some(NodeStatus::Done), None, None);
                }
                if changed {
                    self.mark_running();
                }
                changed
            }
            JobUpdate::NodeProgress {
                node_id,
                value,
                max,
            } => match node_id.clone().or_else(|| self.current_node.clone()) {
                Some(node_id) => {
                    let changed = self.observe(
                        &node_id,
                        Some(NodeStatus::Running),
                        Some(*value),
                        Some(*max),
                    );
                    changed | self.mark_running()
                }
                None => false,
            },
            JobUpdate::Snapshot { nodes } => {
                let mut changed = false;
                for obs in nodes {
                    changed |= self.observe(&obs.node_id, obs.status, obs.value, obs.max);
                }
                if self
                    .nodes
                    .values()
                    .any(|n| n.status != NodeStatus::Pending)
                {
                    changed |= self.mark_running();
                }
                changed
            }
            JobUpdate::Finished => {
                for node in self.nodes.values_mut() {
                    if !node.status.is_terminal() {
                        node.observe(Some(NodeStatus::Done), None, None);
                    }
                }
                self.current_node = None;
                self.status = JobStatus::Done;
                true
            }
            JobUpdate::Failed {
                node_id,
                message,
                exception_type,
            } => {
                if let Some(node_id) = node_id {
                    self.observe(node_id, Some(NodeStatus::Errored), None, None);
                }
                self.current_node = None;
                self.status = JobStatus::Errored {
                    node_id: node_id.clone(),
                    message: message.clone(),
                    exception_type: exception_type.clone(),
                };
                true
            }
        };

        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Classify a stream message. Returns the job it concerns and the update
/// to apply, or `None` when it carries nothing job-specific.
pub fn interpret(msg: ComfyUIMessage) -> Option<(JobId, JobUpdate)> {
    let (prompt_id, update) = match msg {
        ComfyUIMessage::ExecutionStart(data) => (data.prompt_id, JobUpdate::Started),
        ComfyUIMessage::ExecutionCached(data) => (
            data.prompt_id,
            JobUpdate::NodesDone {
                node_ids: data.nodes,
            },
        ),
        ComfyUIMessage::Executing(data) => {
            let prompt_id = data.prompt_id?;
            match data.node {
                Some(node_id) => (prompt_id, JobUpdate::NodeRunning { node_id }),
                None => (prompt_id, JobUpdate::Finished),
            }
        }
        ComfyUIMessage::Progress(data) => (
            data.prompt_id?,
            JobUpdate::NodeProgress {
                node_id: data.node,
                value: data.value,
                max: data.max,
            },
        ),
        ComfyUIMessage::ProgressState(data) => {
            let nodes = data
                .nodes
                .into_entries()
                .into_iter()
                .map(|(node_id, snap)| {
                    let status = snap.state.as_deref().and_then(NodeStatus::parse).or_else(|| {
                        snap.value
                            .filter(|v| *v > 0.0)
                            .map(|_| NodeStatus::Running)
                    });
                    NodeObservation {
                        node_id,
                        status,
                        value: snap.value,
                        max: snap.max,
                    }
                })
                .collect();
            (data.prompt_id, JobUpdate::Snapshot { nodes })
        }
        ComfyUIMessage::Executed(data) => (
            data.prompt_id,
            JobUpdate::NodesDone {
                node_ids: vec![data.node],
            },
        ),
        ComfyUIMessage::ExecutionSuccess(data) => (data.prompt_id, JobUpdate::Finished),
        ComfyUIMessage::ExecutionError(data) => (
            data.prompt_id,
            JobUpdate::Failed {
                node_id: data.node_id,
                message: data.exception_message,
                exception_type: data.exception_type,
            },
        ),
        ComfyUIMessage::ExecutionInterrupted(data) => (
            data.prompt_id,
            JobUpdate::Failed {
                node_id: data.node_id,
                message: INTERRUPTED_MESSAGE.to_string(),
                exception_type: None,
            },
        ),
        ComfyUIMessage::Status(_) | ComfyUIMessage::Other(_) => return None,
    };
    Some((JobId::new(prompt_id), update))
}

/// Finished jobs kept for late `progress`/`state` queries. The oldest
/// terminal entries are evicted beyond this.
const TERMINAL_RETENTION: usize = 64;

/// Updates for unwatched jobs held for a later `watch` or `rekey`.
const STRAY_CAPACITY: usize = 512;
const STRAY_RETENTION: Duration = Duration::from_secs(60);

/// An update that arrived before anyone watched its job, e.g. events for
/// a backend-assigned id racing the submission response.
struct StrayUpdate {
    job_id: JobId,
    update: JobUpdate,
    received: Instant,
}

/// Concurrency-safe map of watched jobs.
#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<JobId, watch::Sender<JobState>>>,
    stray: Mutex<VecDeque<StrayUpdate>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching a job (idempotent) and subscribe to its changes.
    /// Buffered updates for the job are replayed first.
    pub async fn watch(&self, job_id: &JobId) -> watch::Receiver<JobState> {
        if let Some(tx) = self.jobs.read().await.get(job_id) {
            return tx.subscribe();
        }
        let mut jobs = self.jobs.write().await;
        if let Some(tx) = jobs.get(job_id) {
            return tx.subscribe();
        }

        let tx = watch::channel(JobState::new(job_id.clone())).0;
        self.replay_stray(job_id, &tx);
        let rx = tx.subscribe();
        jobs.insert(job_id.clone(), tx);
        evict_terminal(&mut jobs);
        rx
    }

    pub async fn is_watched(&self, job_id: &JobId) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// Consistent copy of a job's current state.
    pub async fn snapshot(&self, job_id: &JobId) -> Option<JobState> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|tx| tx.borrow().clone())
    }

    /// Apply an update to a watched job. Returns the new state when it
    /// changed. Updates for unwatched jobs are buffered for a while and
    /// yield `None`, as do no-op updates.
    pub async fn apply(&self, job_id: &JobId, update: &JobUpdate) -> Option<JobState> {
        let jobs = self.jobs.read().await;
        let Some(tx) = jobs.get(job_id) else {
            // Pushed under the read lock so `watch`/`rekey` cannot miss it.
            self.push_stray(job_id, update);
            return None;
        };
        let mut changed = false;
        tx.send_if_modified(|state| {
            changed = state.apply(update);
            changed
        });
        changed.then(|| tx.borrow().clone())
    }

    /// Move a job to a new identifier, keeping existing subscribers, and
    /// replay updates that arrived under the new id. Returns the state
    /// when the replay changed it.
    pub async fn rekey(&self, from: &JobId, to: &JobId) -> Option<JobState> {
        let mut jobs = self.jobs.write().await;
        let tx = jobs.remove(from)?;
        tx.send_modify(|state| state.job_id = to.clone());
        let changed = self.replay_stray(to, &tx);
        let state = changed.then(|| tx.borrow().clone());
        jobs.insert(to.clone(), tx);
        state
    }

    /// Stop watching a job. Pending waiters observe a closed channel.
    pub async fn forget(&self, job_id: &JobId) {
        self.jobs.write().await.remove(job_id);
    }

    /// Watched jobs that have not reached a terminal state.
    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|(_, tx)| !tx.borrow().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn push_stray(&self, job_id: &JobId, update: &JobUpdate) {
        let mut stray = self.stray.lock().unwrap_or_else(PoisonError::into_inner);
        while stray
            .front()
            .is_some_and(|s| s.received.elapsed() > STRAY_RETENTION)
        {
            stray.pop_front();
        }
        if stray.len() == STRAY_CAPACITY {
            stray.pop_front();
        }
        stray.push_back(StrayUpdate {
            job_id: job_id.clone(),
            update: update.clone(),
            received: Instant::now(),
        });
    }

    /// Apply and drop buffered updates for `job_id`, in arrival order.
    fn replay_stray(&self, job_id: &JobId, tx: &watch::Sender<JobState>) -> bool {
        let mut stray = self.stray.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = false;
        stray.retain(|s| {
            if s.job_id != *job_id {
                return true;
            }
            if s.received.elapsed() <= STRAY_RETENTION {
                tx.send_if_modified(|state| {
                    let applied = state.apply(&s.update);
                    changed |= applied;
                    applied
                });
            }
            false
        });
        if changed {
            tracing::debug!(job_id = %job_id, "Replayed updates received before the job was watched");
        }
        changed
    }
}

/// Drop the least recently updated terminal jobs beyond the retention.
fn evict_terminal(jobs: &mut HashMap<JobId, watch::Sender<JobState>>) {
    let mut terminal: Vec<(Timestamp, JobId)> = jobs
        .iter()
        .filter_map(|(id, tx)| {
            let state = tx.borrow();
            state.is_terminal().then(|| (state.updated_at, id.clone()))
        })
        .collect();
    if terminal.len() <= TERMINAL_RETENTION {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - TERMINAL_RETENTION;
    for (_, id) in terminal.into_iter().take(excess) {
        jobs.remove(&id);
    }
}
