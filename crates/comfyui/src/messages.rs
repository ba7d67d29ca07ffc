//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module decodes them into a
//! strongly-typed [`ComfyUIMessage`] enum. Unknown kinds decode to
//! [`ComfyUIMessage::Other`] so newer servers never break the stream.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// All ComfyUI WebSocket message kinds the monitor understands.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    Executing(ExecutingData),

    /// Step progress from a long-running node (e.g. a sampler).
    Progress(ProgressData),

    /// Snapshot of per-node progress for one prompt.
    ProgressState(ProgressStateData),

    /// A node has finished and produced output.
    Executed(ExecutedData),

    /// The prompt finished successfully (newer servers).
    ExecutionSuccess(PromptRef),

    /// Execution failed with an error.
    ExecutionError(ErrorData),

    /// Execution was interrupted on the server.
    ExecutionInterrupted(InterruptedData),

    /// Any other message kind; carries the raw `type` tag.
    Other(String),
}

impl ComfyUIMessage {
    /// The prompt this message belongs to, if it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::ExecutionStart(d) | ComfyUIMessage::ExecutionSuccess(d) => {
                Some(&d.prompt_id)
            }
            ComfyUIMessage::ExecutionCached(d) => Some(&d.prompt_id),
            ComfyUIMessage::Executing(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::ProgressState(d) => Some(&d.prompt_id),
            ComfyUIMessage::Executed(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionError(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionInterrupted(d) => Some(&d.prompt_id),
            ComfyUIMessage::Status(_) | ComfyUIMessage::Other(_) => None,
        }
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only a prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: f64,
    pub max: f64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `progress_state` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressStateData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: NodeSnapshots,
}

/// `progress_state.nodes` arrives either as a list of entries or as an
/// object keyed by node id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeSnapshots {
    List(Vec<NodeSnapshot>),
    Map(BTreeMap<String, NodeSnapshot>),
}

impl Default for NodeSnapshots {
    fn default() -> Self {
        NodeSnapshots::List(Vec::new())
    }
}

impl NodeSnapshots {
    /// Flatten into `(node_id, snapshot)` pairs. List entries without a
    /// node id are dropped.
    pub fn into_entries(self) -> Vec<(String, NodeSnapshot)> {
        match self {
            NodeSnapshots::List(list) => list
                .into_iter()
                .filter_map(|snap| snap.node_id.clone().map(|id| (id, snap)))
                .collect(),
            NodeSnapshots::Map(map) => map
                .into_iter()
                .map(|(key, snap)| (snap.node_id.clone().unwrap_or(key), snap))
                .collect(),
        }
    }
}

/// Progress of one node inside a `progress_state` snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSnapshot {
    #[serde(default, alias = "nodeId")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Raw state string (`pending`, `running`, `finished`, `error`, ...).
    #[serde(default, alias = "status")]
    pub state: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: Option<String>,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Outer `{type, data}` envelope, decoded before the payload.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or a known `type` whose payload does
/// not match. Unknown `type` values yield [`ComfyUIMessage::Other`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, serde_json::Error> {
        serde_json::from_value(data)
    }

    let msg = match kind.as_str() {
        "status" => ComfyUIMessage::Status(payload(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(payload(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(payload(data)?),
        "executing" => ComfyUIMessage::Executing(payload(data)?),
        "progress" => ComfyUIMessage::Progress(payload(data)?),
        "progress_state" => ComfyUIMessage::ProgressState(payload(data)?),
        "executed" => ComfyUIMessage::Executed(payload(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(payload(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(payload(data)?),
        "execution_interrupted" => ComfyUIMessage::ExecutionInterrupted(payload(data)?),
        _ => ComfyUIMessage::Other(kind),
    };
    Ok(msg)
}
