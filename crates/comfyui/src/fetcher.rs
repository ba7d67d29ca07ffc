//! Result retrieval: history lookup, artifact extraction, download.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dhgen_core::error::CoreError;
use dhgen_core::media::MediaKind;
use dhgen_core::naming::unique_destination;
use dhgen_core::types::JobId;
use serde_json::Value;

use crate::api::ComfyUIApi;
use crate::error::{DownloadError, MonitorError};
use crate::tracker::{JobUpdate, INTERRUPTED_MESSAGE};

/// History output keys, in the order artifacts are reported per node.
const OUTPUT_KEYS: &[(&str, MediaKind)] = &[
    ("videos", MediaKind::Video),
    // Video-combine nodes report their mp4 outputs under `gifs`.
    ("gifs", MediaKind::Video),
    ("audios", MediaKind::Audio),
    ("audio", MediaKind::Audio),
    ("images", MediaKind::Image),
];

/// One produced file as listed in a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub node_id: String,
    pub kind: MediaKind,
    /// Backend-provided file name.
    pub filename: String,
    pub subfolder: String,
    /// Backend folder type (`output`, `temp`, ...).
    pub folder_type: String,
}

/// A produced file resolved to a retrieval URI and, once downloaded,
/// its local path.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub file: OutputFile,
    pub uri: String,
    pub local_path: Option<PathBuf>,
}

impl Artifact {
    pub fn kind(&self) -> MediaKind {
        self.file.kind
    }

    pub fn filename(&self) -> &str {
        &self.file.filename
    }
}

/// Ordered artifacts of one job plus the downloads that failed.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub items: Vec<Artifact>,
    pub failures: Vec<DownloadError>,
}

impl Artifacts {
    /// `true` when no download failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Artifact> {
        self.items.iter()
    }
}

fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// List every media file in a history entry's `outputs`.
///
/// Nodes are visited in numeric-aware id order; within a node the keys
/// follow [`OUTPUT_KEYS`]; within a key, list order is kept. Entries
/// without a file name are skipped.
pub fn extract_outputs(entry: &Value) -> Vec<OutputFile> {
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut node_ids: Vec<&String> = outputs.keys().collect();
    node_ids.sort_by(|a, b| compare_node_ids(a, b));

    let mut files = Vec::new();
    for node_id in node_ids {
        let node_output = &outputs[node_id.as_str()];
        for (key, kind) in OUTPUT_KEYS {
            let Some(list) = node_output.get(*key).and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                files.push(OutputFile {
                    node_id: node_id.clone(),
                    kind: *kind,
                    filename: filename.to_string(),
                    subfolder: item
                        .get("subfolder")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    folder_type: item
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("output")
                        .to_string(),
                });
            }
        }
    }
    files
}

/// Terminal outcome recorded in a history entry.
///
/// A prompt only appears in history once execution stopped, so an entry
/// without an error status counts as finished.
pub fn history_outcome(entry: &Value) -> JobUpdate {
    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str)
        .unwrap_or("success");
    if status_str != "error" {
        return JobUpdate::Finished;
    }

    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let find = |name: &str| {
        messages.iter().find_map(|m| {
            let pair = m.as_array()?;
            (pair.first()?.as_str()? == name).then(|| pair.get(1).cloned().unwrap_or_default())
        })
    };
    let text = |data: &Value, key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

    if let Some(data) = find("execution_error") {
        JobUpdate::Failed {
            node_id: text(&data, "node_id"),
            message: text(&data, "exception_message").unwrap_or_else(|| "execution failed".into()),
            exception_type: text(&data, "exception_type"),
        }
    } else if let Some(data) = find("execution_interrupted") {
        JobUpdate::Failed {
            node_id: text(&data, "node_id"),
            message: INTERRUPTED_MESSAGE.to_string(),
            exception_type: None,
        }
    } else {
        JobUpdate::Failed {
            node_id: None,
            message: "execution failed".into(),
            exception_type: None,
        }
    }
}

/// Queries history for finished jobs and downloads their outputs.
#[derive(Debug, Clone)]
pub struct ResultFetcher {
    api: ComfyUIApi,
    attempts: u32,
    delay: Duration,
}

impl ResultFetcher {
    /// * `attempts` - history queries before `ResultNotFound` (at least 1).
    /// * `delay`    - base delay; attempt `n` waits `delay * n` before the next.
    pub fn new(api: ComfyUIApi, attempts: u32, delay: Duration) -> Self {
        Self {
            api,
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Single history query, no retry.
    pub async fn lookup(&self, job_id: &JobId) -> Result<Option<Value>, MonitorError> {
        Ok(self.api.get_history(job_id.as_str()).await?)
    }

    /// History entry for `job_id`, retried while the backend has not
    /// published it yet.
    pub async fn history_entry(&self, job_id: &JobId) -> Result<Value, MonitorError> {
        for attempt in 1..=self.attempts {
            if let Some(entry) = self.lookup(job_id).await? {
                return Ok(entry);
            }
            tracing::debug!(job_id = %job_id, attempt, "History not available yet");
            if attempt < self.attempts {
                tokio::time::sleep(self.delay * attempt).await;
            }
        }
        Err(MonitorError::ResultNotFound {
            job_id: job_id.clone(),
            attempts: self.attempts,
        })
    }

    /// Resolve the artifacts of a finished job and, when `dest` is given,
    /// download each into it. A job whose history records a failure
    /// yields [`MonitorError::RemoteExecution`].
    ///
    /// Individual download failures do not stop the remaining downloads;
    /// they are collected in [`Artifacts::failures`].
    pub async fn fetch(&self, job_id: &JobId, dest: Option<&Path>) -> Result<Artifacts, MonitorError> {
        let entry = self.history_entry(job_id).await?;
        if let JobUpdate::Failed {
            node_id,
            message,
            exception_type,
        } = history_outcome(&entry)
        {
            return Err(MonitorError::RemoteExecution {
                job_id: job_id.clone(),
                node_id,
                message,
                exception_type,
            });
        }
        let files = extract_outputs(&entry);
        tracing::info!(job_id = %job_id, count = files.len(), "Resolved job artifacts");

        if let Some(dir) = dest {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CoreError::io(dir, e))?;
        }

        let mut artifacts = Artifacts::default();
        for file in files {
            let uri = match self.api.view_url(&file.filename, &file.subfolder, &file.folder_type) {
                Ok(url) => url,
                Err(e) => {
                    artifacts.failures.push(DownloadError {
                        filename: file.filename.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let local_path = match dest {
                None => None,
                Some(dir) => match self.download(&file, uri.clone(), dir).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Artifact download failed");
                        artifacts.failures.push(e);
                        continue;
                    }
                },
            };

            artifacts.items.push(Artifact {
                file,
                uri: uri.to_string(),
                local_path,
            });
        }
        Ok(artifacts)
    }

    async fn download(
        &self,
        file: &OutputFile,
        uri: reqwest::Url,
        dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        let failed = |reason: String| DownloadError {
            filename: file.filename.clone(),
            reason,
        };

        let bytes = self.api.download(uri).await.map_err(|e| failed(e.to_string()))?;
        let path = unique_destination(dir, &file.filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| failed(format!("cannot write {}: {e}", path.display())))?;

        tracing::info!(
            filename = %file.filename,
            path = %path.display(),
            size = bytes.len(),
            "Downloaded artifact",
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outputs_are_ordered_and_classified() {
        let entry = json!({
            "outputs": {
                "12": {"images": [{"filename": "frame.png", "subfolder": "", "type": "temp"}]},
                "9": {
                    "images": [{"filename": "still.png"}],
                    "audio": [{"filename": "voice.flac", "type": "output"}],
                    "gifs": [{"filename": "talk_00001.mp4", "subfolder": "vid", "type": "output"}]
                },
                "final": {"videos": [{"filename": "x.mp4"}, {"subfolder": "nameless"}]}
            }
        });

        let files = extract_outputs(&entry);
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(
            names,
            vec!["talk_00001.mp4", "voice.flac", "still.png", "frame.png", "x.mp4"]
        );
        assert_eq!(files[0].kind, MediaKind::Video);
        assert_eq!(files[0].subfolder, "vid");
        assert_eq!(files[1].kind, MediaKind::Audio);
        assert_eq!(files[2].kind, MediaKind::Image);
        assert_eq!(files[2].folder_type, "output");
        assert_eq!(files[3].folder_type, "temp");
    }

    #[test]
    fn empty_outputs_yield_no_files() {
        assert!(extract_outputs(&json!({"outputs": {}})).is_empty());
        assert!(extract_outputs(&json!({"status": {}})).is_empty());
        assert!(extract_outputs(&json!({"outputs": {"3": {"text": ["hi"]}}})).is_empty());
    }

    #[test]
    fn history_outcome_success_and_errors() {
        assert_eq!(
            history_outcome(&json!({"status": {"status_str": "success", "completed": true}})),
            JobUpdate::Finished
        );
        assert_eq!(history_outcome(&json!({"outputs": {}})), JobUpdate::Finished);

        let failed = json!({"status": {"status_str": "error", "completed": false, "messages": [
            ["execution_start", {"prompt_id": "p"}],
            ["execution_error", {"prompt_id": "p", "node_id": "21", "exception_message": "OOM", "exception_type": "RuntimeError"}]
        ]}});
        assert_eq!(
            history_outcome(&failed),
            JobUpdate::Failed {
                node_id: Some("21".into()),
                message: "OOM".into(),
                exception_type: Some("RuntimeError".into()),
            }
        );

        let interrupted = json!({"status": {"status_str": "error", "messages": [
            ["execution_interrupted", {"prompt_id": "p", "node_id": "4"}]
        ]}});
        assert_eq!(
            history_outcome(&interrupted),
            JobUpdate::Failed {
                node_id: Some("4".into()),
                message: INTERRUPTED_MESSAGE.into(),
                exception_type: None,
            }
        );
    }

    #[test]
    fn numeric_aware_node_order() {
        let mut ids = vec!["10", "2", "b", "1", "a"];
        ids.sort_by(|a, b| compare_node_ids(a, b));
        assert_eq!(ids, vec!["1", "2", "10", "a", "b"]);
    }
}
