//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, asset upload,
//! history retrieval, artifact download, queue inspection) using
//! [`reqwest`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Identifier of the queued prompt (echoes a caller-chosen id).
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors. Non-empty means the prompt was not queued.
    #[serde(default)]
    pub node_errors: serde_json::Map<String, serde_json::Value>,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Response of `GET /queue`. Each entry is `[number, prompt_id, ...]`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub queue_pending: Vec<Vec<serde_json::Value>>,
}

impl QueueSnapshot {
    fn contains(entries: &[Vec<serde_json::Value>], prompt_id: &str) -> bool {
        entries
            .iter()
            .any(|item| item.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        Self::contains(&self.queue_running, prompt_id)
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        Self::contains(&self.queue_pending, prompt_id)
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// ComfyUI accepted the request but refused the workflow.
    #[error("Workflow rejected: {0}")]
    NodeErrors(String),

    /// A 2xx response whose body did not have the expected shape.
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    /// A local file could not be read.
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client whose requests time out after `timeout`.
    pub fn with_timeout(api_url: String, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api_url })
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the workflow JSON, the
    /// session's client ID and, when given, a caller-chosen prompt ID.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        prompt_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let mut body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        if let Some(prompt_id) = prompt_id {
            body["prompt_id"] = serde_json::Value::String(prompt_id.to_string());
        }

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if !submitted.node_errors.is_empty() {
            let detail = serde_json::Value::Object(submitted.node_errors).to_string();
            return Err(ComfyUIApiError::NodeErrors(detail));
        }
        Ok(submitted)
    }

    /// Upload a local file as an input asset.
    ///
    /// Sends a multipart `POST /upload/image` (ComfyUI uses this endpoint
    /// for every input kind). Returns the name under which the server
    /// stored the file; that name is the asset identifier to place in a
    /// workflow.
    pub async fn upload_asset(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComfyUIApiError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        tracing::info!(path = %path.display(), size = bytes.len(), "Uploading asset to ComfyUI");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("subfolder", "");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let uploaded: UploadResponse = Self::parse_response(response).await?;
        match uploaded.name {
            Some(name) => Ok(name),
            None => Err(ComfyUIApiError::InvalidResponse(format!(
                "upload of '{file_name}' returned no name: {}",
                uploaded.error.unwrap_or_else(|| "unknown error".into())
            ))),
        }
    }

    /// Retrieve the history entry for one prompt.
    ///
    /// Sends a `GET /history/{prompt_id}`. Returns `None` while ComfyUI
    /// has no record of the prompt (it answers with `{}`).
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<serde_json::Value>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut body: serde_json::Value = Self::parse_response(response).await?;
        Ok(body
            .as_object_mut()
            .and_then(|entries| entries.remove(prompt_id)))
    }

    /// Inspect the execution queue (`GET /queue`).
    pub async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieval URI of an output file (`GET /view`).
    pub fn view_url(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<reqwest::Url, ComfyUIApiError> {
        reqwest::Url::parse_with_params(
            &format!("{}/view", self.api_url),
            &[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ],
        )
        .map_err(|e| ComfyUIApiError::InvalidResponse(format!("bad view URL: {e}")))
    }

    /// Download the raw bytes behind a retrieval URI.
    pub async fn download(&self, url: reqwest::Url) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ComfyUIApiError::InvalidResponse(format!("{e}: {text}")))
    }
}
