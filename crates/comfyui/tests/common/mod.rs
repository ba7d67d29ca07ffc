//! In-process fake ComfyUI backend (HTTP + WebSocket) for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Notify;

use dhgen_comfyui::config::{MonitorConfig, ReconnectPolicy};
use dhgen_comfyui::reconnect::ReconnectConfig;

/// Outbox marker: the server drops the socket without a close frame.
pub const DROP: &str = "__DROP__";

/// Placeholder replaced with the prompt id in scripted frames.
pub const PID: &str = "{pid}";

#[derive(Default)]
pub struct FakeState {
    /// Frames queued for every accepted prompt.
    pub script: Mutex<Vec<String>>,
    /// Frames waiting to be sent on the live socket.
    pub outbox: Mutex<VecDeque<String>>,
    pub notify: Notify,
    /// Bodies received on `POST /prompt`.
    pub prompts: Mutex<Vec<Value>>,
    /// `clientId` of every WebSocket connection.
    pub ws_clients: Mutex<Vec<String>>,
    pub ws_connections: AtomicUsize,
    /// Answer `/prompt` with this id instead of echoing the requested one.
    pub assigned_id: Mutex<Option<String>>,
    /// Reject prompts with these node errors.
    pub node_errors: Mutex<Option<Value>>,
    /// History entry returned for every accepted prompt once set.
    pub history_entry: Mutex<Option<Value>>,
    /// Answer `{}` to this many history queries first.
    pub history_empty_polls: AtomicUsize,
    pub history_polls: AtomicUsize,
    /// Downloadable files by name.
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<Vec<String>>,
    pub queue_running: Mutex<Vec<String>>,
    pub queue_pending: Mutex<Vec<String>>,
}

impl FakeState {
    /// Queue frames on the live socket right away.
    pub fn push_frames(&self, prompt_id: &str, frames: &[String]) {
        let mut outbox = self.outbox.lock().unwrap();
        for frame in frames {
            outbox.push_back(frame.replace(PID, prompt_id));
        }
        drop(outbox);
        self.notify.notify_one();
    }

    pub fn submitted_ids(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p["prompt_id"].as_str().map(str::to_string))
            .collect()
    }
}

pub struct FakeComfy {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeComfy {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/prompt", post(submit_prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/upload/image", post(upload))
            .route("/queue", get(queue))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Session config pointed at this server with test-friendly timings.
    pub fn config(&self) -> MonitorConfig {
        let mut config = MonitorConfig::for_server(&format!("http://{}", self.addr)).unwrap();
        config.wait_timeout = Duration::from_secs(10);
        config.history_attempts = 4;
        config.history_delay = Duration::from_millis(10);
        config.reconnect = ReconnectPolicy::Backoff(ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        });
        config
    }

    pub fn script(&self, frames: &[&str]) {
        *self.state.script.lock().unwrap() = frames.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_history(&self, entry: Value) {
        *self.state.history_entry.lock().unwrap() = Some(entry);
    }

    pub fn add_file(&self, name: &str, bytes: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
    }

    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }
}

/// A minimal template with the digital-human node layout.
pub fn digital_human_template() -> Value {
    json!({
        "1": {"class_type": "LoadAudio", "inputs": {"audio": "", "audioUI": ""}},
        "3": {"class_type": "TextInput", "inputs": {"multi_line_prompt": ""}},
        "5": {"class_type": "LoadImage", "inputs": {"video": ""}},
        "21": {"class_type": "Sampler", "inputs": {"positive_prompt": "", "negative_prompt": "", "temperature": 1.0}},
        "40": {"class_type": "VideoCombine", "inputs": {"frame_rate": 25}}
    })
}

pub fn frame(kind: &str, data: Value) -> String {
    json!({"type": kind, "data": data}).to_string()
}

// ---- handlers ----

async fn submit_prompt(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Json<Value> {
    let requested = body["prompt_id"].as_str().unwrap_or("generated-id").to_string();
    state.prompts.lock().unwrap().push(body);

    if let Some(errors) = state.node_errors.lock().unwrap().clone() {
        return Json(json!({"prompt_id": requested, "number": 0, "node_errors": errors}));
    }

    let prompt_id = state
        .assigned_id
        .lock()
        .unwrap()
        .clone()
        .unwrap_or(requested);
    let script = state.script.lock().unwrap().clone();
    state.push_frames(&prompt_id, &script);

    Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": {}}))
}

async fn history(State(state): State<Arc<FakeState>>, Path(prompt_id): Path<String>) -> Json<Value> {
    let poll = state.history_polls.fetch_add(1, Ordering::SeqCst);
    if poll < state.history_empty_polls.load(Ordering::SeqCst) {
        return Json(json!({}));
    }
    let mut body = serde_json::Map::new();
    if let Some(entry) = state.history_entry.lock().unwrap().clone() {
        body.insert(prompt_id, entry);
    }
    Json(Value::Object(body))
}

async fn view(
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let name = params.get("filename").cloned().unwrap_or_default();
    match state.files.lock().unwrap().get(&name) {
        Some(bytes) => (StatusCode::OK, bytes.clone()),
        None => (StatusCode::NOT_FOUND, b"not found".to_vec()),
    }
}

async fn upload(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Json<Value> {
    let mut name = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            name = field.file_name().map(str::to_string);
            let _ = field.bytes().await.unwrap();
        }
    }
    let name = name.unwrap_or_else(|| "upload".into());
    state.uploads.lock().unwrap().push(name.clone());
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

fn queue_entries(ids: &[String]) -> Vec<Value> {
    ids.iter()
        .enumerate()
        .map(|(n, id)| json!([n, id, {}]))
        .collect()
}

async fn queue(State(state): State<Arc<FakeState>>) -> Json<Value> {
    let running = queue_entries(&state.queue_running.lock().unwrap());
    let pending = queue_entries(&state.queue_pending.lock().unwrap());
    Json(json!({"queue_running": running, "queue_pending": pending}))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<FakeState>>,
) -> impl IntoResponse {
    let client_id = params.get("clientId").cloned().unwrap_or_default();
    state.ws_clients.lock().unwrap().push(client_id);
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| stream_frames(socket, state))
}

/// Drain the outbox onto the socket until it is dropped or closed.
async fn stream_frames(mut socket: WebSocket, state: Arc<FakeState>) {
    loop {
        let next = state.outbox.lock().unwrap().pop_front();
        match next {
            Some(frame) if frame == DROP => return,
            Some(frame) => {
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            None => {
                tokio::select! {
                    _ = state.notify.notified() => {}
                    msg = socket.recv() => match msg {
                        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                        Some(Ok(_)) => {}
                    },
                }
            }
        }
    }
}
