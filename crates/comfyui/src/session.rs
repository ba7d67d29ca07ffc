//! Monitoring session: the facade over the whole subsystem.
//!
//! A [`MonitorSession`] owns one client id, one lazily-opened WebSocket
//! connection with its processing task, and the table of watched jobs.
//! Every operation keys on [`JobId`], never on the connection, so waits
//! survive reconnects and a timed-out job can be monitored again later.
//!
//! Events are broadcast via a [`tokio::sync::broadcast`] channel. Call
//! [`MonitorSession::subscribe`] to receive them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dhgen_core::types::{new_client_id, JobId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::config::{MonitorConfig, ReconnectPolicy};
use crate::error::MonitorError;
use crate::events::MonitorEvent;
use crate::fetcher::{history_outcome, Artifacts, ResultFetcher};
use crate::processor::{process_messages, publish_state, StreamEnd};
use crate::progress::JobProgress;
use crate::reconnect::reconnect_loop;
use crate::tracker::{JobState, JobTable, JobUpdate};
use crate::waiter::{wait_for_terminal, LinkState};
use crate::workflow::{DigitalHumanBindings, DigitalHumanRequest, JobDescriptor, WorkflowTemplate};

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long [`MonitorSession::shutdown`] waits for the connection task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by [`MonitorSession::run_and_wait`] and
/// [`MonitorSession::monitor`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Completion timeout; the session default when `None`.
    pub timeout: Option<Duration>,
    /// Download artifacts here. `None` only resolves their URIs.
    pub output_dir: Option<PathBuf>,
    /// Detaches the waiter when cancelled. The remote job is untouched.
    pub cancel: Option<CancellationToken>,
}

/// Where a job currently is on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLocation {
    /// In history. `error` is set when execution failed.
    Finished { error: Option<String> },
    Running,
    Pending,
    NotFound,
}

/// One monitoring session against one ComfyUI server.
pub struct MonitorSession {
    client_id: String,
    config: MonitorConfig,
    client: ComfyUIClient,
    api: ComfyUIApi,
    fetcher: ResultFetcher,
    table: Arc<JobTable>,
    event_tx: broadcast::Sender<MonitorEvent>,
    link_tx: Arc<watch::Sender<LinkState>>,
    uploaded: Mutex<HashSet<String>>,
    connection: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
}

/// Everything the connection task needs, owned.
struct ConnectionContext {
    client: ComfyUIClient,
    client_id: String,
    policy: ReconnectPolicy,
    fetcher: ResultFetcher,
    table: Arc<JobTable>,
    event_tx: broadcast::Sender<MonitorEvent>,
    link_tx: Arc<watch::Sender<LinkState>>,
    cancel: CancellationToken,
}

impl MonitorSession {
    /// Create a session with a fresh client id. Nothing is dialed until
    /// the first operation that needs the stream.
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        let client = ComfyUIClient::new(config.ws_url.clone(), config.api_url.clone())
            .with_dial_timeout(config.dial_timeout);
        let api = ComfyUIApi::with_timeout(config.api_url.clone(), config.request_timeout)?;
        let fetcher = ResultFetcher::new(api.clone(), config.history_attempts, config.history_delay);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_tx, _) = watch::channel(LinkState::Idle);

        Ok(Self {
            client_id: new_client_id(),
            config,
            client,
            api,
            fetcher,
            table: Arc::new(JobTable::new()),
            event_tx,
            link_tx: Arc::new(link_tx),
            uploaded: Mutex::new(HashSet::new()),
            connection: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current health of the WebSocket link.
    pub fn link_state(&self) -> LinkState {
        *self.link_tx.borrow()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Open the WebSocket connection and start the processing task.
    ///
    /// Idempotent while the connection task is alive. A failed dial is
    /// returned as [`MonitorError::Connection`] and not retried.
    pub async fn connect(&self) -> Result<(), MonitorError> {
        if self.cancel.is_cancelled() {
            return Err(ComfyUIClientError::Connection("session is shut down".into()).into());
        }

        let mut task = self.connection.lock().await;
        let alive = task.as_ref().is_some_and(|handle| !handle.is_finished())
            && self.link_state() != LinkState::Lost;
        if alive {
            return Ok(());
        }

        let conn = self.client.connect(&self.client_id).await?;
        self.link_tx.send_replace(LinkState::Connected);
        let _ = self.event_tx.send(MonitorEvent::Connected {
            client_id: self.client_id.clone(),
        });

        let ctx = ConnectionContext {
            client: self.client.clone(),
            client_id: self.client_id.clone(),
            policy: self.config.reconnect.clone(),
            fetcher: self.fetcher.clone(),
            table: Arc::clone(&self.table),
            event_tx: self.event_tx.clone(),
            link_tx: Arc::clone(&self.link_tx),
            cancel: self.cancel.child_token(),
        };
        *task = Some(tokio::spawn(async move {
            tracing::info!(client_id = %ctx.client_id, "Starting connection task");
            run_connection_loop(conn, &ctx).await;
            tracing::info!(client_id = %ctx.client_id, "Connection task exited");
        }));
        Ok(())
    }

    /// Upload a local file and remember its asset identifier.
    pub async fn upload_asset(&self, path: &Path) -> Result<String, MonitorError> {
        let asset_id = self.api.upload_asset(path).await?;
        tracing::info!(path = %path.display(), asset_id = %asset_id, "Asset uploaded");
        self.register_asset(&asset_id);
        Ok(asset_id)
    }

    /// Mark an asset identifier as present on the server without
    /// uploading it (e.g. uploaded by an earlier session).
    pub fn register_asset(&self, asset_id: &str) {
        self.uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset_id.to_string());
    }

    /// Reject descriptors that reference assets this session never
    /// uploaded. Makes no network calls.
    pub fn check_assets(&self, descriptor: &JobDescriptor) -> Result<(), MonitorError> {
        let uploaded = self.uploaded.lock().unwrap_or_else(PoisonError::into_inner);
        let missing: Vec<&str> = descriptor
            .asset_refs()
            .filter(|asset| !uploaded.contains(*asset))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Submission(format!(
                "descriptor references assets that were never uploaded: {}",
                missing.join(", ")
            )))
        }
    }

    /// Fill `template` for a digital-human request. A binding the
    /// template does not declare is a [`MonitorError::Submission`].
    pub fn describe(
        &self,
        bindings: &DigitalHumanBindings,
        template: &WorkflowTemplate,
        request: &DigitalHumanRequest<'_>,
    ) -> Result<JobDescriptor, MonitorError> {
        Ok(bindings.describe(template, request)?)
    }

    /// Submit a descriptor and return its JobId.
    ///
    /// The job is watched before the request is sent so that no early
    /// event is lost. Submission does not need the WebSocket.
    pub async fn submit(&self, descriptor: &JobDescriptor) -> Result<JobId, MonitorError> {
        self.check_assets(descriptor)?;

        let job_id = JobId::generate();
        self.table.watch(&job_id).await;

        let response = match self
            .api
            .submit_workflow(descriptor.graph(), &self.client_id, Some(job_id.as_str()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.table.forget(&job_id).await;
                tracing::error!(job_id = %job_id, error = %e, "Workflow submission failed");
                return Err(e.into());
            }
        };

        let assigned = JobId::new(response.prompt_id);
        if assigned != job_id {
            tracing::debug!(requested = %job_id, assigned = %assigned, "Backend assigned a different prompt id");
            // Frames for the assigned id may already have arrived.
            if let Some(state) = self.table.rekey(&job_id, &assigned).await {
                publish_state(&state, &self.event_tx);
            }
        }

        tracing::info!(
            job_id = %assigned,
            client_id = %self.client_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(assigned)
    }

    /// Aggregate progress of a watched job.
    pub async fn progress(&self, job_id: &JobId) -> Option<JobProgress> {
        self.table.snapshot(job_id).await.map(|state| state.progress())
    }

    /// Full state snapshot of a watched job.
    pub async fn state(&self, job_id: &JobId) -> Option<JobState> {
        self.table.snapshot(job_id).await
    }

    /// Block until the job is done or errored.
    pub async fn wait(
        &self,
        job_id: &JobId,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<JobState, MonitorError> {
        self.connect().await?;
        self.await_terminal(job_id, timeout, cancel).await
    }

    /// Resolve (and optionally download) the artifacts of a finished job.
    pub async fn fetch(&self, job_id: &JobId, dest: Option<&Path>) -> Result<Artifacts, MonitorError> {
        self.fetcher.fetch(job_id, dest).await
    }

    /// Submit, wait for completion, then fetch.
    ///
    /// The descriptor is validated before anything touches the network.
    pub async fn run_and_wait(
        &self,
        descriptor: &JobDescriptor,
        options: &WaitOptions,
    ) -> Result<Artifacts, MonitorError> {
        self.check_assets(descriptor)?;
        self.connect().await?;
        let job_id = self.submit(descriptor).await?;
        self.wait_and_fetch(&job_id, options).await
    }

    /// Re-attach to a job submitted earlier (possibly by another
    /// session) and see it through to its artifacts.
    pub async fn monitor(&self, job_id: &JobId, options: &WaitOptions) -> Result<Artifacts, MonitorError> {
        self.connect().await?;
        self.table.watch(job_id).await;
        if let Some(entry) = self.fetcher.lookup(job_id).await? {
            self.settle(job_id, &history_outcome(&entry)).await;
        }
        self.wait_and_fetch(job_id, options).await
    }

    /// Classify a job as finished, running, pending or unknown.
    pub async fn locate(&self, job_id: &JobId) -> Result<JobLocation, MonitorError> {
        if let Some(entry) = self.fetcher.lookup(job_id).await? {
            let error = match history_outcome(&entry) {
                JobUpdate::Failed { message, .. } => Some(message),
                _ => None,
            };
            return Ok(JobLocation::Finished { error });
        }

        let queue = self.api.queue().await?;
        Ok(if queue.is_running(job_id.as_str()) {
            JobLocation::Running
        } else if queue.is_pending(job_id.as_str()) {
            JobLocation::Pending
        } else {
            JobLocation::NotFound
        })
    }

    /// Stop the connection task and wait for it to exit.
    pub async fn shutdown(&self) {
        tracing::info!(client_id = %self.client_id, "Shutting down monitor session");
        self.cancel.cancel();

        if let Some(handle) = self.connection.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
        self.link_tx.send_replace(LinkState::Lost);

        tracing::info!(client_id = %self.client_id, "Monitor session shut down complete");
    }

    // ---- private helpers ----

    async fn wait_and_fetch(&self, job_id: &JobId, options: &WaitOptions) -> Result<Artifacts, MonitorError> {
        let cancel = options.cancel.clone().unwrap_or_default();
        self.await_terminal(job_id, options.timeout, &cancel).await?;
        self.fetch(job_id, options.output_dir.as_deref()).await
    }

    /// Wait on the connection the caller already opened. A link lost in
    /// between is reported, not silently redialed.
    async fn await_terminal(
        &self,
        job_id: &JobId,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<JobState, MonitorError> {
        let job = self.table.watch(job_id).await;
        let link = self.link_tx.subscribe();
        wait_for_terminal(
            job_id,
            job,
            link,
            timeout.unwrap_or(self.config.wait_timeout),
            cancel,
        )
        .await
    }

    async fn settle(&self, job_id: &JobId, update: &JobUpdate) {
        if let Some(state) = self.table.apply(job_id, update).await {
            publish_state(&state, &self.event_tx);
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Core connection loop: process messages -> reconnect -> resync.
///
/// Runs until the cancellation token is triggered or the reconnect
/// policy gives up. Always leaves the link in [`LinkState::Lost`].
async fn run_connection_loop(mut conn: ComfyUIConnection, ctx: &ConnectionContext) {
    loop {
        let end = process_messages(&mut conn.ws_stream, &ctx.table, &ctx.event_tx, &ctx.cancel).await;
        if end == StreamEnd::Cancelled {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Close handshake failed");
            }
            break;
        }

        tracing::warn!(client_id = %ctx.client_id, reason = ?end, "ComfyUI connection lost");
        let _ = ctx.event_tx.send(MonitorEvent::Disconnected {
            client_id: ctx.client_id.clone(),
        });

        let ReconnectPolicy::Backoff(reconnect_config) = &ctx.policy else {
            tracing::error!(client_id = %ctx.client_id, "Fail-fast policy, abandoning watched jobs");
            break;
        };

        ctx.link_tx.send_replace(LinkState::Reconnecting);
        match reconnect_loop(&ctx.client, &ctx.client_id, reconnect_config, &ctx.cancel).await {
            Some(new_conn) => {
                conn = new_conn;
                ctx.link_tx.send_replace(LinkState::Connected);
                let _ = ctx.event_tx.send(MonitorEvent::Connected {
                    client_id: ctx.client_id.clone(),
                });
                resync_jobs(ctx).await;
            }
            None => break,
        }
    }
    ctx.link_tx.send_replace(LinkState::Lost);
}

/// Settle watched jobs that finished while the stream was down.
async fn resync_jobs(ctx: &ConnectionContext) {
    for job_id in ctx.table.active_jobs().await {
        match ctx.fetcher.lookup(&job_id).await {
            Ok(Some(entry)) => {
                tracing::info!(job_id = %job_id, "Job finished while disconnected");
                if let Some(state) = ctx.table.apply(&job_id, &history_outcome(&entry)).await {
                    publish_state(&state, &ctx.event_tx);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "History resync failed");
            }
        }
    }
}
