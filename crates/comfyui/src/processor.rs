//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, folds them into the
//! [`JobTable`], and emits [`MonitorEvent`]s to the broadcast channel.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::events::MonitorEvent;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::tracker::{interpret, JobState, JobStatus, JobTable};

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The session was shut down.
    Cancelled,
    /// The server sent a close frame.
    Closed,
    /// A receive error ended the stream.
    Failed(String),
    /// The stream ended without a close frame.
    Exhausted,
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// the stream is exhausted, or `cancel` fires. Each text frame is parsed
/// via [`parse_message`]; messages for jobs that are not watched are
/// discarded by the table.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages<S>(
    ws_stream: &mut S,
    table: &JobTable,
    event_tx: &broadcast::Sender<MonitorEvent>,
    cancel: &CancellationToken,
) -> StreamEnd
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = ws_stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(&text, table, event_tx).await;
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::trace!(len = data.len(), "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return StreamEnd::Closed;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return StreamEnd::Failed(e.to_string());
            }
            None => return StreamEnd::Exhausted,
        }
    }
}

/// Parse a single text frame and apply it to the job table.
async fn handle_text_message(
    text: &str,
    table: &JobTable,
    event_tx: &broadcast::Sender<MonitorEvent>,
) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            return;
        }
    };

    match &msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            return;
        }
        ComfyUIMessage::Other(kind) => {
            tracing::trace!(kind = %kind, "Ignoring unhandled ComfyUI message");
            return;
        }
        _ => {}
    }

    let Some((job_id, update)) = interpret(msg) else {
        return;
    };
    if let Some(state) = table.apply(&job_id, &update).await {
        publish_state(&state, event_tx);
    }
}

/// Log a state change and broadcast the matching event.
pub(crate) fn publish_state(state: &JobState, event_tx: &broadcast::Sender<MonitorEvent>) {
    let job_id = state.job_id.clone();
    let event = match &state.status {
        JobStatus::Done => {
            tracing::info!(job_id = %job_id, "Execution completed");
            MonitorEvent::JobCompleted { job_id }
        }
        JobStatus::Errored {
            node_id,
            message,
            exception_type,
        } => {
            tracing::error!(
                job_id = %job_id,
                node_id = node_id.as_deref().unwrap_or("-"),
                error_type = exception_type.as_deref().unwrap_or("-"),
                error_message = %message,
                "Execution error",
            );
            MonitorEvent::JobFailed {
                job_id,
                node_id: node_id.clone(),
                message: message.clone(),
            }
        }
        JobStatus::Pending | JobStatus::Running => {
            let progress = state.progress();
            tracing::debug!(
                job_id = %job_id,
                node = state.current_node.as_deref().unwrap_or("-"),
                percent = progress.percent(),
                completed = progress.completed,
                total = progress.total,
                "Generation progress",
            );
            MonitorEvent::JobProgress {
                job_id,
                progress,
                current_node: state.current_node.clone(),
            }
        }
    };
    let _ = event_tx.send(event);
}

#[cfg(test)]
mod tests {
    use dhgen_core::types::JobId;
    use futures::stream;

    use super::*;

    fn text(json: &str) -> Result<Message, WsError> {
        Ok(Message::Text(json.to_string()))
    }

    #[tokio::test]
    async fn folds_frames_into_watched_job() {
        let table = JobTable::new();
        let id = JobId::new("p1");
        table.watch(&id).await;
        let (event_tx, mut event_rx) = broadcast::channel(16);

        let mut frames = stream::iter(vec![
            text(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            text(r#"{"type":"executing","data":{"node":"3","prompt_id":"other"}}"#),
            Ok(Message::Binary(vec![1, 2, 3])),
            text("{not json"),
            text(r#"{"type":"mystery","data":{}}"#),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#),
        ]);

        let end = process_messages(&mut frames, &table, &event_tx, &CancellationToken::new()).await;
        assert_eq!(end, StreamEnd::Exhausted);
        assert_eq!(table.snapshot(&id).await.unwrap().status, JobStatus::Done);
        assert!(!table.is_watched(&JobId::new("other")).await);

        assert!(matches!(event_rx.recv().await.unwrap(), MonitorEvent::JobProgress { .. }));
        assert!(matches!(event_rx.recv().await.unwrap(), MonitorEvent::JobCompleted { .. }));
    }

    #[tokio::test]
    async fn close_frame_and_errors_end_the_loop() {
        let table = JobTable::new();
        let (event_tx, _rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();

        let mut closing = stream::iter(vec![Ok(Message::Close(None))]);
        assert_eq!(
            process_messages(&mut closing, &table, &event_tx, &cancel).await,
            StreamEnd::Closed
        );

        let mut failing = stream::iter(vec![Err(WsError::ConnectionClosed)]);
        assert!(matches!(
            process_messages(&mut failing, &table, &event_tx, &cancel).await,
            StreamEnd::Failed(_)
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_pending_stream() {
        let table = JobTable::new();
        let (event_tx, _rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut silent = stream::pending::<Result<Message, WsError>>();
        assert_eq!(
            process_messages(&mut silent, &table, &event_tx, &cancel).await,
            StreamEnd::Cancelled
        );
    }
}
