//! Exponential-backoff reconnection logic for ComfyUI WebSocket
//! connections.
//!
//! When the connection to ComfyUI drops, the session calls
//! [`reconnect_loop`] to keep retrying with increasing delays until
//! either the connection is restored, the attempt budget runs out, or
//! the [`CancellationToken`] is triggered. Every attempt reuses the
//! session's client id so ComfyUI keeps routing the same jobs to us.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Attempt to reconnect to ComfyUI with exponential backoff.
///
/// Returns `Some(connection)` once a connection succeeds, or `None` if
/// the `cancel` token is triggered or `max_attempts` is exhausted.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    client_id: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(
            client_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id, "Reconnect cancelled");
                return None;
            }
            result = client.connect(client_id) => {
                match result {
                    Ok(conn) => {
                        tracing::info!(client_id, attempt, "Reconnected to ComfyUI");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            client_id,
                            error = %e,
                            "Reconnect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        if config.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(client_id, attempt, "Giving up on reconnecting to ComfyUI");
            return None;
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
