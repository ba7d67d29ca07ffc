//! Monitor configuration loaded from environment variables.

use std::time::Duration;

use dhgen_core::error::CoreError;

use crate::reconnect::ReconnectConfig;

/// Default ComfyUI address when `COMFYUI_SERVER` is unset.
pub const DEFAULT_SERVER: &str = "127.0.0.1:6006";

/// What to do when the stream drops while jobs are being watched.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Fail every waiter with `ConnectionLost` immediately.
    FailFast,
    /// Retry with exponential backoff, reusing the session's client id.
    Backoff(ReconnectConfig),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff(ReconnectConfig::default())
    }
}

/// Settings for one [`MonitorSession`](crate::session::MonitorSession).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// WebSocket base URL, e.g. `ws://127.0.0.1:6006`.
    pub ws_url: String,
    /// HTTP base URL, e.g. `http://127.0.0.1:6006`.
    pub api_url: String,
    /// Bound on the WebSocket handshake (default: `10s`).
    pub dial_timeout: Duration,
    /// Bound on each HTTP request (default: `30s`).
    pub request_timeout: Duration,
    /// Default completion timeout when the caller gives none (default: `600s`).
    pub wait_timeout: Duration,
    /// History queries before giving up with `ResultNotFound` (default: `5`).
    pub history_attempts: u32,
    /// Base delay between history queries, multiplied by the attempt
    /// number (default: `500ms`).
    pub history_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ws_url: format!("ws://{DEFAULT_SERVER}"),
            api_url: format!("http://{DEFAULT_SERVER}"),
            dial_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(600),
            history_attempts: 5,
            history_delay: Duration::from_millis(500),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl MonitorConfig {
    /// Defaults pointed at a specific server address.
    pub fn for_server(address: &str) -> Result<Self, CoreError> {
        let (ws_url, api_url) = split_server_address(address)?;
        Ok(Self {
            ws_url,
            api_url,
            ..Self::default()
        })
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default          |
    /// |----------------------------------|------------------|
    /// | `COMFYUI_SERVER`                 | `127.0.0.1:6006` |
    /// | `COMFYUI_DIAL_TIMEOUT_SECS`      | `10`             |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`   | `30`             |
    /// | `COMFYUI_WAIT_TIMEOUT_SECS`      | `600`            |
    /// | `COMFYUI_HISTORY_ATTEMPTS`       | `5`              |
    /// | `COMFYUI_HISTORY_DELAY_MS`       | `500`            |
    /// | `COMFYUI_RECONNECT`              | `backoff`        |
    /// | `COMFYUI_RECONNECT_MAX_ATTEMPTS` | unlimited        |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = lookup("COMFYUI_SERVER").unwrap_or_else(|| DEFAULT_SERVER.into());
        let mut config = Self::for_server(&server)?;

        if let Some(secs) = parse_var::<u64, _>(&lookup, "COMFYUI_DIAL_TIMEOUT_SECS")? {
            config.dial_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "COMFYUI_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "COMFYUI_WAIT_TIMEOUT_SECS")? {
            config.wait_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "COMFYUI_HISTORY_ATTEMPTS")? {
            if attempts == 0 {
                return Err(CoreError::Config(
                    "COMFYUI_HISTORY_ATTEMPTS must be at least 1".into(),
                ));
            }
            config.history_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COMFYUI_HISTORY_DELAY_MS")? {
            config.history_delay = Duration::from_millis(ms);
        }

        let max_attempts = parse_var::<u32, _>(&lookup, "COMFYUI_RECONNECT_MAX_ATTEMPTS")?;
        config.reconnect = match lookup("COMFYUI_RECONNECT").as_deref().map(str::trim) {
            None | Some("") | Some("backoff") => ReconnectPolicy::Backoff(ReconnectConfig {
                max_attempts,
                ..Default::default()
            }),
            Some("fail-fast") | Some("fail_fast") => ReconnectPolicy::FailFast,
            Some(other) => {
                return Err(CoreError::Config(format!(
                    "COMFYUI_RECONNECT must be 'backoff' or 'fail-fast', got '{other}'"
                )))
            }
        };

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoreError::Config(format!("{key} is invalid ('{raw}'): {e}"))),
    }
}

/// Turn a server address into `(ws_url, api_url)`.
///
/// Accepts a bare `host:port`, or a URL with an `http`, `https`, `ws`
/// or `wss` scheme. Trailing slashes are dropped.
pub fn split_server_address(address: &str) -> Result<(String, String), CoreError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(CoreError::Config("ComfyUI server address is empty".into()));
    }

    let (ws_scheme, http_scheme, rest) = match address.split_once("://") {
        None => ("ws", "http", address),
        Some(("http", rest)) | Some(("ws", rest)) => ("ws", "http", rest),
        Some(("https", rest)) | Some(("wss", rest)) => ("wss", "https", rest),
        Some((scheme, _)) => {
            return Err(CoreError::Config(format!(
                "Unsupported scheme '{scheme}' in ComfyUI server address"
            )))
        }
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(CoreError::Config(format!(
            "ComfyUI server address '{address}' has no host"
        )));
    }

    Ok((
        format!("{ws_scheme}://{rest}"),
        format!("{http_scheme}://{rest}"),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = MonitorConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.ws_url, "ws://127.0.0.1:6006");
        assert_eq!(config.api_url, "http://127.0.0.1:6006");
        assert_eq!(config.wait_timeout, Duration::from_secs(600));
        assert_eq!(config.history_attempts, 5);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("COMFYUI_SERVER", "https://gpu.example.com/"),
            ("COMFYUI_WAIT_TIMEOUT_SECS", "30"),
            ("COMFYUI_HISTORY_DELAY_MS", "50"),
            ("COMFYUI_RECONNECT", "fail-fast"),
        ]))
        .unwrap();
        assert_eq!(config.ws_url, "wss://gpu.example.com");
        assert_eq!(config.api_url, "https://gpu.example.com");
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
        assert_eq!(config.history_delay, Duration::from_millis(50));
        assert_eq!(config.reconnect, ReconnectPolicy::FailFast);
    }

    #[test]
    fn reconnect_attempt_limit() {
        let config = MonitorConfig::from_lookup(lookup_from(&[(
            "COMFYUI_RECONNECT_MAX_ATTEMPTS",
            "4",
        )]))
        .unwrap();
        assert_matches!(
            config.reconnect,
            ReconnectPolicy::Backoff(ReconnectConfig { max_attempts: Some(4), .. })
        );
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let result =
            MonitorConfig::from_lookup(lookup_from(&[("COMFYUI_DIAL_TIMEOUT_SECS", "soon")]));
        assert_matches!(result, Err(CoreError::Config(_)));

        let result = MonitorConfig::from_lookup(lookup_from(&[("COMFYUI_RECONNECT", "maybe")]));
        assert_matches!(result, Err(CoreError::Config(_)));

        let result = MonitorConfig::from_lookup(lookup_from(&[("COMFYUI_HISTORY_ATTEMPTS", "0")]));
        assert_matches!(result, Err(CoreError::Config(_)));
    }

    #[test]
    fn server_address_forms() {
        assert_eq!(
            split_server_address("10.0.0.5:8188").unwrap(),
            ("ws://10.0.0.5:8188".to_string(), "http://10.0.0.5:8188".to_string())
        );
        assert_eq!(
            split_server_address("ws://host:1").unwrap().1,
            "http://host:1"
        );
        assert_matches!(split_server_address("  "), Err(CoreError::Config(_)));
        assert_matches!(split_server_address("ftp://host"), Err(CoreError::Config(_)));
        assert_matches!(split_server_address("http://"), Err(CoreError::Config(_)));
    }
}
