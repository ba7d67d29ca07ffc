//! ComfyUI job submission and progress monitoring.
//!
//! Provides typed message parsing, WebSocket connection management with
//! reconnection, HTTP API wrappers, per-job progress tracking and
//! aggregation, completion detection, result retrieval, and the
//! [`MonitorSession`](session::MonitorSession) facade composing them.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod messages;
pub mod processor;
pub mod progress;
pub mod reconnect;
pub mod session;
pub mod tracker;
pub mod waiter;
pub mod workflow;
