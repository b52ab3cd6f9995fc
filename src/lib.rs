//! # nodelink - Session Engine for Sensor Nodes
//!
//! nodelink keeps one stateful session per embedded sensor node reachable over
//! a small-MTU notification link (write characteristic out, notify
//! characteristic in). It turns raw notifications into typed telemetry, keeps
//! bounded metric histories, reassembles chunked bulk transfers, and drives a
//! reconnect loop with capped exponential backoff.
//!
//! ## Features
//!
//! - **Framing**: Splits each notification into messages (brace-balanced
//!   JSON objects or trimmed lines). Text is never stitched across
//!   notifications.
//! - **Parsing**: JSON and `key=value` payloads, metric profiles, config and
//!   flash status reports, bulk transfer fragments.
//! - **Metric Series**: Fixed-capacity rings per metric plus a history series
//!   fed from stored logs.
//! - **Bulk Transfers**: Indexed and line-mode reassembly with periodic
//!   acknowledgements, duplicate suppression and timeout recovery.
//! - **Reconnect**: Capped exponential backoff with an attempt ceiling, gated
//!   off by manual disconnects.
//! - **Command Queue**: Per-session serialized writes; one failed write does
//!   not block the next.
//! - **Config Draft**: Local edits to the node configuration, mirrored from
//!   the device until touched, pushed as a single config request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nodelink::config::Config;
//! use nodelink::session::SessionDriver;
//! use nodelink::transport::MockTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("nodelink.toml").await?;
//!     let (notices, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let transport = MockTransport::new();
//!     let session = SessionDriver::spawn(
//!         "node-1",
//!         config.session_settings(),
//!         Arc::new(transport.clone()),
//!         notices,
//!     );
//!     session.connect().await?;
//!     if let Some(link) = transport.last_link() {
//!         link.inject(br#"{"sensor":"bme280","temperature":21.5}"#.to_vec());
//!     }
//!     if let Some(notice) = rx.recv().await {
//!         println!("{:?}", notice.kind);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - Notification framing, payload parsing, outbound requests
//! - [`session`] - Per-device state, timers, reassembly, reconnect, driver
//! - [`transport`] - Link abstraction and the scripted mock transport
//! - [`config`] - Configuration loading and validation
//! - [`export`] - CSV normalization for exported logs
//! - [`replay`] - Feed recorded captures through a session
//! - [`metrics`] - Process-wide counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ SessionRegistry │ ← device id → session, connection ceiling
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  SessionDriver  │ ← async actor, command queue, link events
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  DeviceSession  │ ← synchronous state machine
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Protocol     │ ← framer, parser, actions
//! └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod transport;
