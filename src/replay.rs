//! Capture replay: feed recorded notifications through a full session.
//!
//! A capture is plain text with one notification per line. Blank lines and
//! lines starting with `#` are skipped. A line prefixed with `hex:` carries
//! the raw notification bytes as hex digits; anything else is sent as-is.
//!
//! ```text
//! # boot
//! {"sensor":"bme280","temperature":21.5}
//! hex:7b2263223a2231227d
//! ```

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::metrics;
use crate::session::{NoticeKind, SessionDriver, SessionSettings, SessionSnapshot};
use crate::transport::MockTransport;

/// Everything observable after a replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub session: SessionSnapshot,
    /// Export CSVs delivered during the replay, oldest first.
    pub exports: Vec<String>,
    /// Streamed history in export layout, when any samples arrived.
    pub history_csv: Option<String>,
    /// Requests the session wrote back to the node, decoded as JSON.
    pub writes: Vec<serde_json::Value>,
    pub counters: metrics::Snapshot,
}

/// Parse capture text into notification payloads.
pub fn parse_capture(text: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        match line.strip_prefix("hex:") {
            Some(hex) => {
                let bytes = decode_hex(hex.trim())
                    .with_context(|| format!("capture line {}", idx + 1))?;
                out.push(bytes);
            }
            None => out.push(line.as_bytes().to_vec()),
        }
    }
    Ok(out)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(anyhow!("odd number of hex digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

fn hex_value(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(anyhow!("invalid hex digit {:?}", b as char)),
    }
}

/// Run `notifications` through a session connected to a mock link and wait
/// (up to `settle`) for any bulk transfer and history drain to finish.
pub async fn run_replay(
    device_id: &str,
    settings: SessionSettings,
    notifications: Vec<Vec<u8>>,
    settle: Duration,
) -> Result<ReplayReport> {
    let transport = MockTransport::new();
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let handle = SessionDriver::spawn(
        device_id,
        settings,
        Arc::new(transport.clone()),
        notice_tx,
    );
    handle
        .connect()
        .await
        .context("failed to open replay link")?;
    let link = transport
        .last_link()
        .ok_or_else(|| anyhow!("replay transport produced no link"))?;

    debug!("replaying {} notifications", notifications.len());
    for bytes in notifications {
        if !link.inject(bytes) {
            return Err(anyhow!("replay link closed before the capture ended"));
        }
    }

    let deadline = Instant::now() + settle;
    let session = loop {
        let snapshot = handle.snapshot().await?;
        if !snapshot.transfer_active && !snapshot.history_loading {
            break snapshot;
        }
        if Instant::now() >= deadline {
            warn!("replay did not settle within {:?}", settle);
            break snapshot;
        }
        sleep(Duration::from_millis(20)).await;
    };
    let history_csv = if session.history_samples > 0 {
        Some(handle.history_csv().await?)
    } else {
        None
    };
    handle.shutdown().await;

    let mut exports = Vec::new();
    while let Ok(notice) = notice_rx.try_recv() {
        if let NoticeKind::Export(csv) = notice.kind {
            exports.push(csv);
        }
    }

    Ok(ReplayReport {
        session,
        exports,
        history_csv,
        writes: link.written_json(),
        counters: metrics::snapshot(),
    })
}
