//! Process-wide engine counters.
//!
//! Cheap relaxed atomics, read through [`snapshot`] by the CLI and tests.
use std::sync::atomic::{AtomicU64, Ordering};

static NOTIFICATIONS: AtomicU64 = AtomicU64::new(0);
static MESSAGES: AtomicU64 = AtomicU64::new(0);
static FRAGMENTS: AtomicU64 = AtomicU64::new(0);
static DUPLICATE_FRAGMENTS: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_INCOMPLETE: AtomicU64 = AtomicU64::new(0);
static HISTORY_LINES_DROPPED: AtomicU64 = AtomicU64::new(0);
static WRITES_FAILED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);

pub fn inc_notifications() {
    NOTIFICATIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages(n: u64) {
    MESSAGES.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_fragments() {
    FRAGMENTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicate_fragments() {
    DUPLICATE_FRAGMENTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transfer_outcome(complete: bool) {
    if complete {
        TRANSFERS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    } else {
        TRANSFERS_INCOMPLETE.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn add_history_lines_dropped(n: u64) {
    HISTORY_LINES_DROPPED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_writes_failed() {
    WRITES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub notifications: u64,
    pub messages: u64,
    pub fragments: u64,
    pub duplicate_fragments: u64,
    pub transfers_completed: u64,
    pub transfers_incomplete: u64,
    pub history_lines_dropped: u64,
    pub writes_failed: u64,
    pub reconnect_attempts: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        notifications: NOTIFICATIONS.load(Ordering::Relaxed),
        messages: MESSAGES.load(Ordering::Relaxed),
        fragments: FRAGMENTS.load(Ordering::Relaxed),
        duplicate_fragments: DUPLICATE_FRAGMENTS.load(Ordering::Relaxed),
        transfers_completed: TRANSFERS_COMPLETED.load(Ordering::Relaxed),
        transfers_incomplete: TRANSFERS_INCOMPLETE.load(Ordering::Relaxed),
        history_lines_dropped: HISTORY_LINES_DROPPED.load(Ordering::Relaxed),
        writes_failed: WRITES_FAILED.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
    }
}
