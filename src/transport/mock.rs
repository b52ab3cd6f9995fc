//! Scripted in-memory transport.
//!
//! Backs the integration tests and the `replay` command: notifications are
//! injected by hand, writes are recorded, and connect failures or link drops
//! can be scripted.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Link, NotificationSink, Transport};
use crate::error::LinkError;

#[derive(Default)]
struct LinkInner {
    writes: Vec<Vec<u8>>,
    sink: Option<NotificationSink>,
    fail_writes: bool,
    closed: bool,
}

/// One mock connection. Clones share state.
#[derive(Clone, Default)]
pub struct MockLink {
    inner: Arc<Mutex<LinkInner>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a notification as if the node sent it.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.notify(bytes.into()),
            None => false,
        }
    }

    /// Simulate an unexpected link loss.
    pub fn drop_link(&self) {
        let sink = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.sink.clone()
        };
        if let Some(sink) = sink {
            sink.disconnected();
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Recorded writes decoded as JSON; undecodable writes are skipped.
    pub fn written_json(&self) -> Vec<serde_json::Value> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| serde_json::from_slice(w).ok())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait]
impl Link for MockLink {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(LinkError::Disconnected);
        }
        if inner.fail_writes {
            return Err(LinkError::WriteFailed("mock write rejected".into()));
        }
        inner.writes.push(bytes);
        Ok(())
    }

    fn subscribe(&self, sink: NotificationSink) {
        self.lock().sink = Some(sink);
    }

    async fn disconnect(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sink = None;
    }
}

#[derive(Default)]
struct TransportInner {
    scripted: VecDeque<Result<(), LinkError>>,
    links: Vec<MockLink>,
    attempts: usize,
}

/// Hands out [`MockLink`]s. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        let mut inner = self.lock();
        for _ in 0..n {
            inner
                .scripted
                .push_back(Err(LinkError::ConnectFailed("mock device unreachable".into())));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.lock().links.clone()
    }

    pub fn last_link(&self) -> Option<MockLink> {
        self.lock().links.last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Arc<dyn Link>, LinkError> {
        let mut inner = self.lock();
        inner.attempts += 1;
        inner.scripted.pop_front().unwrap_or(Ok(()))?;
        let link = MockLink::new();
        inner.links.push(link.clone());
        Ok(Arc::new(link))
    }
}
