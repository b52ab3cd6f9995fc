//! Device id → session handle map, owned by whoever orchestrates sessions.

use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::SessionSettings;
use super::driver::{SessionDriver, SessionHandle, SessionNotice};
use crate::error::SessionError;
use crate::transport::Transport;

/// Concurrent live links allowed by default.
pub const MAX_CONNECTIONS: usize = 4;

/// Live-link budget shared by every session of a registry. A session holds
/// a slot from the start of a connect attempt until its link is gone.
#[derive(Debug)]
pub struct ConnectionSlots {
    max: usize,
    used: AtomicUsize,
}

impl ConnectionSlots {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            used: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.max).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
    }
}

pub struct SessionRegistry {
    settings: SessionSettings,
    slots: Arc<ConnectionSlots>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    sessions: HashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new(
        settings: SessionSettings,
        max_connections: usize,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            settings,
            slots: Arc::new(ConnectionSlots::new(max_connections)),
            notices,
            sessions: HashMap::new(),
        }
    }

    /// Connect to `device_id`, creating its session on the first successful
    /// link. A known device reconnects through its existing session and keeps
    /// its original transport.
    pub async fn connect(
        &mut self,
        device_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.sessions.get(device_id) {
            if handle.is_connected() {
                return Ok(handle.clone());
            }
        }
        if let Some(handle) = self.sessions.get(device_id) {
            handle.connect().await?;
            return Ok(handle.clone());
        }
        if self.slots.in_use() >= self.slots.max() {
            return Err(SessionError::TooManyConnections(self.slots.max()));
        }

        let handle = SessionDriver::spawn_limited(
            device_id,
            self.settings.clone(),
            transport,
            self.notices.clone(),
            Arc::clone(&self.slots),
        );
        if let Err(e) = handle.connect().await {
            handle.shutdown().await;
            return Err(e);
        }
        info!("registry: added session {}", device_id);
        self.sessions.insert(device_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, device_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(device_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.slots.max()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|h| h.is_connected()).count()
    }

    /// Manual disconnect of every session; sessions are retained.
    pub async fn disconnect_all(&self) {
        for handle in self.sessions.values() {
            let _ = handle.disconnect().await;
        }
    }

    /// Close and drop a session. Returns false for unknown ids.
    pub async fn forget(&mut self, device_id: &str) -> bool {
        match self.sessions.remove(device_id) {
            Some(handle) => {
                handle.shutdown().await;
                info!("registry: forgot session {}", device_id);
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&mut self) {
        for (_, handle) in self.sessions.drain() {
            handle.shutdown().await;
        }
    }
}
