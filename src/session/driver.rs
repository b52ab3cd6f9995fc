//! Async actor that runs one [`DeviceSession`] against a transport.
//!
//! The driver task owns the session and selects over four sources:
//!
//! * link events (notifications, disconnects) tagged with a link generation,
//! * internal results (connect attempts, write completions),
//! * user commands from [`SessionHandle`]s,
//! * the session's nearest timer deadline.
//!
//! Sources are polled in that priority order, link events first, so a
//! command always observes every notification that arrived before it.
//! Connection attempts run on their own tasks and report back, so inbound
//! events keep flowing while a connect is pending. Every write goes through
//! the session's [`CommandQueue`]. Events carrying an old link generation are
//! dropped.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::device::{Applied, DeviceSession, Effect, SessionSettings, SessionSnapshot};
use super::draft::DraftEdit;
use super::queue::CommandQueue;
use super::registry::ConnectionSlots;
use crate::error::{LinkError, SessionError};
use crate::protocol::{Action, ActionKind};
use crate::transport::{Link, LinkEvent, NotificationSink, Transport};

/// What an observer is told after a session update.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeKind {
    /// Configuration-facing state changed; rebuild those views.
    Structural,
    /// Only live metric values changed.
    Metrics,
    /// A bulk export is ready, already in export CSV layout.
    Export(String),
    Connection(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotice {
    pub device_id: String,
    pub kind: NoticeKind,
}

/// User-initiated node requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequest {
    RequestConfig,
    RequestFlashStatus,
    StartExport,
    StartHistoryStream,
    StopHistoryStream,
    SyncTime,
    SetStoreFlash(bool),
    PushConfig,
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum SessionCommand {
    Connect(Reply),
    Disconnect(oneshot::Sender<()>),
    Request(UserRequest, Reply),
    EditDraft(DraftEdit),
    ClearDraft,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    HistoryCsv(oneshot::Sender<String>),
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    Connected {
        attempt: u64,
        result: Result<Arc<dyn Link>, LinkError>,
    },
    WriteDone {
        kind: ActionKind,
        result: Result<(), String>,
    },
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    device_id: String,
    tx: mpsc::UnboundedSender<SessionCommand>,
    connected: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the connection state equals `connected`.
    pub async fn wait_connected(&mut self, connected: bool) -> bool {
        self.connected.wait_for(|c| *c == connected).await.is_ok()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Connect (or reconnect by hand). Re-enables auto reconnect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.call(SessionCommand::Connect).await?
    }

    /// Manual disconnect; auto reconnect stays off until the next connect.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.call(SessionCommand::Disconnect).await
    }

    pub async fn request(&self, request: UserRequest) -> Result<(), SessionError> {
        self.call(|tx| SessionCommand::Request(request, tx)).await?
    }

    pub fn edit_draft(&self, edit: DraftEdit) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::EditDraft(edit))
            .map_err(|_| SessionError::Closed)
    }

    pub fn clear_draft(&self) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::ClearDraft)
            .map_err(|_| SessionError::Closed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.call(SessionCommand::Snapshot).await
    }

    /// Drained history samples as export CSV.
    pub async fn history_csv(&self) -> Result<String, SessionError> {
        self.call(SessionCommand::HistoryCsv).await
    }

    /// Close the session: cancel timers, drop the link, stop the task.
    pub async fn shutdown(&self) {
        let _ = self.call(SessionCommand::Shutdown).await;
    }
}

pub struct SessionDriver {
    session: DeviceSession,
    transport: Arc<dyn Transport>,
    link: Option<(u64, Arc<dyn Link>)>,
    generation: u64,
    connecting: Option<u64>,
    connect_waiters: Vec<Reply>,
    queue: CommandQueue,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    link_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    link_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    connected_tx: watch::Sender<bool>,
    slots: Option<Arc<ConnectionSlots>>,
    holds_slot: bool,
}

impl SessionDriver {
    /// Spawn the driver task for `device_id`. The session starts disconnected;
    /// call [`SessionHandle::connect`] to open the first link.
    pub fn spawn(
        device_id: impl Into<String>,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> SessionHandle {
        Self::launch(device_id.into(), settings, transport, notices, None)
    }

    /// Like [`SessionDriver::spawn`], but every connect attempt (manual or
    /// automatic) must first take one of the shared `slots`.
    pub fn spawn_limited(
        device_id: impl Into<String>,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        notices: mpsc::UnboundedSender<SessionNotice>,
        slots: Arc<ConnectionSlots>,
    ) -> SessionHandle {
        Self::launch(device_id.into(), settings, transport, notices, Some(slots))
    }

    fn launch(
        device_id: String,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        notices: mpsc::UnboundedSender<SessionNotice>,
        slots: Option<Arc<ConnectionSlots>>,
    ) -> SessionHandle {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let driver = SessionDriver {
            session: DeviceSession::new(device_id.clone(), settings),
            transport,
            link: None,
            generation: 0,
            connecting: None,
            connect_waiters: Vec::new(),
            queue: CommandQueue::start(device_id.clone()),
            cmd_rx,
            link_tx,
            link_rx,
            internal_tx,
            internal_rx,
            notices,
            connected_tx,
            slots,
            holds_slot: false,
        };
        tokio::spawn(driver.run());
        SessionHandle {
            device_id,
            tx,
            connected,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                biased;
                Some((generation, event)) = self.link_rx.recv() => {
                    self.on_link_event(generation, event);
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.on_internal(internal);
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown(done)) => {
                        self.close().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.close().await;
                        break;
                    }
                },
                _ = wait_deadline(deadline) => {
                    let applied = self.session.poll_timers(Instant::now());
                    self.process(applied);
                }
            }
        }
        debug!("[{}] session task stopped", self.session.id());
    }

    fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect(reply) => {
                if self.link.is_some() && self.session.is_connected() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                if !self.acquire_slot() {
                    let max = self.slots.as_ref().map_or(0, |slots| slots.max());
                    let _ = reply.send(Err(SessionError::TooManyConnections(max)));
                    return;
                }
                self.connect_waiters.push(reply);
                let applied = self.session.manual_reconnect();
                self.process(applied);
            }
            SessionCommand::Disconnect(done) => {
                let applied = self.session.manual_disconnect();
                self.drop_link();
                self.process(applied);
                let _ = done.send(());
            }
            SessionCommand::Request(request, reply) => {
                let result = match request {
                    UserRequest::RequestConfig => self.session.request_config(),
                    UserRequest::RequestFlashStatus => self.session.request_flash_status(),
                    UserRequest::StartExport => self.session.start_export(),
                    UserRequest::StartHistoryStream => self.session.start_history_stream(),
                    UserRequest::StopHistoryStream => self.session.stop_history_stream(),
                    UserRequest::SyncTime => self.session.sync_time(),
                    UserRequest::SetStoreFlash(flag) => self.session.set_store_flash(flag),
                    UserRequest::PushConfig => self.session.push_config(),
                };
                match result {
                    Ok(applied) => {
                        self.process(applied);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        self.notify(NoticeKind::Structural);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            SessionCommand::EditDraft(edit) => {
                let applied = self.session.edit_draft(edit);
                self.process(applied);
            }
            SessionCommand::ClearDraft => {
                let applied = self.session.clear_draft();
                self.process(applied);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            SessionCommand::HistoryCsv(reply) => {
                let _ = reply.send(self.session.history_csv());
            }
            // Handled in the select loop.
            SessionCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_link_event(&mut self, generation: u64, event: LinkEvent) {
        let current = self.link.as_ref().map(|(g, _)| *g);
        if current != Some(generation) {
            debug!(
                "[{}] ignoring event from stale link generation {}",
                self.session.id(),
                generation
            );
            return;
        }
        let now = Instant::now();
        match event {
            LinkEvent::Notification(bytes) => {
                let applied = self.session.handle_notification(&bytes, now);
                self.process(applied);
            }
            LinkEvent::Disconnected => {
                self.link = None;
                self.release_slot();
                let applied = self.session.on_link_lost(now);
                self.publish_connection();
                self.process(applied);
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected { attempt, result } => {
                if self.connecting != Some(attempt) {
                    if let Ok(link) = result {
                        debug!("[{}] discarding stale connection", self.session.id());
                        tokio::spawn(async move { link.disconnect().await });
                    }
                    return;
                }
                self.connecting = None;
                let now = Instant::now();
                match result {
                    Ok(link) => {
                        link.subscribe(NotificationSink::new(attempt, self.link_tx.clone()));
                        self.link = Some((attempt, link));
                        let applied = self.session.on_connected(now);
                        self.publish_connection();
                        self.reply_connect(Ok(()));
                        self.process(applied);
                    }
                    Err(e) => {
                        warn!("[{}] connect failed: {}", self.session.id(), e);
                        self.release_slot();
                        let applied = self.session.on_reconnect_failed(now);
                        self.reply_connect(Err(SessionError::Link(e)));
                        self.process(applied);
                    }
                }
            }
            Internal::WriteDone { kind, result } => {
                let applied = self.session.on_write_result(kind, result);
                self.process(applied);
            }
        }
    }

    /// Carry out the effects of a session update and tell observers.
    fn process(&mut self, applied: Applied) {
        for effect in applied.effects {
            match effect {
                Effect::Send(action) => self.write(action),
                Effect::Connect => self.start_connect(),
                Effect::Export(csv) => self.notify(NoticeKind::Export(csv)),
            }
        }
        if applied.structural {
            self.notify(NoticeKind::Structural);
        } else if applied.metrics_updated {
            self.notify(NoticeKind::Metrics);
        }
    }

    fn write(&mut self, action: Action) {
        let Some((_, link)) = &self.link else {
            debug!("[{}] no link, dropping {}", self.session.id(), action.kind());
            return;
        };
        let link = Arc::clone(link);
        let done = self.internal_tx.clone();
        let kind = action.kind();
        let bytes = action.encode();
        let _ = self.queue.enqueue(kind.as_str(), async move {
            let result = link.write(bytes).await;
            let _ = done.send(Internal::WriteDone {
                kind,
                result: result.clone().map_err(|e| e.to_string()),
            });
            result.map_err(anyhow::Error::from)
        });
    }

    fn start_connect(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        if !self.acquire_slot() {
            let applied = self.session.on_reconnect_deferred(Instant::now());
            self.process(applied);
            return;
        }
        self.generation += 1;
        let attempt = self.generation;
        self.connecting = Some(attempt);
        info!("[{}] connecting (attempt id {})", self.session.id(), attempt);
        let transport = Arc::clone(&self.transport);
        let done = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect().await;
            let _ = done.send(Internal::Connected { attempt, result });
        });
    }

    fn drop_link(&mut self) {
        // An in-flight connect attempt becomes stale.
        self.connecting = None;
        self.reply_connect(Err(SessionError::NotConnected));
        if let Some((_, link)) = self.link.take() {
            tokio::spawn(async move { link.disconnect().await });
        }
        self.release_slot();
        self.publish_connection();
    }

    /// True when this session may open a link. Unlimited drivers always may.
    fn acquire_slot(&mut self) -> bool {
        if self.holds_slot {
            return true;
        }
        match &self.slots {
            Some(slots) if !slots.try_acquire() => false,
            _ => {
                self.holds_slot = true;
                true
            }
        }
    }

    fn release_slot(&mut self) {
        if !self.holds_slot {
            return;
        }
        self.holds_slot = false;
        if let Some(slots) = &self.slots {
            slots.release();
        }
    }

    async fn close(&mut self) {
        self.session.close();
        self.connecting = None;
        self.reply_connect(Err(SessionError::Closed));
        // Flush queued writes before the link goes away.
        self.queue.shutdown().await;
        if let Some((_, link)) = self.link.take() {
            link.disconnect().await;
        }
        self.release_slot();
        self.publish_connection();
        info!("[{}] session closed", self.session.id());
    }

    fn reply_connect(&mut self, result: Result<(), SessionError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn publish_connection(&mut self) {
        let connected = self.session.is_connected();
        let previous = self.connected_tx.send_replace(connected);
        if previous != connected {
            self.notify(NoticeKind::Connection(connected));
        }
    }

    fn notify(&self, kind: NoticeKind) {
        let _ = self.notices.send(SessionNotice {
            device_id: self.session.id().to_string(),
            kind,
        });
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
