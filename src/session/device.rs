//! Per-device aggregate state.
//!
//! [`DeviceSession`] is synchronous and never touches the transport. Every
//! input (a notification, a timer firing, a link event, a user request, a
//! write outcome) returns an [`Applied`] that says whether the change was
//! structural and lists the [`Effect`]s the caller must carry out: writes to
//! queue, a connection attempt to start, an export to hand over.
//!
//! The caller passes `now` explicitly, so the same code runs under the async
//! driver and under plain unit tests.

use chrono::{DateTime, Local, Offset, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

use super::draft::{ConfigDraft, DraftEdit, StatusKind};
use super::reconnect::{ReconnectDecision, ReconnectPhase, ReconnectPolicy, ReconnectScheduler};
use super::series::{parse_timestamp, MetricSeries, Profile, Sample, HISTORY_CAPACITY, LIVE_CAPACITY};
use super::timers::{TimerKind, Timers};
use super::transfer::{ChunkReassembler, TransferResult, TransferSettings};
use crate::error::SessionError;
use crate::export::{history_to_csv, normalize_export};
use crate::logutil::{escape_log, notification_preview};
use crate::metrics;
use crate::protocol::{
    decode_notification, Action, ActionKind, ConfigDelta, FlashStatus, Fragment, FragmentMode,
    KeyPolicy, MessageFramer, ParsedMessage, PayloadParser, ProfileUpdate,
};

/// Name of the series fed by the history stream.
pub const HISTORY_SERIES: &str = "history";
const MAX_WARNINGS: usize = 50;

/// Ack tags whose negative answer aborts a bulk transfer.
const TRANSFER_ACKS: &[&str] = &["flash_export", "flash_stream", "csv", "csv_chunk", "csv_block", "export"];

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub live_capacity: usize,
    pub history_capacity: usize,
    pub key_policy: KeyPolicy,
    pub transfer: TransferSettings,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            live_capacity: LIVE_CAPACITY,
            history_capacity: HISTORY_CAPACITY,
            key_policy: KeyPolicy::default(),
            transfer: TransferSettings::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Work the caller must carry out after a session update.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Queue a write to the node.
    Send(Action),
    /// Start a connection attempt.
    Connect,
    /// A bulk export finished; the CSV is ready for the consumer.
    Export(String),
}

#[derive(Debug, Default, PartialEq)]
pub struct Applied {
    /// Configuration-facing views should be rebuilt.
    pub structural: bool,
    /// Live metric values changed.
    pub metrics_updated: bool,
    pub effects: Vec<Effect>,
}

impl Applied {
    fn structural() -> Self {
        Self {
            structural: true,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: Applied) {
        self.structural |= other.structural;
        self.metrics_updated |= other.metrics_updated;
        self.effects.extend(other.effects);
    }

    /// Actions queued by this update, in order.
    pub fn sends(&self) -> impl Iterator<Item = &Action> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Send(action) => Some(action),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognizedSensor {
    pub sensor: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub at: DateTime<Utc>,
    pub message: String,
}

pub struct DeviceSession {
    id: String,
    name: Option<String>,
    connected: bool,
    sensor: Option<String>,
    address: Option<String>,
    recognized: Vec<RecognizedSensor>,
    metrics: HashMap<String, MetricSeries>,
    metric_order: Vec<String>,
    profiles: HashMap<String, Profile>,
    live: ConfigDelta,
    draft: ConfigDraft,
    pending_push: Option<Map<String, Value>>,
    reconnect: ReconnectScheduler,
    transfer: ChunkReassembler,
    flash: Option<FlashStatus>,
    history: VecDeque<Sample>,
    history_loading: bool,
    stop_sent: bool,
    warnings: VecDeque<Warning>,
    timers: Timers,
    framer: MessageFramer,
    parser: PayloadParser,
    settings: SessionSettings,
}

impl DeviceSession {
    pub fn new(id: impl Into<String>, settings: SessionSettings) -> Self {
        Self {
            id: id.into(),
            name: None,
            connected: false,
            sensor: None,
            address: None,
            recognized: Vec::new(),
            metrics: HashMap::new(),
            metric_order: Vec::new(),
            profiles: HashMap::new(),
            live: ConfigDelta::default(),
            draft: ConfigDraft::default(),
            pending_push: None,
            reconnect: ReconnectScheduler::new(settings.reconnect.clone()),
            transfer: ChunkReassembler::new(settings.transfer.clone()),
            flash: None,
            history: VecDeque::new(),
            history_loading: false,
            stop_sent: false,
            warnings: VecDeque::new(),
            timers: Timers::new(),
            framer: MessageFramer::new(),
            parser: PayloadParser::new(settings.key_policy),
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn sensor(&self) -> Option<&str> {
        self.sensor.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn recognized_sensors(&self) -> &[RecognizedSensor] {
        &self.recognized
    }

    /// Metric keys in display order.
    pub fn metric_keys(&self) -> &[String] {
        &self.metric_order
    }

    pub fn metric(&self, key: &str) -> Option<&MetricSeries> {
        self.metrics.get(key)
    }

    pub fn profile(&self, key: &str) -> Option<&Profile> {
        self.profiles.get(key)
    }

    pub fn live_config(&self) -> &ConfigDelta {
        &self.live
    }

    pub fn draft(&self) -> &ConfigDraft {
        &self.draft
    }

    pub fn flash(&self) -> Option<&FlashStatus> {
        self.flash.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &Sample> {
        self.history.iter()
    }

    /// Drained history rendered in the export layout.
    pub fn history_csv(&self) -> String {
        history_to_csv(&self.history)
    }

    pub fn history_loading(&self) -> bool {
        self.history_loading
    }

    pub fn transfer(&self) -> &ChunkReassembler {
        &self.transfer
    }

    pub fn reconnect(&self) -> &ReconnectScheduler {
        &self.reconnect
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.warnings.iter()
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ---- inbound ---------------------------------------------------------

    /// Decode, frame, parse and apply one raw notification.
    pub fn handle_notification(&mut self, raw: &[u8], now: Instant) -> Applied {
        metrics::inc_notifications();
        debug!("[{}] notification: {}", self.id, notification_preview(raw));
        let text = decode_notification(raw);
        let messages = self.framer.split(&text);
        metrics::inc_messages(messages.len() as u64);
        let mut applied = Applied::default();
        for message in messages {
            let hint = self.sensor.clone().or_else(|| self.live.sensor.clone());
            let parsed = self.parser.parse(&message, hint.as_deref());
            if parsed.is_empty() {
                debug!("[{}] ignored message: {}", self.id, escape_log(&message));
                continue;
            }
            applied.merge(self.apply(parsed, now));
        }
        applied
    }

    /// Route one parsed message to the sub-states it touches.
    pub fn apply(&mut self, msg: ParsedMessage, now: Instant) -> Applied {
        let mut applied = Applied {
            structural: msg.is_structural(),
            ..Default::default()
        };

        if let Some(address) = &msg.address {
            self.address = Some(address.clone());
        }
        if let Some(sensor) = &msg.sensor {
            self.sensor = Some(sensor.clone());
            let entry = RecognizedSensor {
                sensor: sensor.clone(),
                address: msg.address.clone().or_else(|| self.address.clone()),
            };
            if !self.recognized.contains(&entry) {
                info!("[{}] recognized sensor {} at {:?}", self.id, entry.sensor, entry.address);
                self.recognized.push(entry);
            }
        }
        if let Some(name) = &msg.name {
            self.set_name(name);
        }
        if let Some(config) = &msg.config {
            self.apply_config(config);
        }
        if let Some(flash) = &msg.flash {
            self.flash.get_or_insert_with(FlashStatus::default).merge(flash);
        }
        if let Some(ack) = &msg.ack {
            self.apply_ack(ack, msg.status.as_deref(), msg.message.as_deref());
        }
        if let Some(csv) = &msg.csv {
            info!("[{}] received inline export ({} bytes)", self.id, csv.len());
            self.draft.set_status(StatusKind::Ok, "Export received");
            applied.effects.push(Effect::Export(normalize_export(csv)));
        }
        if let Some(fragment) = msg.fragment {
            applied.merge(self.apply_fragment(fragment, now));
        }
        if !msg.profiles.is_empty() {
            self.apply_profiles(&msg.profiles, msg.profile_set);
        }
        if !msg.metrics.is_empty() {
            let at = msg
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now);
            for (key, value) in &msg.metrics {
                self.push_sample(key, Sample { at, value: *value });
            }
            applied.metrics_updated = true;
        }
        applied
    }

    fn set_name(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.name = Some(name.to_string());
        if !self.draft.touched {
            self.draft.name = Some(name.to_string());
        }
    }

    fn apply_config(&mut self, config: &ConfigDelta) {
        if let (Some(old), Some(new)) = (&self.live.sensor, &config.sensor) {
            if old != new {
                info!(
                    "[{}] sensor type changed {} -> {}, clearing metrics",
                    self.id, old, new
                );
                self.metrics.clear();
                self.metric_order.clear();
                self.profiles.clear();
            }
        }
        self.live.merge(config);
        if let Some(name) = &config.name {
            self.set_name(name);
        }
        self.draft.mirror(config);
    }

    fn apply_ack(&mut self, ack: &str, status: Option<&str>, message: Option<&str>) {
        let kind = match status {
            Some("error" | "err" | "fail" | "failed" | "nok") => StatusKind::Error,
            Some("ok" | "success" | "done") | None => StatusKind::Ok,
            Some(_) => StatusKind::Info,
        };
        let text = match (message, status) {
            (Some(m), _) if !m.trim().is_empty() => m.trim().to_string(),
            (_, Some(s)) => format!("{}: {}", ack, s),
            _ => format!("{}: ok", ack),
        };
        debug!("[{}] ack {} {:?}: {}", self.id, ack, kind, escape_log(&text));
        if kind == StatusKind::Error && TRANSFER_ACKS.contains(&ack) {
            warn!("[{}] node refused {}: {}", self.id, ack, escape_log(&text));
            self.transfer.abort(&mut self.timers);
            self.history_loading = false;
        }
        if ack == "flash_stream_stop" {
            self.history_loading = false;
        }
        self.draft.set_status(kind, text);
    }

    fn apply_fragment(&mut self, fragment: Fragment, now: Instant) -> Applied {
        let mut applied = Applied::structural();
        let mode = fragment.mode;
        if mode == FragmentMode::Lines && self.transfer.active_mode() != Some(FragmentMode::Lines) {
            self.history_loading = true;
            self.stop_sent = false;
        }
        let outcome = self.transfer.accept(fragment, &mut self.timers, now);
        if let Some(ack) = outcome.ack {
            self.queue(&mut applied, ack);
        }
        if let Some(result) = outcome.result {
            self.finish_export(result, &mut applied);
        }
        if outcome.stream_finished {
            self.finish_stream(&mut applied);
        }
        applied
    }

    fn finish_export(&mut self, result: TransferResult, applied: &mut Applied) {
        match result {
            TransferResult::Complete(payload) => {
                info!("[{}] export complete ({} bytes)", self.id, payload.len());
                self.draft.set_status(StatusKind::Ok, "Export complete");
                applied.effects.push(Effect::Export(normalize_export(&payload)));
            }
            TransferResult::Incomplete { missing, .. } => {
                let message = if missing == 0 {
                    "Export incomplete: transfer timed out".to_string()
                } else {
                    format!("Export incomplete: {} fragment(s) missing", missing)
                };
                warn!("[{}] {}", self.id, message);
                self.draft.set_status(StatusKind::Error, message);
            }
        }
    }

    fn finish_stream(&mut self, applied: &mut Applied) {
        self.history_loading = false;
        if !self.stop_sent {
            self.stop_sent = true;
            info!("[{}] history stream finished ({} samples)", self.id, self.history.len());
            self.queue(applied, Action::FlashStreamStop);
        }
    }

    fn apply_profiles(&mut self, updates: &IndexMap<String, ProfileUpdate>, full_set: bool) {
        for (key, update) in updates {
            let current = self
                .profiles
                .get(key)
                .cloned()
                .unwrap_or_else(|| Profile::base_for(key));
            match current.updated(update, key) {
                Ok(profile) => {
                    if let Some(series) = self.metrics.get_mut(key) {
                        series.profile = profile.clone();
                    }
                    self.profiles.insert(key.clone(), profile);
                }
                Err(message) => {
                    warn!("[{}] rejected profile update: {}", self.id, message);
                    self.record_warning(message);
                }
            }
        }
        if full_set {
            self.metrics.retain(|key, _| updates.contains_key(key));
            self.metric_order.retain(|key| updates.contains_key(key));
            self.profiles.retain(|key, _| updates.contains_key(key));
            for key in updates.keys() {
                self.ensure_series(key);
            }
        }
    }

    /// Create the series for `key` on first use and append it to the display order.
    fn ensure_series(&mut self, key: &str) {
        if !self.metrics.contains_key(key) {
            let fresh = self.new_series(key);
            self.metric_order.push(key.to_string());
            self.metrics.insert(key.to_string(), fresh);
        }
    }

    fn push_sample(&mut self, key: &str, sample: Sample) {
        self.ensure_series(key);
        if let Some(series) = self.metrics.get_mut(key) {
            series.push(sample);
        }
    }

    fn new_series(&self, key: &str) -> MetricSeries {
        if key == HISTORY_SERIES {
            return MetricSeries::new(key, self.primary_profile(), self.settings.history_capacity);
        }
        let profile = self
            .profiles
            .get(key)
            .cloned()
            .unwrap_or_else(|| Profile::base_for(key));
        MetricSeries::new(key, profile, self.settings.live_capacity)
    }

    /// Profile of the first live metric, which the history series copies.
    fn primary_profile(&self) -> Profile {
        self.metric_order
            .iter()
            .find(|key| key.as_str() != HISTORY_SERIES)
            .and_then(|key| self.metrics.get(key))
            .map(|series| series.profile.clone())
            .unwrap_or_else(|| Profile::base_for("generic"))
    }

    fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push_back(Warning {
            at: Utc::now(),
            message: message.into(),
        });
        while self.warnings.len() > MAX_WARNINGS {
            self.warnings.pop_front();
        }
    }

    fn queue(&self, applied: &mut Applied, action: Action) {
        if self.connected {
            applied.effects.push(Effect::Send(action));
        } else {
            debug!("[{}] not connected, dropping {}", self.id, action.kind());
        }
    }

    // ---- timers ----------------------------------------------------------

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Applied {
        let mut applied = Applied::default();
        for kind in self.timers.take_due(now) {
            applied.merge(self.on_timer(kind, now));
        }
        applied
    }

    pub fn on_timer(&mut self, kind: TimerKind, now: Instant) -> Applied {
        let mut applied = Applied::default();
        match kind {
            TimerKind::Reconnect => {
                if self.reconnect.on_timer_fired() {
                    info!(
                        "[{}] reconnect attempt {}",
                        self.id,
                        self.reconnect.attempts() + 1
                    );
                    applied.effects.push(Effect::Connect);
                }
            }
            TimerKind::TransferTimeout => {
                if let Some(result) = self.transfer.on_timeout(&mut self.timers) {
                    applied.structural = true;
                    self.finish_export(result, &mut applied);
                }
            }
            TimerKind::HistoryDrain => {
                let tick = self.transfer.drain(&mut self.timers, now);
                if tick.rejected > 0 {
                    debug!("[{}] skipped {} unparseable history lines", self.id, tick.rejected);
                }
                if !tick.samples.is_empty() {
                    applied.metrics_updated = true;
                    self.push_history(&tick.samples);
                }
                if tick.finished {
                    applied.structural = true;
                    self.finish_stream(&mut applied);
                }
            }
        }
        applied
    }

    fn push_history(&mut self, samples: &[Sample]) {
        let cap = self.settings.history_capacity.max(1);
        for sample in samples {
            self.history.push_back(*sample);
            self.push_sample(HISTORY_SERIES, *sample);
        }
        while self.history.len() > cap {
            self.history.pop_front();
        }
    }

    // ---- link lifecycle --------------------------------------------------

    /// Link established: reset backoff, sync the clock, fetch configuration.
    pub fn on_connected(&mut self, _now: Instant) -> Applied {
        info!("[{}] connected", self.id);
        self.connected = true;
        self.reconnect.on_connected(&mut self.timers);
        let mut applied = Applied::structural();
        self.queue(&mut applied, time_sync_action());
        self.queue(&mut applied, Action::ConfigGet);
        applied
    }

    /// Unexpected link loss.
    pub fn on_link_lost(&mut self, now: Instant) -> Applied {
        if self.connected {
            warn!("[{}] link lost", self.id);
        }
        self.go_offline();
        let decision = self.reconnect.on_link_lost(&mut self.timers, now);
        self.note_decision(decision);
        Applied::structural()
    }

    pub fn on_reconnect_failed(&mut self, now: Instant) -> Applied {
        let decision = self.reconnect.on_reconnect_failed(&mut self.timers, now);
        self.note_decision(decision);
        Applied::structural()
    }

    /// No connection slot was free for a scheduled reconnect.
    pub fn on_reconnect_deferred(&mut self, now: Instant) -> Applied {
        debug!("[{}] connection limit reached, reconnect deferred", self.id);
        let decision = self.reconnect.on_slot_unavailable(&mut self.timers, now);
        self.note_decision(decision);
        Applied::default()
    }

    fn note_decision(&mut self, decision: ReconnectDecision) {
        if decision == ReconnectDecision::GaveUp {
            self.record_warning(format!(
                "gave up reconnecting after {} attempts",
                self.reconnect.attempts()
            ));
        }
    }

    /// User-initiated disconnect; leaves the retry loop.
    pub fn manual_disconnect(&mut self) -> Applied {
        info!("[{}] disconnected by user", self.id);
        self.reconnect.disable(&mut self.timers);
        self.go_offline();
        Applied::structural()
    }

    /// User-initiated reconnect; re-enables the retry loop.
    pub fn manual_reconnect(&mut self) -> Applied {
        self.reconnect.reset_for_manual(&mut self.timers);
        Applied {
            structural: true,
            effects: vec![Effect::Connect],
            ..Default::default()
        }
    }

    /// Stop everything this session scheduled.
    pub fn close(&mut self) {
        self.reconnect.disable(&mut self.timers);
        self.go_offline();
        self.timers.cancel_all();
    }

    fn go_offline(&mut self) {
        self.connected = false;
        self.pending_push = None;
        if self.transfer.abort(&mut self.timers) {
            self.draft.set_status(StatusKind::Error, "Transfer interrupted by disconnect");
        }
        self.history_loading = false;
    }

    // ---- user requests ---------------------------------------------------

    fn ensure_connected(&mut self) -> Result<(), SessionError> {
        if self.connected {
            Ok(())
        } else {
            self.draft.set_status(StatusKind::Error, "Device not connected");
            Err(SessionError::NotConnected)
        }
    }

    fn request(&mut self, action: Action) -> Result<Applied, SessionError> {
        self.ensure_connected()?;
        let mut applied = Applied::default();
        self.queue(&mut applied, action);
        Ok(applied)
    }

    pub fn request_config(&mut self) -> Result<Applied, SessionError> {
        self.request(Action::ConfigGet)
    }

    pub fn request_flash_status(&mut self) -> Result<Applied, SessionError> {
        self.request(Action::FlashStatus)
    }

    pub fn sync_time(&mut self) -> Result<Applied, SessionError> {
        self.request(time_sync_action())
    }

    pub fn set_store_flash(&mut self, flag: bool) -> Result<Applied, SessionError> {
        self.request(Action::StoreFlash(flag))
    }

    /// Ask for a full CSV export; any running transfer is dropped first.
    pub fn start_export(&mut self) -> Result<Applied, SessionError> {
        self.ensure_connected()?;
        self.transfer.abort(&mut self.timers);
        self.history_loading = false;
        self.draft.set_status(StatusKind::Info, "Export requested");
        let mut applied = self.request(Action::FlashExport)?;
        applied.structural = true;
        Ok(applied)
    }

    /// Start streaming the flash log into the history series.
    pub fn start_history_stream(&mut self) -> Result<Applied, SessionError> {
        self.ensure_connected()?;
        self.transfer.abort(&mut self.timers);
        self.history.clear();
        if self.metrics.remove(HISTORY_SERIES).is_some() {
            self.metric_order.retain(|key| key != HISTORY_SERIES);
        }
        self.history_loading = true;
        self.stop_sent = false;
        let mut applied = self.request(Action::FlashStream)?;
        applied.structural = true;
        Ok(applied)
    }

    pub fn stop_history_stream(&mut self) -> Result<Applied, SessionError> {
        self.ensure_connected()?;
        self.transfer.abort(&mut self.timers);
        self.history_loading = false;
        self.stop_sent = true;
        let mut applied = self.request(Action::FlashStreamStop)?;
        applied.structural = true;
        Ok(applied)
    }

    /// Send the draft as a configuration push.
    pub fn push_config(&mut self) -> Result<Applied, SessionError> {
        self.ensure_connected()?;
        let Some(payload) = self.draft.build_payload() else {
            self.draft
                .set_status(StatusKind::Error, "No valid configuration to send");
            return Err(SessionError::NothingToSend);
        };
        self.pending_push = Some(payload.clone());
        self.request(Action::PushConfig(payload))
    }

    pub fn edit_draft(&mut self, edit: DraftEdit) -> Applied {
        self.draft.apply(edit);
        Applied::structural()
    }

    pub fn clear_draft(&mut self) -> Applied {
        self.draft.reset_to(&self.live);
        if let Some(name) = &self.name {
            self.draft.name = Some(name.clone());
        }
        Applied::structural()
    }

    /// Outcome of a queued write.
    pub fn on_write_result(&mut self, kind: ActionKind, result: Result<(), String>) -> Applied {
        match result {
            Ok(()) => {
                debug!("[{}] wrote {}", self.id, kind);
                if kind == ActionKind::PushConfig {
                    if let Some(name) = self
                        .pending_push
                        .take()
                        .and_then(|p| p.get("name").and_then(Value::as_str).map(str::to_string))
                    {
                        self.name = Some(name.clone());
                        self.draft.name = Some(name);
                    }
                    self.draft.touched = false;
                    self.draft.set_status(StatusKind::Ok, "Configuration sent");
                    return Applied::structural();
                }
                Applied::default()
            }
            Err(e) => {
                metrics::inc_writes_failed();
                warn!("[{}] write {} failed: {}", self.id, kind, e);
                if !kind.is_user_initiated() {
                    return Applied::default();
                }
                match kind {
                    ActionKind::PushConfig => self.pending_push = None,
                    ActionKind::FlashExport | ActionKind::FlashStream => {
                        self.transfer.abort(&mut self.timers);
                        self.history_loading = false;
                    }
                    _ => {}
                }
                self.draft
                    .set_status(StatusKind::Error, format!("Sending {} failed", kind));
                Applied::structural()
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            connected: self.connected,
            sensor: self.sensor.clone(),
            address: self.address.clone(),
            recognized: self.recognized.clone(),
            metrics: self
                .metric_order
                .iter()
                .filter_map(|key| self.metrics.get(key))
                .map(|series| MetricView {
                    key: series.key.clone(),
                    label: series.profile.label.clone(),
                    unit: series.profile.unit.clone(),
                    min: series.profile.min,
                    max: series.profile.max,
                    latest: series.latest,
                    samples: series.len(),
                })
                .collect(),
            config: self.live.clone(),
            draft: self.draft.clone(),
            flash: self.flash,
            history_samples: self.history.len(),
            history_loading: self.history_loading,
            transfer_active: self.transfer.is_active(),
            reconnect: ReconnectView {
                phase: self.reconnect.phase(),
                attempts: self.reconnect.attempts(),
                auto_reconnect: self.reconnect.auto_reconnect(),
            },
            warnings: self.warnings.iter().cloned().collect(),
        }
    }
}

fn time_sync_action() -> Action {
    let now = Local::now();
    Action::TimeSync {
        epoch_ms: now.timestamp_millis(),
        tz_offset_min: now.offset().fix().local_minus_utc() / 60,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricView {
    pub key: String,
    pub label: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub latest: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectView {
    pub phase: ReconnectPhase,
    pub attempts: u32,
    pub auto_reconnect: bool,
}

/// Serializable view of a session, for observers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub connected: bool,
    pub sensor: Option<String>,
    pub address: Option<String>,
    pub recognized: Vec<RecognizedSensor>,
    pub metrics: Vec<MetricView>,
    pub config: ConfigDelta,
    pub draft: ConfigDraft,
    pub flash: Option<FlashStatus>,
    pub history_samples: usize,
    pub history_loading: bool,
    pub transfer_active: bool,
    pub reconnect: ReconnectView,
    pub warnings: Vec<Warning>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PinRole;
    use std::time::Duration;

    fn connected() -> (DeviceSession, Instant) {
        let mut s = DeviceSession::new("aa:bb", SessionSettings::default());
        let now = Instant::now();
        s.on_connected(now);
        (s, now)
    }

    #[test]
    fn connect_queues_time_sync_then_config_get() {
        let mut s = DeviceSession::new("aa:bb", SessionSettings::default());
        let applied = s.on_connected(Instant::now());
        let kinds: Vec<ActionKind> = applied.sends().map(Action::kind).collect();
        assert_eq!(kinds, vec![ActionKind::TimeSync, ActionKind::ConfigGet]);
        assert!(s.is_connected());
    }

    #[test]
    fn metric_ticks_are_not_structural() {
        let (mut s, now) = connected();
        let applied = s.handle_notification(br#"{"m":{"t":21.5,"h":40}}"#, now);
        assert!(!applied.structural);
        assert!(applied.metrics_updated);
        assert_eq!(s.metric_keys(), &["temperature".to_string(), "humidity".to_string()]);
        assert_eq!(s.metric("temperature").unwrap().latest, Some(21.5));

        let applied = s.handle_notification(br#"{"name":"greenhouse"}"#, now);
        assert!(applied.structural);
        assert_eq!(s.name(), Some("greenhouse"));
        assert_eq!(s.draft().name.as_deref(), Some("greenhouse"));
    }

    #[test]
    fn touched_draft_survives_device_reports() {
        let (mut s, now) = connected();
        s.edit_draft(DraftEdit::Name("shed".into()));
        s.handle_notification(br#"{"config":{"name":"greenhouse","frequency":2000}}"#, now);
        assert_eq!(s.name(), Some("greenhouse"));
        assert_eq!(s.draft().name.as_deref(), Some("shed"));
        assert_eq!(s.live_config().frequency_ms, Some(2000));
        s.clear_draft();
        assert_eq!(s.draft().name.as_deref(), Some("greenhouse"));
        assert!(!s.draft().touched);
    }

    #[test]
    fn sensor_change_clears_metrics() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"config":{"sensor":"bmp280"}}"#, now);
        s.handle_notification(br#"{"m":{"t":20}}"#, now);
        assert_eq!(s.metric_keys().len(), 1);
        s.handle_notification(br#"{"config":{"sensor":"analog"}}"#, now);
        assert!(s.metric_keys().is_empty());
    }

    #[test]
    fn inverted_profile_is_rejected_with_warning() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"m":{"t":20}}"#, now);
        s.handle_notification(br#"{"ranges":{"temperature":[80,10]}}"#, now);
        assert_eq!(s.metric("temperature").unwrap().profile.min, -10.0);
        assert_eq!(s.warnings().count(), 1);
    }

    #[test]
    fn full_profile_set_restricts_metric_keys() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"m":{"t":20,"h":50,"p":1000}}"#, now);
        let applied = s.handle_notification(
            br#"{"profiles":{"temperature":{"label":"Air","unit":"C","min":0,"max":40}}}"#,
            now,
        );
        assert!(applied.structural);
        assert_eq!(s.metric_keys(), &["temperature".to_string()]);
        assert_eq!(s.metric("temperature").unwrap().profile.label, "Air");
    }

    #[test]
    fn indexed_export_acks_and_delivers_csv() {
        let (mut s, now) = connected();
        s.start_export().unwrap();
        let first = s.handle_notification(
            br#"{"csv_chunk":{"id":5,"seq":1,"last":true,"data":"01/01/24 00:00:01,2.0,\n"}}"#,
            now,
        );
        assert!(matches!(
            first.sends().next(),
            Some(Action::CsvAck { seq: 1, .. })
        ));
        let second = s.handle_notification(
            br#"{"csv_chunk":{"id":5,"seq":0,"last":false,"data":"date_time,value1,value2\n01/01/24 00:00:00,1.0,\n"}}"#,
            now,
        );
        let export = second.effects.iter().find_map(|e| match e {
            Effect::Export(csv) => Some(csv.clone()),
            _ => None,
        });
        assert_eq!(
            export.as_deref(),
            Some("date_time,value1,value2\n01/01/24 00:00:00,1.0,\n01/01/24 00:00:01,2.0,\n")
        );
        assert!(!s.transfer().is_active());
    }

    #[test]
    fn negative_export_ack_aborts_transfer() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"csv_chunk":{"id":1,"seq":0,"last":false,"data":"a"}}"#, now);
        assert!(s.transfer().is_active());
        s.handle_notification(
            br#"{"ack":"flash_export","status":"error","message":"busy"}"#,
            now,
        );
        assert!(!s.transfer().is_active());
        assert!(!s.timers().is_armed(TimerKind::TransferTimeout));
        let status = s.draft().status.clone().unwrap();
        assert_eq!(status.kind, StatusKind::Error);
        assert_eq!(status.message, "busy");
    }

    #[test]
    fn transfer_timeout_reports_incomplete() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"csv_chunk":{"id":1,"seq":1,"last":true,"data":"b"}}"#, now);
        let applied = s.poll_timers(now + Duration::from_secs(31));
        assert!(applied.structural);
        assert!(!applied.effects.iter().any(|e| matches!(e, Effect::Export(_))));
        assert_eq!(s.draft().status.as_ref().unwrap().kind, StatusKind::Error);
    }

    #[test]
    fn history_stream_drains_and_stops_once() {
        let (mut s, now) = connected();
        s.handle_notification(br#"{"m":{"t":20}}"#, now);
        s.start_history_stream().unwrap();
        assert!(s.history_loading());
        s.handle_notification(
            br#"{"csv_block":{"id":2,"seq":0,"last":false,"data":"2024-01-01 00:00:00,12.5\n2024-01-01 00:00:01,13.0"}}"#,
            now,
        );
        s.handle_notification(br#"{"csv_block":{"id":2,"seq":1,"last":true,"data":""}}"#, now);
        let applied = s.poll_timers(now + Duration::from_secs(1));
        let values: Vec<f64> = s.history().map(|x| x.value).collect();
        assert_eq!(values, vec![12.5, 13.0]);
        let stops = applied
            .sends()
            .filter(|a| a.kind() == ActionKind::FlashStreamStop)
            .count();
        assert_eq!(stops, 1);
        assert!(!s.history_loading());
        let history = s.metric(HISTORY_SERIES).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.profile.label, "Temperature");
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn requests_fail_while_disconnected() {
        let mut s = DeviceSession::new("aa:bb", SessionSettings::default());
        assert_eq!(s.request_config(), Err(SessionError::NotConnected));
        assert_eq!(s.draft().status.as_ref().unwrap().kind, StatusKind::Error);
    }

    #[test]
    fn successful_push_applies_name_and_clears_touched() {
        let (mut s, _) = connected();
        s.edit_draft(DraftEdit::Name("shed".into()));
        s.edit_draft(DraftEdit::Pin(PinRole::I2cSda, Some(21)));
        let applied = s.push_config().unwrap();
        assert!(matches!(applied.sends().next(), Some(Action::PushConfig(_))));
        s.on_write_result(ActionKind::PushConfig, Ok(()));
        assert_eq!(s.name(), Some("shed"));
        assert!(!s.draft().touched);
        assert_eq!(s.draft().status.as_ref().unwrap().kind, StatusKind::Ok);
    }

    #[test]
    fn failed_ack_write_does_not_touch_draft_status() {
        let (mut s, _) = connected();
        s.on_write_result(ActionKind::CsvAck, Err("gatt busy".into()));
        assert!(s.draft().status.is_none());
        s.on_write_result(ActionKind::FlashStatus, Err("gatt busy".into()));
        assert_eq!(s.draft().status.as_ref().unwrap().kind, StatusKind::Error);
    }

    #[test]
    fn link_loss_schedules_reconnect_and_close_cancels_it() {
        let (mut s, now) = connected();
        s.on_link_lost(now);
        assert!(!s.is_connected());
        assert!(s.timers().is_armed(TimerKind::Reconnect));
        let applied = s.poll_timers(now + Duration::from_millis(1000));
        assert_eq!(applied.effects, vec![Effect::Connect]);
        s.close();
        assert!(s.next_deadline().is_none());
    }
}
