//! Reconnection backoff for a session whose link dropped.
//!
//! ```text
//! Connected ──link lost──▶ Disconnected ──▶ AwaitingBackoff ──timer──▶ Reconnecting
//!     ▲                                          ▲                       │
//!     └────────────── success ───────────────────┼───────────────────────┤
//!                                                └──── failure ──────────┘
//!                                 attempts ≥ ceiling ─▶ GivingUp
//! ```
//!
//! `delay = min(base × 2^attempts, max)`. A manual disconnect switches auto
//! reconnect off and cancels the pending timer; only a manual reconnect turns
//! it back on.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::timers::{TimerKind, TimerToken, Timers};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1000,
            max_delay_ms: 15000,
            max_attempts: 6,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconnectPhase {
    Connected,
    Disconnected,
    AwaitingBackoff,
    Reconnecting,
    GivingUp,
}

/// Outcome of asking the scheduler to plan the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Scheduled(Duration),
    AlreadyPending,
    Disabled,
    GaveUp,
}

#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    attempts: u32,
    auto_reconnect: bool,
    pending: Option<TimerToken>,
    phase: ReconnectPhase,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let auto_reconnect = policy.enabled;
        Self {
            policy,
            attempts: 0,
            auto_reconnect,
            pending: None,
            phase: ReconnectPhase::Disconnected,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// True while a backoff timer is pending or an attempt is in flight.
    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self.phase,
            ReconnectPhase::AwaitingBackoff | ReconnectPhase::Reconnecting
        )
    }

    pub fn has_pending_timer(&self, timers: &Timers) -> bool {
        self.pending.map(|t| timers.is_current(t)).unwrap_or(false)
    }

    /// Unexpected link loss.
    pub fn on_link_lost(&mut self, timers: &mut Timers, now: Instant) -> ReconnectDecision {
        if self.phase == ReconnectPhase::Connected {
            self.phase = ReconnectPhase::Disconnected;
        }
        self.schedule(timers, now)
    }

    /// Plan the next attempt according to the backoff rule.
    pub fn schedule(&mut self, timers: &mut Timers, now: Instant) -> ReconnectDecision {
        if !self.auto_reconnect {
            return ReconnectDecision::Disabled;
        }
        if self.has_pending_timer(timers) {
            return ReconnectDecision::AlreadyPending;
        }
        if self.attempts >= self.policy.max_attempts {
            info!(
                "reconnect: giving up after {} attempts",
                self.attempts
            );
            self.phase = ReconnectPhase::GivingUp;
            self.pending = None;
            return ReconnectDecision::GaveUp;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.pending = Some(timers.arm(TimerKind::Reconnect, now + delay));
        self.phase = ReconnectPhase::AwaitingBackoff;
        debug!(
            "reconnect: attempt {} scheduled in {} ms",
            self.attempts + 1,
            delay.as_millis()
        );
        ReconnectDecision::Scheduled(delay)
    }

    /// The backoff timer fired. Returns whether an attempt should start now;
    /// a manual disconnect in the meantime turns this into a no-op.
    pub fn on_timer_fired(&mut self) -> bool {
        self.pending = None;
        if !self.auto_reconnect || self.phase != ReconnectPhase::AwaitingBackoff {
            return false;
        }
        self.phase = ReconnectPhase::Reconnecting;
        metrics::inc_reconnect_attempts();
        true
    }

    pub fn on_reconnect_failed(&mut self, timers: &mut Timers, now: Instant) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.phase == ReconnectPhase::Reconnecting {
            self.phase = ReconnectPhase::Disconnected;
        }
        self.schedule(timers, now)
    }

    /// The timer fired while every connection slot was taken. Wait another
    /// backoff period without counting an attempt.
    pub fn on_slot_unavailable(&mut self, timers: &mut Timers, now: Instant) -> ReconnectDecision {
        if self.phase == ReconnectPhase::Reconnecting {
            self.phase = ReconnectPhase::Disconnected;
        }
        self.schedule(timers, now)
    }

    pub fn on_connected(&mut self, timers: &mut Timers) {
        self.attempts = 0;
        self.auto_reconnect = self.policy.enabled;
        self.cancel_pending(timers);
        self.phase = ReconnectPhase::Connected;
    }

    /// Manual disconnect: explicit exit from the retry loop.
    pub fn disable(&mut self, timers: &mut Timers) {
        self.auto_reconnect = false;
        self.cancel_pending(timers);
        if self.phase != ReconnectPhase::Connected {
            self.phase = ReconnectPhase::Disconnected;
        }
    }

    /// Manual reconnect: re-enable the loop and start counting afresh.
    pub fn reset_for_manual(&mut self, timers: &mut Timers) {
        self.attempts = 0;
        self.auto_reconnect = self.policy.enabled;
        self.cancel_pending(timers);
        self.phase = ReconnectPhase::Reconnecting;
    }

    fn cancel_pending(&mut self, timers: &mut Timers) {
        if self.pending.take().is_some() {
            timers.cancel(TimerKind::Reconnect);
        }
    }
}
