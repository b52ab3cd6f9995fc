//! Explicit, cancellable timer slots owned by a session.
//!
//! A session never spawns ambient timers. It arms deadlines here and the
//! driver sleeps until [`Timers::next_deadline`], then hands due kinds back via
//! [`Timers::take_due`]. Tests drive the same API with hand-made instants.
//!
//! Each arm returns a [`TimerToken`]; re-arming a kind bumps its generation so
//! a token held for an older deadline no longer matches.

use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Reconnect,
    TransferTimeout,
    HistoryDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct Timers {
    next_generation: u64,
    armed: HashMap<TimerKind, (Instant, u64)>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `kind` to fire at `at`.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) -> TimerToken {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(kind, (at, generation));
        TimerToken { kind, generation }
    }

    /// Cancel `kind`; returns whether anything was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.armed.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Whether `token` still refers to the currently armed deadline.
    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed
            .get(&token.kind)
            .map(|(_, generation)| *generation == token.generation)
            .unwrap_or(false)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.armed.get(&kind).map(|(at, _)| *at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().map(|(at, _)| *at).min()
    }

    /// Disarm and return every kind due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .armed
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(kind, (at, _))| (*at, *kind))
            .collect();
        due.sort();
        for (_, kind) in &due {
            self.armed.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}
