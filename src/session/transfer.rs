//! Bulk transfer reassembly (`csv_chunk` / `csv_block`).
//!
//! Two modes share one state slot, so a session never tracks more than one
//! transfer:
//!
//! * **Indexed**: fragments are stored by sequence and joined on completion.
//!   Completion means every slot `0..=last` is filled once `last` is known,
//!   otherwise that the received byte count reached the declared total. Each
//!   fragment (re)arms a single-shot inactivity timeout.
//! * **Lines**: each fragment carries newline-delimited records that go into a
//!   bounded intake queue. A periodic drain tick pops a batch, parses
//!   `timestamp,value[,...]` rows and hands samples to the session. After the
//!   producer's final fragment, an empty queue finalizes the stream.
//!
//! Acknowledgements go out every `ack_every` sequence numbers and always for
//! the final fragment. Repeated sequence numbers are acknowledged again (the
//! node retransmits when an ack is lost) but never stored twice.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::series::{parse_timestamp, Sample};
use super::timers::{TimerKind, Timers};
use crate::metrics;
use crate::protocol::keys::number_from_str;
use crate::protocol::{Action, Fragment, FragmentMode};

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub ack_every: u32,
    pub timeout: Duration,
    pub max_pending_lines: usize,
    pub drain_batch: usize,
    pub drain_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            ack_every: 1,
            timeout: Duration::from_secs(30),
            max_pending_lines: 2000,
            drain_batch: 20,
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// Final state of an indexed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Complete(String),
    /// Received fragments joined in order, with a count of the sequences
    /// that never arrived.
    Incomplete { payload: String, missing: u64 },
}

/// What a single fragment caused.
#[derive(Debug, Default, PartialEq)]
pub struct FragmentOutcome {
    pub ack: Option<Action>,
    pub result: Option<TransferResult>,
    pub duplicate: bool,
    /// Line-mode stream reached its end with nothing left to drain.
    pub stream_finished: bool,
}

/// Result of one drain tick.
#[derive(Debug, Default, PartialEq)]
pub struct DrainOutcome {
    pub samples: Vec<Sample>,
    pub rejected: usize,
    /// True exactly once per stream, when the last line has been consumed.
    pub finished: bool,
}

#[derive(Debug)]
struct IndexedTransfer {
    id: Option<String>,
    slots: BTreeMap<u32, String>,
    received: u64,
    total: Option<u64>,
    last: Option<u32>,
    started: Instant,
    last_activity: Instant,
}

impl IndexedTransfer {
    /// Stored sequences at or below `end`.
    fn filled_through(&self, end: u32) -> u64 {
        self.slots.range(..=end).count() as u64
    }

    fn is_complete(&self) -> bool {
        match self.last {
            Some(last) => self.filled_through(last) == u64::from(last) + 1,
            None => matches!(self.total, Some(total) if self.received >= total),
        }
    }

    fn assemble(&self) -> TransferResult {
        let Some(end) = self.last.or_else(|| self.slots.keys().next_back().copied()) else {
            return TransferResult::Incomplete {
                payload: String::new(),
                missing: 0,
            };
        };
        let mut payload = String::with_capacity(self.received as usize);
        for data in self.slots.range(..=end).map(|(_, data)| data) {
            payload.push_str(data);
        }
        let missing = u64::from(end) + 1 - self.filled_through(end);
        if missing == 0 && (self.last.is_some() || self.is_complete()) {
            TransferResult::Complete(payload)
        } else {
            TransferResult::Incomplete { payload, missing }
        }
    }
}

#[derive(Debug)]
struct LineTransfer {
    id: Option<String>,
    seen: BTreeSet<u32>,
    pending: VecDeque<String>,
    done: bool,
    started: Instant,
}

#[derive(Debug)]
enum Transfer {
    Indexed(IndexedTransfer),
    Lines(LineTransfer),
}

impl Transfer {
    fn mode(&self) -> FragmentMode {
        match self {
            Transfer::Indexed(_) => FragmentMode::Indexed,
            Transfer::Lines(_) => FragmentMode::Lines,
        }
    }

    fn id(&self) -> Option<&str> {
        match self {
            Transfer::Indexed(t) => t.id.as_deref(),
            Transfer::Lines(t) => t.id.as_deref(),
        }
    }
}

#[derive(Debug)]
pub struct ChunkReassembler {
    settings: TransferSettings,
    active: Option<Transfer>,
}

impl ChunkReassembler {
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            settings,
            active: None,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_mode(&self) -> Option<FragmentMode> {
        self.active.as_ref().map(Transfer::mode)
    }

    /// Received byte count of the active indexed transfer.
    pub fn received_bytes(&self) -> Option<u64> {
        match &self.active {
            Some(Transfer::Indexed(t)) => Some(t.received),
            _ => None,
        }
    }

    pub fn pending_lines(&self) -> usize {
        match &self.active {
            Some(Transfer::Lines(t)) => t.pending.len(),
            _ => 0,
        }
    }

    /// Drop any active transfer and its timers.
    pub fn abort(&mut self, timers: &mut Timers) -> bool {
        timers.cancel(TimerKind::TransferTimeout);
        timers.cancel(TimerKind::HistoryDrain);
        match self.active.take() {
            Some(transfer) => {
                info!(
                    "transfer: aborted {:?} transfer id={:?}",
                    transfer.mode(),
                    transfer.id()
                );
                true
            }
            None => false,
        }
    }

    pub fn accept(&mut self, fragment: Fragment, timers: &mut Timers, now: Instant) -> FragmentOutcome {
        metrics::inc_fragments();
        let restart = match &self.active {
            None => true,
            Some(active) => {
                active.mode() != fragment.mode
                    || active.id() != fragment.transfer_id.as_deref()
            }
        };
        if restart {
            if self.active.is_some() {
                debug!(
                    "transfer: new {:?} transfer id={:?} replaces the active one",
                    fragment.mode, fragment.transfer_id
                );
            }
            self.abort(timers);
            self.active = Some(match fragment.mode {
                FragmentMode::Indexed => Transfer::Indexed(IndexedTransfer {
                    id: fragment.transfer_id.clone(),
                    slots: BTreeMap::new(),
                    received: 0,
                    total: None,
                    last: None,
                    started: now,
                    last_activity: now,
                }),
                FragmentMode::Lines => Transfer::Lines(LineTransfer {
                    id: fragment.transfer_id.clone(),
                    seen: BTreeSet::new(),
                    pending: VecDeque::new(),
                    done: false,
                    started: now,
                }),
            });
        }

        let mut outcome = FragmentOutcome {
            ack: self.ack_for(&fragment),
            ..Default::default()
        };
        match fragment.mode {
            FragmentMode::Indexed => self.accept_indexed(fragment, timers, now, &mut outcome),
            FragmentMode::Lines => self.accept_lines(fragment, timers, now, &mut outcome),
        }
        if outcome.duplicate {
            metrics::inc_duplicate_fragments();
        }
        outcome
    }

    fn ack_for(&self, fragment: &Fragment) -> Option<Action> {
        let every = self.settings.ack_every.max(1);
        if fragment.last || (u64::from(fragment.seq) + 1) % u64::from(every) == 0 {
            Some(Action::CsvAck {
                id: fragment.transfer_id.clone(),
                seq: fragment.seq,
            })
        } else {
            None
        }
    }

    fn accept_indexed(
        &mut self,
        fragment: Fragment,
        timers: &mut Timers,
        now: Instant,
        outcome: &mut FragmentOutcome,
    ) {
        let Some(Transfer::Indexed(transfer)) = self.active.as_mut() else {
            return;
        };
        transfer.last_activity = now;
        if let Some(total) = fragment.total {
            transfer.total = Some(total);
        }
        if fragment.last {
            transfer.last = Some(fragment.seq);
        }
        if transfer.slots.contains_key(&fragment.seq) {
            outcome.duplicate = true;
        } else {
            transfer.received += fragment.data.len() as u64;
            transfer.slots.insert(fragment.seq, fragment.data);
        }

        if transfer.is_complete() {
            let result = transfer.assemble();
            debug!(
                "transfer: indexed id={:?} finished after {} ms",
                transfer.id,
                now.saturating_duration_since(transfer.started).as_millis()
            );
            self.finish(timers, &result);
            outcome.result = Some(result);
        } else {
            timers.arm(TimerKind::TransferTimeout, now + self.settings.timeout);
        }
    }

    fn accept_lines(
        &mut self,
        fragment: Fragment,
        timers: &mut Timers,
        now: Instant,
        outcome: &mut FragmentOutcome,
    ) {
        let cap = self.settings.max_pending_lines.max(1);
        let Some(Transfer::Lines(transfer)) = self.active.as_mut() else {
            return;
        };
        if !transfer.seen.insert(fragment.seq) {
            outcome.duplicate = true;
            return;
        }
        for line in fragment.data.lines() {
            let line = line.trim();
            if line.is_empty() || is_header(line) {
                continue;
            }
            transfer.pending.push_back(line.to_string());
        }
        let overflow = transfer.pending.len().saturating_sub(cap);
        if overflow > 0 {
            transfer.pending.drain(..overflow);
            metrics::add_history_lines_dropped(overflow as u64);
            warn!("transfer: history intake full, dropped {} oldest lines", overflow);
        }
        if fragment.last {
            transfer.done = true;
        }

        if transfer.pending.is_empty() {
            if transfer.done {
                debug!(
                    "transfer: stream id={:?} ended after {} ms",
                    transfer.id,
                    now.saturating_duration_since(transfer.started).as_millis()
                );
                self.active = None;
                timers.cancel(TimerKind::HistoryDrain);
                outcome.stream_finished = true;
            }
        } else if !timers.is_armed(TimerKind::HistoryDrain) {
            timers.arm(TimerKind::HistoryDrain, now + self.settings.drain_interval);
        }
    }

    /// One drain tick: pop up to `drain_batch` lines and parse them.
    pub fn drain(&mut self, timers: &mut Timers, now: Instant) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let Some(Transfer::Lines(transfer)) = self.active.as_mut() else {
            timers.cancel(TimerKind::HistoryDrain);
            return outcome;
        };
        let batch = self.settings.drain_batch.max(1).min(transfer.pending.len());
        for line in transfer.pending.drain(..batch) {
            match parse_history_line(&line) {
                Some(sample) => outcome.samples.push(sample),
                None => outcome.rejected += 1,
            }
        }
        if !transfer.pending.is_empty() {
            timers.arm(TimerKind::HistoryDrain, now + self.settings.drain_interval);
        } else {
            timers.cancel(TimerKind::HistoryDrain);
            if transfer.done {
                self.active = None;
                outcome.finished = true;
            }
        }
        outcome
    }

    /// The inactivity timeout fired. Only indexed transfers carry one.
    pub fn on_timeout(&mut self, timers: &mut Timers) -> Option<TransferResult> {
        let Some(Transfer::Indexed(transfer)) = &self.active else {
            return None;
        };
        let result = transfer.assemble();
        warn!(
            "transfer: id={:?} timed out with {} of {:?} bytes",
            transfer.id, transfer.received, transfer.total
        );
        self.finish(timers, &result);
        Some(result)
    }

    fn finish(&mut self, timers: &mut Timers, result: &TransferResult) {
        timers.cancel(TimerKind::TransferTimeout);
        self.active = None;
        metrics::inc_transfer_outcome(matches!(result, TransferResult::Complete(_)));
    }
}

fn is_header(line: &str) -> bool {
    let first = line.split(',').next().unwrap_or("").trim().to_ascii_lowercase();
    first == "date_time" || first == "timestamp"
}

/// Parse `timestamp,value[,...]`. Rows with a bad timestamp or a non-finite
/// value are rejected.
pub fn parse_history_line(line: &str) -> Option<Sample> {
    let mut fields = line.split(',');
    let at = parse_timestamp(fields.next()?)?;
    let value = number_from_str(fields.next()?)?;
    Some(Sample { at, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u32, last: bool, data: &str) -> Fragment {
        Fragment {
            mode: FragmentMode::Indexed,
            seq,
            transfer_id: Some("7".into()),
            total: None,
            last,
            data: data.into(),
        }
    }

    fn block(seq: u32, last: bool, data: &str) -> Fragment {
        Fragment {
            mode: FragmentMode::Lines,
            seq,
            transfer_id: Some("3".into()),
            total: None,
            last,
            data: data.into(),
        }
    }

    #[test]
    fn out_of_order_chunks_complete_in_sequence_order() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        let first = r.accept(chunk(1, true, "B"), &mut timers, now);
        assert!(first.result.is_none());
        assert!(timers.is_armed(TimerKind::TransferTimeout));
        let second = r.accept(chunk(0, false, "A"), &mut timers, now);
        assert_eq!(second.result, Some(TransferResult::Complete("AB".into())));
        assert!(!r.is_active());
        assert!(!timers.is_armed(TimerKind::TransferTimeout));
    }

    #[test]
    fn single_last_chunk_completes_immediately() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let out = r.accept(chunk(0, true, "A"), &mut timers, Instant::now());
        assert_eq!(out.result, Some(TransferResult::Complete("A".into())));
        assert!(out.ack.is_some());
    }

    #[test]
    fn declared_total_completes_without_last() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        let mut f = chunk(0, false, "abc");
        f.total = Some(5);
        assert!(r.accept(f, &mut timers, now).result.is_none());
        let out = r.accept(chunk(1, false, "de"), &mut timers, now);
        assert_eq!(out.result, Some(TransferResult::Complete("abcde".into())));
    }

    #[test]
    fn duplicates_do_not_change_counters() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(chunk(0, false, "AAA"), &mut timers, now);
        let dup = r.accept(chunk(0, false, "AAA"), &mut timers, now);
        assert!(dup.duplicate);
        assert_eq!(r.received_bytes(), Some(3));
        let done = r.accept(chunk(1, true, "B"), &mut timers, now);
        assert_eq!(done.result, Some(TransferResult::Complete("AAAB".into())));
    }

    #[test]
    fn timeout_reports_missing_sequences() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(chunk(0, false, "A"), &mut timers, now);
        r.accept(chunk(2, true, "C"), &mut timers, now);
        let due = timers.take_due(now + Duration::from_secs(31));
        assert_eq!(due, vec![TimerKind::TransferTimeout]);
        let result = r.on_timeout(&mut timers);
        assert_eq!(
            result,
            Some(TransferResult::Incomplete {
                payload: "AC".into(),
                missing: 1,
            })
        );
        assert!(!r.is_active());
    }

    #[test]
    fn highest_sequence_number_is_acked() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings {
            ack_every: 4,
            ..Default::default()
        });
        let out = r.accept(chunk(u32::MAX, false, "x"), &mut timers, Instant::now());
        assert_eq!(
            out.ack,
            Some(Action::CsvAck {
                id: Some("7".into()),
                seq: u32::MAX,
            })
        );
        assert!(out.result.is_none());
    }

    #[test]
    fn far_last_sequence_times_out_with_a_gap_count() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(chunk(0, false, "A"), &mut timers, now);
        let out = r.accept(chunk(u32::MAX, true, "Z"), &mut timers, now);
        assert!(out.result.is_none());
        let result = r.on_timeout(&mut timers);
        assert_eq!(
            result,
            Some(TransferResult::Incomplete {
                payload: "AZ".into(),
                missing: u64::from(u32::MAX) - 1,
            })
        );
    }

    #[test]
    fn new_id_resets_previous_transfer() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(chunk(0, false, "old"), &mut timers, now);
        let mut fresh = chunk(0, true, "new");
        fresh.transfer_id = Some("8".into());
        let out = r.accept(fresh, &mut timers, now);
        assert_eq!(out.result, Some(TransferResult::Complete("new".into())));
    }

    #[test]
    fn ack_every_n_and_always_on_last() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings {
            ack_every: 3,
            ..Default::default()
        });
        let now = Instant::now();
        let acks: Vec<bool> = (0..5)
            .map(|seq| {
                r.accept(chunk(seq, seq == 4, "x"), &mut timers, now)
                    .ack
                    .is_some()
            })
            .collect();
        assert_eq!(acks, vec![false, false, true, false, true]);
    }

    #[test]
    fn block_stream_drains_then_finishes_once() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(
            block(0, false, "2024-01-01 00:00:00,12.5\n2024-01-01 00:00:01,13.0"),
            &mut timers,
            now,
        );
        assert_eq!(r.pending_lines(), 2);
        assert!(timers.is_armed(TimerKind::HistoryDrain));
        let end = r.accept(block(1, true, ""), &mut timers, now);
        assert!(!end.stream_finished);

        let tick = r.drain(&mut timers, now);
        let values: Vec<f64> = tick.samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![12.5, 13.0]);
        assert!(tick.finished);
        assert!(!timers.is_armed(TimerKind::HistoryDrain));

        let again = r.drain(&mut timers, now);
        assert!(!again.finished);
        assert!(again.samples.is_empty());
    }

    #[test]
    fn block_headers_and_junk_are_skipped() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let now = Instant::now();
        r.accept(
            block(0, true, "date_time,value\nnot a row\n2024-01-01 00:00:00,nan\n2024-01-01 00:00:02,4"),
            &mut timers,
            now,
        );
        let tick = r.drain(&mut timers, now);
        assert_eq!(tick.samples.len(), 1);
        assert_eq!(tick.rejected, 2);
        assert!(tick.finished);
    }

    #[test]
    fn intake_cap_drops_oldest_lines() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings {
            max_pending_lines: 3,
            drain_batch: 10,
            ..Default::default()
        });
        let now = Instant::now();
        let data: Vec<String> = (0..5)
            .map(|i| format!("2024-01-01 00:00:0{},{}", i, i))
            .collect();
        r.accept(block(0, false, &data.join("\n")), &mut timers, now);
        assert_eq!(r.pending_lines(), 3);
        let tick = r.drain(&mut timers, now);
        let values: Vec<f64> = tick.samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(!tick.finished);
    }

    #[test]
    fn empty_last_block_finishes_immediately() {
        let mut timers = Timers::new();
        let mut r = ChunkReassembler::new(TransferSettings::default());
        let out = r.accept(block(0, true, ""), &mut timers, Instant::now());
        assert!(out.stream_finished);
        assert!(!r.is_active());
    }
}
