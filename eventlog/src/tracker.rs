//! Sequence consistency tracker.
//!
//! The backend assigns ordering values in order but may make them visible out
//! of order. The tracker polls the backend in the background and computes
//! `max_ordering`: the highest ordering value below which nothing is missing.
//! Tag queries never read past it.
//!
//! Each cycle probes the highest visible ordering, scans the values between
//! the current `max_ordering` and the probe and records every missing value
//! as a pending gap. A gap that shows up later is resolved. A gap that stays
//! missing through [`TrackerConfig::max_attempts`] scans that covered it, or
//! for longer than [`TrackerConfig::max_gap_age`], is abandoned and skipped
//! forever.
//!
//! Callers talk to the tracker through a [`TrackerHandle`]. Requests are
//! answered from the last completed cycle and never wait for a probe in
//! progress.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::JournalBackend;
use crate::config::TrackerConfig;
use crate::errors::{JournalError, JournalResult, Operation};
use crate::types::OrderingNr;

const REQUEST_BUFFER: usize = 64;

/// Diagnostic view of the tracker after its last completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    /// Highest ordering value with no gaps below it.
    pub max_ordering: OrderingNr,
    /// Gaps currently waiting to become visible.
    pub pending_gaps: usize,
    /// Gaps given up on since the tracker started.
    pub abandoned_total: u64,
    /// Cycles that completed successfully.
    pub cycles: u64,
    /// Cycles that failed and were absorbed.
    pub failed_cycles: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingGap {
    first_seen: Instant,
    attempts: u32,
}

/// Result of one probe and scan against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scan {
    probe: OrderingNr,
    seen: Vec<OrderingNr>,
    truncated: bool,
}

impl Scan {
    fn end(&self) -> OrderingNr {
        if self.truncated {
            self.seen.last().copied().unwrap_or(self.probe)
        } else {
            self.probe
        }
    }
}

/// Gap bookkeeping, independent of any I/O.
#[derive(Debug)]
struct GapTracker {
    max_ordering: OrderingNr,
    pending: BTreeMap<OrderingNr, PendingGap>,
    abandoned: BTreeSet<OrderingNr>,
    abandoned_total: u64,
    cycles: u64,
    failed_cycles: u64,
    max_attempts: u32,
    max_gap_age: Duration,
}

impl GapTracker {
    fn new(config: &TrackerConfig) -> Self {
        Self {
            max_ordering: OrderingNr::ZERO,
            pending: BTreeMap::new(),
            abandoned: BTreeSet::new(),
            abandoned_total: 0,
            cycles: 0,
            failed_cycles: 0,
            max_attempts: config.max_attempts.into_inner(),
            max_gap_age: config.max_gap_age,
        }
    }

    /// Folds one scan into the state. Returns whether `max_ordering` moved.
    fn observe(&mut self, scan: &Scan, now: Instant) -> bool {
        self.cycles += 1;
        let seen: BTreeSet<OrderingNr> = scan.seen.iter().copied().collect();
        let scan_end = scan.end();

        self.pending.retain(|ordering, _| !seen.contains(ordering));
        self.age_pending(scan_end, now);

        let mut candidate = self.max_ordering.next();
        while candidate <= scan_end {
            if !seen.contains(&candidate) && !self.abandoned.contains(&candidate) {
                self.pending.entry(candidate).or_insert(PendingGap {
                    first_seen: now,
                    attempts: 0,
                });
            }
            candidate = candidate.next();
        }

        let reachable = self
            .pending
            .keys()
            .next()
            .map_or(scan_end, |first_gap| first_gap.prev());

        let advanced = reachable > self.max_ordering;
        if advanced {
            self.max_ordering = reachable;
            self.abandoned = self.abandoned.split_off(&self.max_ordering.next());
        }
        advanced
    }

    /// Ages the gaps this scan looked at. Gaps above `scan_end` were not
    /// re-checked and keep their attempt count.
    fn age_pending(&mut self, scan_end: OrderingNr, now: Instant) {
        let mut expired = Vec::new();
        for (ordering, gap) in self.pending.range_mut(..=scan_end) {
            gap.attempts = gap.attempts.saturating_add(1);
            let age = now.saturating_duration_since(gap.first_seen);
            if gap.attempts >= self.max_attempts || age >= self.max_gap_age {
                expired.push((*ordering, age, gap.attempts));
            }
        }

        for (ordering, age, attempts) in expired {
            warn!(
                %ordering,
                age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                attempts,
                "abandoning ordering gap; rows written at this ordering will be skipped by tag queries"
            );
            self.pending.remove(&ordering);
            self.abandoned.insert(ordering);
            self.abandoned_total += 1;
        }
    }

    fn cycle_failed(&mut self, error: &JournalError) {
        self.failed_cycles += 1;
        warn!(%error, failed_cycles = self.failed_cycles, "tracker cycle failed; retrying next cycle");
    }

    fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            max_ordering: self.max_ordering,
            pending_gaps: self.pending.len(),
            abandoned_total: self.abandoned_total,
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
        }
    }
}

#[derive(Debug)]
enum Request {
    MaxOrdering(oneshot::Sender<OrderingNr>),
    Snapshot(oneshot::Sender<TrackerSnapshot>),
    Shutdown,
}

/// Background poller computing the gap-free ordering prefix.
pub struct SequenceConsistencyTracker {
    backend: Arc<dyn JournalBackend>,
    config: TrackerConfig,
    gaps: GapTracker,
}

impl std::fmt::Debug for SequenceConsistencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceConsistencyTracker")
            .field("config", &self.config)
            .field("gaps", &self.gaps)
            .finish_non_exhaustive()
    }
}

impl SequenceConsistencyTracker {
    /// Starts the tracker on the current tokio runtime.
    ///
    /// The task runs until [`TrackerHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub fn spawn(backend: Arc<dyn JournalBackend>, config: TrackerConfig) -> TrackerHandle {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BUFFER);
        let ask_timeout = config.ask_timeout;
        let tracker = Self {
            gaps: GapTracker::new(&config),
            backend,
            config,
        };

        tokio::spawn(tracker.run(requests_rx));

        TrackerHandle {
            requests: requests_tx,
            ask_timeout,
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        info!(config = ?self.config, "sequence consistency tracker started");
        let mut published = self.gaps.snapshot();
        let limit = self.config.batch_size.into_inner();

        loop {
            let cycle = scan(Arc::clone(&self.backend), self.gaps.max_ordering, limit);
            let Some(outcome) = serve_until(cycle, &mut requests, &published).await else {
                break;
            };

            let poll_again_now = match outcome {
                Ok(scan) => {
                    let advanced = self.gaps.observe(&scan, Instant::now());
                    if advanced {
                        debug!(max_ordering = %self.gaps.max_ordering, "safe ordering advanced");
                    }
                    scan.truncated && advanced
                }
                Err(error) => {
                    self.gaps.cycle_failed(&error);
                    false
                }
            };
            published = self.gaps.snapshot();

            if !poll_again_now {
                let delay = tokio::time::sleep(self.config.query_delay);
                if serve_until(delay, &mut requests, &published).await.is_none() {
                    break;
                }
            }
        }

        info!(snapshot = ?published, "sequence consistency tracker stopped");
    }
}

async fn scan(
    backend: Arc<dyn JournalBackend>,
    after: OrderingNr,
    limit: usize,
) -> JournalResult<Scan> {
    let probe = backend
        .max_ordering()
        .await
        .map_err(JournalError::during(Operation::MaxOrdering))?;
    if probe <= after {
        return Ok(Scan {
            probe,
            seen: Vec::new(),
            truncated: false,
        });
    }

    let seen = backend
        .scan_orderings(after, probe, limit)
        .await
        .map_err(JournalError::during(Operation::ScanOrderings))?;
    let truncated = seen.len() >= limit;
    Ok(Scan {
        probe,
        seen,
        truncated,
    })
}

/// Drives `work` to completion while answering requests from `published`.
/// Returns `None` when the tracker has been asked to stop.
async fn serve_until<F: Future>(
    work: F,
    requests: &mut mpsc::Receiver<Request>,
    published: &TrackerSnapshot,
) -> Option<F::Output> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Some(output),
            request = requests.recv() => match request {
                Some(Request::MaxOrdering(reply)) => {
                    let _ = reply.send(published.max_ordering);
                }
                Some(Request::Snapshot(reply)) => {
                    let _ = reply.send(*published);
                }
                Some(Request::Shutdown) | None => return None,
            },
        }
    }
}

/// Cheap, cloneable client of a running tracker.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    requests: mpsc::Sender<Request>,
    ask_timeout: Duration,
}

impl TrackerHandle {
    /// The gap-free ordering prefix as of the last completed cycle.
    ///
    /// Fails with [`JournalError::TrackerTimeout`] if the tracker does not
    /// answer within the configured timeout and with
    /// [`JournalError::TrackerUnavailable`] if it has stopped.
    pub async fn max_ordering(&self) -> JournalResult<OrderingNr> {
        self.ask(Request::MaxOrdering).await
    }

    /// Diagnostic counters as of the last completed cycle.
    pub async fn snapshot(&self) -> JournalResult<TrackerSnapshot> {
        self.ask(Request::Snapshot).await
    }

    /// Stops the background task. Later requests fail with
    /// [`JournalError::TrackerUnavailable`].
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }

    /// Whether the background task has stopped.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    async fn ask<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> JournalResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.requests
                .send(request(reply_tx))
                .await
                .map_err(|_| JournalError::TrackerUnavailable)?;
            reply_rx.await.map_err(|_| JournalError::TrackerUnavailable)
        };

        tokio::time::timeout(self.ask_timeout, exchange)
            .await
            .map_err(|_| JournalError::TrackerTimeout(self.ask_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxAttempts;
    use proptest::prelude::*;

    fn orderings(values: &[u64]) -> Vec<OrderingNr> {
        values.iter().copied().map(OrderingNr::new).collect()
    }

    fn complete(probe: u64, seen: &[u64]) -> Scan {
        Scan {
            probe: OrderingNr::new(probe),
            seen: orderings(seen),
            truncated: false,
        }
    }

    fn tracker(max_attempts: u32, max_gap_age: Duration) -> GapTracker {
        GapTracker::new(
            &TrackerConfig::default()
                .with_max_attempts(MaxAttempts::try_new(max_attempts).unwrap())
                .with_max_gap_age(max_gap_age),
        )
    }

    #[test]
    fn contiguous_rows_advance_to_probe() {
        let mut gaps = tracker(10, Duration::from_secs(60));
        assert!(gaps.observe(&complete(3, &[1, 2, 3]), Instant::now()));
        assert_eq!(gaps.max_ordering, OrderingNr::new(3));
        assert!(gaps.pending.is_empty());
    }

    #[test]
    fn gap_holds_max_below_it_until_resolved() {
        let mut gaps = tracker(10, Duration::from_secs(60));
        let now = Instant::now();

        gaps.observe(&complete(4, &[1, 2, 4]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(2));
        assert_eq!(gaps.snapshot().pending_gaps, 1);

        gaps.observe(&complete(4, &[3, 4]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(4));
        assert_eq!(gaps.snapshot().pending_gaps, 0);
        assert_eq!(gaps.abandoned_total, 0);
    }

    #[test]
    fn gap_is_abandoned_after_max_attempts() {
        let mut gaps = tracker(2, Duration::from_secs(3600));
        let now = Instant::now();

        gaps.observe(&complete(3, &[1, 3]), now);
        gaps.observe(&complete(3, &[3]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(1));

        gaps.observe(&complete(3, &[3]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(3));
        assert_eq!(gaps.abandoned_total, 1);
    }

    #[test]
    fn gap_is_abandoned_once_too_old() {
        let mut gaps = tracker(1_000, Duration::from_secs(5));
        let start = Instant::now();

        gaps.observe(&complete(2, &[2]), start);
        assert_eq!(gaps.max_ordering, OrderingNr::ZERO);

        gaps.observe(&complete(2, &[2]), start + Duration::from_secs(5));
        assert_eq!(gaps.max_ordering, OrderingNr::new(2));
        assert_eq!(gaps.abandoned_total, 1);
    }

    #[test]
    fn abandoned_gap_is_skipped_while_a_later_gap_holds() {
        let mut gaps = tracker(1_000, Duration::from_secs(5));
        let start = Instant::now();

        gaps.observe(&complete(3, &[3]), start);
        gaps.observe(&complete(3, &[1, 3]), start + Duration::from_secs(1));
        assert_eq!(gaps.max_ordering, OrderingNr::new(1));

        // 2 was first seen at `start`, so it expires first.
        gaps.observe(&complete(5, &[3, 5]), start + Duration::from_secs(5));
        assert_eq!(gaps.abandoned_total, 1);
        assert_eq!(gaps.max_ordering, OrderingNr::new(3));
        assert_eq!(gaps.snapshot().pending_gaps, 1);
    }

    #[test]
    fn truncated_scan_only_trusts_what_it_saw() {
        let mut gaps = tracker(10, Duration::from_secs(60));
        let scan = Scan {
            probe: OrderingNr::new(100),
            seen: orderings(&[1, 2, 3]),
            truncated: true,
        };

        assert!(gaps.observe(&scan, Instant::now()));
        assert_eq!(gaps.max_ordering, OrderingNr::new(3));
        assert!(gaps.pending.is_empty());
    }

    fn truncated(probe: u64, seen: &[u64]) -> Scan {
        Scan {
            probe: OrderingNr::new(probe),
            seen: orderings(seen),
            truncated: true,
        }
    }

    #[test]
    fn gaps_beyond_a_short_scan_are_not_aged() {
        let mut gaps = tracker(2, Duration::from_secs(3600));
        let now = Instant::now();

        gaps.observe(&truncated(5, &[3, 5]), now);
        assert_eq!(gaps.snapshot().pending_gaps, 3);

        // 4 became visible but this window stops at 3.
        gaps.observe(&truncated(5, &[2, 3]), now);
        gaps.observe(&truncated(5, &[1, 2]), now);

        assert_eq!(gaps.abandoned_total, 0);
        assert_eq!(gaps.max_ordering, OrderingNr::new(3));
        assert!(gaps.pending.contains_key(&OrderingNr::new(4)));

        gaps.observe(&complete(5, &[4, 5]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(5));
        assert_eq!(gaps.abandoned_total, 0);
    }

    #[test]
    fn stale_probe_does_not_age_gaps_above_it() {
        let mut gaps = tracker(2, Duration::from_secs(3600));
        let now = Instant::now();

        gaps.observe(&complete(4, &[1, 2, 4]), now);
        gaps.observe(&complete(2, &[]), now);
        gaps.observe(&complete(2, &[]), now);

        assert_eq!(gaps.abandoned_total, 0);
        assert_eq!(gaps.max_ordering, OrderingNr::new(2));

        gaps.observe(&complete(4, &[3, 4]), now);
        assert_eq!(gaps.max_ordering, OrderingNr::new(4));
        assert_eq!(gaps.abandoned_total, 0);
    }

    #[test]
    fn failed_cycle_keeps_state() {
        let mut gaps = tracker(10, Duration::from_secs(60));
        gaps.observe(&complete(2, &[1, 2]), Instant::now());

        gaps.cycle_failed(&JournalError::TrackerUnavailable);
        let snapshot = gaps.snapshot();
        assert_eq!(snapshot.max_ordering, OrderingNr::new(2));
        assert_eq!(snapshot.failed_cycles, 1);
        assert_eq!(snapshot.cycles, 1);
    }

    proptest! {
        #[test]
        fn max_ordering_never_decreases(
            cycles in prop::collection::vec(
                (0u64..40, prop::collection::btree_set(1u64..40, 0..20), any::<bool>()),
                1..20,
            )
        ) {
            let mut gaps = tracker(3, Duration::from_secs(60));
            let start = Instant::now();
            let mut previous = OrderingNr::ZERO;

            for (step, (probe, seen, truncated)) in cycles.into_iter().enumerate() {
                let after = gaps.max_ordering;
                let seen: Vec<u64> = seen
                    .into_iter()
                    .filter(|value| *value > after.value() && *value <= probe)
                    .collect();
                let scan = Scan {
                    probe: OrderingNr::new(probe),
                    seen: orderings(&seen),
                    truncated: truncated && !seen.is_empty(),
                };
                gaps.observe(&scan, start + Duration::from_secs(step as u64));

                prop_assert!(gaps.max_ordering >= previous);
                prop_assert!(gaps.pending.keys().all(|gap| *gap > gaps.max_ordering));
                previous = gaps.max_ordering;
            }
        }
    }
}
