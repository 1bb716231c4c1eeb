//! Failure injection for [`JournalBackend`] implementations.
//!
//! [`ChaosBackend`] wraps any backend and fails selected operations with
//! [`BackendError::Unavailable`] before they reach the wrapped store, either
//! at random or for an exact number of calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use eventlog::{
    BackendError, BackendResult, JournalBackend, JournalRow, Operation, OrderingNr, PersistenceId,
    SequenceNr, StreamRange, TagRange,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Probability of injecting a failure into one backend call.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self::try_new(value).unwrap_or_default()
    }
}

/// Which calls a [`ChaosBackend`] fails and how often.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    targets: Option<HashSet<Operation>>,
}

impl ChaosConfig {
    /// A config whose random choices repeat from run to run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Fails each targeted call with `probability`, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Restricts injection to the given operations. Other calls pass through.
    #[must_use]
    pub fn targeting(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.targets = Some(operations.into_iter().collect());
        self
    }

    fn targets(&self, operation: Operation) -> bool {
        self.targets
            .as_ref()
            .map_or(true, |targets| targets.contains(&operation))
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::default(),
            targets: None,
        }
    }
}

/// Wraps a backend in a [`ChaosBackend`].
pub trait ChaosBackendExt: Sized {
    /// Wraps `self` with the given injection config.
    fn with_chaos(self, config: ChaosConfig) -> ChaosBackend<Self>;
}

impl<B: JournalBackend> ChaosBackendExt for B {
    fn with_chaos(self, config: ChaosConfig) -> ChaosBackend<Self> {
        ChaosBackend::new(self, config)
    }
}

/// A backend that fails some of its calls on purpose.
pub struct ChaosBackend<B> {
    inner: B,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    forced: AtomicU64,
    injected: AtomicU64,
}

impl<B> ChaosBackend<B> {
    /// Wraps `inner`.
    pub fn new(inner: B, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            forced: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Fails the next `count` targeted calls regardless of probability.
    pub fn fail_next(&self, count: u64) {
        self.forced.store(count, Ordering::SeqCst);
    }

    /// How many failures have been injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped backend.
    pub const fn inner(&self) -> &B {
        &self.inner
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(probability))
    }

    fn take_forced(&self) -> bool {
        self.forced
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn inject(&self, operation: Operation) -> BackendResult<()> {
        if !self.config.targets(operation) {
            return Ok(());
        }

        if self.take_forced() || self.should_inject(self.config.failure_probability) {
            let _ = self.injected.fetch_add(1, Ordering::SeqCst);
            debug!(%operation, "injecting backend failure");
            return Err(BackendError::Unavailable(format!(
                "injected failure during {operation}"
            )));
        }

        Ok(())
    }
}

impl<B> std::fmt::Debug for ChaosBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosBackend")
            .field("config", &self.config)
            .field("injected", &self.injected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: JournalBackend> JournalBackend for ChaosBackend<B> {
    async fn allocate_orderings(&self, count: u64) -> BackendResult<OrderingNr> {
        self.inject(Operation::AllocateOrderings)?;
        self.inner.allocate_orderings(count).await
    }

    async fn put_batch(&self, rows: Vec<JournalRow>) -> BackendResult<()> {
        self.inject(Operation::PutBatch)?;
        self.inner.put_batch(rows).await
    }

    async fn update_message(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: SequenceNr,
        message: Vec<u8>,
    ) -> BackendResult<()> {
        self.inject(Operation::UpdateMessage)?;
        self.inner
            .update_message(persistence_id, sequence_nr, message)
            .await
    }

    async fn mark_deleted(
        &self,
        persistence_id: &PersistenceId,
        to: SequenceNr,
    ) -> BackendResult<u64> {
        self.inject(Operation::MarkDeleted)?;
        self.inner.mark_deleted(persistence_id, to).await
    }

    async fn query_by_persistence_id(&self, range: &StreamRange) -> BackendResult<Vec<JournalRow>> {
        self.inject(Operation::QueryByPersistenceId)?;
        self.inner.query_by_persistence_id(range).await
    }

    async fn query_by_tag(&self, range: &TagRange) -> BackendResult<Vec<JournalRow>> {
        self.inject(Operation::QueryByTag)?;
        self.inner.query_by_tag(range).await
    }

    async fn max_ordering(&self) -> BackendResult<OrderingNr> {
        self.inject(Operation::MaxOrdering)?;
        self.inner.max_ordering().await
    }

    async fn scan_orderings(
        &self,
        after: OrderingNr,
        to: OrderingNr,
        limit: usize,
    ) -> BackendResult<Vec<OrderingNr>> {
        self.inject(Operation::ScanOrderings)?;
        self.inner.scan_orderings(after, to, limit).await
    }

    async fn list_persistence_ids(
        &self,
        after: Option<&PersistenceId>,
        limit: usize,
    ) -> BackendResult<Vec<PersistenceId>> {
        self.inject(Operation::ListPersistenceIds)?;
        self.inner.list_persistence_ids(after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog_memory::InMemoryBackend;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn probability_is_clamped() {
        let config = ChaosConfig::default().with_failure_probability(3.5);
        assert!((f32::from(config.failure_probability) - 1.0).abs() < f32::EPSILON);

        let config = ChaosConfig::default().with_failure_probability(f32::NAN);
        assert!(f32::from(config.failure_probability).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn zero_probability_passes_every_call_through() {
        let chaos = InMemoryBackend::new().with_chaos(ChaosConfig::default());

        assert_eq!(chaos.max_ordering().await.unwrap(), OrderingNr::ZERO);
        assert!(chaos.list_persistence_ids(None, 10).await.unwrap().is_empty());
        assert_eq!(chaos.injected(), 0);
    }

    #[tokio::test]
    async fn certain_failure_hits_only_targeted_operations() {
        let chaos = InMemoryBackend::new().with_chaos(
            ChaosConfig::default()
                .with_failure_probability(1.0)
                .targeting([Operation::MaxOrdering]),
        );

        assert!(matches!(
            chaos.max_ordering().await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(chaos.scan_orderings(OrderingNr::ZERO, OrderingNr::new(5), 5).await.is_ok());
        assert_eq!(chaos.injected(), 1);
    }

    #[tokio::test]
    async fn forced_failures_run_out() {
        let chaos = InMemoryBackend::new().with_chaos(ChaosConfig::deterministic());
        chaos.fail_next(2);

        assert!(chaos.max_ordering().await.is_err());
        assert!(chaos.allocate_orderings(1).await.is_err());
        assert!(chaos.max_ordering().await.is_ok());
        assert_eq!(chaos.injected(), 2);
    }

    #[test]
    fn deterministic_half_probability_repeats() {
        let first = ChaosBackend::new(
            InMemoryBackend::new(),
            ChaosConfig::deterministic().with_failure_probability(0.5),
        );
        let second = ChaosBackend::new(
            InMemoryBackend::new(),
            ChaosConfig::deterministic().with_failure_probability(0.5),
        );
        let half = Probability::try_new(0.5).unwrap();

        let a: Vec<bool> = (0..32).map(|_| first.should_inject(half)).collect();
        let b: Vec<bool> = (0..32).map(|_| second.should_inject(half)).collect();
        assert_eq!(a, b);
    }
}
