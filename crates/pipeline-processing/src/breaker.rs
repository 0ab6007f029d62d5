use crate::{
    error::BreakerError,
    guard::{ReadinessContext, ReadinessProbe},
};
use chrono::Utc;
use model::{
    core::identifiers::{ProcessorName, ResourceKey},
    events::{CircuitClosed, CircuitHalfOpened, CircuitOpened},
    records::circuit::{CircuitRecord, CircuitState},
};
use pipeline_core::{event_bus::EventBus, metrics::Metrics, state::CircuitStore};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Probe-driven circuit breaker over one (processor, resource_key).
///
/// An Open circuit never resets on elapsed time. The only way back is a
/// readiness probe reporting the upstream precondition true, which moves
/// the circuit to HalfOpen and admits exactly one trial attempt. All state
/// lives in the `CircuitStore` and is mutated through compare-and-swap;
/// a losing writer re-reads and re-applies.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
    bus: EventBus,
    metrics: Metrics,
    threshold: u32,
    min_probe_interval: Duration,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn CircuitStore>,
        bus: EventBus,
        metrics: Metrics,
        threshold: u32,
        min_probe_interval: Duration,
    ) -> Self {
        CircuitBreaker {
            store,
            bus,
            metrics,
            threshold: threshold.max(1),
            min_probe_interval,
        }
    }

    /// Whether an attempt may run right now. A HalfOpen circuit admits one
    /// caller: the claim is taken via CAS, so concurrent invocations cannot
    /// both win.
    pub async fn allow(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
    ) -> Result<bool, BreakerError> {
        loop {
            let current = self.store.load(processor, key).await?;

            match current.as_ref().map(|r| r.state) {
                None | Some(CircuitState::Closed) => return Ok(true),
                Some(CircuitState::Open) => return Ok(false),
                Some(CircuitState::HalfOpen) => {
                    let record = match current.as_ref() {
                        Some(r) => r,
                        None => continue,
                    };

                    if record.half_open_claimed {
                        return Ok(false);
                    }

                    let mut next = record.bump();
                    next.half_open_claimed = true;

                    if self.store.cas(processor, key, current.as_ref(), &next).await? {
                        return Ok(true);
                    }
                    // Lost the race; re-read and re-evaluate.
                }
            }
        }
    }

    /// Feed one attempt outcome into the breaker. Success closes the
    /// circuit and clears the counter; failure increments it and opens the
    /// circuit at the threshold. A HalfOpen trial resolves here: success
    /// closes, failure reopens.
    pub async fn record_outcome(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
        success: bool,
    ) -> Result<(), BreakerError> {
        loop {
            let current = self.store.load(processor, key).await?;
            let record = current.clone().unwrap_or_default();
            let prior_state = record.state;

            let next = if success {
                if prior_state == CircuitState::Closed && record.consecutive_failures == 0 {
                    return Ok(());
                }
                let mut next = record.bump();
                next.state = CircuitState::Closed;
                next.consecutive_failures = 0;
                next.half_open_claimed = false;
                next.opened_at = None;
                next
            } else {
                let mut next = record.bump();
                next.consecutive_failures = record.consecutive_failures.saturating_add(1);
                next.half_open_claimed = false;
                let reopens = prior_state == CircuitState::HalfOpen;
                if reopens || next.consecutive_failures >= self.threshold {
                    next.state = CircuitState::Open;
                    next.opened_at = Some(Utc::now());
                }
                next
            };

            let transitioned = next.state != prior_state;

            if self.store.cas(processor, key, current.as_ref(), &next).await? {
                if transitioned {
                    self.publish_transition(processor, key, prior_state, &next).await;
                }
                return Ok(());
            }
        }
    }

    /// Probe an Open circuit. Probes are rate-limited per resource: a
    /// probe inside `min_probe_interval` of the previous one is skipped.
    /// Returns true when the circuit moved to HalfOpen.
    pub async fn probe(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
        probe: &dyn ReadinessProbe,
        ctx: &ReadinessContext,
    ) -> Result<bool, BreakerError> {
        let current = self.store.load(processor, key).await?;
        let record = match current.as_ref() {
            Some(r) if r.state == CircuitState::Open => r.clone(),
            _ => return Ok(false),
        };

        if let Some(last) = record.last_probe_at {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed.num_milliseconds() >= 0
                && (elapsed.num_milliseconds() as u128) < self.min_probe_interval.as_millis()
            {
                return Ok(false);
            }
        }

        self.metrics.increment_probes(1);
        let readiness = probe.check(ctx).await?;
        let now = Utc::now();

        loop {
            let current = self.store.load(processor, key).await?;
            let record = match current.as_ref() {
                Some(r) if r.state == CircuitState::Open => r.clone(),
                // Another writer already resolved the circuit.
                _ => return Ok(false),
            };

            let mut next = record.bump();
            next.last_probe_at = Some(now);

            let ready = readiness.is_ready();
            if ready {
                next.state = CircuitState::HalfOpen;
                next.half_open_claimed = false;
            }

            if self.store.cas(processor, key, current.as_ref(), &next).await? {
                if ready {
                    info!(
                        processor = %processor,
                        resource_key = %key,
                        "Readiness probe passed; circuit half-open"
                    );
                    self.bus
                        .publish(CircuitHalfOpened {
                            processor: processor.to_string(),
                            resource_key: key.to_string(),
                            timestamp: now,
                        })
                        .await;
                }
                return Ok(ready);
            }
        }
    }

    /// Release an unresolved HalfOpen claim. Used when the claimed attempt
    /// never became a real execution, so the single trial slot must go back
    /// to the pool instead of blocking the circuit forever.
    pub async fn release_claim(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
    ) -> Result<(), BreakerError> {
        loop {
            let current = self.store.load(processor, key).await?;
            let record = match current.as_ref() {
                Some(r) if r.state == CircuitState::HalfOpen && r.half_open_claimed => r.clone(),
                _ => return Ok(()),
            };

            let mut next = record.bump();
            next.half_open_claimed = false;

            if self.store.cas(processor, key, current.as_ref(), &next).await? {
                return Ok(());
            }
        }
    }

    pub async fn current_state(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
    ) -> Result<CircuitState, BreakerError> {
        Ok(self
            .store
            .load(processor, key)
            .await?
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed))
    }

    async fn publish_transition(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
        prior: CircuitState,
        next: &CircuitRecord,
    ) {
        match next.state {
            CircuitState::Open => {
                warn!(
                    processor = %processor,
                    resource_key = %key,
                    consecutive_failures = next.consecutive_failures,
                    "Circuit opened"
                );
                self.bus
                    .publish(CircuitOpened {
                        processor: processor.to_string(),
                        resource_key: key.to_string(),
                        consecutive_failures: next.consecutive_failures,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            CircuitState::Closed if prior != CircuitState::Closed => {
                info!(
                    processor = %processor,
                    resource_key = %key,
                    "Circuit closed"
                );
                self.bus
                    .publish(CircuitClosed {
                        processor: processor.to_string(),
                        resource_key: key.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::guard::Readiness;
    use async_trait::async_trait;
    use model::core::identifiers::Identifier;
    use pipeline_core::state::sled_store::SledStore;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::tempdir;

    struct StubProbe {
        ready: AtomicBool,
        calls: AtomicU32,
    }

    impl StubProbe {
        fn new(ready: bool) -> Self {
            Self {
                ready: AtomicBool::new(ready),
                calls: AtomicU32::new(0),
            }
        }

        fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessProbe for StubProbe {
        async fn check(&self, _ctx: &ReadinessContext) -> Result<Readiness, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ready.load(Ordering::SeqCst) {
                Ok(Readiness::Ready)
            } else {
                Ok(Readiness::NotReady {
                    reason: "upstream table empty".into(),
                })
            }
        }
    }

    fn ctx(processor: &ProcessorName, key: &ResourceKey) -> ReadinessContext {
        ReadinessContext {
            processor: processor.clone(),
            identifier: Identifier::new("2026-08-01"),
            resource_key: key.clone(),
        }
    }

    fn breaker(store: Arc<SledStore>, threshold: u32, probe_interval: Duration) -> CircuitBreaker {
        CircuitBreaker::new(store, EventBus::new(), Metrics::new(), threshold, probe_interval)
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 3, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        for _ in 0..2 {
            breaker.record_outcome(&processor, &key, false).await.unwrap();
            assert!(breaker.allow(&processor, &key).await.unwrap());
        }

        breaker.record_outcome(&processor, &key, false).await.unwrap();
        assert_eq!(
            breaker.current_state(&processor, &key).await.unwrap(),
            CircuitState::Open
        );
        assert!(!breaker.allow(&processor, &key).await.unwrap());
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 3, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        breaker.record_outcome(&processor, &key, false).await.unwrap();
        breaker.record_outcome(&processor, &key, false).await.unwrap();
        breaker.record_outcome(&processor, &key, true).await.unwrap();
        breaker.record_outcome(&processor, &key, false).await.unwrap();
        breaker.record_outcome(&processor, &key, false).await.unwrap();

        assert_eq!(
            breaker.current_state(&processor, &key).await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn probe_false_keeps_circuit_open() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 1, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        breaker.record_outcome(&processor, &key, false).await.unwrap();

        let probe = StubProbe::new(false);
        let moved = breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();

        assert!(!moved);
        assert_eq!(
            breaker.current_state(&processor, &key).await.unwrap(),
            CircuitState::Open,
            "no amount of elapsed time reopens the circuit without a passing probe"
        );
    }

    #[tokio::test]
    async fn probe_true_half_opens_and_admits_one_trial() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 1, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        breaker.record_outcome(&processor, &key, false).await.unwrap();

        let probe = StubProbe::new(true);
        let moved = breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();
        assert!(moved);

        assert!(breaker.allow(&processor, &key).await.unwrap());
        assert!(
            !breaker.allow(&processor, &key).await.unwrap(),
            "second caller must not get the HalfOpen claim"
        );
    }

    #[tokio::test]
    async fn half_open_trial_resolves_the_circuit() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 1, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        breaker.record_outcome(&processor, &key, false).await.unwrap();
        let probe = StubProbe::new(true);
        breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();
        assert!(breaker.allow(&processor, &key).await.unwrap());

        // Trial failure reopens.
        breaker.record_outcome(&processor, &key, false).await.unwrap();
        assert_eq!(
            breaker.current_state(&processor, &key).await.unwrap(),
            CircuitState::Open
        );

        // Probe again, trial success closes.
        breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();
        assert!(breaker.allow(&processor, &key).await.unwrap());
        breaker.record_outcome(&processor, &key, true).await.unwrap();
        assert_eq!(
            breaker.current_state(&processor, &key).await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn probes_are_rate_limited() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 1, Duration::from_secs(3600));
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        breaker.record_outcome(&processor, &key, false).await.unwrap();

        let probe = StubProbe::new(false);
        breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();
        breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();

        assert_eq!(probe.calls(), 1, "second probe inside the interval is skipped");
    }

    #[tokio::test]
    async fn probe_on_closed_circuit_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let breaker = breaker(store.clone(), 3, Duration::ZERO);
        let processor = ProcessorName::new("ingest");
        let key = ResourceKey::new("source-feed");

        let probe = StubProbe::new(true);
        let moved = breaker
            .probe(&processor, &key, &probe, &ctx(&processor, &key))
            .await
            .unwrap();

        assert!(!moved);
        assert_eq!(probe.calls(), 0);
    }
}
