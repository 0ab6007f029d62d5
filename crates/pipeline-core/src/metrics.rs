use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct InnerMetrics {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_suppressed: AtomicU64,
    probes_performed: AtomicU64,
    items_completed: AtomicU64,
    items_failed: AtomicU64,
    batches_finalized: AtomicU64,
    retry_count: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_suppressed: u64,
    pub probes_performed: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub batches_finalized: u64,
    pub retry_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics::default()),
        }
    }

    pub fn increment_runs_started(&self, count: u64) {
        self.inner.runs_started.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_runs_succeeded(&self, count: u64) {
        self.inner
            .runs_succeeded
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_runs_failed(&self, count: u64) {
        self.inner.runs_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_runs_suppressed(&self, count: u64) {
        self.inner
            .runs_suppressed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_probes(&self, count: u64) {
        self.inner
            .probes_performed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_items_completed(&self, count: u64) {
        self.inner
            .items_completed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_items_failed(&self, count: u64) {
        self.inner.items_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_batches_finalized(&self, count: u64) {
        self.inner
            .batches_finalized
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self, count: u64) {
        self.inner.retry_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.inner.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.inner.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.inner.runs_failed.load(Ordering::Relaxed),
            runs_suppressed: self.inner.runs_suppressed.load(Ordering::Relaxed),
            probes_performed: self.inner.probes_performed.load(Ordering::Relaxed),
            items_completed: self.inner.items_completed.load(Ordering::Relaxed),
            items_failed: self.inner.items_failed.load(Ordering::Relaxed),
            batches_finalized: self.inner.batches_finalized.load(Ordering::Relaxed),
            retry_count: self.inner.retry_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
