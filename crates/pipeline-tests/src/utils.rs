use async_trait::async_trait;
use chrono::NaiveDate;
use model::{
    core::identifiers::{BatchId, Identifier, ItemId, ProcessorName, ResourceKey},
    events::Event,
    records::{
        batch::{BatchRecord, BatchStatus, StagedResult},
        run::FailureCategory,
    },
};
use pipeline_core::{
    error::StoreError,
    event_bus::EventBus,
    heartbeat::Heartbeater,
    metrics::Metrics,
    retry::RetryPolicy,
    state::{StagingStore, sled_store::SledStore},
};
use pipeline_processing::{
    breaker::CircuitBreaker,
    error::ProbeError,
    gate::IdempotencyGate,
    guard::{AlwaysReady, Readiness, ReadinessContext, ReadinessProbe},
    runner::{ExecutionContext, ExecutionOutput, Processor, ProcessorFailure, ProcessorRunner},
};
use pipeline_runtime::{
    actor::messages::{BatchDescriptor, WorkItem},
    consolidate::DestinationConsolidator,
    control::ControlService,
    queue::{InProcessQueue, WorkMessage},
    worker::{ItemFailure, ItemHandler, ItemOutput},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::{NamedTempFile, TempDir};
use tokio::{sync::mpsc, time::sleep};

pub fn open_store() -> (TempDir, Arc<SledStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SledStore::open(dir.path()).expect("open store"));
    (dir, store)
}

pub fn date(spec: &str) -> NaiveDate {
    NaiveDate::parse_from_str(spec, "%Y-%m-%d").expect("date")
}

/// Subscribe a bounded channel to one event type on the bus.
pub async fn capture<E>(bus: &EventBus) -> mpsc::Receiver<Arc<E>>
where
    E: Event + Clone,
{
    let (tx, rx) = mpsc::channel(64);
    bus.subscribe::<E>(tx).await;
    rx
}

pub fn counts_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("counts file");
    file.write_all(json.as_bytes()).expect("write counts");
    file
}

// --- batch runtime harness ---------------------------------------------

/// Fully wired batch runtime over a temp sled store. The temp dir lives
/// as long as the harness.
pub struct BatchRuntime {
    pub store: Arc<SledStore>,
    pub queue: Arc<InProcessQueue>,
    pub control: ControlService,
    pub metrics: Metrics,
    pub bus: EventBus,
    _dir: TempDir,
}

pub fn batch_runtime(
    handler: Arc<dyn ItemHandler>,
    workers: usize,
    retry: RetryPolicy,
    stall_threshold_secs: u64,
) -> BatchRuntime {
    let (dir, store) = open_store();
    batch_runtime_with_staging(
        dir,
        store.clone(),
        store,
        handler,
        workers,
        retry,
        stall_threshold_secs,
    )
}

/// Same wiring, but with the staging layer swapped out so tests can
/// inject staging failures.
pub fn batch_runtime_with_staging(
    dir: TempDir,
    store: Arc<SledStore>,
    staging: Arc<dyn StagingStore>,
    handler: Arc<dyn ItemHandler>,
    workers: usize,
    retry: RetryPolicy,
    stall_threshold_secs: u64,
) -> BatchRuntime {
    let queue = Arc::new(InProcessQueue::new(3));
    let metrics = Metrics::new();
    let bus = EventBus::new();
    let mut control = ControlService::new(
        store.clone(),
        staging,
        queue.clone(),
        Arc::new(DestinationConsolidator::new(store.clone())),
        bus.clone(),
        metrics.clone(),
        stall_threshold_secs,
    );
    if workers > 0 {
        control.spawn_workers(handler, workers, retry);
    }

    BatchRuntime {
        store,
        queue,
        control,
        metrics,
        bus,
        _dir: dir,
    }
}

pub fn work_items(count: usize) -> Vec<WorkItem> {
    (1..=count)
        .map(|n| WorkItem {
            item_id: ItemId::new(format!("item-{n:04}")),
            payload: format!("{{\"seq\":{n}}}"),
        })
        .collect()
}

pub fn descriptor(
    processor: &str,
    identifier: &str,
    count: usize,
    stall_threshold_secs: Option<u64>,
) -> BatchDescriptor {
    BatchDescriptor {
        processor: ProcessorName::new(processor),
        identifier: Identifier::new(identifier),
        items: work_items(count),
        stall_threshold_secs,
    }
}

pub async fn wait_for_batch<F>(
    control: &ControlService,
    batch_id: &BatchId,
    pred: F,
) -> BatchRecord
where
    F: Fn(&BatchRecord) -> bool,
{
    for _ in 0..600 {
        let record = control.status(batch_id.clone()).await.expect("status");
        if pred(&record) {
            return record;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} never reached the expected state");
}

pub async fn wait_until<F>(what: &str, pred: F)
where
    F: Fn() -> bool,
{
    for _ in 0..600 {
        if pred() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// --- item handlers ------------------------------------------------------

/// Stages every payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl ItemHandler for EchoHandler {
    async fn process(&self, msg: &WorkMessage) -> Result<ItemOutput, ItemFailure> {
        Ok(ItemOutput {
            payload: msg.payload.clone(),
            written_count: 1,
        })
    }
}

/// Fails every item retryably `failures` times before letting it through.
pub struct FlakyHandler {
    failures: u64,
    seen: Mutex<HashMap<String, u64>>,
}

impl FlakyHandler {
    pub fn new(failures: u64) -> Self {
        FlakyHandler {
            failures,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ItemHandler for FlakyHandler {
    async fn process(&self, msg: &WorkMessage) -> Result<ItemOutput, ItemFailure> {
        {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(msg.item_id.to_string()).or_insert(0);
            if *count < self.failures {
                *count += 1;
                return Err(ItemFailure::retryable("upstream timeout"));
            }
        }
        Ok(ItemOutput {
            payload: msg.payload.clone(),
            written_count: 1,
        })
    }
}

/// Fails the listed items fatally; everything else passes through.
pub struct FatalForHandler {
    fatal: HashSet<String>,
}

impl FatalForHandler {
    pub fn new(ids: &[&str]) -> Self {
        FatalForHandler {
            fatal: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ItemHandler for FatalForHandler {
    async fn process(&self, msg: &WorkMessage) -> Result<ItemOutput, ItemFailure> {
        if self.fatal.contains(msg.item_id.as_str()) {
            return Err(ItemFailure::fatal("malformed record"));
        }
        Ok(ItemOutput {
            payload: msg.payload.clone(),
            written_count: 1,
        })
    }
}

/// Staging layer that refuses specific items. The worker nacks on a
/// staging failure, so the refused items never reach a terminal state.
pub struct FailingStaging {
    inner: Arc<SledStore>,
    refuse: HashSet<String>,
}

impl FailingStaging {
    pub fn new(inner: Arc<SledStore>, refuse: &[&str]) -> Self {
        FailingStaging {
            inner,
            refuse: refuse.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl StagingStore for FailingStaging {
    async fn stage(
        &self,
        batch_id: &BatchId,
        item_id: &ItemId,
        payload: &str,
    ) -> Result<String, StoreError> {
        if self.refuse.contains(item_id.as_str()) {
            return Err(StoreError::Sled(sled::Error::Io(std::io::Error::other(
                "staging volume offline",
            ))));
        }
        self.inner.stage(batch_id, item_id, payload).await
    }

    async fn staged(&self, batch_id: &BatchId) -> Result<Vec<StagedResult>, StoreError> {
        self.inner.staged(batch_id).await
    }
}

// --- processors ---------------------------------------------------------

/// Processor whose readiness and execution results are scripted per test.
pub struct ScriptedProcessor {
    name: ProcessorName,
    resource: ResourceKey,
    ready: AtomicBool,
    results: Mutex<VecDeque<Result<u64, ProcessorFailure>>>,
}

impl ScriptedProcessor {
    pub fn new(name: &str, resource: &str) -> Self {
        ScriptedProcessor {
            name: ProcessorName::new(name),
            resource: ResourceKey::new(resource),
            ready: AtomicBool::new(true),
            results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn push_success(&self, records: u64) {
        self.results.lock().unwrap().push_back(Ok(records));
    }

    pub fn push_failure(&self, category: FailureCategory, message: &str) {
        self.results
            .lock()
            .unwrap()
            .push_back(Err(ProcessorFailure::new(category, message)));
    }

    pub fn resource(&self) -> ResourceKey {
        self.resource.clone()
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProcessor {
    async fn check(&self, _ctx: &ReadinessContext) -> Result<Readiness, ProbeError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::NotReady {
                reason: "no rows for identifier".into(),
            })
        }
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn name(&self) -> ProcessorName {
        self.name.clone()
    }

    fn resource_key(&self, _identifier: &Identifier) -> ResourceKey {
        self.resource.clone()
    }

    fn readiness(&self) -> &dyn ReadinessProbe {
        self
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionOutput, ProcessorFailure> {
        let next = self.results.lock().unwrap().pop_front().unwrap_or(Ok(0));
        next.map(|records_written| ExecutionOutput { records_written })
    }
}

/// Processor that drives one batch through the coordinator and maps the
/// terminal batch status onto its attempt outcome.
pub struct BatchDriver {
    name: ProcessorName,
    control: ControlService,
    items: Vec<WorkItem>,
    probe: AlwaysReady,
}

impl BatchDriver {
    pub fn new(name: &str, control: ControlService, items: Vec<WorkItem>) -> Self {
        BatchDriver {
            name: ProcessorName::new(name),
            control,
            items,
            probe: AlwaysReady,
        }
    }

    pub fn into_control(self) -> ControlService {
        self.control
    }
}

#[async_trait]
impl Processor for BatchDriver {
    fn name(&self) -> ProcessorName {
        self.name.clone()
    }

    fn resource_key(&self, identifier: &Identifier) -> ResourceKey {
        ResourceKey::new(format!("batch:{}:{identifier}", self.name))
    }

    fn readiness(&self) -> &dyn ReadinessProbe {
        &self.probe
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutput, ProcessorFailure> {
        let descriptor = BatchDescriptor {
            processor: ctx.processor.clone(),
            identifier: ctx.identifier.clone(),
            items: self.items.clone(),
            stall_threshold_secs: None,
        };

        let batch_id = self
            .control
            .start(descriptor)
            .await
            .map_err(|e| ProcessorFailure::new(FailureCategory::Unknown, e.to_string()))?;

        loop {
            let record = self
                .control
                .status(batch_id.clone())
                .await
                .map_err(|e| ProcessorFailure::new(FailureCategory::Unknown, e.to_string()))?;

            if record.status.is_terminal() {
                return match record.status {
                    BatchStatus::Completed if record.items_failed == 0 => Ok(ExecutionOutput {
                        records_written: record.items_done,
                    }),
                    _ => Err(ProcessorFailure {
                        category: FailureCategory::ProcessingError,
                        message: format!(
                            "{} of {} items failed",
                            record.items_failed, record.total_items
                        ),
                        records_written: record.items_done,
                    }),
                };
            }

            sleep(Duration::from_millis(10)).await;
        }
    }
}

// --- runner wiring ------------------------------------------------------

pub fn runner_over(
    store: Arc<SledStore>,
    threshold: u32,
    bus: EventBus,
    metrics: Metrics,
) -> ProcessorRunner {
    let gate = IdempotencyGate::new(store.clone(), bus.clone(), metrics.clone());
    let breaker = CircuitBreaker::new(
        store.clone(),
        bus.clone(),
        metrics.clone(),
        threshold,
        Duration::ZERO,
    );
    let heartbeater = Heartbeater::new(store.clone(), bus.clone(), Duration::from_millis(10));
    ProcessorRunner::new(store, gate, breaker, heartbeater, bus, metrics)
}
