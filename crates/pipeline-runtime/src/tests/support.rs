use crate::{
    actor::messages::{BatchDescriptor, WorkItem},
    consolidate::DestinationConsolidator,
    control::ControlService,
    queue::InProcessQueue,
};
use model::{
    core::identifiers::{BatchId, Identifier, ItemId, ProcessorName},
    records::batch::BatchRecord,
};
use pipeline_core::{
    event_bus::EventBus,
    metrics::Metrics,
    state::{StagingStore, sled_store::SledStore},
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;

pub(crate) struct Harness {
    pub store: Arc<SledStore>,
    pub queue: Arc<InProcessQueue>,
    pub control: ControlService,
    pub metrics: Metrics,
    _dir: TempDir,
}

pub(crate) fn harness(default_stall_threshold_secs: u64) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SledStore::open(dir.path()).expect("open store"));
    harness_with_staging(dir, store.clone(), store, default_stall_threshold_secs)
}

/// Same wiring, but with the staging layer swapped out. Used to inject
/// staging failures.
pub(crate) fn harness_with_staging(
    dir: TempDir,
    store: Arc<SledStore>,
    staging: Arc<dyn StagingStore>,
    default_stall_threshold_secs: u64,
) -> Harness {
    let queue = Arc::new(InProcessQueue::new(3));
    let metrics = Metrics::new();
    let control = ControlService::new(
        store.clone(),
        staging,
        queue.clone(),
        Arc::new(DestinationConsolidator::new(store.clone())),
        EventBus::new(),
        metrics.clone(),
        default_stall_threshold_secs,
    );

    Harness {
        store,
        queue,
        control,
        metrics,
        _dir: dir,
    }
}

pub(crate) fn open_store() -> (TempDir, Arc<SledStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SledStore::open(dir.path()).expect("open store"));
    (dir, store)
}

pub(crate) fn descriptor(items: &[&str], stall_threshold_secs: Option<u64>) -> BatchDescriptor {
    BatchDescriptor {
        processor: ProcessorName::new("orders-export"),
        identifier: Identifier::new("2026-08-06"),
        items: items
            .iter()
            .map(|id| WorkItem {
                item_id: ItemId::new(*id),
                payload: format!("{{\"item\":\"{id}\"}}"),
            })
            .collect(),
        stall_threshold_secs,
    }
}

pub(crate) async fn wait_for_batch<F>(
    control: &ControlService,
    batch_id: &BatchId,
    pred: F,
) -> BatchRecord
where
    F: Fn(&BatchRecord) -> bool,
{
    for _ in 0..300 {
        let record = control.status(batch_id.clone()).await.expect("status");
        if pred(&record) {
            return record;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} never reached the expected state");
}
