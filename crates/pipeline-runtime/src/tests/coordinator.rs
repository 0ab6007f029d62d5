use crate::tests::support::{descriptor, harness, wait_for_batch};
use chrono::Utc;
use model::{
    core::identifiers::{BatchId, ItemId},
    records::batch::{BatchStatus, CompletionEvent, CompletionStatus},
};
use pipeline_core::state::{DestinationStore, StagingStore};
use std::time::Duration;
use tokio::time::sleep;

fn done_event(
    batch_id: &BatchId,
    item: &str,
    staging_key: Option<String>,
    written_count: u64,
) -> CompletionEvent {
    CompletionEvent {
        batch_id: batch_id.clone(),
        item_id: ItemId::new(item),
        status: CompletionStatus::Done,
        written_count,
        staging_key,
        error: None,
        at: Utc::now(),
    }
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let h = harness(3600);

    let batch_id = h.control.start(descriptor(&[], None)).await.unwrap();
    let record = wait_for_batch(&h.control, &batch_id, |b| b.status.is_terminal()).await;

    assert_eq!(record.status, BatchStatus::Completed);
    assert_eq!(record.total_items, 0);
    assert!(record.consolidated);
}

#[tokio::test]
async fn completions_drive_the_batch_to_completed() {
    let h = harness(3600);

    let batch_id = h
        .control
        .start(descriptor(&["i1", "i2"], None))
        .await
        .unwrap();

    for item in ["i1", "i2"] {
        let key = h
            .store
            .stage(&batch_id, &ItemId::new(item), "{\"rows\":5}")
            .await
            .unwrap();
        h.control
            .completion(done_event(&batch_id, item, Some(key), 5))
            .await
            .unwrap();
    }

    let record = wait_for_batch(&h.control, &batch_id, |b| b.status.is_terminal()).await;
    assert_eq!(record.status, BatchStatus::Completed);
    assert_eq!(record.items_done, 2);
    assert_eq!(record.items_failed, 0);
    assert!(record.consolidated);
    assert_eq!(h.store.destination_count(&batch_id).await.unwrap(), 2);
    assert_eq!(h.metrics.snapshot().batches_finalized, 1);
}

#[tokio::test]
async fn duplicate_completion_events_are_no_ops() {
    let h = harness(3600);

    let batch_id = h
        .control
        .start(descriptor(&["i1", "i2"], None))
        .await
        .unwrap();

    let key = h
        .store
        .stage(&batch_id, &ItemId::new("i1"), "{\"rows\":1}")
        .await
        .unwrap();
    h.control
        .completion(done_event(&batch_id, "i1", Some(key.clone()), 1))
        .await
        .unwrap();

    wait_for_batch(&h.control, &batch_id, |b| b.items_done == 1).await;

    // Redelivered event for an already-terminal item.
    h.control
        .completion(done_event(&batch_id, "i1", Some(key), 1))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let record = h.control.status(batch_id.clone()).await.unwrap();
    assert_eq!(record.items_done, 1);
    assert_eq!(record.status, BatchStatus::Running);
}

#[tokio::test]
async fn completion_for_unknown_item_is_ignored() {
    let h = harness(3600);

    let batch_id = h.control.start(descriptor(&["i1"], None)).await.unwrap();
    h.control
        .completion(done_event(&batch_id, "ghost", None, 0))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let record = h.control.status(batch_id.clone()).await.unwrap();
    assert_eq!(record.items_done, 0);
    assert_eq!(record.status, BatchStatus::Running);
}

#[tokio::test]
async fn stall_finalizes_with_partial_results() {
    let h = harness(3600);

    // Per-batch threshold of zero: any idle moment with outstanding items
    // counts as a stall.
    let batch_id = h
        .control
        .start(descriptor(&["i1", "i2", "i3"], Some(0)))
        .await
        .unwrap();

    let key = h
        .store
        .stage(&batch_id, &ItemId::new("i1"), "{\"rows\":4}")
        .await
        .unwrap();
    h.control
        .completion(done_event(&batch_id, "i1", Some(key), 4))
        .await
        .unwrap();
    wait_for_batch(&h.control, &batch_id, |b| b.items_done == 1).await;

    let stalled = h.control.check_stalled().await.unwrap();
    assert_eq!(stalled, vec![batch_id.clone()]);

    let record = wait_for_batch(&h.control, &batch_id, |b| b.status.is_terminal()).await;
    assert_eq!(record.status, BatchStatus::CompletedWithPartial);
    assert_eq!(record.items_done, 1);
    assert!(record.consolidated);

    // Only the staged result made it to the destination.
    assert_eq!(h.store.destination_count(&batch_id).await.unwrap(), 1);

    // A straggler completion after finalization must not thaw the counters.
    let key = h
        .store
        .stage(&batch_id, &ItemId::new("i2"), "{\"rows\":9}")
        .await
        .unwrap();
    h.control
        .completion(done_event(&batch_id, "i2", Some(key), 9))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let record = h.control.status(batch_id.clone()).await.unwrap();
    assert_eq!(record.items_done, 1);
    assert_eq!(record.status, BatchStatus::CompletedWithPartial);
}

#[tokio::test]
async fn check_stalled_leaves_active_batches_alone() {
    let h = harness(3600);

    let batch_id = h.control.start(descriptor(&["i1"], None)).await.unwrap();

    let stalled = h.control.check_stalled().await.unwrap();
    assert!(stalled.is_empty());

    let record = h.control.status(batch_id.clone()).await.unwrap();
    assert_eq!(record.status, BatchStatus::Running);
}
