use crate::{
    actor::{ActorRef, messages::CoordinatorMsg},
    error::WorkerError,
    queue::{Delivery, WorkMessage, WorkQueue},
};
use async_trait::async_trait;
use chrono::Utc;
use model::records::batch::{CompletionEvent, CompletionStatus, ItemStatus};
use pipeline_core::{
    metrics::Metrics,
    retry::{RetryDisposition, RetryPolicy},
    state::{BatchStore, StagingStore},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of processing one work item. The payload is what gets staged
/// and later consolidated into the destination.
#[derive(Debug, Clone)]
pub struct ItemOutput {
    pub payload: String,
    pub written_count: u64,
}

/// A handler failure. `retryable` drives the worker's retry policy;
/// non-retryable failures complete the item as Failed on first sight.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ItemFailure {
    pub message: String,
    pub retryable: bool,
}

impl ItemFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        ItemFailure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ItemFailure {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The per-item processing logic plugged into the worker harness.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn process(&self, msg: &WorkMessage) -> Result<ItemOutput, ItemFailure>;
}

/// Pulls work messages off the queue, runs the handler, stages the result,
/// and reports completion to the coordinator.
///
/// The ack contract: a message is acked only after its result is durably
/// staged AND the completion event is handed to the coordinator. Anything
/// less nacks, and the queue redelivers. Duplicates are expected and are
/// absorbed by the item record's terminal state.
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    batches: Arc<dyn BatchStore>,
    staging: Arc<dyn StagingStore>,
    coordinator: ActorRef<CoordinatorMsg>,
    handler: Arc<dyn ItemHandler>,
    retry: RetryPolicy,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        batches: Arc<dyn BatchStore>,
        staging: Arc<dyn StagingStore>,
        coordinator: ActorRef<CoordinatorMsg>,
        handler: Arc<dyn ItemHandler>,
        retry: RetryPolicy,
        metrics: Metrics,
        cancel: CancellationToken,
    ) -> Self {
        Worker {
            queue,
            batches,
            staging,
            coordinator,
            handler,
            retry,
            metrics,
            cancel,
        }
    }

    /// Consume deliveries until the queue drains or shutdown is requested.
    pub async fn run(self) {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Worker shutting down");
                    return;
                }
                next = self.queue.next() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        info!("Work queue closed; worker exiting");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Work queue receive failed; worker exiting");
                        return;
                    }
                },
            };

            if let Err(e) = self.handle_delivery(delivery).await {
                error!(error = %e, "Delivery handling failed");
            }
        }
    }

    async fn handle_delivery(&self, delivery: Box<dyn Delivery>) -> Result<(), WorkerError> {
        let msg = delivery.message().clone();

        if !self.claim(&msg).await? {
            debug!(
                batch_id = %msg.batch_id,
                item_id = %msg.item_id,
                attempt = msg.attempt,
                "Item already terminal; acking duplicate delivery"
            );
            delivery.ack().await?;
            return Ok(());
        }

        let attempts = AtomicU64::new(0);
        let outcome = self
            .retry
            .run(
                || {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    self.handler.process(&msg)
                },
                |failure: &ItemFailure| {
                    if failure.retryable {
                        RetryDisposition::Retry
                    } else {
                        RetryDisposition::Stop
                    }
                },
            )
            .await;

        let extra_attempts = attempts.load(Ordering::Relaxed).saturating_sub(1);
        if extra_attempts > 0 {
            self.metrics.increment_retries(extra_attempts);
        }

        match outcome {
            Ok(output) => self.complete_done(delivery, &msg, output).await,
            Err(retry_err) => {
                let failure = retry_err.into_inner();
                warn!(
                    batch_id = %msg.batch_id,
                    item_id = %msg.item_id,
                    attempt = msg.attempt,
                    error = %failure,
                    "Item processing failed"
                );
                self.complete_failed(delivery, &msg, &failure).await
            }
        }
    }

    /// Move the item to InProgress. Returns false when the item is already
    /// terminal (a duplicate delivery) or unknown.
    async fn claim(&self, msg: &WorkMessage) -> Result<bool, WorkerError> {
        loop {
            let Some(item) = self.batches.item(&msg.batch_id, &msg.item_id).await? else {
                warn!(
                    batch_id = %msg.batch_id,
                    item_id = %msg.item_id,
                    "Delivery for unknown item; dropping"
                );
                return Ok(false);
            };

            if item.status.is_terminal() {
                return Ok(false);
            }

            if item.status == ItemStatus::InProgress {
                // Redelivery of an in-flight item; the previous consumer
                // nacked or died, so this consumer takes over.
                return Ok(true);
            }

            let mut next = item.bump();
            next.status = ItemStatus::InProgress;
            if self.batches.cas_item(&item, &next).await? {
                return Ok(true);
            }
        }
    }

    /// Stage, report, then ack. A failure at any step before the ack nacks
    /// the delivery so the queue retries the whole sequence.
    async fn complete_done(
        &self,
        delivery: Box<dyn Delivery>,
        msg: &WorkMessage,
        output: ItemOutput,
    ) -> Result<(), WorkerError> {
        let staging_key = match self
            .staging
            .stage(&msg.batch_id, &msg.item_id, &output.payload)
            .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    batch_id = %msg.batch_id,
                    item_id = %msg.item_id,
                    error = %e,
                    "Staging failed; nacking for redelivery"
                );
                delivery.nack().await?;
                return Ok(());
            }
        };

        let event = CompletionEvent {
            batch_id: msg.batch_id.clone(),
            item_id: msg.item_id.clone(),
            status: CompletionStatus::Done,
            written_count: output.written_count,
            staging_key: Some(staging_key),
            error: None,
            at: Utc::now(),
        };

        if let Err(e) = self.coordinator.send(CoordinatorMsg::Completion { event }).await {
            warn!(
                batch_id = %msg.batch_id,
                item_id = %msg.item_id,
                error = %e,
                "Coordinator unreachable; nacking for redelivery"
            );
            delivery.nack().await?;
            return Ok(());
        }

        delivery.ack().await?;
        Ok(())
    }

    async fn complete_failed(
        &self,
        delivery: Box<dyn Delivery>,
        msg: &WorkMessage,
        failure: &ItemFailure,
    ) -> Result<(), WorkerError> {
        let event = CompletionEvent {
            batch_id: msg.batch_id.clone(),
            item_id: msg.item_id.clone(),
            status: CompletionStatus::Failed,
            written_count: 0,
            staging_key: None,
            error: Some(failure.message.clone()),
            at: Utc::now(),
        };

        if let Err(e) = self.coordinator.send(CoordinatorMsg::Completion { event }).await {
            warn!(
                batch_id = %msg.batch_id,
                item_id = %msg.item_id,
                error = %e,
                "Coordinator unreachable; nacking failed item"
            );
            delivery.nack().await?;
            return Ok(());
        }

        delivery.ack().await?;
        Ok(())
    }
}
