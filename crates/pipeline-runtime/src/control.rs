use crate::{
    actor::{
        ActorRef,
        coordinator::CoordinatorActor,
        messages::{BatchDescriptor, CoordinatorMsg},
        spawn_actor,
    },
    consolidate::Consolidator,
    error::CoordinatorError,
    queue::WorkQueue,
    worker::{ItemHandler, Worker},
};
use model::{
    core::identifiers::BatchId,
    records::batch::{BatchRecord, CompletionEvent},
};
use pipeline_core::{
    event_bus::EventBus,
    metrics::Metrics,
    retry::RetryPolicy,
    state::{BatchStore, StagingStore},
};
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const COORDINATOR_MAILBOX: usize = 100;

/// Wiring for the batch runtime: spawns the coordinator actor, hands out
/// the operations callers need, and owns worker lifecycles.
pub struct ControlService {
    coordinator: ActorRef<CoordinatorMsg>,
    coordinator_handle: JoinHandle<()>,
    queue: Arc<dyn WorkQueue>,
    batches: Arc<dyn BatchStore>,
    staging: Arc<dyn StagingStore>,
    metrics: Metrics,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ControlService {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        staging: Arc<dyn StagingStore>,
        queue: Arc<dyn WorkQueue>,
        consolidator: Arc<dyn Consolidator>,
        bus: EventBus,
        metrics: Metrics,
        default_stall_threshold_secs: u64,
    ) -> Self {
        let actor = CoordinatorActor::new(
            batches.clone(),
            staging.clone(),
            queue.clone(),
            consolidator,
            bus,
            metrics.clone(),
            default_stall_threshold_secs,
        );
        let (coordinator, coordinator_handle) =
            spawn_actor("batch-coordinator", COORDINATOR_MAILBOX, actor);

        ControlService {
            coordinator,
            coordinator_handle,
            queue,
            batches,
            staging,
            metrics,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn coordinator(&self) -> ActorRef<CoordinatorMsg> {
        self.coordinator.clone()
    }

    /// Token that stops the workers; `shutdown` cancels it, and callers may
    /// cancel it early to interrupt a run in flight.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch `count` workers over the shared queue, each running `handler`.
    pub fn spawn_workers(&mut self, handler: Arc<dyn ItemHandler>, count: usize, retry: RetryPolicy) {
        for n in 0..count {
            let worker = Worker::new(
                self.queue.clone(),
                self.batches.clone(),
                self.staging.clone(),
                self.coordinator.clone(),
                handler.clone(),
                retry.clone(),
                self.metrics.clone(),
                self.cancel.clone(),
            );
            info!(worker = n, "Spawning worker");
            self.workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Open a batch and dispatch its items. Replies with the batch id once
    /// the batch and all item records are durable.
    pub async fn start(&self, descriptor: BatchDescriptor) -> Result<BatchId, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.coordinator
            .send(CoordinatorMsg::Start { descriptor, reply })
            .await?;
        rx.await.map_err(|_| CoordinatorError::ReplyDropped)?
    }

    pub async fn status(&self, batch_id: BatchId) -> Result<BatchRecord, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.coordinator
            .send(CoordinatorMsg::Status { batch_id, reply })
            .await?;
        rx.await.map_err(|_| CoordinatorError::ReplyDropped)?
    }

    /// Scan running batches and force-finalize the ones past their stall
    /// threshold. Returns the ids that were finalized.
    pub async fn check_stalled(&self) -> Result<Vec<BatchId>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.coordinator
            .send(CoordinatorMsg::CheckStalled { reply })
            .await?;
        rx.await.map_err(|_| CoordinatorError::ReplyDropped)?
    }

    /// Feed an externally observed completion event to the coordinator.
    pub async fn completion(&self, event: CompletionEvent) -> Result<(), CoordinatorError> {
        self.coordinator
            .send(CoordinatorMsg::Completion { event })
            .await?;
        Ok(())
    }

    /// Stop workers, then the coordinator. Waits for both to wind down.
    pub async fn shutdown(self) {
        info!("Control service shutting down");
        self.cancel.cancel();

        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task join failed");
            }
        }

        // Dropping the last coordinator ref closes its mailbox.
        drop(self.coordinator);
        if let Err(e) = self.coordinator_handle.await {
            warn!(error = %e, "Coordinator task join failed");
        }
    }
}
