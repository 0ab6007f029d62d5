use crate::{event_bus::EventBus, state::RunLedger};
use model::{
    events::HeartbeatEmitted,
    records::run::{HeartbeatEntry, OpenAttempt},
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Emits periodic liveness signals for a long-running attempt.
///
/// Beats are best effort: a failed ledger append is logged and the loop
/// keeps going, since losing one beat must never fail the attempt itself.
#[derive(Clone)]
pub struct Heartbeater {
    ledger: Arc<dyn RunLedger>,
    bus: EventBus,
    interval: Duration,
}

/// Handle for a running heartbeat loop. Stopping is explicit so the final
/// beat cannot race the attempt's finalization.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl Heartbeater {
    pub fn new(ledger: Arc<dyn RunLedger>, bus: EventBus, interval: Duration) -> Self {
        Heartbeater {
            ledger,
            bus,
            interval,
        }
    }

    /// Spawns the beat loop for `attempt`. The first beat fires immediately,
    /// so an attempt that hangs right away is still visible.
    pub fn start(&self, attempt: &OpenAttempt) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ledger = self.ledger.clone();
        let bus = self.bus.clone();
        let interval = self.interval;
        let run_id = attempt.run_id.clone();
        let processor = attempt.processor.clone();
        let identifier = attempt.identifier.clone();

        let task = tokio::spawn(async move {
            if interval.is_zero() {
                token.cancelled().await;
                return;
            }

            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let entry = HeartbeatEntry {
                            run_id: run_id.clone(),
                            processor: processor.clone(),
                            identifier: identifier.clone(),
                            at: chrono::Utc::now(),
                        };

                        if let Err(e) = ledger.append_heartbeat(&entry).await {
                            warn!(
                                run_id = %run_id,
                                error = %e,
                                "Failed to append heartbeat"
                            );
                            continue;
                        }

                        bus.publish(HeartbeatEmitted {
                            run_id: run_id.to_string(),
                            processor: processor.to_string(),
                            timestamp: entry.at,
                        })
                        .await;
                    }
                }
            }
        });

        HeartbeatHandle { cancel, task }
    }
}
