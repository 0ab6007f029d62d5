#[cfg(test)]
mod tests {
    use crate::{
        TEST_BATCH_PROCESSOR, TEST_IDENTIFIER, TEST_PROCESSOR,
        utils::{
            BatchDriver, EchoHandler, FailingStaging, FatalForHandler, FlakyHandler,
            ScriptedProcessor, batch_runtime, batch_runtime_with_staging, capture, counts_file,
            date, descriptor, open_store, runner_over, wait_for_batch, wait_until, work_items,
        },
    };
    use chrono::Utc;
    use futures::future::join_all;
    use model::{
        core::identifiers::{Identifier, ItemId},
        events::{
            CircuitClosed, CircuitOpened, ReconciliationCompleted, StallDetected,
            TriggerSuppressed,
        },
        records::{
            batch::{BatchStatus, CompletionEvent, CompletionStatus, ItemStatus},
            circuit::CircuitState,
            run::{FailureCategory, RunStatus},
        },
        report::{PhasePair, Severity},
    };
    use pipeline_core::{
        event_bus::EventBus,
        metrics::Metrics,
        retry::RetryPolicy,
        state::{BatchStore, CircuitStore, DestinationStore, RunLedger},
    };
    use pipeline_processing::runner::{Processor, RunOutcome};
    use pipeline_reconcile::{
        collaborators::CountsFile, service::ReconciliationService, severity::SeverityThresholds,
    };
    use std::{sync::Arc, time::Duration};
    use tokio::time::sleep;
    use tracing_test::traced_test;

    // Test Settings: failure threshold 3, no force flag.
    // Scenario: A processor succeeds on the first trigger for an identifier,
    // then the same trigger fires again.
    // Expected Outcome:
    // - The first run finalizes as Success with the records it wrote.
    // - The second trigger is suppressed without opening an attempt.
    // - The ledger holds exactly one finalized record.
    #[traced_test]
    #[tokio::test]
    async fn tc01() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let metrics = Metrics::new();
        let runner = runner_over(store.clone(), 3, bus.clone(), metrics.clone());
        let processor = ScriptedProcessor::new(TEST_PROCESSOR, "warehouse.orders");
        let identifier = Identifier::new(TEST_IDENTIFIER);

        let mut suppressed = capture::<TriggerSuppressed>(&bus).await;

        processor.push_success(187);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 187);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let second = runner.run(&processor, &identifier, false).await.unwrap();
        assert!(matches!(second, RunOutcome::Skipped { .. }));

        let history = store.history(&processor.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 1);

        let event = suppressed.recv().await.expect("suppression event");
        assert_eq!(event.identifier, TEST_IDENTIFIER);

        let snap = metrics.snapshot();
        assert_eq!(snap.runs_started, 1);
        assert_eq!(snap.runs_succeeded, 1);
        assert_eq!(snap.runs_suppressed, 1);
    }

    // Test Settings: failure threshold 1, so a single counted failure opens
    // the circuit.
    // Scenario: The upstream has no rows yet; the readiness guard skips the
    // execution. Data arrives later and the trigger fires again.
    // Expected Outcome:
    // - The guarded run finalizes as Skipped / NoDataAvailable.
    // - The skip does not feed the breaker's failure counter.
    // - The re-run succeeds, and a third trigger is suppressed by the gate.
    #[traced_test]
    #[tokio::test]
    async fn tc02() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let metrics = Metrics::new();
        let runner = runner_over(store.clone(), 1, bus.clone(), metrics.clone());
        let processor = ScriptedProcessor::new(TEST_PROCESSOR, "warehouse.orders");
        let identifier = Identifier::new(TEST_IDENTIFIER);

        processor.set_ready(false);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Skipped);
                assert_eq!(record.failure_category, FailureCategory::NoDataAvailable);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let circuit = store
            .load(&processor.name(), &processor.resource())
            .await
            .unwrap();
        assert!(
            circuit.is_none() || circuit.unwrap().state == CircuitState::Closed,
            "a guard skip must not count as a failure"
        );

        processor.set_ready(true);
        processor.push_success(187);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 187);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let third = runner.run(&processor, &identifier, false).await.unwrap();
        assert!(matches!(third, RunOutcome::Skipped { .. }));

        let history = store.history(&processor.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    // Test Settings: failure threshold 2, zero probe interval.
    // Scenario: Two consecutive upstream failures open the circuit. While
    // the upstream stays down, another trigger fires; then the upstream
    // recovers and the next trigger probes its way back in.
    // Expected Outcome:
    // - The circuit opens at the threshold and the blocked invocation opens
    //   no ledger attempt.
    // - Once the probe passes, the same invocation takes the HalfOpen trial,
    //   succeeds, and closes the circuit.
    #[traced_test]
    #[tokio::test]
    async fn tc03() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let metrics = Metrics::new();
        let runner = runner_over(store.clone(), 2, bus.clone(), metrics.clone());
        let processor = ScriptedProcessor::new(TEST_PROCESSOR, "warehouse.orders");
        let identifier = Identifier::new(TEST_IDENTIFIER);

        let mut opened = capture::<CircuitOpened>(&bus).await;
        let mut closed = capture::<CircuitClosed>(&bus).await;

        for _ in 0..2 {
            processor.push_failure(FailureCategory::UpstreamFailure, "connection refused");
            let outcome = runner.run(&processor, &identifier, false).await.unwrap();
            assert!(matches!(outcome, RunOutcome::Completed(_)));
        }

        let event = opened.recv().await.expect("circuit opened event");
        assert_eq!(event.consecutive_failures, 2);

        processor.set_ready(false);
        let blocked = runner.run(&processor, &identifier, false).await.unwrap();
        match blocked {
            RunOutcome::Skipped { reason } => assert!(reason.contains("circuit open")),
            other => panic!("expected Skipped, got {other:?}"),
        }
        let history = store.history(&processor.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 2, "blocked invocation must not open an attempt");

        processor.set_ready(true);
        processor.push_success(42);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 42);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let circuit = store
            .load(&processor.name(), &processor.resource())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(circuit.state, CircuitState::Closed);
        closed.recv().await.expect("circuit closed event");

        assert_eq!(metrics.snapshot().probes_performed, 2);
    }

    // Test Settings: Default gate behavior plus an explicit force flag.
    // Scenario: A unit already succeeded with output; an operator forces a
    // re-run over it.
    // Expected Outcome:
    // - The forced trigger proceeds and finalizes a second Success record.
    // - Both gate decisions are audited, with the second marked forced.
    #[traced_test]
    #[tokio::test]
    async fn tc04() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let metrics = Metrics::new();
        let runner = runner_over(store.clone(), 3, bus.clone(), metrics.clone());
        let processor = ScriptedProcessor::new(TEST_PROCESSOR, "warehouse.orders");
        let identifier = Identifier::new(TEST_IDENTIFIER);

        processor.push_success(187);
        runner.run(&processor, &identifier, false).await.unwrap();

        processor.push_success(190);
        let forced = runner.run(&processor, &identifier, true).await.unwrap();
        match forced {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 190);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let history = store.history(&processor.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 2);

        let decisions = store
            .decisions(&processor.name(), &identifier)
            .await
            .unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(!decisions[0].forced);
        assert!(decisions[1].forced);
    }

    // Test Settings: 4 workers, no handler retries, default stall threshold.
    // Scenario: A 6-item batch runs through fan-out, staging, and
    // consolidation with a handler that always succeeds.
    // Expected Outcome:
    // - The batch finalizes as Completed with all items done.
    // - Every staged result is merged into the destination exactly once.
    #[traced_test]
    #[tokio::test]
    async fn tc05() {
        let rt = batch_runtime(Arc::new(EchoHandler), 4, RetryPolicy::no_retry(), 3600);

        let batch_id = rt
            .control
            .start(descriptor(TEST_BATCH_PROCESSOR, TEST_IDENTIFIER, 6, None))
            .await
            .unwrap();

        let record = wait_for_batch(&rt.control, &batch_id, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.items_done, 6);
        assert_eq!(record.items_failed, 0);

        assert_eq!(rt.store.destination_count(&batch_id).await.unwrap(), 6);

        let snap = rt.metrics.snapshot();
        assert_eq!(snap.items_completed, 6);
        assert_eq!(snap.batches_finalized, 1);

        rt.control.shutdown().await;
    }

    // Test Settings: 4 workers shared by two batches.
    // Scenario: Two batches for different identifiers are opened
    // concurrently against the same worker pool.
    // Expected Outcome: Both complete and consolidate independently, each
    // with its own destination count.
    #[traced_test]
    #[tokio::test]
    async fn tc06() {
        let rt = batch_runtime(Arc::new(EchoHandler), 4, RetryPolicy::no_retry(), 3600);

        let ids = join_all(vec![
            rt.control
                .start(descriptor(TEST_BATCH_PROCESSOR, "2026-08-05", 4, None)),
            rt.control
                .start(descriptor(TEST_BATCH_PROCESSOR, "2026-08-06", 3, None)),
        ])
        .await;

        let first = ids[0].as_ref().unwrap().clone();
        let second = ids[1].as_ref().unwrap().clone();

        let a = wait_for_batch(&rt.control, &first, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;
        let b = wait_for_batch(&rt.control, &second, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;

        assert_eq!(a.status, BatchStatus::Completed);
        assert_eq!(a.items_done, 4);
        assert_eq!(b.status, BatchStatus::Completed);
        assert_eq!(b.items_done, 3);

        assert_eq!(rt.store.destination_count(&first).await.unwrap(), 4);
        assert_eq!(rt.store.destination_count(&second).await.unwrap(), 3);

        rt.control.shutdown().await;
    }

    // Test Settings: no workers; completion events are fed directly.
    // Scenario: The same Done event for one item arrives twice before the
    // other item completes, as an at-least-once queue allows.
    // Expected Outcome: The duplicate is a no-op. The batch finalizes with
    // items_done equal to the item count, not the event count.
    #[traced_test]
    #[tokio::test]
    async fn tc07() {
        let rt = batch_runtime(Arc::new(EchoHandler), 0, RetryPolicy::no_retry(), 3600);

        let batch_id = rt
            .control
            .start(descriptor(TEST_BATCH_PROCESSOR, TEST_IDENTIFIER, 2, None))
            .await
            .unwrap();

        let done = |item: &str| CompletionEvent {
            batch_id: batch_id.clone(),
            item_id: ItemId::new(item),
            status: CompletionStatus::Done,
            written_count: 1,
            staging_key: None,
            error: None,
            at: Utc::now(),
        };

        rt.control.completion(done("item-0001")).await.unwrap();
        rt.control.completion(done("item-0001")).await.unwrap();
        rt.control.completion(done("item-0002")).await.unwrap();

        let record = wait_for_batch(&rt.control, &batch_id, |r| r.status.is_terminal()).await;
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.items_done, 2);
        assert_eq!(rt.metrics.snapshot().items_completed, 2);

        rt.control.shutdown().await;
    }

    // Test Settings: 2 workers, no handler retries.
    // Scenario: One item in a 4-item batch is malformed and fails fatally;
    // the rest process normally.
    // Expected Outcome: The batch still finalizes as Completed, with the
    // failure reflected in the counters and only the good items merged.
    #[traced_test]
    #[tokio::test]
    async fn tc08() {
        let rt = batch_runtime(
            Arc::new(FatalForHandler::new(&["item-0002"])),
            2,
            RetryPolicy::no_retry(),
            3600,
        );

        let batch_id = rt
            .control
            .start(descriptor(TEST_BATCH_PROCESSOR, TEST_IDENTIFIER, 4, None))
            .await
            .unwrap();

        let record = wait_for_batch(&rt.control, &batch_id, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.items_done, 3);
        assert_eq!(record.items_failed, 1);

        let failed = rt
            .store
            .item(&batch_id, &ItemId::new("item-0002"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);

        assert_eq!(rt.store.destination_count(&batch_id).await.unwrap(), 3);
        assert_eq!(rt.metrics.snapshot().items_failed, 1);

        rt.control.shutdown().await;
    }

    // Test Settings: 2 workers, retry policy of 3 attempts with no backoff.
    // Scenario: Every item fails twice with a retryable error before
    // succeeding on the third attempt.
    // Expected Outcome: All items converge to Done within one delivery each,
    // and the retry counter records the extra attempts.
    #[traced_test]
    #[tokio::test]
    async fn tc09() {
        let rt = batch_runtime(
            Arc::new(FlakyHandler::new(2)),
            2,
            RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
            3600,
        );

        let batch_id = rt
            .control
            .start(descriptor(TEST_BATCH_PROCESSOR, TEST_IDENTIFIER, 3, None))
            .await
            .unwrap();

        let record = wait_for_batch(&rt.control, &batch_id, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.items_done, 3);
        assert_eq!(record.items_failed, 0);

        assert_eq!(rt.metrics.snapshot().retry_count, 6);

        rt.control.shutdown().await;
    }

    // Test Settings: 4 workers, per-batch stall threshold of 0 seconds,
    // queue allows 3 redeliveries.
    // Scenario: A 104-item batch where staging refuses two items. The
    // workers nack those deliveries until the queue parks them, leaving the
    // items in flight forever.
    // Expected Outcome:
    // - The stall sweep force-finalizes the batch as CompletedWithPartial.
    // - The 102 staged results are consolidated; the two refused items stay
    //   non-terminal and the frozen counters ignore their late completions.
    #[traced_test]
    #[tokio::test]
    async fn tc10() {
        let (dir, store) = open_store();
        let staging = Arc::new(FailingStaging::new(store.clone(), &[
            "item-0013",
            "item-0047",
        ]));
        let rt = batch_runtime_with_staging(
            dir,
            store.clone(),
            staging,
            Arc::new(EchoHandler),
            4,
            RetryPolicy::no_retry(),
            3600,
        );

        let mut stalls = capture::<StallDetected>(&rt.bus).await;

        let batch_id = rt
            .control
            .start(descriptor(
                TEST_BATCH_PROCESSOR,
                TEST_IDENTIFIER,
                104,
                Some(0),
            ))
            .await
            .unwrap();

        wait_for_batch(&rt.control, &batch_id, |r| r.items_done == 102).await;
        wait_until("refused items to exhaust redeliveries", || {
            rt.queue.parked().len() == 2
        })
        .await;

        let stalled = rt.control.check_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].as_str(), batch_id.as_str());

        let record = wait_for_batch(&rt.control, &batch_id, |r| {
            r.status.is_terminal() && r.consolidated
        })
        .await;
        assert_eq!(record.status, BatchStatus::CompletedWithPartial);
        assert_eq!(record.items_done, 102);
        assert_eq!(record.items_failed, 0);
        assert_eq!(record.outstanding(), 2);

        assert_eq!(rt.store.destination_count(&batch_id).await.unwrap(), 102);

        let stall = stalls.recv().await.expect("stall event");
        assert_eq!(stall.outstanding_items, 2);

        let refused = rt
            .store
            .item(&batch_id, &ItemId::new("item-0013"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refused.status, ItemStatus::InProgress);

        // A straggler completion after finalization settles the item record
        // but must not move the frozen batch counters.
        rt.control
            .completion(CompletionEvent {
                batch_id: batch_id.clone(),
                item_id: ItemId::new("item-0013"),
                status: CompletionStatus::Done,
                written_count: 1,
                staging_key: None,
                error: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let after = rt.control.status(batch_id.clone()).await.unwrap();
        assert_eq!(after.items_done, 102);
        assert_eq!(after.status, BatchStatus::CompletedWithPartial);

        rt.control.shutdown().await;
    }

    // Test Settings: full stack; 2 workers, failure threshold 3.
    // Scenario: A batch-driving processor goes through the invocation
    // wrapper, so the gate, breaker, ledger, and batch runtime all see the
    // same trigger.
    // Expected Outcome:
    // - The run finalizes as Success with records_written equal to the
    //   batch's completed items.
    // - A second trigger for the same identifier is suppressed by the gate.
    #[traced_test]
    #[tokio::test]
    async fn tc11() {
        let (dir, store) = open_store();
        let rt = batch_runtime_with_staging(
            dir,
            store.clone(),
            store.clone(),
            Arc::new(EchoHandler),
            2,
            RetryPolicy::no_retry(),
            3600,
        );
        let driver = BatchDriver::new(TEST_BATCH_PROCESSOR, rt.control, work_items(5));
        let runner = runner_over(store.clone(), 3, EventBus::new(), Metrics::new());
        let identifier = Identifier::new(TEST_IDENTIFIER);

        let outcome = runner.run(&driver, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 5);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let second = runner.run(&driver, &identifier, false).await.unwrap();
        assert!(matches!(second, RunOutcome::Skipped { .. }));

        let history = store.history(&driver.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 1);

        driver.into_control().shutdown().await;
    }

    // Test Settings: default severity thresholds (medium 0.1, high 0.5).
    // Scenario: A counts file covers one date where the published phase
    // lost most of its rows; a second date has no entry at all.
    // Expected Outcome:
    // - The covered date grades a High gap on staged->published and emits a
    //   cycle-completed event.
    // - The missing date downgrades both pairs to skips instead of failing.
    #[traced_test]
    #[tokio::test]
    async fn tc12() {
        let file = counts_file(
            r#"{"2026-08-05": {"expected_units": 9, "phases": {"staged": 9, "published": 2}}}"#,
        );
        let counts: Arc<CountsFile> = Arc::new(CountsFile::load(file.path()).unwrap());

        let bus = EventBus::new();
        let mut completed = capture::<ReconciliationCompleted>(&bus).await;

        let service = ReconciliationService::new(
            counts.clone(),
            counts,
            vec![
                PhasePair::new("schedule", "staged"),
                PhasePair::new("staged", "published"),
            ],
            SeverityThresholds::default(),
            "schedule",
            bus,
        );

        let report = service.reconcile(date("2026-08-05")).await;
        assert_eq!(report.gaps_found, 1);
        assert_eq!(report.checks[0].phase_pair, "staged->published");
        assert_eq!(report.checks[0].expected_count, 9);
        assert_eq!(report.checks[0].actual_count, 2);
        assert_eq!(report.checks[0].severity, Severity::High);
        assert_eq!(report.highest_severity(), Some(Severity::High));

        let event = completed.recv().await.expect("cycle event");
        assert_eq!(event.gaps_found, 1);

        let missing = service.reconcile(date("2026-08-06")).await;
        assert_eq!(missing.gaps_found, 0);
        assert_eq!(missing.skipped.len(), 2);
    }

    // Test Settings: failure threshold 3, no force flag.
    // Scenario: A run completes cleanly but writes nothing because the data
    // was not there yet. The data lands later and the trigger fires again.
    // Expected Outcome:
    // - The zero-output success does not block the re-run.
    // - The re-run writes records and becomes the blocking outcome, so a
    //   third trigger is suppressed.
    #[traced_test]
    #[tokio::test]
    async fn tc13() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let metrics = Metrics::new();
        let runner = runner_over(store.clone(), 3, bus.clone(), metrics.clone());
        let processor = ScriptedProcessor::new(TEST_PROCESSOR, "warehouse.orders");
        let identifier = Identifier::new(TEST_IDENTIFIER);

        processor.push_success(0);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 0);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        processor.push_success(187);
        let outcome = runner.run(&processor, &identifier, false).await.unwrap();
        match outcome {
            RunOutcome::Completed(record) => {
                assert_eq!(record.status, RunStatus::Success);
                assert_eq!(record.records_written, 187);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let third = runner.run(&processor, &identifier, false).await.unwrap();
        assert!(matches!(third, RunOutcome::Skipped { .. }));

        let history = store.history(&processor.name(), &identifier).await.unwrap();
        assert_eq!(history.len(), 2);
    }
}
