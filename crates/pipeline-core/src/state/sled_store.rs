use crate::{
    error::StoreError,
    state::{BatchStore, CircuitStore, DestinationStore, RunLedger, StagingStore},
};
use async_trait::async_trait;
use model::{
    core::identifiers::{BatchId, Identifier, ItemId, ProcessorName, ResourceKey, RunId},
    records::{
        batch::{BatchRecord, BatchStatus, StagedResult, WorkItemRecord},
        circuit::CircuitRecord,
        run::{AttemptOutcome, DecisionRecord, HeartbeatEntry, OpenAttempt, RunRecord},
    },
};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;

/// Single sled database backing every durable store trait, partitioned by
/// key prefix:
///
///   opn: open attempts            run: finalized run records
///   lat: latest-seq index         dec: gate decisions
///   hb:  heartbeats               cir: circuit records
///   bat: batch records            itm: work-item records
///   stg: staged item results      dst: consolidated destination rows
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    #[inline]
    fn run_key(processor: &ProcessorName, identifier: &Identifier, seq: u64) -> String {
        format!("run:{}:{}:{:020}", processor, identifier, seq)
    }

    #[inline]
    fn latest_key(processor: &ProcessorName, identifier: &Identifier) -> String {
        format!("lat:{}:{}", processor, identifier)
    }

    #[inline]
    fn circuit_key(processor: &ProcessorName, key: &ResourceKey) -> String {
        format!("cir:{}:{}", processor, key)
    }

    #[inline]
    fn item_key(batch_id: &BatchId, item_id: &ItemId) -> String {
        format!("itm:{}:{}", batch_id, item_id)
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_decoded<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_key, value) = entry?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Byte-level compare-and-swap of a bincode-encoded record. Equal
    /// structs encode to equal bytes, so this is the version check.
    fn cas_encoded<T: serde::Serialize>(
        &self,
        key: &str,
        expected: Option<&T>,
        next: &T,
    ) -> Result<bool, StoreError> {
        let old = expected.map(bincode::serialize).transpose()?;
        let new = bincode::serialize(next)?;
        let swapped = self
            .db
            .compare_and_swap(key, old, Some(new))?
            .is_ok();
        Ok(swapped)
    }
}

#[async_trait]
impl RunLedger for SledStore {
    async fn open_attempt(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<OpenAttempt, StoreError> {
        let attempt = OpenAttempt {
            run_id: RunId::generate(),
            seq: self.db.generate_id()?,
            processor: processor.clone(),
            identifier: identifier.clone(),
            started_at: chrono::Utc::now(),
        };

        let key = format!("opn:{}", attempt.run_id);
        self.db.insert(key, bincode::serialize(&attempt)?)?;
        Ok(attempt)
    }

    async fn finalize_attempt(
        &self,
        attempt: &OpenAttempt,
        outcome: &AttemptOutcome,
    ) -> Result<RunRecord, StoreError> {
        let record = RunRecord {
            run_id: attempt.run_id.clone(),
            seq: attempt.seq,
            processor: attempt.processor.clone(),
            identifier: attempt.identifier.clone(),
            started_at: attempt.started_at,
            completed_at: Some(chrono::Utc::now()),
            status: outcome.status(),
            records_written: outcome.records_written(),
            failure_category: outcome.category(),
            error_message: outcome.message(),
        };

        let open_key = format!("opn:{}", attempt.run_id);
        let run_key = Self::run_key(&attempt.processor, &attempt.identifier, attempt.seq);
        let latest_key = Self::latest_key(&attempt.processor, &attempt.identifier);
        let record_bytes =
            bincode::serialize(&record).map_err(|e| StoreError::OutcomeUnknown {
                run_id: attempt.run_id.to_string(),
                source: Box::new(e.into()),
            })?;
        let run_id = attempt.run_id.to_string();
        let seq = attempt.seq;

        // Atomic check-then-set: the open entry is consumed in the same
        // transaction that appends the final record and advances the
        // latest-seq index, so an attempt can be finalized at most once.
        let result = self
            .db
            .transaction::<_, _, StoreError>(|tx| {
                if tx.get(open_key.as_str())?.is_none() {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::AlreadyFinalized {
                            run_id: run_id.clone(),
                        },
                    ));
                }
                tx.remove(open_key.as_str())?;
                tx.insert(run_key.as_str(), record_bytes.as_slice())?;

                let newer_exists = match tx.get(latest_key.as_str())? {
                    Some(bytes) => {
                        let current: u64 = bincode::deserialize(&bytes)
                            .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                        current > seq
                    }
                    None => false,
                };
                if !newer_exists {
                    let seq_bytes = bincode::serialize(&seq)
                        .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                    tx.insert(latest_key.as_str(), seq_bytes)?;
                }
                Ok(())
            });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => {
                return Err(StoreError::OutcomeUnknown {
                    run_id: attempt.run_id.to_string(),
                    source: Box::new(e.into()),
                });
            }
        }

        // The attempt is not finalized until this durably commits.
        self.db
            .flush_async()
            .await
            .map_err(|e| StoreError::OutcomeUnknown {
                run_id: attempt.run_id.to_string(),
                source: Box::new(e.into()),
            })?;

        Ok(record)
    }

    async fn latest_attempt(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Option<RunRecord>, StoreError> {
        let seq: Option<u64> = self.get_decoded(&Self::latest_key(processor, identifier))?;
        match seq {
            Some(seq) => self.get_decoded(&Self::run_key(processor, identifier, seq)),
            None => Ok(None),
        }
    }

    async fn history(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Vec<RunRecord>, StoreError> {
        // Keys embed the zero-padded sequence, so prefix order is sequence
        // order.
        self.scan_decoded(&format!("run:{}:{}:", processor, identifier))
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let key = format!(
            "dec:{}:{}:{:020}",
            record.processor,
            record.identifier,
            self.db.generate_id()?
        );
        self.db.insert(key, bincode::serialize(record)?)?;
        Ok(())
    }

    async fn decisions(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        self.scan_decoded(&format!("dec:{}:{}:", processor, identifier))
    }

    async fn append_heartbeat(&self, entry: &HeartbeatEntry) -> Result<(), StoreError> {
        let key = format!("hb:{}:{:020}", entry.run_id, self.db.generate_id()?);
        self.db.insert(key, bincode::serialize(entry)?)?;
        Ok(())
    }

    async fn heartbeats(&self, run_id: &RunId) -> Result<Vec<HeartbeatEntry>, StoreError> {
        self.scan_decoded(&format!("hb:{}:", run_id))
    }
}

#[async_trait]
impl CircuitStore for SledStore {
    async fn load(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
    ) -> Result<Option<CircuitRecord>, StoreError> {
        self.get_decoded(&Self::circuit_key(processor, key))
    }

    async fn cas(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
        expected: Option<&CircuitRecord>,
        next: &CircuitRecord,
    ) -> Result<bool, StoreError> {
        self.cas_encoded(&Self::circuit_key(processor, key), expected, next)
    }
}

#[async_trait]
impl BatchStore for SledStore {
    async fn insert_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        let key = format!("bat:{}", batch.batch_id);
        let inserted = self
            .db
            .compare_and_swap(
                key.as_str(),
                None as Option<&[u8]>,
                Some(bincode::serialize(batch)?),
            )?
            .is_ok();
        if !inserted {
            return Err(StoreError::AlreadyExists { key });
        }
        Ok(())
    }

    async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        self.get_decoded(&format!("bat:{}", id))
    }

    async fn cas_batch(
        &self,
        expected: &BatchRecord,
        next: &BatchRecord,
    ) -> Result<bool, StoreError> {
        self.cas_encoded(&format!("bat:{}", expected.batch_id), Some(expected), next)
    }

    async fn running_batches(&self) -> Result<Vec<BatchRecord>, StoreError> {
        let all: Vec<BatchRecord> = self.scan_decoded("bat:")?;
        Ok(all
            .into_iter()
            .filter(|b| b.status == BatchStatus::Running)
            .collect())
    }

    async fn insert_item(&self, item: &WorkItemRecord) -> Result<(), StoreError> {
        let key = Self::item_key(&item.batch_id, &item.item_id);
        self.db.insert(key, bincode::serialize(item)?)?;
        Ok(())
    }

    async fn item(
        &self,
        batch_id: &BatchId,
        item_id: &ItemId,
    ) -> Result<Option<WorkItemRecord>, StoreError> {
        self.get_decoded(&Self::item_key(batch_id, item_id))
    }

    async fn cas_item(
        &self,
        expected: &WorkItemRecord,
        next: &WorkItemRecord,
    ) -> Result<bool, StoreError> {
        self.cas_encoded(
            &Self::item_key(&expected.batch_id, &expected.item_id),
            Some(expected),
            next,
        )
    }

    async fn items(&self, batch_id: &BatchId) -> Result<Vec<WorkItemRecord>, StoreError> {
        self.scan_decoded(&format!("itm:{}:", batch_id))
    }
}

#[async_trait]
impl StagingStore for SledStore {
    async fn stage(
        &self,
        batch_id: &BatchId,
        item_id: &ItemId,
        payload: &str,
    ) -> Result<String, StoreError> {
        let staging_key = format!("stg:{}:{}", batch_id, item_id);
        let staged = StagedResult {
            batch_id: batch_id.clone(),
            item_id: item_id.clone(),
            staging_key: staging_key.clone(),
            payload: payload.to_string(),
        };
        self.db
            .insert(staging_key.as_str(), bincode::serialize(&staged)?)?;
        // Workers ack against this write; it must be on disk first.
        self.db.flush_async().await?;
        Ok(staging_key)
    }

    async fn staged(&self, batch_id: &BatchId) -> Result<Vec<StagedResult>, StoreError> {
        self.scan_decoded(&format!("stg:{}:", batch_id))
    }
}

#[async_trait]
impl DestinationStore for SledStore {
    async fn merge(
        &self,
        batch_id: &BatchId,
        results: &[StagedResult],
    ) -> Result<u64, StoreError> {
        // Upsert keyed by (batch, item): re-running a consolidation
        // converges on the same destination rows.
        for result in results {
            let key = format!("dst:{}:{}", batch_id, result.item_id);
            self.db
                .insert(key.as_str(), bincode::serialize(result)?)?;
        }
        self.db.flush_async().await?;
        self.destination_count(batch_id).await
    }

    async fn destination_count(&self, batch_id: &BatchId) -> Result<u64, StoreError> {
        Ok(self.db.scan_prefix(format!("dst:{}:", batch_id)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::records::run::{FailureCategory, RunStatus};
    use tempfile::tempdir;

    fn processor() -> ProcessorName {
        ProcessorName::new("derive-features")
    }

    fn identifier() -> Identifier {
        Identifier::new("2026-08-01")
    }

    #[tokio::test]
    async fn latest_attempt_follows_ledger_sequence() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let first = store.open_attempt(&processor(), &identifier()).await.unwrap();
        let second = store.open_attempt(&processor(), &identifier()).await.unwrap();
        assert!(second.seq > first.seq);

        store
            .finalize_attempt(
                &second,
                &AttemptOutcome::Success {
                    records_written: 10,
                },
            )
            .await
            .unwrap();
        store
            .finalize_attempt(
                &first,
                &AttemptOutcome::Failed {
                    category: FailureCategory::UpstreamFailure,
                    message: "upstream 500".into(),
                },
            )
            .await
            .unwrap();

        // Finalization order does not matter: the later-opened attempt wins
        // the latest pointer by sequence, not by wall clock.
        let latest = store
            .latest_attempt(&processor(), &identifier())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.run_id, second.run_id);
        assert_eq!(latest.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn finalize_is_exactly_once() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let attempt = store.open_attempt(&processor(), &identifier()).await.unwrap();
        store
            .finalize_attempt(&attempt, &AttemptOutcome::Success { records_written: 1 })
            .await
            .unwrap();

        let err = store
            .finalize_attempt(&attempt, &AttemptOutcome::Success { records_written: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized { .. }));

        let history = store.history(&processor(), &identifier()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].records_written, 1);
    }

    #[tokio::test]
    async fn decisions_never_pollute_attempt_queries() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        store
            .append_decision(&DecisionRecord {
                processor: processor(),
                identifier: identifier(),
                decided_at: chrono::Utc::now(),
                outcome: model::records::run::GateOutcome::Skip,
                forced: false,
                retry_of: None,
                reason: "duplicate".into(),
            })
            .await
            .unwrap();

        assert!(store
            .latest_attempt(&processor(), &identifier())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.decisions(&processor(), &identifier()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn circuit_cas_rejects_stale_writer() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let key = ResourceKey::new("warehouse:raw:2026-08-01");

        let base = CircuitRecord::default();
        assert!(store.cas(&processor(), &key, None, &base).await.unwrap());

        let mut winner = base.bump();
        winner.consecutive_failures = 1;
        assert!(store
            .cas(&processor(), &key, Some(&base), &winner)
            .await
            .unwrap());

        // A second writer still holding the original snapshot loses.
        let mut loser = base.bump();
        loser.consecutive_failures = 7;
        assert!(!store
            .cas(&processor(), &key, Some(&base), &loser)
            .await
            .unwrap());

        let stored = store.load(&processor(), &key).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn destination_merge_converges() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let batch_id = BatchId::new("b-1");

        let staged = vec![
            StagedResult {
                batch_id: batch_id.clone(),
                item_id: ItemId::new("i-1"),
                staging_key: "stg:b-1:i-1".into(),
                payload: "{}".into(),
            },
            StagedResult {
                batch_id: batch_id.clone(),
                item_id: ItemId::new("i-2"),
                staging_key: "stg:b-1:i-2".into(),
                payload: "{}".into(),
            },
        ];

        assert_eq!(store.merge(&batch_id, &staged).await.unwrap(), 2);
        // Re-running the merge must not duplicate rows.
        assert_eq!(store.merge(&batch_id, &staged).await.unwrap(), 2);
    }
}
