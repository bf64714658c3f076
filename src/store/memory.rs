use crate::error::StoreError;
use crate::store::{FailureRecord, FailureStatus, FailureStore, NewFailureRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

/// In-memory implementation of failure storage
///
/// Rows are kept in insertion order; every mutation happens under the write
/// lock, which makes `transition` a single-row compare-and-set.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFailureStore {
    records: Arc<RwLock<Vec<FailureRecord>>>,
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory failure store");
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Snapshot of every row
    pub async fn all(&self) -> Vec<FailureRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    #[instrument(skip(self, record), fields(topic = %record.source_topic, offset = record.offset))]
    async fn insert(&self, record: NewFailureRecord) -> Result<FailureRecord, StoreError> {
        let row = record.into_record(Uuid::new_v4(), Utc::now());
        self.records.write().await.push(row.clone());

        debug!(id = %row.id, status = %row.status, "Saved failure record to memory");
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<FailureRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    #[instrument(skip(self))]
    async fn find_by_status(&self, status: FailureStatus) -> Result<Vec<FailureRecord>, StoreError> {
        let records = self.records.read().await;
        let found: Vec<FailureRecord> = records
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();

        trace!(count = found.len(), "Queried failure records from memory");
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        id: Uuid,
        from: FailureStatus,
        to: FailureStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(row) if row.status == from => {
                row.status = to;
                row.updated_at = Utc::now();
                debug!("Failure record status updated");
                Ok(true)
            }
            Some(row) => {
                trace!(current = %row.status, "Status precondition not met");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self, message))]
    async fn update_error_message(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let row = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::UpdateFailed {
                id,
                message: "record not found".to_string(),
            })?;

        row.last_error_message = message.to_string();
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConsumerRecord;
    use bytes::Bytes;

    fn new_row(offset: i64, status: FailureStatus) -> NewFailureRecord {
        let record = ConsumerRecord::new("library-events", 0, offset, None, Bytes::from("{}"));
        NewFailureRecord::from_consumer_record(&record, "failed", status)
    }

    #[tokio::test]
    async fn test_insert_and_query() -> anyhow::Result<()> {
        let store = InMemoryFailureStore::new();
        let first = store.insert(new_row(1, FailureStatus::Retry)).await?;
        store.insert(new_row(2, FailureStatus::Dead)).await?;
        let third = store.insert(new_row(3, FailureStatus::Retry)).await?;

        let retry = store.find_by_status(FailureStatus::Retry).await?;
        assert_eq!(
            retry.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![first.id, third.id]
        );
        assert_eq!(store.find_by_status(FailureStatus::Dead).await?.len(), 1);
        assert_eq!(store.get(first.id).await?, Some(first));
        Ok(())
    }

    #[tokio::test]
    async fn test_same_coordinates_are_not_unique() -> anyhow::Result<()> {
        let store = InMemoryFailureStore::new();
        store.insert(new_row(7, FailureStatus::Retry)).await?;
        store.insert(new_row(7, FailureStatus::Retry)).await?;
        assert_eq!(store.len().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() -> anyhow::Result<()> {
        let store = InMemoryFailureStore::new();
        let row = store.insert(new_row(1, FailureStatus::Retry)).await?;

        assert!(store.transition(row.id, FailureStatus::Retry, FailureStatus::Skipped).await?);
        // second claim loses
        assert!(!store.transition(row.id, FailureStatus::Retry, FailureStatus::Skipped).await?);
        assert!(!store.transition(Uuid::new_v4(), FailureStatus::Retry, FailureStatus::Skipped).await?);

        let err = store
            .transition(row.id, FailureStatus::Skipped, FailureStatus::Retry)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() -> anyhow::Result<()> {
        let store = InMemoryFailureStore::new();
        let row = store.insert(new_row(1, FailureStatus::Retry)).await?;

        let claims = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .transition(row.id, FailureStatus::Retry, FailureStatus::Skipped)
                    .await
            })
        });

        let mut winners = 0;
        for claim in futures::future::join_all(claims).await {
            if claim?? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_error_message() -> anyhow::Result<()> {
        let store = InMemoryFailureStore::new();
        let row = store.insert(new_row(1, FailureStatus::Skipped)).await?;

        store.update_error_message(row.id, "still failing").await?;
        let stored = store.get(row.id).await?.unwrap();
        assert_eq!(stored.last_error_message, "still failing");
        assert_eq!(stored.status, FailureStatus::Skipped);

        assert!(store.update_error_message(Uuid::new_v4(), "x").await.is_err());
        Ok(())
    }
}
