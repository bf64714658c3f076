use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{BrokerClient, BrokerError, ConsumerRecord, ProducerRecord, RecordMetadata};

type GroupOffsetKey = (String, String, i32);

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<ConsumerRecord>>>,
    offsets: HashMap<GroupOffsetKey, i64>,
    round_robin: usize,
}

/// In-memory broker with per-group committed offsets
///
/// Topics are created on first publish with `default_partitions` partitions,
/// and grow when a record names a partition past the end.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    default_partitions: i32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_default_partitions(1)
    }

    pub fn with_default_partitions(partitions: i32) -> Self {
        debug!(partitions, "Initializing in-memory broker");
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            default_partitions: partitions.max(1),
        }
    }

    /// Create a topic; a no-op if it already exists
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.write();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// Every record of a topic, partition by partition
    pub fn records(&self, topic: &str) -> Vec<ConsumerRecord> {
        let state = self.state.read();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        let state = self.state.read();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn select_partition(state: &mut BrokerState, record: &ProducerRecord, count: usize) -> usize {
        match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                state.round_robin = state.round_robin.wrapping_add(1);
                state.round_robin % count
            }
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError> {
        let state = self.state.read();
        let partitions = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        Ok((0..partitions.len() as i32).collect())
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
    ) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let state = self.state.read();
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        let start = offset.max(0) as usize;
        let records: Vec<ConsumerRecord> =
            log.iter().skip(start).take(max_records).cloned().collect();

        trace!(
            topic = %topic,
            partition,
            offset,
            count = records.len(),
            "Fetched records from memory"
        );
        Ok(records)
    }

    async fn committed(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, BrokerError> {
        let state = self.state.read();
        Ok(state
            .offsets
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write();
        state
            .offsets
            .insert((group_id.to_string(), topic.to_string(), partition), next_offset);
        trace!(group_id = %group_id, topic = %topic, partition, next_offset, "Committed offset");
        Ok(())
    }

    async fn publish(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let wanted = record
            .partition
            .map(|p| p.max(0) + 1)
            .unwrap_or(self.default_partitions)
            .max(self.default_partitions) as usize;
        let partitions = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| vec![Vec::new(); wanted]);
        if record.partition.is_some() && partitions.len() < wanted {
            debug!(topic = %record.topic, from = partitions.len(), to = wanted, "Growing topic");
            partitions.resize(wanted, Vec::new());
        }
        let count = partitions.len();

        let partition = match record.partition {
            Some(p) if p < 0 => {
                return Err(BrokerError::UnknownPartition {
                    topic: record.topic.clone(),
                    partition: p,
                });
            }
            Some(p) => p as usize,
            None => Self::select_partition(state, &record, count),
        };

        let log = state
            .topics
            .get_mut(&record.topic)
            .and_then(|partitions| partitions.get_mut(partition))
            .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
        let offset = log.len() as i64;

        log.push(ConsumerRecord {
            topic: record.topic.clone(),
            partition: partition as i32,
            offset,
            key: record.key,
            value: record.value,
            headers: record.headers,
        });

        debug!(topic = %record.topic, partition, offset, "Published record to memory");

        Ok(RecordMetadata {
            topic: record.topic,
            partition: partition as i32,
            offset,
        })
    }
}
