use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::Blob;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{FailureRecord, FailureStatus, FailureStore, NewFailureRecord};

type Item = HashMap<String, AttributeValue>;

const DEFAULT_STATUS_INDEX: &str = "status-index";

/// DynamoDB-backed failure store
///
/// Table layout: hash key `id` (S). Reconciliation queries go through a
/// global secondary index on `status`. Status changes are conditional
/// updates on the current status, so two sweeps cannot both claim a row.
#[derive(Debug, Clone)]
pub struct DynamoDbFailureStore {
    client: DynamoClient,
    table_name: String,
    status_index: String,
}

impl DynamoDbFailureStore {
    pub fn builder() -> DynamoDbFailureStoreBuilder {
        DynamoDbFailureStoreBuilder::new()
    }

    /// Build a store from the default AWS environment configuration
    pub async fn from_env(table_name: impl Into<String>) -> Result<Self, StoreError> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::builder()
            .with_client(DynamoClient::new(&config))
            .with_table_name(table_name)
            .build()
    }

    fn to_item(record: &FailureRecord) -> Item {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S(record.id.to_string()));
        item.insert(
            "source_topic".into(),
            AttributeValue::S(record.source_topic.clone()),
        );
        if let Some(key) = &record.key {
            item.insert("record_key".into(), AttributeValue::B(Blob::new(key.to_vec())));
        }
        item.insert(
            "payload".into(),
            AttributeValue::B(Blob::new(record.payload.to_vec())),
        );
        item.insert(
            "partition".into(),
            AttributeValue::N(record.partition.to_string()),
        );
        item.insert("offset".into(), AttributeValue::N(record.offset.to_string()));
        item.insert(
            "last_error_message".into(),
            AttributeValue::S(record.last_error_message.clone()),
        );
        item.insert(
            "status".into(),
            AttributeValue::S(record.status.as_str().to_string()),
        );
        item.insert(
            "created_at".into(),
            AttributeValue::S(record.created_at.to_rfc3339()),
        );
        item.insert(
            "updated_at".into(),
            AttributeValue::S(record.updated_at.to_rfc3339()),
        );
        item
    }

    fn from_item(item: &Item) -> Result<FailureRecord, StoreError> {
        Ok(FailureRecord {
            id: Uuid::parse_str(string_attr(item, "id")?)
                .map_err(|e| StoreError::InvalidData(format!("id: {}", e)))?,
            source_topic: string_attr(item, "source_topic")?.to_string(),
            key: item
                .get("record_key")
                .and_then(|v| v.as_b().ok())
                .map(|b| Bytes::copy_from_slice(b.as_ref())),
            payload: item
                .get("payload")
                .and_then(|v| v.as_b().ok())
                .map(|b| Bytes::copy_from_slice(b.as_ref()))
                .ok_or_else(|| StoreError::InvalidData("missing payload".to_string()))?,
            partition: number_attr(item, "partition")?,
            offset: number_attr(item, "offset")?,
            last_error_message: string_attr(item, "last_error_message")?.to_string(),
            status: string_attr(item, "status")?.parse()?,
            created_at: time_attr(item, "created_at")?,
            updated_at: time_attr(item, "updated_at")?,
        })
    }
}

fn string_attr<'a>(item: &'a Item, name: &str) -> Result<&'a str, StoreError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| StoreError::InvalidData(format!("missing attribute {}", name)))
}

fn number_attr<T: std::str::FromStr>(item: &Item, name: &str) -> Result<T, StoreError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| StoreError::InvalidData(format!("missing attribute {}", name)))
}

fn time_attr(item: &Item, name: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(string_attr(item, name)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("{}: {}", name, e)))
}

#[async_trait]
impl FailureStore for DynamoDbFailureStore {
    #[instrument(skip(self, record), fields(table = %self.table_name, topic = %record.source_topic))]
    async fn insert(&self, record: NewFailureRecord) -> Result<FailureRecord, StoreError> {
        let row = record.into_record(Uuid::new_v4(), Utc::now());

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::to_item(&row)))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await
            .map_err(|e| StoreError::InsertFailed(DisplayErrorContext(&e).to_string()))?;

        debug!(id = %row.id, status = %row.status, "Saved failure record to DynamoDB");
        Ok(row)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get(&self, id: Uuid) -> Result<Option<FailureRecord>, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::QueryFailed(DisplayErrorContext(&e).to_string()))?;

        response.item.as_ref().map(Self::from_item).transpose()
    }

    #[instrument(skip(self), fields(table = %self.table_name, index = %self.status_index))]
    async fn find_by_status(&self, status: FailureStatus) -> Result<Vec<FailureRecord>, StoreError> {
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let response = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(&self.status_index)
                .key_condition_expression("#status = :status")
                .expression_attribute_names("#status", "status")
                .expression_attribute_values(":status", AttributeValue::S(status.as_str().to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| StoreError::QueryFailed(DisplayErrorContext(&e).to_string()))?;

            for item in response.items.unwrap_or_default() {
                records.push(Self::from_item(&item)?);
            }

            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        records.sort_by_key(|r| r.created_at);
        trace!(count = records.len(), "Queried failure records from DynamoDB");
        Ok(records)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn transition(
        &self,
        id: Uuid,
        from: FailureStatus,
        to: FailureStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET #status = :to, updated_at = :now")
            .condition_expression("#status = :from")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":from", AttributeValue::S(from.as_str().to_string()))
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().to_string()))
            .expression_attribute_values(":now", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(id = %id, from = %from, to = %to, "Failure record status updated");
                Ok(true)
            }
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                trace!(id = %id, "Status precondition not met");
                Ok(false)
            }
            Err(e) => Err(StoreError::UpdateFailed {
                id,
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    #[instrument(skip(self, message), fields(table = %self.table_name))]
    async fn update_error_message(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET last_error_message = :message, updated_at = :now")
            .condition_expression("attribute_exists(id)")
            .expression_attribute_values(":message", AttributeValue::S(message.to_string()))
            .expression_attribute_values(":now", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await
            .map_err(|e| StoreError::UpdateFailed {
                id,
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DynamoDbFailureStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    status_index: Option<String>,
}

impl DynamoDbFailureStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_status_index(mut self, index: impl Into<String>) -> Self {
        self.status_index = Some(index.into());
        self
    }

    pub fn build(self) -> Result<DynamoDbFailureStore, StoreError> {
        Ok(DynamoDbFailureStore {
            client: self
                .client
                .ok_or_else(|| StoreError::InvalidData("DynamoDB client is required".to_string()))?,
            table_name: self
                .table_name
                .ok_or_else(|| StoreError::InvalidData("Table name is required".to_string()))?,
            status_index: self
                .status_index
                .unwrap_or_else(|| DEFAULT_STATUS_INDEX.to_string()),
        })
    }
}
