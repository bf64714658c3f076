//! Library events handler
//!
//! Reference [`RecordProcessor`] for the `library-events` topic. Payloads are
//! JSON documents of the form
//! `{"libraryEventId": 1, "libraryEventType": "NEW", "book": {...}}`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::ConsumerRecord;
use crate::consumer::RecordProcessor;
use crate::error::ProcessingError;

/// Event id reserved for exercising the recoverable path
pub const SIMULATED_OUTAGE_EVENT_ID: i64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LibraryEventType {
    New,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub book_id: Option<i64>,
    pub book_name: Option<String>,
    pub book_author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEvent {
    pub library_event_id: Option<i64>,
    pub library_event_type: LibraryEventType,
    pub book: Option<Book>,
}

/// Persistence for library events
pub trait LibraryEventRepository: Send + Sync {
    fn exists(&self, id: i64) -> bool;

    /// Store the event, assigning an id when it has none; returns the id
    fn save(&self, event: LibraryEvent) -> i64;
}

#[derive(Debug, Default)]
struct RepositoryState {
    events: HashMap<i64, LibraryEvent>,
    next_id: i64,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryLibraryRepository {
    state: Arc<RwLock<RepositoryState>>,
}

impl InMemoryLibraryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<LibraryEvent> {
        self.state.read().events.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }
}

impl LibraryEventRepository for InMemoryLibraryRepository {
    fn exists(&self, id: i64) -> bool {
        self.state.read().events.contains_key(&id)
    }

    fn save(&self, mut event: LibraryEvent) -> i64 {
        let mut state = self.state.write();
        let id = match event.library_event_id {
            Some(id) => id,
            None => {
                state.next_id += 1;
                while state.events.contains_key(&state.next_id) {
                    state.next_id += 1;
                }
                state.next_id
            }
        };
        event.library_event_id = Some(id);
        state.events.insert(id, event);
        id
    }
}

pub struct LibraryEventsService<R> {
    repository: R,
}

impl LibraryEventsService<InMemoryLibraryRepository> {
    pub fn in_memory() -> Self {
        Self::new(InMemoryLibraryRepository::new())
    }
}

impl<R: LibraryEventRepository> LibraryEventsService<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn handle(&self, event: LibraryEvent) -> Result<i64, ProcessingError> {
        if event.library_event_id == Some(SIMULATED_OUTAGE_EVENT_ID) {
            return Err(ProcessingError::recoverable(anyhow!("Temporary network error")));
        }

        match event.library_event_type {
            LibraryEventType::New => {
                let id = self.repository.save(event);
                info!(library_event_id = id, "Saved new library event");
                Ok(id)
            }
            LibraryEventType::Update => {
                let id = event
                    .library_event_id
                    .ok_or_else(|| ProcessingError::validation(anyhow!("Library Event id is missing")))?;
                if !self.repository.exists(id) {
                    return Err(ProcessingError::validation(anyhow!(
                        "Library event not found with given id: {}",
                        id
                    )));
                }
                debug!(library_event_id = id, "Validation is successful for the library event");
                self.repository.save(event);
                info!(library_event_id = id, "Updated library event");
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl<R: LibraryEventRepository> RecordProcessor for LibraryEventsService<R> {
    async fn process(&self, record: &ConsumerRecord) -> Result<(), ProcessingError> {
        let event: LibraryEvent = serde_json::from_slice(&record.value).map_err(|e| {
            ProcessingError::validation(anyhow::Error::new(e).context("Malformed library event"))
        })?;

        debug!(
            topic = %record.topic,
            offset = record.offset,
            event = ?event,
            "Processing library event"
        );
        self.handle(event).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Cause;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn record(json: &str) -> ConsumerRecord {
        ConsumerRecord::new("library-events", 0, 0, None, Bytes::copy_from_slice(json.as_bytes()))
    }

    #[test]
    fn test_event_json_shape() {
        let event: LibraryEvent = serde_json::from_str(
            r#"{"libraryEventId":null,"libraryEventType":"NEW","book":{"bookId":456,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}"#,
        )
        .unwrap();

        assert_eq!(event.library_event_id, None);
        assert_eq!(event.library_event_type, LibraryEventType::New);
        assert_eq!(event.book.unwrap().book_id, Some(456));
    }

    #[tokio::test]
    async fn test_new_then_update() -> anyhow::Result<()> {
        let service = LibraryEventsService::in_memory();

        service
            .process(&record(r#"{"libraryEventId":null,"libraryEventType":"NEW","book":null}"#))
            .await?;
        assert_eq!(service.repository().len(), 1);
        let id = service.repository().get(1).unwrap().library_event_id;
        assert_eq!(id, Some(1));

        service
            .process(&record(r#"{"libraryEventId":1,"libraryEventType":"UPDATE","book":{"bookId":1,"bookName":"Second Edition","bookAuthor":"Dilip"}}"#))
            .await?;
        let updated = service.repository().get(1).unwrap();
        assert_eq!(updated.book.unwrap().book_name.as_deref(), Some("Second Edition"));
        Ok(())
    }

    #[test]
    fn test_new_event_skips_taken_ids() {
        let service = LibraryEventsService::in_memory();
        service.repository().save(LibraryEvent {
            library_event_id: Some(1),
            library_event_type: LibraryEventType::New,
            book: None,
        });

        let result = tokio_test::block_on(
            service.process(&record(r#"{"libraryEventId":null,"libraryEventType":"NEW","book":null}"#)),
        );
        tokio_test::assert_ok!(result);
        assert_eq!(service.repository().len(), 2);
        assert!(service.repository().get(2).is_some());
    }

    #[tokio::test]
    async fn test_failure_causes() {
        let service = LibraryEventsService::in_memory();

        let err = service
            .process(&record(r#"{"libraryEventId":999,"libraryEventType":"UPDATE","book":null}"#))
            .await
            .unwrap_err();
        assert_eq!(err.cause(), Cause::Recoverable);
        assert_eq!(err.message(), "Temporary network error");

        let err = service
            .process(&record(r#"{"libraryEventId":null,"libraryEventType":"UPDATE","book":null}"#))
            .await
            .unwrap_err();
        assert_eq!(err.cause(), Cause::Validation);
        assert_eq!(err.message(), "Library Event id is missing");

        let err = service
            .process(&record(r#"{"libraryEventId":42,"libraryEventType":"UPDATE","book":null}"#))
            .await
            .unwrap_err();
        assert_eq!(err.cause(), Cause::Validation);
        assert_eq!(err.message(), "Library event not found with given id: 42");

        let err = service.process(&record("not json")).await.unwrap_err();
        assert_eq!(err.cause(), Cause::Validation);
        assert!(err.message().starts_with("Malformed library event"));
    }
}
