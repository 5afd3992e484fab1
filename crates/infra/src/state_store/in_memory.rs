use std::collections::HashMap;
use std::sync::RwLock;

use streamline_core::ProcessorKey;
use streamline_events::StreamProcessorState;

use super::r#trait::{decode_state, encode_state, RepositoryError, StreamProcessorStateRepository};

/// In-memory state repository.
///
/// Intended for tests/dev. States are kept as the same JSON documents the
/// Postgres adapter stores, so loading goes through the same decoding and
/// validation.
#[derive(Debug, Default)]
pub struct InMemoryStateRepository {
    documents: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw document, bypassing encoding. Used to simulate corrupt or
    /// legacy rows.
    pub fn insert_document(&self, key: &ProcessorKey, document: serde_json::Value) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.storage_key(), document);
    }
}

#[async_trait::async_trait]
impl StreamProcessorStateRepository for InMemoryStateRepository {
    async fn try_get(&self, key: &ProcessorKey) -> Result<Option<StreamProcessorState>, RepositoryError> {
        let document = {
            let documents = self
                .documents
                .read()
                .map_err(|_| RepositoryError::Unavailable("lock poisoned".to_string()))?;
            documents.get(&key.storage_key()).cloned()
        };
        document.map(|d| decode_state(key, d)).transpose()
    }

    async fn persist(&self, key: &ProcessorKey, state: &StreamProcessorState) -> Result<(), RepositoryError> {
        let document = encode_state(key, state)?;
        self.documents
            .write()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".to_string()))?
            .insert(key.storage_key(), document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamline_core::{EventProcessorId, ProcessingPosition, ScopeId, StreamId, StreamProcessorId};
    use streamline_events::UnpartitionedState;

    fn key() -> ProcessorKey {
        StreamProcessorId::new(ScopeId::DEFAULT, EventProcessorId::new(), StreamId::new()).into()
    }

    #[tokio::test]
    async fn persisted_state_is_loaded_back() {
        let repo = InMemoryStateRepository::new();
        let key = key();
        assert!(repo.try_get(&key).await.unwrap().is_none());

        let state: StreamProcessorState = UnpartitionedState::at(ProcessingPosition::new(5, 3)).into();
        repo.persist(&key, &state).await.unwrap();

        assert_eq!(repo.try_get(&key).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn inconsistent_state_fails_at_load() {
        let repo = InMemoryStateRepository::new();
        let key = key();
        repo.insert_document(
            &key,
            serde_json::json!({
                "kind": "partitioned",
                "position": { "event_log_position": 9, "stream_position": 9 },
                "head": { "event_log_position": 2, "stream_position": 2 },
                "failing_partitions": {},
                "last_successfully_processed": null
            }),
        );

        assert!(matches!(
            repo.try_get(&key).await,
            Err(RepositoryError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn garbage_fails_to_decode() {
        let repo = InMemoryStateRepository::new();
        let key = key();
        repo.insert_document(&key, serde_json::json!({ "kind": "sideways" }));

        assert!(matches!(
            repo.try_get(&key).await,
            Err(RepositoryError::Serialization { .. })
        ));
    }
}
