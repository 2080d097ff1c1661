//! Conversation persistence.
//!
//! [`ConversationStore`] is the storage-agnostic contract shared by the
//! in-memory, file-per-thread and SQLite backends. Every backend guarantees:
//!
//! - `append` of an empty batch is a no-op, and a reader never observes part
//!   of a batch;
//! - writes to one thread are serialized, writes to distinct threads may run
//!   concurrently;
//! - unknown threads load as empty / not found rather than failing;
//! - `list` returns metadata newest first and synthesizes a minimal record
//!   for threads that have messages but no metadata.

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use file::FileConversationStore;
pub use memory::InMemoryConversationStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConversationStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::types::{PersistedMessage, ThreadMetadata};

/// Durable home of thread messages and metadata.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a batch atomically. Empty batches are ignored.
    async fn append(&self, thread_id: &str, messages: &[PersistedMessage]) -> Result<()>;

    /// All messages of a thread in canonical order; unknown threads are empty.
    async fn load(&self, thread_id: &str) -> Result<Vec<PersistedMessage>>;

    /// Upsert the whole metadata record for `metadata.thread_id`.
    async fn save_metadata(&self, metadata: &ThreadMetadata) -> Result<()>;

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>>;

    /// Remove messages and metadata together. Absent threads are a no-op.
    async fn delete(&self, thread_id: &str) -> Result<()>;

    /// Metadata ordered by `last_updated` descending.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ThreadMetadata>>;
}

/// Open the backend described by `config`.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>> {
    let store: Arc<dyn ConversationStore> = match config {
        StoreConfig::Memory => Arc::new(InMemoryConversationStore::new()),
        StoreConfig::File { base_dir } => Arc::new(FileConversationStore::new(base_dir.clone())),
        #[cfg(feature = "sqlite")]
        StoreConfig::Sqlite { url } => Arc::new(SqliteConversationStore::connect(url).await?),
        #[cfg(not(feature = "sqlite"))]
        StoreConfig::Sqlite { .. } => {
            return Err(crate::error::ThreadlineError::Configuration(
                "sqlite store requested but the `sqlite` feature is disabled".into(),
            ))
        }
    };
    tracing::debug!(backend = config.kind(), "conversation store opened");
    Ok(store)
}

/// Apply `offset`/`limit` to an already ordered list.
pub(crate) fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginate_skips_then_takes() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(paginate(items.clone(), 2, 1), vec![2, 3]);
        assert_eq!(paginate(items.clone(), 10, 4), vec![5]);
        assert!(paginate(items.clone(), 0, 0).is_empty());
        assert!(paginate(items, 3, 9).is_empty());
    }

    #[tokio::test]
    async fn open_memory_store() {
        let store = open(&StoreConfig::Memory).await.unwrap();
        assert!(store.load("nobody").await.unwrap().is_empty());
    }
}
