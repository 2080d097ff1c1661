use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{paginate, ConversationStore};
use crate::error::Result;
use crate::types::{sort_by_recency, sort_canonical, PersistedMessage, ThreadMetadata};

#[derive(Default)]
struct ThreadEntry {
    messages: Vec<PersistedMessage>,
    metadata: Option<ThreadMetadata>,
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryConversationStore {
    threads: RwLock<HashMap<String, ThreadEntry>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, thread_id: &str, messages: &[PersistedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .extend_from_slice(messages);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<PersistedMessage>> {
        let threads = self.threads.read().await;
        let mut messages = threads
            .get(thread_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default();
        sort_canonical(&mut messages);
        Ok(messages)
    }

    async fn save_metadata(&self, metadata: &ThreadMetadata) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(metadata.thread_id.clone())
            .or_default()
            .metadata = Some(metadata.clone());
        Ok(())
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|e| e.metadata.clone()))
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.threads.write().await.remove(thread_id);
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ThreadMetadata>> {
        let threads = self.threads.read().await;
        let mut entries: Vec<ThreadMetadata> = threads
            .iter()
            .filter_map(|(thread_id, entry)| match &entry.metadata {
                Some(metadata) => Some(metadata.clone()),
                None => entry
                    .messages
                    .iter()
                    .map(|m| m.timestamp)
                    .max()
                    .map(|last| ThreadMetadata::synthesized(thread_id.clone(), last)),
            })
            .collect();
        sort_by_recency(&mut entries);
        Ok(paginate(entries, limit, offset))
    }
}
