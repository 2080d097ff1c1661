use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{paginate, ConversationStore};
use crate::error::{Result, ThreadlineError};
use crate::types::{sort_by_recency, sort_canonical, PersistedMessage, ThreadMetadata};

const MESSAGES_FILE: &str = "messages.json";
const METADATA_FILE: &str = "metadata.json";

/// File-per-thread store.
///
/// Layout: `<base_dir>/<sanitized_thread_id>/{messages.json,metadata.json}`.
/// Every write goes to a temp file in the thread directory and is renamed
/// over the target, so readers see either the previous or the new version.
/// A file that fails to parse is treated as absent and replaced by the next
/// successful write.
pub struct FileConversationStore {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileConversationStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub(crate) fn thread_dir(&self, thread_id: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(dir_name(thread_id)?))
    }

    /// Lock serializing writes to one thread.
    ///
    /// Entries nobody holds are pruned on every acquisition, so the table only
    /// tracks threads with a write in flight.
    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|id, lock| id == thread_id || Arc::strong_count(lock) > 1);
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    async fn read_messages(&self, dir: &Path) -> Result<Vec<PersistedMessage>> {
        Ok(read_json(&dir.join(MESSAGES_FILE)).await?.unwrap_or_default())
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn append(&self, thread_id: &str, messages: &[PersistedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let dir = self.thread_dir(thread_id)?;
        let lock = self.thread_lock(thread_id).await;
        let _guard = lock.lock().await;

        let mut all = self.read_messages(&dir).await?;
        all.extend_from_slice(messages);
        write_json_atomic(&dir, MESSAGES_FILE, &all).await
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<PersistedMessage>> {
        let dir = self.thread_dir(thread_id)?;
        let mut messages = self.read_messages(&dir).await?;
        sort_canonical(&mut messages);
        Ok(messages)
    }

    async fn save_metadata(&self, metadata: &ThreadMetadata) -> Result<()> {
        let dir = self.thread_dir(&metadata.thread_id)?;
        let lock = self.thread_lock(&metadata.thread_id).await;
        let _guard = lock.lock().await;
        write_json_atomic(&dir, METADATA_FILE, metadata).await
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>> {
        let dir = self.thread_dir(thread_id)?;
        read_json(&dir.join(METADATA_FILE)).await
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        let dir = self.thread_dir(thread_id)?;
        let lock = self.thread_lock(thread_id).await;
        let guard = lock.lock().await;
        let removed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        };
        drop(guard);
        drop(lock);
        let mut locks = self.locks.lock().await;
        if locks.get(thread_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(thread_id);
        }
        removed
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ThreadMetadata>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut listed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if let Some(metadata) = read_json::<ThreadMetadata>(&dir.join(METADATA_FILE)).await? {
                listed.push(metadata);
                continue;
            }
            let messages = self.read_messages(&dir).await?;
            let last = messages.iter().map(|m| m.timestamp).max();
            if let (Some(first), Some(last)) = (messages.first(), last) {
                listed.push(ThreadMetadata::synthesized(first.thread_id.clone(), last));
            }
        }

        sort_by_recency(&mut listed);
        Ok(paginate(listed, limit, offset))
    }
}

/// Directory name for a thread id.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`; when that changes the id a
/// short sha256 suffix keeps distinct ids in distinct directories.
fn dir_name(thread_id: &str) -> Result<String> {
    if thread_id.is_empty() {
        return Err(ThreadlineError::InvalidThreadId(
            "thread id cannot be empty".into(),
        ));
    }
    if thread_id.contains('\0') {
        return Err(ThreadlineError::InvalidThreadId(format!(
            "thread id contains NUL: {thread_id:?}"
        )));
    }

    let sanitized: String = thread_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == thread_id {
        return Ok(sanitized);
    }
    let digest = Sha256::digest(thread_id.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{sanitized}-{suffix}"))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring corrupted thread file");
            Ok(None)
        }
    }
}

async fn write_json_atomic<T: Serialize + ?Sized>(dir: &Path, file_name: &str, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(file_name);
    let tmp_path = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let write_result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &target).await
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}
