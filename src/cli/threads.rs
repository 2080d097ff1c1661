//! CLI handlers for `threadline threads ...`.

use std::io::Write;

use crate::codec::MessageRegistry;
use crate::error::Result;
use crate::store::ConversationStore;

/// Handle `threadline threads list`.
pub async fn handle_list(
    store: &dyn ConversationStore,
    limit: usize,
    offset: usize,
    out: &mut impl Write,
) -> Result<()> {
    let threads = store.list(limit, offset).await?;
    if threads.is_empty() {
        writeln!(out, "No threads.")?;
        return Ok(());
    }
    for thread in threads {
        let latest = thread
            .latest_run_id
            .map(|run| run.to_string())
            .unwrap_or_else(|| "-".into());
        let marker = if thread.current_run_id.is_some() { " (running)" } else { "" };
        writeln!(
            out,
            "{}\t{}\tlatest_run={}{}",
            thread.thread_id,
            thread.last_updated.to_rfc3339(),
            latest,
            marker
        )?;
    }
    Ok(())
}

/// Handle `threadline threads show <id>`.
///
/// Records that cannot be decoded are shown by type instead of aborting.
pub async fn handle_show(
    store: &dyn ConversationStore,
    thread_id: &str,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let metadata = store.load_metadata(thread_id).await?;
    let records = store.load(thread_id).await?;
    if metadata.is_none() && records.is_empty() {
        writeln!(out, "Thread {thread_id} not found.")?;
        return Ok(());
    }

    if json {
        let document = serde_json::json!({
            "metadata": metadata,
            "messages": records,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&document)?)?;
        return Ok(());
    }

    if let Some(metadata) = &metadata {
        writeln!(out, "thread:       {}", metadata.thread_id)?;
        writeln!(out, "updated:      {}", metadata.last_updated.to_rfc3339())?;
        if let Some(run) = metadata.latest_run_id {
            writeln!(out, "latest run:   {run}")?;
        }
        if let Some(run) = metadata.current_run_id {
            writeln!(out, "current run:  {run}")?;
        }
        writeln!(out)?;
    }

    let registry = MessageRegistry::global();
    for record in &records {
        let text = match registry.from_persisted(record) {
            Ok(message) if !message.text().is_empty() => message.text().to_string(),
            Ok(_) => format!("<{}>", record.message_type),
            Err(err) => {
                tracing::warn!(record_id = %record.id, error = %err, "undecodable record");
                format!("<{}: {err}>", record.message_type)
            }
        };
        let agent = record
            .from_agent
            .as_deref()
            .map(|agent| format!(" ({agent})"))
            .unwrap_or_default();
        writeln!(
            out,
            "[{}] {}{} run={}: {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.role,
            agent,
            record.run_id,
            text
        )?;
    }
    Ok(())
}

/// Handle `threadline threads delete <id>`.
pub async fn handle_delete(
    store: &dyn ConversationStore,
    thread_id: &str,
    out: &mut impl Write,
) -> Result<()> {
    store.delete(thread_id).await?;
    writeln!(out, "Deleted thread {thread_id}.")?;
    Ok(())
}
