//! Agent loop backed by an external process or session.
//!
//! [`ProcessAgentLoop`] owns at most one [`BackendClient`] at a time and
//! manages its lifecycle across runs:
//!
//! - [`ProcessMode::OneShot`] opens a fresh session for every run, sends the
//!   full conversation, and tears the session down when the run ends.
//! - [`ProcessMode::Interactive`] keeps one session open across runs and
//!   sends only new input. When the connection is found dead, the next run
//!   reopens it, resuming the external session recorded in thread metadata.

mod client;
mod stdio;

pub use client::{BackendClient, BackendEvent, BackendEventStream, ClientFactory, SessionRequest};
pub use stdio::StdioBackendClient;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::{AgentLoop, RunContext, RunStatus, StepEvent, StepInput, StepSignal, StepStream};
use crate::error::{Result, ThreadlineError};
use crate::types::{AgentMessage, RunId};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How backend sessions map onto runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessMode {
    OneShot,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Starting,
    Connected,
}

#[derive(Default)]
struct Connection {
    client: Option<Box<dyn BackendClient>>,
    /// The session is fresh and has not seen the conversation yet.
    needs_history: bool,
    /// Run whose conversation the open session currently holds.
    last_run: Option<RunId>,
    /// The session id was already reported for the current run.
    announced: bool,
}

/// Backend turns sent during the current step and not yet closed by a
/// `result` event.
///
/// The step that opened the first turn keeps reading until the count drops
/// to zero, so replies to injected input stay in the run that injected it.
/// Dropping the guard resets the count.
struct OpenTurns(Arc<AtomicUsize>);

impl OpenTurns {
    fn begin(count: Arc<AtomicUsize>) -> Self {
        count.store(1, Ordering::SeqCst);
        Self(count)
    }

    /// Close one turn and return how many are still open.
    fn close_one(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

impl Drop for OpenTurns {
    fn drop(&mut self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Join the live step with one more turn. Fails once the step has closed its
/// last turn.
fn join_turn(count: &AtomicUsize) -> bool {
    count
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then_some(n + 1))
        .is_ok()
}

fn leave_turn(count: &AtomicUsize) {
    let _ = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// [`AgentLoop`] that delegates each turn to a [`BackendClient`].
pub struct ProcessAgentLoop {
    mode: ProcessMode,
    factory: ClientFactory,
    shutdown_timeout: Duration,
    connection: Mutex<Connection>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    open_turns: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl ProcessAgentLoop {
    pub fn new(mode: ProcessMode, factory: ClientFactory) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            mode,
            factory,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connection: Mutex::new(Connection::default()),
            state_tx: Arc::new(state_tx),
            open_turns: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        }
    }

    /// Like [`new`](Self::new), taking the shutdown timeout from `config`.
    pub fn from_config(mode: ProcessMode, factory: ClientFactory, config: &EngineConfig) -> Self {
        Self::new(mode, factory).with_shutdown_timeout(config.shutdown_timeout())
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of sessions opened so far.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Replace the current session with a new one.
    ///
    /// A client that fails to start is shut down before the error is returned.
    async fn open(
        &self,
        conn: &mut Connection,
        ctx: &RunContext,
        resume_session: Option<String>,
    ) -> Result<()> {
        self.teardown(conn).await;
        self.state_tx.send_replace(ConnectionState::Starting);

        let mut client = (self.factory)();
        let resumed = resume_session.is_some();
        let request = SessionRequest {
            thread_id: ctx.thread_id.clone(),
            run_id: ctx.run_id,
            resume_session,
        };
        if let Err(err) = client.start(request).await {
            if let Err(shutdown_err) = client.shutdown(self.shutdown_timeout).await {
                tracing::debug!(error = %shutdown_err, "cleanup after failed start");
            }
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(err);
        }

        conn.client = Some(client);
        conn.needs_history = !resumed;
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.state_tx.send_replace(ConnectionState::Connected);
        tracing::debug!(
            thread_id = %ctx.thread_id,
            run_id = %ctx.run_id,
            mode = %self.mode,
            resumed,
            "backend session opened"
        );
        Ok(())
    }

    async fn teardown(&self, conn: &mut Connection) {
        if let Some(mut client) = conn.client.take() {
            if let Err(err) = client.shutdown(self.shutdown_timeout).await {
                tracing::warn!(error = %err, "backend shutdown failed");
            }
        }
        conn.last_run = None;
        conn.needs_history = false;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Session to resume for a run: the parent's, else the latest run's.
fn resume_session(ctx: &RunContext) -> Option<String> {
    let metadata = &ctx.metadata;
    ctx.parent_run_id
        .and_then(|run| metadata.session_for_run(run))
        .or_else(|| {
            metadata
                .latest_run_id
                .and_then(|run| metadata.session_for_run(run))
        })
        .map(str::to_string)
}

#[async_trait]
impl AgentLoop for ProcessAgentLoop {
    async fn step(&self, input: StepInput, cancel: CancellationToken) -> Result<StepStream> {
        let mut conn = self.connection.lock().await;
        let alive = conn.client.as_ref().is_some_and(|client| client.is_alive());
        if !alive {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(ThreadlineError::backend("backend connection lost"));
        }

        let mut outbound: Vec<AgentMessage> = Vec::new();
        if std::mem::take(&mut conn.needs_history) {
            outbound.extend(input.history);
        }
        outbound.extend(input.pending);

        let session = if conn.announced {
            None
        } else {
            conn.announced = true;
            conn.client.as_ref().and_then(|client| client.current_session())
        };
        if outbound.is_empty() {
            let mut events = Vec::new();
            if let Some(session_id) = session {
                events.push(Ok(StepEvent::SessionBound { session_id }));
            }
            events.push(Ok(StepEvent::Finished(StepSignal::Stop)));
            return Ok(futures::stream::iter(events).boxed());
        }

        let client = conn
            .client
            .as_ref()
            .ok_or_else(|| ThreadlineError::backend("backend connection lost"))?;
        let mut events = client.subscribe()?;
        let turns = OpenTurns::begin(self.open_turns.clone());
        client.send(outbound).await?;
        drop(conn);

        let state_tx = self.state_tx.clone();
        Ok(Box::pin(async_stream::stream! {
            let turns = turns;
            if let Some(session_id) = session {
                yield Ok(StepEvent::SessionBound { session_id });
            }
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = events.next() => Some(next),
                };
                let Some(next) = next else {
                    yield Err(ThreadlineError::Canceled);
                    break;
                };
                match next {
                    Some(Ok(BackendEvent::Message { message })) => {
                        yield Ok(StepEvent::Message(message));
                    }
                    Some(Ok(BackendEvent::Session { session_id })) => {
                        yield Ok(StepEvent::SessionBound { session_id });
                    }
                    Some(Ok(BackendEvent::Result { session_id, is_error, error })) => {
                        if let Some(session_id) = session_id {
                            yield Ok(StepEvent::SessionBound { session_id });
                        }
                        let remaining = turns.close_one();
                        if is_error {
                            let detail = error.unwrap_or_else(|| "backend reported an error".into());
                            yield Err(ThreadlineError::step(detail));
                            break;
                        }
                        if remaining == 0 {
                            yield Ok(StepEvent::Finished(StepSignal::Stop));
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        state_tx.send_replace(ConnectionState::Disconnected);
                        yield Err(err);
                        break;
                    }
                    None => {
                        state_tx.send_replace(ConnectionState::Disconnected);
                        yield Err(ThreadlineError::backend("backend stream ended before result"));
                        break;
                    }
                }
            }
        }))
    }

    fn supports_injection(&self) -> bool {
        self.mode == ProcessMode::Interactive
    }

    async fn inject(&self, messages: &[AgentMessage]) -> Result<bool> {
        if self.mode != ProcessMode::Interactive {
            return Ok(false);
        }
        let conn = self.connection.lock().await;
        let Some(client) = conn.client.as_ref().filter(|client| client.is_alive()) else {
            return Ok(false);
        };
        if !join_turn(&self.open_turns) {
            return Ok(false);
        }
        if let Err(err) = client.send(messages.to_vec()).await {
            leave_turn(&self.open_turns);
            return Err(err);
        }
        Ok(true)
    }

    async fn prepare_run(&self, ctx: &RunContext) -> Result<()> {
        let mut conn = self.connection.lock().await;
        conn.announced = false;
        match self.mode {
            ProcessMode::OneShot => self.open(&mut conn, ctx, None).await,
            ProcessMode::Interactive => {
                let alive = conn.client.as_ref().is_some_and(|client| client.is_alive());
                let continues = conn.last_run.is_some() && conn.last_run == ctx.parent_run_id;
                if alive && continues {
                    return Ok(());
                }
                if conn.client.is_some() && !alive {
                    tracing::warn!(
                        thread_id = %ctx.thread_id,
                        run_id = %ctx.run_id,
                        "backend connection lost; reconnecting"
                    );
                }
                let resume = resume_session(ctx);
                self.open(&mut conn, ctx, resume).await
            }
        }
    }

    async fn finish_run(&self, ctx: &RunContext, status: RunStatus) -> Result<()> {
        let mut conn = self.connection.lock().await;
        match (self.mode, status) {
            (ProcessMode::Interactive, RunStatus::Completed) => {
                conn.last_run = Some(ctx.run_id);
            }
            _ => self.teardown(&mut conn).await,
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut conn = self.connection.lock().await;
        self.teardown(&mut conn).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreadMetadata;
    use uuid::Uuid;

    fn context(parent: Option<RunId>, metadata: ThreadMetadata) -> RunContext {
        RunContext {
            thread_id: metadata.thread_id.clone(),
            run_id: Uuid::new_v4(),
            parent_run_id: parent,
            metadata,
        }
    }

    #[test]
    fn resume_prefers_parent_session() {
        let (parent, latest) = (Uuid::new_v4(), Uuid::new_v4());
        let mut metadata = ThreadMetadata::new("t1");
        metadata.latest_run_id = Some(latest);
        metadata.map_session("s-parent", parent);
        metadata.map_session("s-latest", latest);

        assert_eq!(
            resume_session(&context(Some(parent), metadata.clone())).as_deref(),
            Some("s-parent")
        );
        assert_eq!(
            resume_session(&context(Some(Uuid::new_v4()), metadata.clone())).as_deref(),
            Some("s-latest")
        );
        assert_eq!(resume_session(&context(None, ThreadMetadata::new("t1"))), None);
    }

    #[test]
    fn injected_turns_keep_the_step_open() {
        let count = Arc::new(AtomicUsize::new(0));
        assert!(!join_turn(&count));

        let turns = OpenTurns::begin(count.clone());
        assert!(join_turn(&count));
        assert_eq!(turns.close_one(), 1);
        assert_eq!(turns.close_one(), 0);
        assert!(!join_turn(&count));
        assert_eq!(turns.close_one(), 0);
    }

    #[test]
    fn failed_injection_leaves_its_turn() {
        let count = Arc::new(AtomicUsize::new(0));
        let turns = OpenTurns::begin(count.clone());
        assert!(join_turn(&count));
        leave_turn(&count);
        assert_eq!(turns.close_one(), 0);
    }

    #[test]
    fn dropping_the_step_closes_every_turn() {
        let count = Arc::new(AtomicUsize::new(0));
        let turns = OpenTurns::begin(count.clone());
        assert!(join_turn(&count));
        drop(turns);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_timeout_comes_from_engine_config() {
        let factory: ClientFactory = Arc::new(|| -> Box<dyn BackendClient> {
            Box::new(StdioBackendClient::new("true", Vec::new()))
        });
        let config = EngineConfig::builder().shutdown_timeout_ms(750).build();
        let agent = ProcessAgentLoop::from_config(ProcessMode::Interactive, factory.clone(), &config);
        assert_eq!(agent.shutdown_timeout(), Duration::from_millis(750));
        assert_eq!(
            ProcessAgentLoop::new(ProcessMode::OneShot, factory).shutdown_timeout(),
            DEFAULT_SHUTDOWN_TIMEOUT
        );
    }
}
