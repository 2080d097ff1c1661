//! Per-thread run engine.
//!
//! [`RunEngine`] owns one thread: it persists every input before routing it,
//! drives the injected [`AgentLoop`] one step at a time, appends each output
//! message before publishing it, and keeps the run lineage forest in memory.
//! All run transitions happen under a single restart lock, so at most one run
//! is active per thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent_loop::{AgentLoop, RunContext, StepEvent, StepInput, StepSignal};
use super::subscriber::{SubscriberHub, Subscription};
use super::types::{
    Delivery, EngineSnapshot, EngineState, RunAssignment, RunStatus, SendOptions, ThreadEvent,
};
use crate::codec;
use crate::config::EngineConfig;
use crate::error::{Result, ThreadlineError};
use crate::store::ConversationStore;
use crate::types::{AgentMessage, GenerationId, Lineage, RunId, ThreadMetadata};

/// Drives runs for a single thread.
///
/// Cheap to clone; clones share the same engine.
pub struct RunEngine<L: AgentLoop> {
    inner: Arc<Inner<L>>,
}

impl<L: AgentLoop> Clone for RunEngine<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<L> {
    thread_id: String,
    store: Arc<dyn ConversationStore>,
    agent_loop: L,
    restart_lock: Mutex<RunSlot>,
    journal: RwLock<Journal>,
    hub: SubscriberHub,
    state_tx: watch::Sender<EngineState>,
    root_cancel: CancellationToken,
}

/// Everything guarded by the restart lock.
struct RunSlot {
    metadata: ThreadMetadata,
    active: Option<ActiveRun>,
    queue: VecDeque<QueuedInput>,
    disposed: bool,
    task: Option<JoinHandle<()>>,
}

struct ActiveRun {
    run_id: RunId,
    parent_run_id: Option<RunId>,
    cancel: CancellationToken,
    /// Input delivered to this run, replayed when it branches.
    inputs: Vec<AgentMessage>,
}

struct QueuedInput {
    messages: Vec<AgentMessage>,
}

/// In-memory view of the thread: messages in append order plus the run forest.
#[derive(Default)]
struct Journal {
    messages: Vec<AgentMessage>,
    runs: HashMap<RunId, RunEntry>,
}

struct RunEntry {
    parent_run_id: Option<RunId>,
    status: RunStatus,
    next_order: u32,
}

impl Journal {
    fn register(&mut self, run_id: RunId, parent_run_id: Option<RunId>) {
        self.runs.entry(run_id).or_insert(RunEntry {
            parent_run_id,
            status: RunStatus::NotStarted,
            next_order: 0,
        });
    }

    /// Reserve `count` consecutive order indexes within `run_id`.
    fn reserve_order(&mut self, run_id: RunId, count: usize) -> u32 {
        match self.runs.get_mut(&run_id) {
            Some(entry) => {
                let start = entry.next_order;
                entry.next_order = start.saturating_add(count as u32);
                start
            }
            None => 0,
        }
    }

    /// `run_id` and all of its ancestors.
    fn chain(&self, run_id: RunId) -> HashSet<RunId> {
        let mut chain = HashSet::new();
        let mut cursor = Some(run_id);
        while let Some(run) = cursor {
            if !chain.insert(run) {
                break;
            }
            cursor = self.runs.get(&run).and_then(|entry| entry.parent_run_id);
        }
        chain
    }

    fn lineage_messages(&self, run_id: RunId) -> Vec<AgentMessage> {
        let chain = self.chain(run_id);
        self.messages
            .iter()
            .filter(|m| m.lineage.run_id.is_some_and(|run| chain.contains(&run)))
            .cloned()
            .collect()
    }
}

impl<L: AgentLoop> RunEngine<L> {
    /// Open the engine for `thread_id`, loading its history from `store`.
    ///
    /// A run still marked current in stored metadata was interrupted by a
    /// restart; it is recorded as failed and the marker is cleared.
    pub async fn open(
        thread_id: impl Into<String>,
        store: Arc<dyn ConversationStore>,
        agent_loop: L,
        config: &EngineConfig,
    ) -> Result<Self> {
        let thread_id = thread_id.into();
        if thread_id.is_empty() {
            return Err(ThreadlineError::InvalidThreadId(thread_id));
        }

        let records = store.load(&thread_id).await?;
        let messages = codec::from_persisted_batch(&records)?;
        let mut metadata = store
            .load_metadata(&thread_id)
            .await?
            .unwrap_or_else(|| ThreadMetadata::new(thread_id.clone()));

        let mut journal = Journal::default();
        for message in &messages {
            let Some(run_id) = message.lineage.run_id else {
                continue;
            };
            journal.register(run_id, message.lineage.parent_run_id);
            if let Some(entry) = journal.runs.get_mut(&run_id) {
                entry.status = RunStatus::Completed;
                let idx = message.lineage.message_order_idx.unwrap_or(0);
                entry.next_order = entry.next_order.max(idx.saturating_add(1));
            }
        }
        journal.messages = messages;

        if let Some(interrupted) = metadata.current_run_id.take() {
            tracing::warn!(
                thread_id = %thread_id,
                run_id = %interrupted,
                "run was interrupted before completion"
            );
            if let Some(entry) = journal.runs.get_mut(&interrupted) {
                entry.status = RunStatus::Failed;
            }
            metadata.touch();
            store.save_metadata(&metadata).await?;
        }

        tracing::debug!(
            thread_id = %thread_id,
            messages = journal.messages.len(),
            runs = journal.runs.len(),
            "run engine opened"
        );

        let (state_tx, _) = watch::channel(EngineState::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                thread_id,
                store,
                agent_loop,
                restart_lock: Mutex::new(RunSlot {
                    metadata,
                    active: None,
                    queue: VecDeque::new(),
                    disposed: false,
                    task: None,
                }),
                journal: RwLock::new(journal),
                hub: SubscriberHub::new(config.subscriber_capacity),
                state_tx,
                root_cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    pub fn agent_loop(&self) -> &L {
        &self.inner.agent_loop
    }

    /// Submit input to the thread.
    ///
    /// The input is persisted before this returns. It starts a new run when
    /// the thread is idle; otherwise it is injected into or queued for the
    /// active run. Branching from an explicit parent is only allowed while
    /// idle, or when the parent matches the active run's parent.
    pub async fn send(
        &self,
        messages: Vec<AgentMessage>,
        options: SendOptions,
    ) -> Result<RunAssignment> {
        if messages.is_empty() {
            return Err(ThreadlineError::InvalidArgument(
                "send requires at least one message".into(),
            ));
        }
        let inner = &self.inner;
        let input_id = options
            .input_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut slot = inner.restart_lock.lock().await;
        if slot.disposed {
            return Err(ThreadlineError::InvalidState("engine has been disposed".into()));
        }
        if let Some(parent) = options.parent_run_id {
            if !inner.journal.read().await.runs.contains_key(&parent) {
                return Err(ThreadlineError::InvalidArgument(format!(
                    "unknown parent run {parent}"
                )));
            }
        }

        if let Some(active) = slot.active.as_ref() {
            let (run_id, parent_run_id) = (active.run_id, active.parent_run_id);
            if let Some(requested) = options.parent_run_id {
                if Some(requested) != parent_run_id {
                    return Err(ThreadlineError::InvalidState(format!(
                        "run {run_id} is active; cannot branch from {requested}"
                    )));
                }
            }
            link_cancel(&active.cancel, options.cancel);

            let stored = inner.persist(run_id, parent_run_id, messages).await?;
            let mut delivery = Delivery::Queued;
            if inner.agent_loop.supports_injection() {
                match inner.agent_loop.inject(&stored).await {
                    Ok(true) => delivery = Delivery::Injected,
                    Ok(false) => {}
                    Err(err) => tracing::warn!(
                        thread_id = %inner.thread_id,
                        run_id = %run_id,
                        error = %err,
                        "injection failed; queueing input"
                    ),
                }
            }
            if let Some(active) = slot.active.as_mut() {
                active.inputs.extend(stored.iter().cloned());
            }
            if delivery == Delivery::Queued {
                slot.queue.push_back(QueuedInput { messages: stored });
            }
            return Ok(inner.accepted(input_id, run_id, delivery));
        }

        let parent_run_id = options.parent_run_id.or(slot.metadata.latest_run_id);
        let run_id = Uuid::new_v4();
        inner.journal.write().await.register(run_id, parent_run_id);
        let stored = match inner.persist(run_id, parent_run_id, messages).await {
            Ok(stored) => stored,
            Err(err) => {
                inner.journal.write().await.runs.remove(&run_id);
                return Err(err);
            }
        };

        let cancel = inner.root_cancel.child_token();
        link_cancel(&cancel, options.cancel);
        slot.queue.push_back(QueuedInput {
            messages: stored.clone(),
        });
        slot.active = Some(ActiveRun {
            run_id,
            parent_run_id,
            cancel: cancel.clone(),
            inputs: stored,
        });
        inner.state_tx.send_replace(EngineState::Running);
        slot.task = Some(tokio::spawn(drive(
            inner.clone(),
            run_id,
            parent_run_id,
            cancel,
        )));
        Ok(inner.accepted(input_id, run_id, Delivery::Started))
    }

    /// A new independent view of live events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.subscribe(None)
    }

    /// Like [`subscribe`](Self::subscribe), ending when `cancel` fires.
    pub fn subscribe_until(&self, cancel: CancellationToken) -> Subscription {
        self.inner.hub.subscribe(Some(cancel))
    }

    /// Cancel the active run. Returns whether there was one.
    pub async fn stop(&self) -> bool {
        let slot = self.inner.restart_lock.lock().await;
        match slot.active.as_ref() {
            Some(active) => {
                tracing::debug!(thread_id = %self.inner.thread_id, run_id = %active.run_id, "stopping run");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any active run, shut the agent loop down and close every
    /// subscription. Later `send` calls fail with `InvalidState`.
    pub async fn dispose(&self) -> Result<()> {
        let inner = &self.inner;
        let task = {
            let mut slot = inner.restart_lock.lock().await;
            if slot.disposed {
                return Ok(());
            }
            slot.disposed = true;
            if let Some(active) = slot.active.as_ref() {
                active.cancel.cancel();
            }
            slot.task.take()
        };
        inner.root_cancel.cancel();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(thread_id = %inner.thread_id, error = %err, "run task ended abnormally");
            }
        }

        let _slot = inner.restart_lock.lock().await;
        let result = inner.agent_loop.shutdown().await;
        inner.hub.close_all();
        inner.state_tx.send_replace(EngineState::Disposed);
        tracing::debug!(thread_id = %inner.thread_id, "run engine disposed");
        result
    }

    /// Status of a known run.
    pub async fn run_status(&self, run_id: RunId) -> Option<RunStatus> {
        self.inner
            .journal
            .read()
            .await
            .runs
            .get(&run_id)
            .map(|entry| entry.status)
    }

    pub async fn current_run_id(&self) -> Option<RunId> {
        self.inner
            .restart_lock
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.run_id)
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state_tx.borrow() == EngineState::Running
    }

    /// Every message of the thread, in append order.
    pub async fn history(&self) -> Vec<AgentMessage> {
        self.inner.journal.read().await.messages.clone()
    }

    /// Messages visible to `run_id`: its own and its ancestors'.
    pub async fn run_history(&self, run_id: RunId) -> Vec<AgentMessage> {
        self.inner.journal.read().await.lineage_messages(run_id)
    }

    /// Parent of a known run. `None` for roots and unknown runs.
    pub async fn parent_of(&self, run_id: RunId) -> Option<RunId> {
        self.inner
            .journal
            .read()
            .await
            .runs
            .get(&run_id)
            .and_then(|entry| entry.parent_run_id)
    }

    pub async fn metadata(&self) -> ThreadMetadata {
        self.inner.restart_lock.lock().await.metadata.clone()
    }

    /// Resolve once no run is executing.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state != EngineState::Running).await;
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let slot = self.inner.restart_lock.lock().await;
        let message_count = self.inner.journal.read().await.messages.len();
        EngineSnapshot {
            state: *self.inner.state_tx.borrow(),
            current_run_id: slot.active.as_ref().map(|active| active.run_id),
            latest_run_id: slot.metadata.latest_run_id,
            queued_inputs: slot.queue.len(),
            message_count,
            subscriber_count: self.inner.hub.len(),
        }
    }
}

/// Cancel `run_cancel` when `external` fires.
fn link_cancel(run_cancel: &CancellationToken, external: Option<CancellationToken>) {
    let Some(external) = external else {
        return;
    };
    let run_cancel = run_cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = external.cancelled() => run_cancel.cancel(),
            _ = run_cancel.cancelled() => {}
        }
    });
}

/// Run task: executes `run_id` and any sibling runs it branches into.
async fn drive<L: AgentLoop>(
    inner: Arc<Inner<L>>,
    mut run_id: RunId,
    parent_run_id: Option<RunId>,
    cancel: CancellationToken,
) {
    while let Some(sibling) = inner.execute(run_id, parent_run_id, &cancel).await {
        run_id = sibling;
    }
}

impl<L: AgentLoop> Inner<L> {
    fn accepted(&self, input_id: String, run_id: RunId, delivery: Delivery) -> RunAssignment {
        self.hub.publish(&ThreadEvent::InputAccepted {
            input_id: input_id.clone(),
            run_id,
            delivery,
        });
        RunAssignment {
            input_id,
            run_id,
            delivery,
        }
    }

    /// Tag input with its run, append it and record it in the journal.
    async fn persist(
        &self,
        run_id: RunId,
        parent_run_id: Option<RunId>,
        messages: Vec<AgentMessage>,
    ) -> Result<Vec<AgentMessage>> {
        let first = self
            .journal
            .write()
            .await
            .reserve_order(run_id, messages.len());
        let tagged: Vec<AgentMessage> = messages
            .into_iter()
            .enumerate()
            .map(|(offset, message)| {
                message.with_lineage(Lineage {
                    run_id: Some(run_id),
                    parent_run_id,
                    generation_id: None,
                    message_order_idx: Some(first.saturating_add(offset as u32)),
                })
            })
            .collect();
        let records = codec::to_persisted_batch(&tagged, &self.thread_id, run_id)?;
        self.store.append(&self.thread_id, &records).await?;

        let stored: Vec<AgentMessage> = tagged
            .into_iter()
            .zip(&records)
            .map(|(mut message, record)| {
                message.id = Some(record.id.clone());
                message.timestamp = Some(record.timestamp);
                message
            })
            .collect();
        self.journal
            .write()
            .await
            .messages
            .extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn set_status(&self, run_id: RunId, status: RunStatus) {
        if let Some(entry) = self.journal.write().await.runs.get_mut(&run_id) {
            entry.status = status;
        }
    }

    /// Execute one run to a terminal status. Returns the sibling to run next
    /// when the loop asked to branch.
    async fn execute(
        &self,
        run_id: RunId,
        parent_run_id: Option<RunId>,
        cancel: &CancellationToken,
    ) -> Option<RunId> {
        let ctx = {
            let mut slot = self.restart_lock.lock().await;
            slot.metadata.current_run_id = Some(run_id);
            slot.metadata.touch();
            let ctx = RunContext {
                thread_id: self.thread_id.clone(),
                run_id,
                parent_run_id,
                metadata: slot.metadata.clone(),
            };
            self.set_status(run_id, RunStatus::Running).await;
            self.hub.publish(&ThreadEvent::RunStarted {
                run_id,
                parent_run_id,
            });
            tracing::debug!(thread_id = %self.thread_id, run_id = %run_id, "run started");

            let prepared = match self.store.save_metadata(&slot.metadata).await {
                Ok(()) => self.agent_loop.prepare_run(&ctx).await,
                Err(err) => Err(err),
            };
            if let Err(err) = prepared {
                return self
                    .finalize(slot, &ctx, RunStatus::Failed, Some(err), cancel, false)
                    .await;
            }
            ctx
        };

        let mut first_step = true;
        let mut step_again = false;
        loop {
            let mut slot = self.restart_lock.lock().await;
            let pending: Vec<AgentMessage> = slot
                .queue
                .drain(..)
                .flat_map(|queued| queued.messages)
                .collect();
            if pending.is_empty() && !first_step && !step_again {
                return self
                    .finalize(slot, &ctx, RunStatus::Completed, None, cancel, false)
                    .await;
            }
            drop(slot);

            let outcome = self.step(&ctx, pending, first_step, cancel).await;
            first_step = false;
            match outcome {
                Ok(StepSignal::Continue) => step_again = true,
                Ok(StepSignal::Stop) => step_again = false,
                Ok(StepSignal::Branch) => {
                    let slot = self.restart_lock.lock().await;
                    return self
                        .finalize(slot, &ctx, RunStatus::Completed, None, cancel, true)
                        .await;
                }
                Err(err) => {
                    let status = match err {
                        ThreadlineError::Canceled => RunStatus::Cancelled,
                        _ => RunStatus::Failed,
                    };
                    let slot = self.restart_lock.lock().await;
                    return self
                        .finalize(slot, &ctx, status, Some(err), cancel, false)
                        .await;
                }
            }
        }
    }

    /// Pull one step to completion, appending then publishing each message.
    async fn step(
        &self,
        ctx: &RunContext,
        pending: Vec<AgentMessage>,
        first_step: bool,
        cancel: &CancellationToken,
    ) -> Result<StepSignal> {
        if cancel.is_cancelled() {
            return Err(ThreadlineError::Canceled);
        }
        let generation_id = Uuid::new_v4();
        let history = {
            let pending_ids: HashSet<&str> =
                pending.iter().filter_map(|m| m.id.as_deref()).collect();
            self.journal
                .read()
                .await
                .lineage_messages(ctx.run_id)
                .into_iter()
                .filter(|m| !m.id.as_deref().is_some_and(|id| pending_ids.contains(id)))
                .collect()
        };
        let input = StepInput {
            thread_id: self.thread_id.clone(),
            run_id: ctx.run_id,
            parent_run_id: ctx.parent_run_id,
            generation_id,
            history,
            pending,
            first_step,
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ThreadlineError::Canceled),
            stream = self.agent_loop.step(input, cancel.child_token()) => stream?,
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ThreadlineError::Canceled),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(StepSignal::Stop),
                Some(Err(err)) => return Err(err),
                Some(Ok(StepEvent::Finished(signal))) => return Ok(signal),
                Some(Ok(StepEvent::SessionBound { session_id })) => {
                    self.bind_session(ctx.run_id, session_id).await?;
                }
                Some(Ok(StepEvent::Message(message))) => {
                    self.record_output(ctx, generation_id, message).await?;
                }
            }
        }
    }

    async fn record_output(
        &self,
        ctx: &RunContext,
        generation_id: GenerationId,
        message: AgentMessage,
    ) -> Result<()> {
        let order = self.journal.write().await.reserve_order(ctx.run_id, 1);
        let mut message = message.with_lineage(Lineage {
            run_id: Some(ctx.run_id),
            parent_run_id: ctx.parent_run_id,
            generation_id: Some(generation_id),
            message_order_idx: Some(order),
        });
        let record = codec::to_persisted(&message, &self.thread_id, ctx.run_id)?;
        self.store
            .append(&self.thread_id, std::slice::from_ref(&record))
            .await?;
        message.id = Some(record.id);
        message.timestamp = Some(record.timestamp);
        self.journal.write().await.messages.push(message.clone());
        self.hub.publish(&ThreadEvent::Message { message });
        Ok(())
    }

    async fn bind_session(&self, run_id: RunId, session_id: String) -> Result<()> {
        let mut slot = self.restart_lock.lock().await;
        if slot.metadata.session_for_run(run_id) == Some(session_id.as_str()) {
            return Ok(());
        }
        tracing::debug!(thread_id = %self.thread_id, run_id = %run_id, session_id = %session_id, "session bound");
        slot.metadata.map_session(session_id, run_id);
        slot.metadata.touch();
        self.store.save_metadata(&slot.metadata).await
    }

    /// Record a terminal status while holding the restart lock.
    ///
    /// Only completed runs advance `latest_run_id`. Input still queued for a
    /// failed or cancelled run stays persisted under that run but is not
    /// carried into another one.
    async fn finalize(
        &self,
        mut slot: MutexGuard<'_, RunSlot>,
        ctx: &RunContext,
        status: RunStatus,
        error: Option<ThreadlineError>,
        cancel: &CancellationToken,
        branch: bool,
    ) -> Option<RunId> {
        let run_id = ctx.run_id;
        if let Err(err) = self.agent_loop.finish_run(ctx, status).await {
            tracing::warn!(thread_id = %self.thread_id, run_id = %run_id, error = %err, "finish_run hook failed");
        }

        slot.metadata.current_run_id = None;
        if status == RunStatus::Completed {
            slot.metadata.latest_run_id = Some(run_id);
        }
        slot.metadata.touch();
        if let Err(err) = self.store.save_metadata(&slot.metadata).await {
            tracing::error!(thread_id = %self.thread_id, run_id = %run_id, error = %err, "failed to save thread metadata");
        }
        self.set_status(run_id, status).await;

        if status != RunStatus::Completed && !slot.queue.is_empty() {
            tracing::warn!(
                thread_id = %self.thread_id,
                run_id = %run_id,
                discarded = slot.queue.len(),
                "dropping input queued for unfinished run"
            );
            slot.queue.clear();
        }

        let error = error.map(|err| err.to_string());
        match &error {
            Some(err) => tracing::debug!(thread_id = %self.thread_id, run_id = %run_id, %status, error = %err, "run finished"),
            None => tracing::debug!(thread_id = %self.thread_id, run_id = %run_id, %status, "run finished"),
        }
        self.hub.publish(&ThreadEvent::RunFinished {
            run_id,
            status,
            error,
        });

        if branch && status == RunStatus::Completed && !slot.disposed && !cancel.is_cancelled() {
            match self.start_sibling(&mut slot, ctx, cancel).await {
                Ok(sibling) => return Some(sibling),
                Err(err) => tracing::error!(
                    thread_id = %self.thread_id,
                    run_id = %run_id,
                    error = %err,
                    "failed to start sibling run"
                ),
            }
        }

        slot.active = None;
        cancel.cancel();
        if !slot.disposed {
            self.state_tx.send_replace(EngineState::Idle);
        }
        None
    }

    /// Replay the branching run's input under a fresh sibling run.
    async fn start_sibling(
        &self,
        slot: &mut RunSlot,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunId> {
        let replay: Vec<AgentMessage> = slot
            .active
            .as_ref()
            .map(|active| {
                active
                    .inputs
                    .iter()
                    .cloned()
                    .map(|mut message| {
                        message.id = None;
                        message.timestamp = None;
                        message
                    })
                    .collect()
            })
            .unwrap_or_default();

        let sibling = Uuid::new_v4();
        self.journal.write().await.register(sibling, ctx.parent_run_id);
        let mut inputs = if replay.is_empty() {
            Vec::new()
        } else {
            self.persist(sibling, ctx.parent_run_id, replay).await?
        };
        if !inputs.is_empty() {
            slot.queue.push_front(QueuedInput {
                messages: inputs.clone(),
            });
        }
        inputs.extend(
            slot.queue
                .iter()
                .skip(1)
                .flat_map(|queued| queued.messages.iter().cloned()),
        );
        tracing::debug!(
            thread_id = %self.thread_id,
            run_id = %ctx.run_id,
            sibling = %sibling,
            "run branched"
        );
        slot.active = Some(ActiveRun {
            run_id: sibling,
            parent_run_id: ctx.parent_run_id,
            cancel: cancel.clone(),
            inputs,
        });
        Ok(sibling)
    }
}
