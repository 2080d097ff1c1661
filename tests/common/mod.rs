//! Shared test helpers: a scripted agent loop and a mock backend.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use threadline::engine::{
    AgentLoop, RunContext, RunEngine, RunStatus, StepEvent, StepInput, StepSignal, StepStream,
    Subscription, ThreadEvent,
};
use threadline::error::{Result, ThreadlineError};
use threadline::process::{BackendClient, BackendEvent, BackendEventStream, ClientFactory, SessionRequest};
use threadline::types::{AgentMessage, RunId};

/// One scripted item of a step.
#[derive(Clone)]
pub enum Scripted {
    Reply(AgentMessage),
    Session(String),
    Fail(String),
    Signal(StepSignal),
    /// Wait for the notify before continuing.
    Hold(Arc<Notify>),
    /// Never finish on its own; only cancellation ends it.
    Hang,
}

/// Agent loop that plays back scripted steps, then echoes pending input.
#[derive(Default)]
pub struct ScriptedLoop {
    steps: Mutex<VecDeque<Vec<Scripted>>>,
    inputs: Mutex<Vec<StepInput>>,
    hooks: Mutex<Vec<String>>,
    active_steps: Arc<AtomicUsize>,
    max_active_steps: Arc<AtomicUsize>,
}

impl ScriptedLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next un-scripted step.
    pub fn then(self, step: Vec<Scripted>) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    /// Every `StepInput` seen so far.
    pub fn inputs(&self) -> Vec<StepInput> {
        self.inputs.lock().unwrap().clone()
    }

    /// Hook calls in order, e.g. `prepare_run`, `finish_run:completed`.
    pub fn hooks(&self) -> Vec<String> {
        self.hooks.lock().unwrap().clone()
    }

    /// Highest number of steps ever in flight at once.
    pub fn max_concurrent_steps(&self) -> usize {
        self.max_active_steps.load(Ordering::SeqCst)
    }
}

struct ActiveStep(Arc<AtomicUsize>);

impl Drop for ActiveStep {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentLoop for ScriptedLoop {
    async fn step(&self, input: StepInput, cancel: CancellationToken) -> Result<StepStream> {
        let script = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| {
            input
                .pending
                .iter()
                .map(|m| Scripted::Reply(AgentMessage::assistant(format!("echo: {}", m.text()))))
                .collect()
        });
        self.inputs.lock().unwrap().push(input);

        let now = self.active_steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_steps.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveStep(self.active_steps.clone());

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for item in script {
                match item {
                    Scripted::Reply(message) => yield Ok(StepEvent::Message(message)),
                    Scripted::Session(session_id) => yield Ok(StepEvent::SessionBound { session_id }),
                    Scripted::Fail(reason) => {
                        yield Err(ThreadlineError::step(reason));
                        break;
                    }
                    Scripted::Signal(signal) => {
                        yield Ok(StepEvent::Finished(signal));
                        break;
                    }
                    Scripted::Hold(gate) => gate.notified().await,
                    Scripted::Hang => cancel.cancelled().await,
                }
            }
        }))
    }

    async fn prepare_run(&self, _ctx: &RunContext) -> Result<()> {
        self.hooks.lock().unwrap().push("prepare_run".into());
        Ok(())
    }

    async fn finish_run(&self, _ctx: &RunContext, status: RunStatus) -> Result<()> {
        self.hooks.lock().unwrap().push(format!("finish_run:{status}"));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.hooks.lock().unwrap().push("shutdown".into());
        Ok(())
    }
}

/// Messages carried by `Message` events, in order, until the run finishes.
pub async fn collect_run(sub: &mut Subscription) -> (Vec<AgentMessage>, ThreadEvent) {
    let mut messages = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("subscription closed");
        match event {
            ThreadEvent::Message { message } => messages.push(message),
            finished @ ThreadEvent::RunFinished { .. } => return (messages, finished),
            _ => {}
        }
    }
}

pub async fn idle<L: AgentLoop>(engine: &RunEngine<L>) {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for_idle())
        .await
        .expect("engine did not become idle");
}

pub fn texts(messages: &[AgentMessage]) -> Vec<String> {
    messages.iter().map(|m| m.text().to_string()).collect()
}

/// Everything the mock backends observed.
#[derive(Debug, Default, Clone)]
pub struct BackendLog {
    pub starts: Vec<SessionRequest>,
    pub sends: Vec<Vec<AgentMessage>>,
    pub shutdowns: usize,
}

type EventSender = mpsc::UnboundedSender<Result<BackendEvent>>;

struct Conn {
    tx: Mutex<Option<EventSender>>,
    alive: AtomicBool,
}

impl Conn {
    fn emit(&self, event: BackendEvent) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }
}

#[derive(Default)]
struct Shared {
    log: Mutex<BackendLog>,
    manual: AtomicBool,
    created: AtomicUsize,
    current: Mutex<Option<Arc<Conn>>>,
}

/// Factory of in-process backends.
///
/// By default every `send` is answered with one `reply: <text>` message per
/// input and a terminal `result`. In manual mode the test emits events itself.
#[derive(Clone, Default)]
pub struct MockBackends {
    shared: Arc<Shared>,
}

impl MockBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_manual(&self, manual: bool) {
        self.shared.manual.store(manual, Ordering::SeqCst);
    }

    pub fn factory(&self) -> ClientFactory {
        let shared = self.shared.clone();
        Arc::new(move || {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = Arc::new(Conn {
                tx: Mutex::new(Some(tx)),
                alive: AtomicBool::new(false),
            });
            Box::new(MockClient {
                shared: shared.clone(),
                conn,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                session: Mutex::new(None),
            }) as Box<dyn BackendClient>
        })
    }

    pub fn log(&self) -> BackendLog {
        self.shared.log.lock().unwrap().clone()
    }

    /// Emit an event on the most recently started connection.
    pub fn emit(&self, event: BackendEvent) {
        if let Some(conn) = self.shared.current.lock().unwrap().as_ref() {
            conn.emit(event);
        }
    }

    /// Simulate the backend process dying.
    pub fn kill_current(&self) {
        if let Some(conn) = self.shared.current.lock().unwrap().as_ref() {
            conn.kill();
        }
    }

    /// Wait until at least `count` input batches were sent.
    pub async fn wait_for_sends(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.log().sends.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend never received input");
    }
}

struct MockClient {
    shared: Arc<Shared>,
    conn: Arc<Conn>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<BackendEvent>>>>,
    session: Mutex<Option<String>>,
}

#[async_trait]
impl BackendClient for MockClient {
    async fn start(&mut self, request: SessionRequest) -> Result<()> {
        let n = self.shared.created.fetch_add(1, Ordering::SeqCst) + 1;
        let session = request
            .resume_session
            .clone()
            .unwrap_or_else(|| format!("session-{n}"));
        *self.session.lock().unwrap() = Some(session);
        self.shared.log.lock().unwrap().starts.push(request);
        self.conn.alive.store(true, Ordering::SeqCst);
        *self.shared.current.lock().unwrap() = Some(self.conn.clone());
        Ok(())
    }

    async fn send(&self, messages: Vec<AgentMessage>) -> Result<()> {
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(ThreadlineError::backend("mock backend is dead"));
        }
        self.shared.log.lock().unwrap().sends.push(messages.clone());
        if !self.shared.manual.load(Ordering::SeqCst) {
            for message in &messages {
                self.conn.emit(BackendEvent::Message {
                    message: AgentMessage::assistant(format!("reply: {}", message.text())),
                });
            }
            self.conn.emit(BackendEvent::Result {
                session_id: self.current_session(),
                is_error: false,
                error: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<BackendEventStream> {
        let rx = self.rx.clone();
        Ok(async_stream::stream! {
            loop {
                let next = rx.lock().await.recv().await;
                match next {
                    Some(event) => yield event,
                    None => break,
                }
            }
        }
        .boxed())
    }

    async fn shutdown(&mut self, _timeout: Duration) -> Result<()> {
        self.conn.kill();
        self.shared.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.conn.alive.load(Ordering::SeqCst)
    }

    fn current_session(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }
}

/// Run ids referenced by `RunStarted` events, in order.
pub fn started_runs(events: &[ThreadEvent]) -> Vec<(RunId, Option<RunId>)> {
    events
        .iter()
        .filter_map(|event| match event {
            ThreadEvent::RunStarted {
                run_id,
                parent_run_id,
            } => Some((*run_id, *parent_run_id)),
            _ => None,
        })
        .collect()
}

/// Poll `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}
