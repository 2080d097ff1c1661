//! `ProcessAgentLoop` driven by a real `RunEngine` over mock backends.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{collect_run, idle, texts, MockBackends};
use threadline::config::EngineConfig;
use threadline::engine::{AgentLoop, Delivery, RunEngine, RunStatus, SendOptions, ThreadEvent};
use threadline::process::{BackendEvent, ConnectionState, ProcessAgentLoop, ProcessMode};
use threadline::store::InMemoryConversationStore;
use threadline::types::AgentMessage;

async fn open(mode: ProcessMode, backends: &MockBackends) -> RunEngine<ProcessAgentLoop> {
    let agent = ProcessAgentLoop::new(mode, backends.factory());
    RunEngine::open(
        "proc-1",
        Arc::new(InMemoryConversationStore::new()),
        agent,
        &EngineConfig::default(),
    )
    .await
    .unwrap()
}

fn user(text: &str) -> Vec<AgentMessage> {
    vec![AgentMessage::user(text)]
}

fn finished_status(event: &ThreadEvent) -> (RunStatus, Option<String>) {
    match event {
        ThreadEvent::RunFinished { status, error, .. } => (*status, error.clone()),
        other => panic!("expected RunFinished, got {other:?}"),
    }
}

#[tokio::test]
async fn one_shot_opens_a_session_per_run_with_full_history() {
    let backends = MockBackends::new();
    let engine = open(ProcessMode::OneShot, &backends).await;
    let mut sub = engine.subscribe();

    engine.send(user("first"), SendOptions::new()).await.unwrap();
    let (messages, _) = collect_run(&mut sub).await;
    assert_eq!(texts(&messages), ["reply: first"]);
    idle(&engine).await;
    assert_eq!(engine.agent_loop().connection_state(), ConnectionState::Disconnected);

    engine.send(user("second"), SendOptions::new()).await.unwrap();
    collect_run(&mut sub).await;
    idle(&engine).await;

    let log = backends.log();
    assert_eq!(log.starts.len(), 2);
    assert!(log.starts.iter().all(|start| start.resume_session.is_none()));
    assert_eq!(texts(&log.sends[1]), ["first", "reply: first", "second"]);
    assert_eq!(log.shutdowns, 2);
    assert_eq!(engine.agent_loop().connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn interactive_reuses_the_session_and_sends_only_new_input() {
    let backends = MockBackends::new();
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    let first = engine.send(user("one"), SendOptions::new()).await.unwrap();
    collect_run(&mut sub).await;
    idle(&engine).await;
    engine.send(user("two"), SendOptions::new()).await.unwrap();
    let (messages, _) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(texts(&messages), ["reply: two"]);
    let log = backends.log();
    assert_eq!(log.starts.len(), 1);
    assert_eq!(texts(&log.sends[0]), ["one"]);
    assert_eq!(texts(&log.sends[1]), ["two"]);
    assert_eq!(engine.agent_loop().connections_opened(), 1);
    assert_eq!(engine.agent_loop().connection_state(), ConnectionState::Connected);
    assert_eq!(
        engine.metadata().await.session_for_run(first.run_id),
        Some("session-1")
    );
}

#[tokio::test]
async fn dead_interactive_session_is_resumed_on_the_next_run() {
    let backends = MockBackends::new();
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    engine.send(user("one"), SendOptions::new()).await.unwrap();
    collect_run(&mut sub).await;
    idle(&engine).await;

    backends.kill_current();
    engine.send(user("two"), SendOptions::new()).await.unwrap();
    let (messages, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(finished_status(&finished).0, RunStatus::Completed);
    assert_eq!(texts(&messages), ["reply: two"]);
    let log = backends.log();
    assert_eq!(log.starts.len(), 2);
    assert_eq!(log.starts[1].resume_session.as_deref(), Some("session-1"));
    assert_eq!(texts(&log.sends[1]), ["two"]);
}

#[tokio::test]
async fn backend_dying_mid_turn_fails_the_run_and_next_run_starts_fresh() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    engine.send(user("doomed"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    backends.kill_current();
    let (_, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    let (status, error) = finished_status(&finished);
    assert_eq!(status, RunStatus::Failed);
    assert!(error.unwrap().contains("ended before result"));
    assert_eq!(engine.agent_loop().connection_state(), ConnectionState::Disconnected);
    assert!(engine.metadata().await.latest_run_id.is_none());

    backends.set_manual(false);
    engine.send(user("retry"), SendOptions::new()).await.unwrap();
    let (messages, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(finished_status(&finished).0, RunStatus::Completed);
    assert_eq!(texts(&messages), ["reply: retry"]);
    let log = backends.log();
    assert_eq!(log.starts.len(), 2);
    assert!(log.starts[1].resume_session.is_none());
    assert_eq!(texts(&log.sends[1]), ["retry"]);
}

#[tokio::test]
async fn interactive_injects_input_into_the_live_turn() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    let first = engine.send(user("start"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    let second = engine.send(user("also this"), SendOptions::new()).await.unwrap();
    assert_eq!(second.delivery, Delivery::Injected);
    assert_eq!(second.run_id, first.run_id);

    for reply in ["handled start", "handled also this"] {
        backends.emit(BackendEvent::Message {
            message: AgentMessage::assistant(reply),
        });
        backends.emit(BackendEvent::Result {
            session_id: None,
            is_error: false,
            error: None,
        });
    }
    let (messages, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(finished_status(&finished).0, RunStatus::Completed);
    assert_eq!(texts(&messages), ["handled start", "handled also this"]);
    let log = backends.log();
    assert_eq!(log.sends.len(), 2);
    assert_eq!(texts(&log.sends[1]), ["also this"]);
    assert_eq!(
        texts(&engine.run_history(first.run_id).await),
        ["start", "also this", "handled start", "handled also this"]
    );
}

#[tokio::test]
async fn replies_to_injected_input_stay_in_the_injecting_run() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    let first = engine.send(user("one"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    let injected = engine.send(user("inj"), SendOptions::new()).await.unwrap();
    assert_eq!(injected.delivery, Delivery::Injected);
    for text in ["one", "inj"] {
        backends.emit(BackendEvent::Message {
            message: AgentMessage::assistant(format!("reply: {text}")),
        });
        backends.emit(BackendEvent::Result {
            session_id: None,
            is_error: false,
            error: None,
        });
    }
    let (messages, _) = collect_run(&mut sub).await;
    idle(&engine).await;
    assert_eq!(texts(&messages), ["reply: one", "reply: inj"]);

    backends.set_manual(false);
    let second = engine.send(user("two"), SendOptions::new()).await.unwrap();
    let (messages, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(finished_status(&finished).0, RunStatus::Completed);
    assert_eq!(texts(&messages), ["reply: two"]);
    assert!(messages
        .iter()
        .all(|message| message.lineage.run_id == Some(second.run_id)));
    assert_eq!(
        texts(&engine.run_history(first.run_id).await),
        ["one", "inj", "reply: one", "reply: inj"]
    );
}

#[tokio::test]
async fn injection_after_the_last_result_is_queued_instead() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    engine.send(user("one"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    backends.emit(BackendEvent::Result {
        session_id: None,
        is_error: false,
        error: None,
    });
    collect_run(&mut sub).await;
    idle(&engine).await;

    assert!(!engine.agent_loop().inject(&user("late")).await.unwrap());
    assert_eq!(backends.log().sends.len(), 1);
}

#[tokio::test]
async fn one_shot_queues_input_for_the_next_step() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::OneShot, &backends).await;
    let mut sub = engine.subscribe();

    let first = engine.send(user("start"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    let second = engine.send(user("later"), SendOptions::new()).await.unwrap();
    assert_eq!(second.delivery, Delivery::Queued);
    assert_eq!(second.run_id, first.run_id);

    let done = || BackendEvent::Result {
        session_id: None,
        is_error: false,
        error: None,
    };
    backends.emit(done());
    backends.wait_for_sends(2).await;
    backends.emit(done());
    let (_, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    assert_eq!(finished_status(&finished).0, RunStatus::Completed);
    let log = backends.log();
    assert_eq!(log.starts.len(), 1);
    assert_eq!(texts(&log.sends[1]), ["later"]);
}

#[tokio::test]
async fn error_result_fails_the_run() {
    let backends = MockBackends::new();
    backends.set_manual(true);
    let engine = open(ProcessMode::Interactive, &backends).await;
    let mut sub = engine.subscribe();

    let assignment = engine.send(user("go"), SendOptions::new()).await.unwrap();
    backends.wait_for_sends(1).await;
    backends.emit(BackendEvent::Result {
        session_id: None,
        is_error: true,
        error: Some("quota exceeded".into()),
    });
    let (_, finished) = collect_run(&mut sub).await;
    idle(&engine).await;

    let (status, error) = finished_status(&finished);
    assert_eq!(status, RunStatus::Failed);
    assert!(error.unwrap().contains("quota exceeded"));
    assert_eq!(engine.run_status(assignment.run_id).await, Some(RunStatus::Failed));
    assert_eq!(backends.log().shutdowns, 1);
}
