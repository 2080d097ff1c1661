//! Backend client over a child process speaking newline-delimited JSON.
//!
//! Outbound frames are `{"type":"session_start",...}` followed by any number
//! of `{"type":"input","messages":[...]}`. Every stdout line is parsed as a
//! [`BackendEvent`]; lines that do not parse are logged and skipped.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{BackendClient, BackendEvent, BackendEventStream, SessionRequest};
use crate::error::{Result, ThreadlineError};
use crate::types::{AgentMessage, RunId};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame<'a> {
    SessionStart {
        thread_id: &'a str,
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session: Option<&'a str>,
    },
    Input {
        messages: &'a [AgentMessage],
    },
}

type SharedSession = Arc<Mutex<Option<String>>>;
type EventReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Result<BackendEvent>>>>;

/// Parsed events buffered ahead of the consumer. When full, the reader stops
/// draining stdout and the backend blocks on its pipe.
const EVENT_BUFFER: usize = 256;

struct RunningProcess {
    child: Child,
    write_tx: mpsc::Sender<String>,
    events: EventReceiver,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// [`BackendClient`] that spawns `command` and talks to it over stdio.
pub struct StdioBackendClient {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    resume_arg: Option<String>,
    process: Option<RunningProcess>,
    session: SharedSession,
}

impl StdioBackendClient {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            resume_arg: None,
            process: None,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pass `<flag> <session_id>` on the command line when resuming.
    pub fn with_resume_arg(mut self, flag: impl Into<String>) -> Self {
        self.resume_arg = Some(flag.into());
        self
    }

    fn set_session(session: &SharedSession, value: Option<String>) {
        *session.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    async fn write_frame(&self, frame: &Frame<'_>) -> Result<()> {
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| ThreadlineError::backend("backend not started"))?;
        if !process.alive.load(Ordering::SeqCst) {
            return Err(ThreadlineError::backend("backend process has exited"));
        }
        let line = format!("{}\n", serde_json::to_string(frame)?);
        process
            .write_tx
            .send(line)
            .await
            .map_err(|_| ThreadlineError::backend("backend stdin closed"))
    }
}

#[async_trait]
impl BackendClient for StdioBackendClient {
    async fn start(&mut self, request: SessionRequest) -> Result<()> {
        if self.process.is_some() {
            return Err(ThreadlineError::InvalidState("backend already started".into()));
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let (Some(flag), Some(session)) = (&self.resume_arg, &request.resume_session) {
            cmd.arg(flag).arg(session);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            ThreadlineError::backend(format!("failed to spawn '{}': {err}", self.command))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ThreadlineError::backend("failed to open backend stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ThreadlineError::backend("failed to open backend stdout"))?;

        let alive = Arc::new(AtomicBool::new(true));

        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let alive_writer = alive.clone();
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(err) = written {
                    tracing::warn!(error = %err, "backend stdin write failed");
                    alive_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let alive_reader = alive.clone();
        let session = self.session.clone();
        let mut reader = BufReader::new(stdout);
        let reader = tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<BackendEvent>(trimmed) {
                            Ok(event) => {
                                match &event {
                                    BackendEvent::Session { session_id }
                                    | BackendEvent::Result {
                                        session_id: Some(session_id),
                                        ..
                                    } => Self::set_session(&session, Some(session_id.clone())),
                                    _ => {}
                                }
                                if event_tx.send(Ok(event)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, line = %trimmed, "unparseable backend line");
                            }
                        }
                    }
                    Err(err) => {
                        let _ = event_tx
                            .send(Err(ThreadlineError::backend(format!(
                                "backend read failed: {err}"
                            ))))
                            .await;
                        break;
                    }
                }
            }
            alive_reader.store(false, Ordering::SeqCst);
            tracing::debug!("backend stdout closed");
        });

        Self::set_session(&self.session, request.resume_session.clone());
        self.process = Some(RunningProcess {
            child,
            write_tx,
            events: Arc::new(tokio::sync::Mutex::new(event_rx)),
            alive,
            reader,
        });
        tracing::debug!(
            command = %self.command,
            thread_id = %request.thread_id,
            run_id = %request.run_id,
            resume = request.resume_session.is_some(),
            "backend process started"
        );

        self.write_frame(&Frame::SessionStart {
            thread_id: &request.thread_id,
            run_id: request.run_id,
            resume_session: request.resume_session.as_deref(),
        })
        .await
    }

    async fn send(&self, messages: Vec<AgentMessage>) -> Result<()> {
        self.write_frame(&Frame::Input {
            messages: &messages,
        })
        .await
    }

    fn subscribe(&self) -> Result<BackendEventStream> {
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| ThreadlineError::backend("backend not started"))?;
        let events = process.events.clone();
        Ok(Box::pin(async_stream::stream! {
            loop {
                let next = events.lock().await.recv().await;
                match next {
                    Some(event) => yield event,
                    None => break,
                }
            }
        }))
    }

    async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        // Closing stdin is the exit request.
        drop(process.write_tx);
        process.alive.store(false, Ordering::SeqCst);

        let result = match tokio::time::timeout(timeout, process.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.command, %status, "backend process exited");
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    timeout_ms = timeout.as_millis() as u64,
                    "backend did not exit in time; killing"
                );
                process.child.kill().await.map_err(ThreadlineError::from)
            }
        };
        process.reader.abort();
        result
    }

    fn is_alive(&self) -> bool {
        self.process
            .as_ref()
            .is_some_and(|process| process.alive.load(Ordering::SeqCst))
    }

    fn current_session(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use uuid::Uuid;

    fn request() -> SessionRequest {
        SessionRequest {
            thread_id: "t1".into(),
            run_id: Uuid::new_v4(),
            resume_session: None,
        }
    }

    fn scripted(script: &str) -> StdioBackendClient {
        StdioBackendClient::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn reads_events_until_result() {
        let mut client = scripted(
            r#"read start
echo '{"type":"session","session_id":"s-1"}'
read input
echo 'not json'
echo '{"type":"message","message":{"role":"assistant","body":{"type":"text","text":"pong"}}}'
echo '{"type":"result","is_error":false}'
read done"#,
        );
        client.start(request()).await.unwrap();
        let mut events = client.subscribe().unwrap();
        client.send(vec![AgentMessage::user("ping")]).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            let event = event.unwrap();
            let done = matches!(event, BackendEvent::Result { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[1], BackendEvent::Message { message } if message.text() == "pong"));
        assert_eq!(client.current_session().as_deref(), Some("s-1"));
        assert!(client.is_alive());

        client.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn output_larger_than_the_buffer_arrives_complete_and_in_order() {
        let mut client = scripted(
            r#"read start
read input
i=0
while [ $i -lt 1000 ]; do
  printf '{"type":"message","message":{"role":"assistant","body":{"type":"text","text":"%s"}}}\n' "$i"
  i=$((i+1))
done
echo '{"type":"result","is_error":false}'
read done"#,
        );
        client.start(request()).await.unwrap();
        let mut events = client.subscribe().unwrap();
        client.send(vec![AgentMessage::user("flood")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut texts = Vec::new();
        while let Some(event) = events.next().await {
            match event.unwrap() {
                BackendEvent::Message { message } => texts.push(message.text().to_string()),
                BackendEvent::Result { .. } => break,
                BackendEvent::Session { .. } => {}
            }
        }
        let expected: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
        assert!(client.is_alive());
        client.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn exit_clears_liveness_and_ends_stream() {
        let mut client = scripted("read start; exit 0");
        client.start(request()).await.unwrap();
        let mut events = client.subscribe().unwrap();
        assert!(events.next().await.is_none());
        assert!(!client.is_alive());
        assert!(client.send(vec![AgentMessage::user("late")]).await.is_err());
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_timeout() {
        let mut client = scripted("trap '' TERM; read start; sleep 30");
        client.start(request()).await.unwrap();
        client.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_backend_error() {
        let mut client = StdioBackendClient::new("/nonexistent/threadline-backend", Vec::new());
        let err = client.start(request()).await.unwrap_err();
        assert!(matches!(err, ThreadlineError::Backend(_)));
    }
}
