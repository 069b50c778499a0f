//! The agent-model API itself is an external collaborator (§1, "Deliberately
//! out of scope") — this module only defines the narrow seam the Session
//! Runtime depends on (`AgentSession`/`AgentFactory`) plus a minimal
//! in-repo implementation so the crate is runnable and testable standalone.
//! A real deployment replaces `StubAgentFactory` with an adapter over the
//! actual agent SDK; everything above this seam (C2 translation, C5
//! wiring, reconnect semantics) is unaffected by that swap.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::sandbox::{ExecOptions, SandboxManager};
use crate::translator::{AgentEvent, MessageUpdateKind};

/// What a running agent needs to know to run its bash tool inside the
/// right sandbox (or on the host, when sandboxing is disabled or the
/// session has no owning user).
#[derive(Clone)]
pub struct AgentContext {
    pub user_id: Option<Uuid>,
    pub host_cwd: PathBuf,
    pub sandbox: Option<Arc<SandboxManager>>,
}

/// One live agent turn-driver. Forwards to the real agent SDK in a
/// production deployment; forwards to `StubAgent` here.
pub trait AgentSession: Send + Sync {
    fn prompt(&self, text: String);
    fn steer(&self, text: String);
    fn abort(&self);
    fn compact(&self);
}

pub trait AgentFactory: Send + Sync {
    fn spawn(&self, ctx: AgentContext, events: mpsc::UnboundedSender<AgentEvent>) -> Arc<dyn AgentSession>;
}

/// Demonstrates the bash-tool-redirection wiring (§4.5 "Sandbox wiring")
/// without depending on a real model: each `prompt` is executed as a bash
/// command — through the Sandbox Manager when the session has one,
/// directly on the host otherwise — and its stdout is streamed back as
/// message-delta events, bracketed by a `bash` tool-start/tool-end pair.
pub struct StubAgent {
    ctx: AgentContext,
    events: mpsc::UnboundedSender<AgentEvent>,
    turn_cancel: std::sync::Mutex<CancelToken>,
}

impl StubAgent {
    fn new(ctx: AgentContext, events: mpsc::UnboundedSender<AgentEvent>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            events,
            turn_cancel: std::sync::Mutex::new(CancelToken::new()),
        })
    }

    fn run_turn(self: Arc<Self>, text: String) {
        let cancel = CancelToken::new();
        *self.turn_cancel.lock().unwrap() = cancel.clone();
        tokio::spawn(async move {
            let _ = self.events.send(AgentEvent::AgentStart);
            let tool_id = Uuid::new_v4().to_string();
            let _ = self.events.send(AgentEvent::ToolExecutionStart {
                id: tool_id.clone(),
                tool_name: "bash".to_string(),
                args: serde_json::json!({ "command": text }),
            });

            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
            let events = self.events.clone();
            let forward = tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let delta = String::from_utf8_lossy(&chunk).to_string();
                    let _ = events.send(AgentEvent::MessageUpdate(MessageUpdateKind::TextDelta { delta }));
                }
            });

            let (exit_code, is_error, result_text) = if let Some(sandbox) = &self.ctx.sandbox {
                let Some(user_id) = self.ctx.user_id else {
                    (-1, true, "no owning user for sandboxed exec".to_string())
                } else {
                    match sandbox
                        .exec(
                            &user_id.to_string(),
                            &text,
                            &self.ctx.host_cwd.to_string_lossy(),
                            ExecOptions {
                                on_data: tx,
                                timeout_secs: None,
                                cancel: cancel.clone(),
                            },
                        )
                        .await
                    {
                        Ok(outcome) => (outcome.exit_code, outcome.exit_code != 0, String::new()),
                        Err(e) => (-1, true, e.to_string()),
                    }
                }
            } else {
                match run_on_host(&text, &self.ctx.host_cwd, tx, cancel.clone()).await {
                    Ok(code) => (code, code != 0, String::new()),
                    Err(e) => (-1, true, e),
                }
            };
            let _ = forward.await;

            let _ = self.events.send(AgentEvent::ToolExecutionEnd {
                id: tool_id,
                tool_name: "bash".to_string(),
                result: serde_json::json!({ "exitCode": exit_code, "error": result_text }),
                is_error,
            });
            let _ = self.events.send(AgentEvent::MessageEnd);
            let _ = self.events.send(AgentEvent::AgentEnd);
        });
    }
}

async fn run_on_host(
    command: &str,
    cwd: &std::path::Path,
    on_data: mpsc::Sender<Vec<u8>>,
    cancel: CancelToken,
) -> Result<i32, String> {
    let mut child = Command::new("/bin/bash")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| e.to_string())?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let out_tx = on_data.clone();
    let out_task = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        while let Ok(n) = stdout.read(&mut buf).await {
            if n == 0 || out_tx.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
    });
    let err_task = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        while let Ok(n) = stderr.read(&mut buf).await {
            if n == 0 || on_data.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        status = child.wait() => {
            let _ = out_task.await;
            let _ = err_task.await;
            status.map(|s| s.code().unwrap_or(-1)).map_err(|e| e.to_string())
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            let _ = out_task.await;
            let _ = err_task.await;
            Err("aborted".to_string())
        }
    }
}

impl AgentSession for StubAgent {
    fn prompt(&self, text: String) {
        // `run_turn` needs an owned `Arc<Self>`; `prompt`/`steer` are the
        // only entry points, both always called through an `Arc<dyn
        // AgentSession>` held by the Runtime, so this upgrade is safe.
        unreachable!("use StubAgentFactory::spawn, which wires prompt()/steer() to an Arc handle")
    }
    fn steer(&self, _text: String) {}
    fn abort(&self) {
        self.turn_cancel.lock().unwrap().cancel();
    }
    fn compact(&self) {}
}

pub struct StubAgentFactory;

impl AgentFactory for StubAgentFactory {
    fn spawn(&self, ctx: AgentContext, events: mpsc::UnboundedSender<AgentEvent>) -> Arc<dyn AgentSession> {
        Arc::new(ArcStubAgent(StubAgent::new(ctx, events)))
    }
}

/// Wraps `Arc<StubAgent>` so `prompt`/`steer` can hand `run_turn` an owned
/// `Arc<StubAgent>` (needed to `tokio::spawn` a 'static future) while the
/// `AgentSession` trait object stays `Arc<dyn AgentSession>` at the
/// `Runtime` call site.
struct ArcStubAgent(Arc<StubAgent>);

impl AgentSession for ArcStubAgent {
    fn prompt(&self, text: String) {
        self.0.clone().run_turn(text);
    }
    fn steer(&self, text: String) {
        self.0.clone().run_turn(text);
    }
    fn abort(&self) {
        self.0.abort();
    }
    fn compact(&self) {
        self.0.compact();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn host_exec_emits_expected_event_sequence() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = AgentContext {
            user_id: None,
            host_cwd: dir.path().to_path_buf(),
            sandbox: None,
        };
        let agent = StubAgentFactory.spawn(ctx, tx);
        agent.prompt("echo hi".to_string());

        let mut seen = Vec::new();
        for _ in 0..6 {
            if let Some(event) = rx.recv().await {
                seen.push(std::mem::discriminant(&event));
                if matches!(event, AgentEvent::AgentEnd) {
                    break;
                }
            }
        }
        assert!(seen.len() >= 5, "expected a full agent_start..agent_end sequence");
    }
}
