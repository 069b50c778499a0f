//! C5 Session Runtime: the central component. One `Runtime` per active
//! session, owning the agent handle and the currently bound connection.
//! Grounded on `signaling.rs`'s `SignalingChannel`/`browser_kick` pair,
//! generalized from a fixed video/input duplex to an arbitrary outward
//! event stream with rebind-kicks-the-old-connection semantics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use forge_protocol::{InboundCommand, OutwardEvent};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{AgentContext, AgentFactory, AgentSession};
use crate::sandbox::SandboxManager;
use crate::skills::SkillRegistry;
use crate::translator::{self, AgentEvent};

/// One instance per active session (§4.5). `active_conn` is the "send
/// gate": agent events are translated and pushed here, and silently
/// dropped when no connection is bound or the bound connection's queue is
/// closed — per §9 "drop rather than backpressure".
pub struct Runtime {
    pub session_id: Uuid,
    agent: Arc<dyn AgentSession>,
    active_conn: Arc<RwLock<Option<mpsc::UnboundedSender<OutwardEvent>>>>,
    /// Notified on every `rebind`; a connection holding a `.notified()`
    /// future learns it has been replaced and closes itself. Mirrors the
    /// precedent's `browser_kick: Notify`.
    pub rebind_kick: Notify,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Runtime {
    /// Atomically swap the bound connection. In-flight agent events keep
    /// flowing to whichever connection is current at send time; the old
    /// connection is left for the Gateway to close after observing the kick.
    pub async fn rebind(&self, conn: mpsc::UnboundedSender<OutwardEvent>) {
        *self.active_conn.write().await = Some(conn);
        self.rebind_kick.notify_waiters();
    }

    /// Drop the active connection without installing a new one (called
    /// when a bound connection closes on its own, not via rebind).
    pub async fn unbind(&self, conn: &mpsc::UnboundedSender<OutwardEvent>) {
        let mut guard = self.active_conn.write().await;
        if let Some(current) = guard.as_ref() {
            if current.same_channel(conn) {
                *guard = None;
            }
        }
    }

    pub fn send_prompt(&self, text: String) {
        self.agent.prompt(text);
    }

    pub fn send_steer(&self, text: String) {
        self.agent.steer(text);
    }

    pub fn abort(&self) {
        self.agent.abort();
    }

    pub fn compact(&self) {
        self.agent.compact();
    }

    /// Dispatch one inbound wire command (§4.5). Skill lookup failures are
    /// reported as an `error` event on whatever connection is currently
    /// bound; unknown command types never reach here (they fail to parse
    /// upstream and are reported directly by the caller).
    pub async fn dispatch(&self, cmd: InboundCommand, skills: &SkillRegistry) {
        match cmd {
            InboundCommand::Prompt { message } => self.send_prompt(message),
            InboundCommand::SkillInvoke { skill, args } => match skills.expand(&skill, args.as_deref()) {
                Some(prompt) => self.send_prompt(prompt),
                None => {
                    self.send_event(OutwardEvent::Error {
                        message: format!("unknown or disabled skill: {skill}"),
                    })
                    .await;
                }
            },
            InboundCommand::Abort => self.abort(),
            InboundCommand::Steer { message } => self.send_steer(message),
            InboundCommand::Compact => self.compact(),
        }
    }

    /// Push an event straight to the currently bound connection, bypassing
    /// the agent-event translator (used for gateway-originated events:
    /// malformed-frame errors, skill-lookup errors).
    pub async fn send_event(&self, event: OutwardEvent) {
        if let Some(tx) = self.active_conn.read().await.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Unsubscribe the agent-event forwarder and cancel the agent's
    /// current turn. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.agent.abort();
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
        *self.active_conn.write().await = None;
    }
}

/// Process-wide singleton mapping `sessionId -> Runtime` (§9 "global
/// mutable state"). Single writer via the internal lock; `open_or_rebind`
/// is idempotent per the §4.5 contract.
pub struct RuntimeTable {
    runtimes: RwLock<HashMap<Uuid, Arc<Runtime>>>,
    sandbox: Arc<SandboxManager>,
    agent_factory: Arc<dyn AgentFactory>,
}

impl RuntimeTable {
    pub fn new(sandbox: Arc<SandboxManager>, agent_factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
            sandbox,
            agent_factory,
        }
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Arc<Runtime>> {
        self.runtimes.read().await.get(&session_id).cloned()
    }

    /// `open(sessionId, workDir, conn, userId)` (§4.5). Returns the
    /// existing runtime rebound to `conn` if one is already live, else
    /// constructs a new one: ensures a sandbox container for `userId` when
    /// sandboxing is enabled (falling back to host execution and logging
    /// on failure, never failing the open), spawns the agent, and starts
    /// the translator forwarding loop.
    pub async fn open_or_rebind(
        &self,
        session_id: Uuid,
        work_dir: PathBuf,
        conn: mpsc::UnboundedSender<OutwardEvent>,
        user_id: Option<Uuid>,
    ) -> Arc<Runtime> {
        if let Some(rt) = self.runtimes.read().await.get(&session_id).cloned() {
            rt.rebind(conn).await;
            return rt;
        }

        let mut runtimes = self.runtimes.write().await;
        if let Some(rt) = runtimes.get(&session_id).cloned() {
            rt.rebind(conn).await;
            return rt;
        }

        let sandbox = self.ensure_sandbox(session_id, user_id).await;
        let ctx = AgentContext {
            user_id,
            host_cwd: work_dir,
            sandbox,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let agent = self.agent_factory.spawn(ctx, events_tx);
        let active_conn = Arc::new(RwLock::new(Some(conn)));
        let forwarder = tokio::spawn(forward_events(events_rx, Arc::clone(&active_conn)));

        let rt = Arc::new(Runtime {
            session_id,
            agent,
            active_conn,
            rebind_kick: Notify::new(),
            forwarder: Mutex::new(Some(forwarder)),
            disposed: AtomicBool::new(false),
        });
        runtimes.insert(session_id, Arc::clone(&rt));
        rt
    }

    async fn ensure_sandbox(&self, session_id: Uuid, user_id: Option<Uuid>) -> Option<Arc<SandboxManager>> {
        if !self.sandbox.is_enabled() {
            return None;
        }
        let Some(uid) = user_id else { return None };
        match self.sandbox.ensure(&uid.to_string()).await {
            Ok(_) => Some(Arc::clone(&self.sandbox)),
            Err(e) => {
                tracing::warn!(%session_id, %uid, "sandbox ensure failed, falling back to host execution: {e}");
                None
            }
        }
    }

    pub async fn dispose(&self, session_id: Uuid) {
        let rt = self.runtimes.write().await.remove(&session_id);
        if let Some(rt) = rt {
            rt.dispose().await;
        }
    }

    /// Dispose every live runtime (called on graceful shutdown).
    pub async fn dispose_all(&self) {
        let all: Vec<Arc<Runtime>> = self.runtimes.write().await.drain().map(|(_, v)| v).collect();
        for rt in all {
            rt.dispose().await;
        }
    }
}

/// Pipe translated agent events to whichever connection is bound at the
/// moment each event arrives — never buffered, never backpressured.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    active_conn: Arc<RwLock<Option<mpsc::UnboundedSender<OutwardEvent>>>>,
) {
    while let Some(event) = events.recv().await {
        let Some(outward) = translator::translate(&event) else {
            continue;
        };
        if let Some(tx) = active_conn.read().await.as_ref() {
            let _ = tx.send(outward);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StubAgentFactory;
    use crate::sandbox::SandboxManager;
    use forge_protocol::SandboxConfig;
    use tempfile::tempdir;

    fn table() -> RuntimeTable {
        RuntimeTable::new(
            Arc::new(SandboxManager::new(test_sandbox_config())),
            Arc::new(StubAgentFactory),
        )
    }

    fn test_sandbox_config() -> SandboxConfig {
        SandboxConfig {
            enabled: false,
            runtime_binary: "docker".into(),
            image: "forge-sandbox:latest".into(),
            memory: "1g".into(),
            cpus: "1".into(),
            network: "none".into(),
            container_prefix: "forge".into(),
            skills_dir: "/tmp/forge-skills".into(),
            workspaces_root: "/workspaces-host".into(),
            probe_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn open_twice_returns_same_runtime() {
        let table = table();
        let dir = tempdir().unwrap();
        let session_id = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let rt1 = table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx1, None)
            .await;
        let rt2 = table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx2, None)
            .await;

        assert!(Arc::ptr_eq(&rt1, &rt2));
    }

    #[tokio::test]
    async fn rebind_notifies_kick() {
        let table = table();
        let dir = tempdir().unwrap();
        let session_id = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let rt = table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx1, None)
            .await;
        let kicked = rt.rebind_kick.notified();
        tokio::pin!(kicked);

        table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx2, None)
            .await;

        tokio::time::timeout(std::time::Duration::from_secs(1), kicked)
            .await
            .expect("rebind should notify the previous connection");
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let table = table();
        let dir = tempdir().unwrap();
        let session_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx, None)
            .await;

        table.dispose(session_id).await;
        table.dispose(session_id).await;
        assert!(table.get(session_id).await.is_none());
    }

    #[tokio::test]
    async fn events_dropped_when_no_connection_bound() {
        let table = table();
        let dir = tempdir().unwrap();
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let rt = table
            .open_or_rebind(session_id, dir.path().to_path_buf(), tx.clone(), None)
            .await;
        rt.unbind(&tx).await;
        drop(rx);

        rt.send_event(OutwardEvent::Error {
            message: "nobody home".into(),
        })
        .await;
        // No panic, no send target — the event is simply discarded.
    }
}
