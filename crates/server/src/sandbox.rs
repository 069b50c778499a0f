//! C1 Sandbox Manager: lifecycle of per-user containers and a streamed
//! `exec` primitive. Grounded on `session.rs`'s TOCTOU-safe slot reservation
//! and SIGTERM/SIGKILL teardown discipline, generalized from a
//! `beam-agent` child process to a container runtime invoked as a
//! subprocess, plus the cold-start/subprocess pattern for driving an
//! external CLI tool with JSON/line output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use forge_protocol::{CoreError, SandboxConfig};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};

use crate::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    NotFound,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerInfo {
    pub user_id: String,
    pub container_id: String,
    pub status: ContainerStatus,
}

pub struct ExecOptions {
    /// Raw stdout/stderr byte chunks, delivered in the order tokio's mpsc
    /// scheduler observes the two reader tasks' sends — the practical
    /// meaning of "order of arrival" for two interleaved pipes.
    pub on_data: mpsc::Sender<Vec<u8>>,
    pub timeout_secs: Option<u64>,
    pub cancel: CancelToken,
}

pub struct ExecOutcome {
    pub exit_code: i32,
}

const LABEL: &str = "forge.managed";
const LABEL_USER: &str = "forge.user";

pub struct SandboxManager {
    config: SandboxConfig,
    containers: RwLock<HashMap<String, String>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Probes that the container runtime daemon is reachable.
    pub async fn available(&self) -> bool {
        run_capture(
            &self.config.runtime_binary,
            &["info"],
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await
        .map(|(code, _, _)| code == 0)
        .unwrap_or(false)
    }

    /// Checks that the configured image tag exists locally.
    pub async fn image_available(&self) -> bool {
        run_capture(
            &self.config.runtime_binary,
            &["image", "inspect", &self.config.image],
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await
        .map(|(code, _, _)| code == 0)
        .unwrap_or(false)
    }

    /// Canonical container name for `user_id`: `<prefix>-<sanitized>`,
    /// truncated to 60 characters so it stays re-discoverable across
    /// restarts without a persisted map.
    pub fn container_name(&self, user_id: &str) -> String {
        let sanitized: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let mut name = format!("{}-{}", self.config.container_prefix, sanitized);
        name.truncate(60);
        name
    }

    /// Idempotent: consult the cache, then the canonical name, then create.
    pub async fn ensure(&self, user_id: &str) -> Result<String, CoreError> {
        if let Some(id) = self.containers.read().await.get(user_id).cloned() {
            if self.is_running(&id).await {
                return Ok(id);
            }
        }

        let name = self.container_name(user_id);
        match self.inspect_status(&name).await {
            ContainerStatus::Running => {
                self.containers
                    .write()
                    .await
                    .insert(user_id.to_string(), name.clone());
                Ok(name)
            }
            ContainerStatus::Stopped => {
                let (code, _, stderr) = run_capture(
                    &self.config.runtime_binary,
                    &["start", &name],
                    Duration::from_secs(self.config.probe_timeout_secs),
                )
                .await
                .map_err(|e| CoreError::SpawnError(e.to_string()))?;
                if code != 0 {
                    return Err(CoreError::SpawnError(stderr));
                }
                self.containers
                    .write()
                    .await
                    .insert(user_id.to_string(), name.clone());
                Ok(name)
            }
            ContainerStatus::NotFound => {
                if !self.available().await {
                    return Err(CoreError::RuntimeUnavailable);
                }
                if !self.image_available().await {
                    return Err(CoreError::ImageMissing);
                }
                self.create_container(user_id, &name).await?;
                self.containers
                    .write()
                    .await
                    .insert(user_id.to_string(), name.clone());
                Ok(name)
            }
        }
    }

    async fn create_container(&self, user_id: &str, name: &str) -> Result<(), CoreError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.clone(),
            "--network".into(),
            self.config.network.clone(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--label".into(),
            format!("{LABEL}=true"),
            "--label".into(),
            format!("{LABEL_USER}={user_id}"),
            "-v".into(),
            format!("{}:/workspaces", self.config.workspaces_root),
            "-v".into(),
            format!("{}:{}:ro", self.config.skills_dir, self.config.skills_dir),
        ];
        for mount in skill_symlink_mounts(Path::new(&self.config.skills_dir)) {
            let mount = mount.display().to_string();
            args.push("-v".into());
            args.push(format!("{mount}:{mount}:ro"));
        }
        args.push(self.config.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let (code, _stdout, stderr) =
            run_capture(&self.config.runtime_binary, &arg_refs, Duration::from_secs(30))
                .await
                .map_err(|e| CoreError::SpawnError(e.to_string()))?;
        if code != 0 {
            return Err(CoreError::SpawnError(stderr));
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        matches!(self.inspect_status(name).await, ContainerStatus::Running)
    }

    async fn inspect_status(&self, name: &str) -> ContainerStatus {
        let args = ["inspect", "--format", "{{.State.Running}}", name];
        match run_capture(
            &self.config.runtime_binary,
            &args,
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await
        {
            Ok((0, stdout, _)) if stdout.trim() == "true" => ContainerStatus::Running,
            Ok((0, _, _)) => ContainerStatus::Stopped,
            _ => ContainerStatus::NotFound,
        }
    }

    /// Stop and remove, tolerating "already gone".
    pub async fn remove(&self, user_id: &str) -> Result<(), CoreError> {
        let name = self.container_name(user_id);
        let _ = run_capture(
            &self.config.runtime_binary,
            &["rm", "-f", &name],
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await;
        self.containers.write().await.remove(user_id);
        Ok(())
    }

    pub async fn remove_all(&self) -> Result<(), CoreError> {
        let (code, stdout, _) = run_capture(
            &self.config.runtime_binary,
            &["ps", "-a", "--filter", &format!("label={LABEL}=true"), "--format", "{{.Names}}"],
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await
        .map_err(|e| CoreError::SpawnError(e.to_string()))?;
        if code != 0 {
            return Ok(());
        }
        for name in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let _ = run_capture(
                &self.config.runtime_binary,
                &["rm", "-f", name],
                Duration::from_secs(self.config.probe_timeout_secs),
            )
            .await;
        }
        self.containers.write().await.clear();
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ContainerInfo>, CoreError> {
        let (code, stdout, stderr) = run_capture(
            &self.config.runtime_binary,
            &[
                "ps",
                "-a",
                "--filter",
                &format!("label={LABEL}=true"),
                "--format",
                "{{.Names}}\t{{.Label \"forge.user\"}}",
            ],
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await
        .map_err(|e| CoreError::SpawnError(e.to_string()))?;
        if code != 0 {
            return Err(CoreError::SpawnError(stderr));
        }
        let mut out = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next().unwrap_or_default().to_string();
            let user_id = parts.next().unwrap_or_default().to_string();
            let status = self.inspect_status(&name).await;
            out.push(ContainerInfo {
                user_id,
                container_id: name,
                status,
            });
        }
        Ok(out)
    }

    /// Does not mutate.
    pub async fn info(&self, user_id: &str) -> ContainerInfo {
        let name = self.container_name(user_id);
        let status = self.inspect_status(&name).await;
        ContainerInfo {
            user_id: user_id.to_string(),
            container_id: name,
            status,
        }
    }

    /// Rewrite the host-side workspaces-root prefix of `host_cwd` into the
    /// fixed container path. Logs (non-fatal) when the prefix doesn't
    /// match — a workspace living outside the bind mount.
    fn container_path(&self, host_cwd: &str) -> String {
        if let Some(rest) = host_cwd.strip_prefix(&self.config.workspaces_root) {
            format!("/workspaces{rest}")
        } else {
            tracing::warn!(
                host_cwd,
                workspaces_root = %self.config.workspaces_root,
                "host cwd is not under the sandbox workspaces root; using it unrewritten"
            );
            host_cwd.to_string()
        }
    }

    /// Streamed `exec` inside the user's container. Requires a cached
    /// container id; fails with `NoSandbox` otherwise.
    pub async fn exec(
        &self,
        user_id: &str,
        command: &str,
        host_cwd: &str,
        opts: ExecOptions,
    ) -> Result<ExecOutcome, CoreError> {
        let container_id = self
            .containers
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or(CoreError::NoSandbox)?;
        let container_cwd = self.container_path(host_cwd);

        let mut child = Command::new(&self.config.runtime_binary)
            .args([
                "exec",
                "-w",
                &container_cwd,
                &container_id,
                "/bin/bash",
                "-c",
                command,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::SpawnError(e.to_string()))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let out_tx = opts.on_data.clone();
        let err_tx = opts.on_data;
        let out_task = tokio::spawn(pump(stdout, out_tx));
        let err_task = tokio::spawn(pump(stderr, err_tx));

        // 0/None means no timeout; a 10-year sleep is effectively disabled
        // without needing an `Option<Sleep>` in the select below.
        let timeout_secs = opts.timeout_secs.filter(|s| *s > 0);
        let timeout_duration = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(315_360_000));
        let sleep = tokio::time::sleep(timeout_duration);
        tokio::pin!(sleep);

        let wait = child.wait();
        tokio::pin!(wait);

        tokio::select! {
            status = &mut wait => {
                let _ = out_task.await;
                let _ = err_task.await;
                let code = status.map_err(|e| CoreError::SpawnError(e.to_string()))?.code().unwrap_or(-1);
                Ok(ExecOutcome { exit_code: code })
            }
            _ = opts.cancel.cancelled() => {
                terminate_child(&mut child).await;
                let _ = out_task.await;
                let _ = err_task.await;
                Err(CoreError::Aborted)
            }
            _ = &mut sleep, if timeout_secs.is_some() => {
                terminate_child(&mut child).await;
                let _ = out_task.await;
                let _ = err_task.await;
                Err(CoreError::Timeout(timeout_secs.unwrap_or(0)))
            }
        }
    }
}

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// SIGTERM the exec child, give it `TERMINATE_GRACE` to exit, then SIGKILL.
/// Mirrors the teacher's `destroy_session` teardown discipline.
async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Enumerate symlinks directly under `skills_dir`, resolve their targets,
/// and return the set of distinct target parent directories so bash
/// inside the container can resolve skill files referenced by host
/// absolute paths. Failures to resolve are skipped silently.
fn skill_symlink_mounts(skills_dir: &Path) -> Vec<PathBuf> {
    let mut seen = std::collections::BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::canonicalize(&path) else {
            continue;
        };
        if let Some(parent) = target.parent() {
            seen.insert(parent.to_path_buf());
        }
    }
    seen.into_iter().collect()
}

async fn run_capture(bin: &str, args: &[&str], timeout: Duration) -> anyhow::Result<(i32, String, String)> {
    let fut = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    let output = tokio::time::timeout(timeout, fut).await??;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            runtime_binary: "docker".into(),
            image: "forge-sandbox:latest".into(),
            memory: "2g".into(),
            cpus: "2".into(),
            network: "bridge".into(),
            container_prefix: "forge".into(),
            skills_dir: "/nonexistent-skills".into(),
            workspaces_root: "/workspaces-host".into(),
            probe_timeout_secs: 1,
        }
    }

    #[test]
    fn container_name_sanitizes_and_truncates() {
        let manager = SandboxManager::new(test_config());
        let name = manager.container_name("alice@example.com");
        assert_eq!(name, "forge-alice-example-com");
    }

    #[test]
    fn container_name_truncates_to_60() {
        let manager = SandboxManager::new(test_config());
        let long_user = "u".repeat(100);
        let name = manager.container_name(&long_user);
        assert_eq!(name.len(), 60);
    }

    #[test]
    fn container_path_rewrites_matching_prefix() {
        let manager = SandboxManager::new(test_config());
        let path = manager.container_path("/workspaces-host/s1/workspace");
        assert_eq!(path, "/workspaces/s1/workspace");
    }

    #[test]
    fn container_path_leaves_mismatched_prefix_unrewritten() {
        let manager = SandboxManager::new(test_config());
        let path = manager.container_path("/elsewhere/s1/workspace");
        assert_eq!(path, "/elsewhere/s1/workspace");
    }

    #[tokio::test]
    async fn exec_without_cached_container_fails_no_sandbox() {
        let manager = SandboxManager::new(test_config());
        let (tx, _rx) = mpsc::channel(8);
        let err = manager
            .exec(
                "alice",
                "echo hi",
                "/workspaces-host/s1/workspace",
                ExecOptions {
                    on_data: tx,
                    timeout_secs: None,
                    cancel: CancelToken::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSandbox));
    }

    #[test]
    fn skill_symlink_mounts_on_missing_dir_is_empty() {
        assert!(skill_symlink_mounts(Path::new("/nonexistent-skills")).is_empty());
    }
}
