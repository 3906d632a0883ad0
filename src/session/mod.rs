//! Parent-side session manager, §4.F.
//!
//! Holds the `task_id -> ProcessHandle` map and owns the full lifecycle of a
//! child process: spawn, IPC wiring, status propagation, hard-duration cap,
//! and graceful-then-forceful shutdown.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ipc::envelope::{Payload, StartSession, StopSession};
use crate::ipc::{read_loop, FramedReader, FramedWriter};

/// Status the parent tracks for one session. Deliberately coarse: the
/// parent does not interpret status beyond `FAILED`, matching §4.F
/// "Status propagation".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Connected,
    Streaming,
    Disconnected,
    Failed { code: Option<String>, message: String },
}

struct ProcessHandle {
    status: RwLock<SessionStatus>,
    writer: Arc<FramedWriter<tokio::process::ChildStdin>>,
    shutdown_requested: std::sync::atomic::AtomicBool,
    hard_cap_cancel: Mutex<Option<oneshot::Sender<()>>>,
    exited: Mutex<Option<oneshot::Receiver<()>>>,
    pid: Option<u32>,
}

use tokio::sync::Mutex;

/// Parameters needed to start one child session; a superset of what ends
/// up in the `StartSession` IPC payload.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub task_id: String,
    pub palabra_uid: u32,
    pub bot_uid: u32,
    pub anam_uid: u32,
    pub channel: String,
    pub target_language: String,
    pub avatar_api_key: String,
    pub avatar_base_url: String,
    pub avatar_id: String,
    pub avatar_token: String,
    pub bot_token: String,
}

/// The `task_id -> ProcessHandle` map and its operations (§4.F).
pub struct SessionManager {
    config: Config,
    handles: RwLock<HashMap<String, Arc<ProcessHandle>>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a child, send `StartSession`, and wait for it to reach
    /// `CONNECTED`/`STREAMING` (or fail/timeout).
    pub async fn start_session(&self, params: StartParams) -> Result<()> {
        {
            let handles = self.handles.read().await;
            if handles.contains_key(&params.task_id) {
                bail!("session {} already exists", params.task_id);
            }
        }

        let child_path = Config::child_binary_path();
        let mut command = Command::new(&child_path);
        command
            .envs(self.config.as_env_pairs())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child: Child = command
            .spawn()
            .with_context(|| format!("spawning child binary at {}", child_path.display()))?;
        let pid = child.id();

        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let writer = Arc::new(FramedWriter::new(stdin));
        let (exited_tx, exited_rx) = oneshot::channel();

        let handle = Arc::new(ProcessHandle {
            status: RwLock::new(SessionStatus::Starting),
            writer: writer.clone(),
            shutdown_requested: std::sync::atomic::AtomicBool::new(false),
            hard_cap_cancel: Mutex::new(None),
            exited: Mutex::new(Some(exited_rx)),
            pid,
        });

        self.handles
            .write()
            .await
            .insert(params.task_id.clone(), handle.clone());

        spawn_stderr_logger(params.task_id.clone(), stderr);
        spawn_ipc_reader(params.task_id.clone(), stdout, handle.clone());
        spawn_exit_waiter(params.task_id.clone(), child, handle.clone(), exited_tx);
        self.spawn_hard_cap_timer(params.task_id.clone(), handle.clone()).await;

        writer
            .write_payload(&Payload::StartSession(StartSession {
                task_id: params.task_id.clone(),
                palabra_uid: params.palabra_uid,
                bot_uid: params.bot_uid,
                anam_uid: params.anam_uid,
                channel: params.channel,
                target_language: params.target_language,
                avatar_api_key: params.avatar_api_key,
                avatar_base_url: params.avatar_base_url,
                avatar_id: params.avatar_id,
                avatar_token: params.avatar_token,
                bot_token: params.bot_token,
            }))
            .await
            .context("writing StartSession over IPC")?;

        self.wait_for_ready(&params.task_id, handle).await
    }

    async fn wait_for_ready(&self, task_id: &str, handle: Arc<ProcessHandle>) -> Result<()> {
        let deadline = self.config.connect_wait_timeout;
        let poll = self.config.status_poll_interval;
        let result = timeout(deadline, async {
            loop {
                let status = handle.status.read().await.clone();
                match status {
                    SessionStatus::Connected | SessionStatus::Streaming => return Ok(()),
                    SessionStatus::Failed { message, .. } => bail!("child failed to start: {message}"),
                    _ => tokio::time::sleep(poll).await,
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                warn!(task_id, "connect-wait timeout, stopping session");
                self.stop_session(task_id).await.ok();
                bail!("timed out waiting for session {task_id} to connect");
            }
        }
    }

    async fn spawn_hard_cap_timer(&self, task_id: String, handle: Arc<ProcessHandle>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *handle.hard_cap_cancel.lock().await = Some(cancel_tx);
        let cap = self.config.session_hard_cap;
        let handles_key = task_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(cap) => {
                    info!(task_id = %handles_key, "session hard cap reached, forcing stop");
                    let _ = handle.writer.write_payload(&Payload::StopSession(StopSession {
                        task_id: handles_key,
                    })).await;
                }
                _ = cancel_rx => {}
            }
        });
    }

    /// Stop a session: idempotent, returns `Ok(false)` if already gone.
    pub async fn stop_session(&self, task_id: &str) -> Result<bool> {
        let handle = {
            let mut handles = self.handles.write().await;
            match handles.remove(task_id) {
                Some(h) => h,
                None => return Ok(false),
            }
        };

        handle.shutdown_requested.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(cancel) = handle.hard_cap_cancel.lock().await.take() {
            let _ = cancel.send(());
        }

        handle
            .writer
            .write_payload(&Payload::StopSession(StopSession {
                task_id: task_id.to_string(),
            }))
            .await
            .ok();

        let exited_rx = handle.exited.lock().await.take();
        if let Some(exited_rx) = exited_rx {
            if timeout(self.config.stop_drain_timeout, exited_rx).await.is_err() {
                warn!(task_id, "stop-drain timeout elapsed, escalating to a kill signal");
                escalate_kill(handle.pid).await;
            }
        }

        Ok(true)
    }

    pub async fn status(&self, task_id: &str) -> Option<SessionStatus> {
        let handles = self.handles.read().await;
        let handle = handles.get(task_id)?;
        Some(handle.status.read().await.clone())
    }

    pub async fn all_task_ids(&self) -> Vec<String> {
        self.handles.read().await.keys().cloned().collect()
    }

    /// Stop every live session.
    pub async fn shutdown(&self) {
        let task_ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        for task_id in task_ids {
            if let Err(e) = self.stop_session(&task_id).await {
                error!(task_id, error = %e, "error stopping session during shutdown");
            }
        }
    }

}

/// Escalate past a child that ignored `StopSession` and the stop-drain
/// grace period: SIGTERM, a short additional wait, then SIGKILL. The
/// `tokio::process::Child` itself was moved into the exit-waiter task, so
/// this operates on the raw pid via `nix` rather than `Child::kill`.
async fn escalate_kill(pid: Option<u32>) {
    let Some(pid) = pid else {
        warn!("cannot escalate shutdown: child has no pid");
        return;
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let raw_pid = Pid::from_raw(pid as i32);
        if let Err(e) = signal::kill(raw_pid, Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid, error = %e, "SIGTERM delivery failed");
            }
            return;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;

        if let Err(e) = signal::kill(raw_pid, Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid, error = %e, "SIGKILL delivery failed");
            }
        }
    }

    #[cfg(not(unix))]
    {
        warn!(pid, "non-unix platform: no signal escalation available, child may linger");
    }
}

fn spawn_stderr_logger(task_id: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(task_id = %task_id, child_stderr = %line),
                Ok(None) => break,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "error reading child stderr");
                    break;
                }
            }
        }
    });
}

fn spawn_ipc_reader(
    task_id: String,
    stdout: tokio::process::ChildStdout,
    handle: Arc<ProcessHandle>,
) {
    // `read_loop` requires a sync `FnMut(Payload)`, so the closure itself
    // can't await a write lock. Rather than spawning a detached task per
    // message (no ordering guarantee between them), it forwards status
    // changes through this channel to a single task that applies them in
    // arrival order, keeping `handle.status` strictly monotone.
    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel::<SessionStatus>();
    let status_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            *status_handle.status.write().await = status;
        }
    });

    tokio::spawn(async move {
        let reader = FramedReader::new(stdout);
        let result = read_loop(reader, |payload| match payload {
            Payload::StatusUpdate(update) => {
                let status = match update.status.as_str() {
                    "CONNECTED" => SessionStatus::Connected,
                    "STREAMING" => SessionStatus::Streaming,
                    "DISCONNECTED" => SessionStatus::Disconnected,
                    other => {
                        warn!(task_id = %task_id, status = other, "unrecognized status update");
                        return;
                    }
                };
                let _ = status_tx.send(status);
            }
            Payload::ErrorResponse(err) if err.fatal => {
                let message = err.message.clone();
                let code = Some(err.code.clone());
                let _ = status_tx.send(SessionStatus::Failed { code, message });
            }
            Payload::ErrorResponse(err) => {
                warn!(task_id = %task_id, code = %err.code, "non-fatal child error");
            }
            Payload::LogMessage(log) => {
                info!(task_id = %task_id, level = %log.level, child_log = %log.message);
            }
            _ => {}
        })
        .await;

        if let Err(e) = result {
            warn!(task_id = %task_id, error = %e, "IPC read loop ended with an error");
        }
    });
}

fn spawn_exit_waiter(
    task_id: String,
    mut child: Child,
    handle: Arc<ProcessHandle>,
    exited_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let shutdown_requested =
                    handle.shutdown_requested.load(std::sync::atomic::Ordering::SeqCst);
                if !status.success() && !shutdown_requested {
                    warn!(task_id = %task_id, ?status, "child exited unexpectedly");
                    *handle.status.write().await = SessionStatus::Failed {
                        code: Some("WORKER_FAILED".to_string()),
                        message: format!("child exited with {status}"),
                    };
                } else {
                    info!(task_id = %task_id, ?status, "child exited");
                }
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "error waiting on child process");
            }
        }
        let _ = exited_tx.send(());
    });
}

#[cfg(target_os = "linux")]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starting_a_duplicate_task_id_fails() {
        let manager = SessionManager::new(Config {
            agora_app_id: String::new(),
            avatar_base_url: String::new(),
            avatar_api_key: String::new(),
            translator_base_url: String::new(),
            token_service_base_url: String::new(),
            ..Config::from_env()
        });
        // Insert a fake handle directly to simulate an in-flight session
        // without actually spawning a child binary (none exists in tests).
        let (_tx, rx) = oneshot::channel();
        let handle = Arc::new(ProcessHandle {
            status: RwLock::new(SessionStatus::Starting),
            writer: Arc::new(FramedWriter::new(tokio::io::sink())),
            shutdown_requested: std::sync::atomic::AtomicBool::new(false),
            hard_cap_cancel: Mutex::new(None),
            exited: Mutex::new(Some(rx)),
            pid: None,
        });
        manager
            .handles
            .write()
            .await
            .insert("T".to_string(), handle);

        let result = manager
            .start_session(StartParams {
                task_id: "T".to_string(),
                palabra_uid: 1,
                bot_uid: 2,
                anam_uid: 3,
                channel: "C".to_string(),
                target_language: "fr".to_string(),
                avatar_api_key: "k".to_string(),
                avatar_base_url: "https://avatar.example".to_string(),
                avatar_id: "a".to_string(),
                avatar_token: "t".to_string(),
                bot_token: "b".to_string(),
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stopping_an_unknown_session_is_a_no_op_not_an_error() {
        let manager = SessionManager::new(Config {
            agora_app_id: String::new(),
            avatar_base_url: String::new(),
            avatar_api_key: String::new(),
            translator_base_url: String::new(),
            token_service_base_url: String::new(),
            ..Config::from_env()
        });
        assert_eq!(manager.stop_session("does-not-exist").await.unwrap(), false);
    }
}
