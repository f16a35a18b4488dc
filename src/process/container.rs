//! Process container
//!
//! Wraps one OS child process: owns the PID, the stdio streams, and the
//! lifecycle state machine. Exit outcomes are published on a watch channel
//! observed by both the shutdown sequence and the supervisor's exit handler.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::logs::LogStream;

use super::definition::{ExecMode, ProcessConfig};
use super::state::ProcessStatus;

/// Exit code and signal observed when a child terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// True for a zero exit code
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Sink invoked for every line captured from a child stream
pub type LogSink = Arc<dyn Fn(i64, &str, LogStream, &str) + Send + Sync>;

/// A supervised child process
pub struct Container {
    id: i64,
    name: String,
    worker: usize,
    config: ProcessConfig,

    status: RwLock<ProcessStatus>,
    pid: RwLock<Option<u32>>,
    started_at: RwLock<Option<Instant>>,
    started_wall: RwLock<Option<DateTime<Utc>>>,
    restarts: AtomicU32,
    intentionally_stopped: AtomicBool,

    exit_tx: Mutex<Option<watch::Sender<Option<ExitOutcome>>>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    stdin: Mutex<Option<ChildStdin>>,
    weak: std::sync::Weak<Container>,
}

impl Container {
    /// Create a container for one worker of a definition.
    pub fn new(id: i64, name: impl Into<String>, worker: usize, config: ProcessConfig) -> Arc<Self> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let name = name.into();
        Arc::new_cyclic(|weak| Self {
            id,
            name,
            worker,
            config,
            status: RwLock::new(ProcessStatus::Stopped),
            pid: RwLock::new(None),
            started_at: RwLock::new(None),
            started_wall: RwLock::new(None),
            restarts: AtomicU32::new(0),
            intentionally_stopped: AtomicBool::new(false),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            stdin: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker index within a cluster definition (0 for fork mode)
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ProcessStatus) {
        *self.status.write() = status;
    }

    /// PID of the child, present only while online or stopping
    pub fn pid(&self) -> Option<u32> {
        *self.pid.read()
    }

    /// True while the child holds a PID
    pub fn is_running(&self) -> bool {
        self.status().has_pid() && self.pid().is_some()
    }

    /// Time since the last successful spawn
    pub fn uptime(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        self.started_at.read().map(|at| at.elapsed())
    }

    /// Wall-clock timestamp of the last successful spawn
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_wall.read()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn set_restarts(&self, value: u32) {
        self.restarts.store(value, Ordering::SeqCst);
    }

    /// Set before any user-requested shutdown so the exit handler skips the
    /// restart policy even if the child crashes mid-shutdown.
    pub fn mark_intentional_stop(&self) {
        self.intentionally_stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_intentional_stop(&self) -> bool {
        self.intentionally_stopped.load(Ordering::SeqCst)
    }

    /// Watch the child's exit outcome; yields `Some` exactly once.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the child. Transitions launching -> online and records the PID
    /// and start time.
    pub async fn start(&self, sink: Option<LogSink>) -> DaemonResult<u32> {
        if self.is_running() {
            return Err(DaemonError::ProcessAlreadyExists(self.name.clone()));
        }

        // A container is single-use: claim the exit channel before spawning
        // so a stale container can never leak a second child
        let exit_tx = self.exit_tx.lock().await.take().ok_or_else(|| {
            DaemonError::ProcessAlreadyExists(format!("{}: container already used", self.name))
        })?;

        self.set_status(ProcessStatus::Launching);

        let mut command = self.build_command();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_status(ProcessStatus::Errored);
                *self.exit_tx.lock().await = Some(exit_tx);
                return Err(DaemonError::Spawn(format!("{}: {}", self.name, e)));
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| DaemonError::Spawn(format!("{}: no pid after spawn", self.name)))?;

        *self.pid.write() = Some(pid);
        *self.started_at.write() = Some(Instant::now());
        *self.started_wall.write() = Some(Utc::now());

        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            let id = self.id;
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(sink) = &sink {
                        sink(id, &name, LogStream::Stdout, &line);
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let sink = sink.clone();
            let id = self.id;
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(sink) = &sink {
                        sink(id, &name, LogStream::Stderr, &line);
                    }
                }
            });
        }

        *self.stdin.lock().await = child.stdin.take();

        let container = self
            .weak
            .upgrade()
            .ok_or_else(|| DaemonError::Internal(format!("{}: container dropped", self.name)))?;
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                    #[cfg(not(unix))]
                    let signal = None;
                    ExitOutcome {
                        code: status.code(),
                        signal,
                    }
                }
                Err(e) => {
                    warn!("Wait failed for {}: {}", container.name, e);
                    ExitOutcome {
                        code: None,
                        signal: None,
                    }
                }
            };

            debug!(
                "Child {} exited (code={:?}, signal={:?})",
                container.name, outcome.code, outcome.signal
            );

            *container.pid.write() = None;
            *container.stdin.lock().await = None;
            let _ = exit_tx.send(Some(outcome));
        });

        self.set_status(ProcessStatus::Online);
        Ok(pid)
    }

    /// Stop the child. `force` skips the escalation and goes straight to KILL.
    pub async fn stop(&self, force: bool) -> Option<i32> {
        if force {
            super::shutdown::force_kill(self).await
        } else {
            super::shutdown::graceful_stop(self).await
        }
    }

    /// Kill the child immediately.
    pub async fn kill(&self) -> Option<i32> {
        super::shutdown::force_kill(self).await
    }

    /// Best-effort structured shutdown message over the child's stdin.
    pub async fn send_shutdown_message(&self) {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            if let Err(e) = stdin.write_all(b"{\"type\":\"shutdown\"}\n").await {
                debug!("Shutdown message to {} failed: {}", self.name, e);
            }
            let _ = stdin.flush().await;
        }
    }

    fn build_command(&self) -> Command {
        let config = &self.config;

        let mut command = match &config.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.args(&config.interpreter_args);
                c.arg(&config.script);
                c
            }
            None => Command::new(&config.script),
        };

        command.args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        command.envs(&config.env);
        command.env("NOVA_PROCESS_NAME", &self.name);
        command.env("NOVA_PROCESS_ID", self.id.to_string());
        if config.exec_mode == ExecMode::Cluster {
            command.env("NOVA_WORKER_ID", self.worker.to_string());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}
