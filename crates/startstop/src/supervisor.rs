//! Process supervisor.
//!
//! Spawns build and run commands with combined output redirected to a log
//! file, waits on them with hard bounds, and terminates whole process trees
//! with graceful-then-forceful escalation.

use crate::platform::Platform;
use startstop_core::Command;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Interval between "still running" log lines while waiting on a command.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Wait after an unconditional kill before giving up on reaping.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("{command} did not finish within {} seconds", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("spawned process has no pid: {0}")]
    NoPid(String),
    #[error("empty command")]
    EmptyCommand,
    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkdir(PathBuf),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace period between terminate and kill.
    pub stop_wait: Duration,
    pub heartbeat: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_wait: Duration::from_secs(180),
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }
}

/// A live child process and its bookkeeping.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: u32,
    program: String,
    log_file: PathBuf,
    started: Instant,
    exit_status: Option<ExitStatus>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Reap without blocking; `true` once the root process has exited.
    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "failed to poll process state");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    platform: Arc<dyn Platform>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(platform: Arc<dyn Platform>, config: SupervisorConfig) -> Self {
        Self { platform, config }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Launch `command` and return immediately.
    ///
    /// Output is written to the command's log file, which is truncated.
    pub fn start(&self, command: &Command) -> Result<RunningProcess> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(SupervisorError::EmptyCommand);
        };
        if !command.workdir.is_dir() {
            return Err(SupervisorError::MissingWorkdir(command.workdir.clone()));
        }

        if let Some(parent) = command.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout = File::create(&command.log_file).map_err(|source| {
            SupervisorError::LogFile {
                path: command.log_file.clone(),
                source,
            }
        })?;
        let stderr = stdout.try_clone()?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(&command.env)
            .current_dir(&command.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::NotFound(program.clone())
            } else {
                SupervisorError::Io(e)
            }
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::NoPid(program.clone()))?;

        info!(
            pid,
            command = %command.display(),
            workdir = %command.workdir.display(),
            log = %command.log_file.display(),
            "process started"
        );

        Ok(RunningProcess {
            child,
            pid,
            program: program.clone(),
            log_file: command.log_file.clone(),
            started: Instant::now(),
            exit_status: None,
        })
    }

    /// Run `command` to completion within `timeout`.
    ///
    /// On timeout the whole process tree is killed before
    /// [`SupervisorError::Timeout`] is returned.
    pub async fn run_and_wait_bounded(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<ExitStatus> {
        let mut process = self.start(command)?;
        let started = process.started;

        let status = loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    pid = process.pid,
                    timeout_sec = timeout.as_secs(),
                    command = %command.display(),
                    "process timed out; killing"
                );
                if let Err(err) = self.stop(&mut process, true).await {
                    warn!(pid = process.pid, error = %err, "failed to kill timed-out process");
                }
                return Err(SupervisorError::Timeout {
                    command: command.display(),
                    timeout,
                });
            }

            let sleep_duration = self.config.heartbeat.min(timeout.saturating_sub(elapsed));

            tokio::select! {
                result = process.child.wait() => {
                    break result?;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    if started.elapsed() < timeout {
                        info!(
                            pid = process.pid,
                            elapsed_sec = started.elapsed().as_secs(),
                            timeout_sec = timeout.as_secs(),
                            log = %command.log_file.display(),
                            "{} still running",
                            process.program
                        );
                    }
                }
            }
        };

        process.exit_status = Some(status);
        info!(
            pid = process.pid,
            exit_code = status.code(),
            duration_ms = started.elapsed().as_millis() as u64,
            "process finished"
        );
        Ok(status)
    }

    /// Terminate the process and every descendant.
    ///
    /// Graceful first unless `force`: terminate the tree, wait up to
    /// `stop_wait` for the root, then kill whatever is left. Stopping a
    /// process that has already exited is a no-op.
    pub async fn stop(&self, process: &mut RunningProcess, force: bool) -> Result<()> {
        if process.has_exited() {
            debug!(pid = process.pid, "process already exited");
            return Ok(());
        }

        let descendants = self.platform.descendants(process.pid);
        debug!(pid = process.pid, ?descendants, force, "stopping process tree");

        if !force {
            for &pid in descendants.iter().chain(std::iter::once(&process.pid)) {
                if let Err(err) = self.platform.terminate(pid) {
                    warn!(pid, error = %err, "failed to terminate process");
                }
            }

            match tokio::time::timeout(self.config.stop_wait, process.child.wait()).await {
                Ok(Ok(status)) => {
                    process.exit_status = Some(status);
                    info!(pid = process.pid, exit_code = status.code(), "process stopped");
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    warn!(
                        pid = process.pid,
                        stop_wait_sec = self.config.stop_wait.as_secs(),
                        "process ignored terminate; killing"
                    );
                }
            }
        }

        if process.exit_status.is_none() {
            for &pid in &descendants {
                if let Err(err) = self.platform.kill(pid) {
                    warn!(pid, error = %err, "failed to kill descendant");
                }
            }
            if let Err(err) = process.child.start_kill() {
                debug!(pid = process.pid, error = %err, "kill on root failed");
            }
            match tokio::time::timeout(KILL_REAP_TIMEOUT, process.child.wait()).await {
                Ok(Ok(status)) => {
                    process.exit_status = Some(status);
                    info!(pid = process.pid, "process killed");
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => warn!(pid = process.pid, "process did not exit after kill"),
            }
        }

        self.kill_stragglers(&descendants);
        Ok(())
    }

    /// Kill descendants still alive after their root exited.
    fn kill_stragglers(&self, descendants: &[u32]) {
        for &pid in descendants {
            if self.platform.is_alive(pid) {
                debug!(pid, "killing leftover descendant");
                if let Err(err) = self.platform.kill(pid) {
                    warn!(pid, error = %err, "failed to kill leftover descendant");
                }
            }
        }
    }
}
