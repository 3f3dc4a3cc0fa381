//! Subprocess lifecycle for a single task.

pub(crate) mod command;
pub(crate) mod logs;

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::{
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result, supervisor::SupervisedProcessMessage, task::Task, SupervisorError, TaskName,
};

use self::{
    command::LaunchSpec,
    logs::{resolve_log_file, StreamKind},
};

pub use command::{SEARCH_PATH, SUPERVISOR_MARKER_ENV};

const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Never started.
    Sleeping,
    Running,
    /// Exited on its own with code 0.
    ExitNormal,
    /// Exited on its own with a nonzero code.
    ExitError,
    /// Stopped by the supervisor.
    Stopped,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, Self::ExitNormal | Self::ExitError)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sleeping => write!(f, "sleeping"),
            Self::Running => write!(f, "running"),
            Self::ExitNormal => write!(f, "exit_normal"),
            Self::ExitError => write!(f, "exit_error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time copy of a [`ManagedProcess`], safe to hand out of the supervision loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub name: TaskName,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub last_start_time: Option<DateTime<Local>>,
    pub last_stop_time: Option<DateTime<Local>>,
    pub stdout_logfile: Option<PathBuf>,
    pub stderr_logfile: Option<PathBuf>,
}

impl ProcessInfo {
    /// Fails with [`SupervisorError::ProcessRuntimeError`] if the last run exited nonzero.
    pub fn check_success(&self) -> Result<()> {
        match self.exit_code {
            Some(code) if code != 0 => {
                error!(task_name = %self.name, exit_code = code, "process exited with an error");
                Err(SupervisorError::ProcessRuntimeError {
                    task_name: self.name.clone(),
                    exit_code: code,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Reported by a watcher when its OS process terminates on its own.
#[derive(Debug, Clone)]
pub(crate) struct ProcessExit {
    pub(crate) task_name: TaskName,
    pub(crate) generation: u64,
    pub(crate) exit_code: i32,
    pub(crate) at: DateTime<Local>,
}

/// Runtime wrapper supervising the OS process of exactly one [`Task`].
///
/// Each start spawns the child in its own process group together with two log
/// drains and a watcher. Only the watcher signals the group: it owns the
/// `Child`, so it knows whether the leader has been reaped and its pid may
/// already belong to someone else. It reports a natural exit to the
/// supervision loop; stopping cancels the three of them as a unit.
pub struct ManagedProcess {
    task: Task,
    pid: Option<u32>,
    state: ProcessState,
    exit_code: Option<i32>,
    last_start_time: Option<DateTime<Local>>,
    last_stop_time: Option<DateTime<Local>>,
    stdout_logfile: Option<PathBuf>,
    stderr_logfile: Option<PathBuf>,
    log_dir: PathBuf,
    generation: u64,
    pub(crate) restart_attempts: u32,
    cancellation_token: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<SupervisedProcessMessage>,
}

impl ManagedProcess {
    pub(crate) fn new(
        task: Task,
        log_dir: PathBuf,
        tx: mpsc::UnboundedSender<SupervisedProcessMessage>,
    ) -> Self {
        Self {
            task,
            pid: None,
            state: ProcessState::Sleeping,
            exit_code: None,
            last_start_time: None,
            last_stop_time: None,
            stdout_logfile: None,
            stderr_logfile: None,
            log_dir,
            generation: 0,
            restart_attempts: 0,
            cancellation_token: None,
            watcher: None,
            tx,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn last_start_time(&self) -> Option<DateTime<Local>> {
        self.last_start_time
    }

    pub fn last_stop_time(&self) -> Option<DateTime<Local>> {
        self.last_stop_time
    }

    pub fn stdout_logfile(&self) -> Option<&Path> {
        self.stdout_logfile.as_deref()
    }

    pub fn stderr_logfile(&self) -> Option<&Path> {
        self.stderr_logfile.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.cancellation_token.is_some()
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            name: self.task.name().to_string(),
            pid: self.pid,
            state: self.state,
            exit_code: self.exit_code,
            last_start_time: self.last_start_time,
            last_stop_time: self.last_stop_time,
            stdout_logfile: self.stdout_logfile.clone(),
            stderr_logfile: self.stderr_logfile.clone(),
        }
    }

    /// Bumped on every start; exit reports and restarts carry the value they were issued for.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn mark(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// Spawns the OS process, its log drains and its watcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!(task_name = self.name(), "already running; start ignored");
            return Ok(());
        }
        let spec = LaunchSpec::prepare(&self.task)?;
        let name = self.task.name().to_string();
        let stdout_path = resolve_log_file(
            &self.log_dir,
            &name,
            self.task.stdout_logfile(),
            StreamKind::Stdout,
        )?;
        let stderr_path = resolve_log_file(
            &self.log_dir,
            &name,
            self.task.stderr_logfile(),
            StreamKind::Stderr,
        )?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.directory {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            SupervisorError::run(format!(
                "couldn't spawn `{}` for task `{name}`: {e}",
                spec.program.display()
            ))
        })?;

        let token = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(logs::drain(
                name.clone(),
                stdout,
                stdout_path.clone(),
                StreamKind::Stdout,
                token.child_token(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(logs::drain(
                name.clone(),
                stderr,
                stderr_path.clone(),
                StreamKind::Stderr,
                token.child_token(),
            ));
        }

        self.generation = self.generation.wrapping_add(1);
        self.pid = child.id();
        self.watcher = Some(tokio::spawn(watch(
            child,
            name.clone(),
            self.generation,
            token.clone(),
            self.tx.clone(),
        )));
        self.cancellation_token = Some(token);
        self.stdout_logfile = Some(stdout_path);
        self.stderr_logfile = Some(stderr_path);
        self.exit_code = None;
        self.state = ProcessState::Running;
        self.last_start_time = Some(Local::now());
        info!(task_name = %name, pid = ?self.pid, "process started");
        Ok(())
    }

    /// Cancels the watcher and log drains; the watcher then kills the process
    /// group and reaps the child. No-op when not running.
    ///
    /// Returns the watcher so callers can wait for the kill to land.
    pub(crate) fn stop(&mut self) -> Option<JoinHandle<()>> {
        let token = self.cancellation_token.take()?;
        self.pid = None;
        token.cancel();
        self.state = ProcessState::Stopped;
        self.last_stop_time = Some(Local::now());
        info!(task_name = self.name(), "process stopped");
        self.watcher.take()
    }

    /// Applies a watcher report. Returns the new state, or `None` when the
    /// report belongs to a run that was already stopped or replaced.
    pub(crate) fn record_exit(&mut self, exit: &ProcessExit) -> Option<ProcessState> {
        if !self.is_running() || exit.generation != self.generation {
            debug!(
                task_name = %exit.task_name,
                generation = exit.generation,
                "stale exit report ignored"
            );
            return None;
        }
        // Dropped, not cancelled: the drains still flush what the group wrote.
        self.cancellation_token = None;
        self.watcher = None;
        self.pid = None;
        self.exit_code = Some(exit.exit_code);
        self.last_stop_time = Some(exit.at);
        self.state = if exit.exit_code == 0 {
            ProcessState::ExitNormal
        } else {
            ProcessState::ExitError
        };
        Some(self.state)
    }

    /// Delay = base * 2^min(restart_attempts, MAX_BACKOFF_EXPONENT).
    pub(crate) fn restart_delay(&self, base: Duration) -> Duration {
        let factor = 2u32.saturating_pow(self.restart_attempts.min(MAX_BACKOFF_EXPONENT));
        base.saturating_mul(factor)
    }

    pub(crate) fn has_exceeded_max_retries(&self) -> bool {
        self.restart_attempts >= self.task.restart_retries()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.task.name())
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Waits for the child to exit and reports it, unless cancelled first.
///
/// Either way the child's process group is killed, so background processes it
/// left behind die with it.
async fn watch(
    mut child: Child,
    task_name: TaskName,
    generation: u64,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<SupervisedProcessMessage>,
) {
    let leader = child.id();
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            // `id()` is `None` once the child has been reaped.
            if let Some(pid) = child.id() {
                kill_group(pid);
            }
            if let Err(e) = child.kill().await {
                debug!(task_name = %task_name, "reaping stopped process: {e}");
            }
        }
        status = child.wait() => {
            // Members that outlive the leader keep its group id reserved.
            if let Some(pid) = leader {
                kill_group(pid);
            }
            let exit_code = match status {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    error!(task_name = %task_name, "waiting for process failed: {e}");
                    -1
                }
            };
            info!(task_name = %task_name, exit_code, "process exited");
            let exit = ProcessExit { task_name, generation, exit_code, at: Local::now() };
            if tx.send(SupervisedProcessMessage::Exited(exit)).is_err() {
                warn!("supervision loop is gone; exit report dropped");
            }
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// SIGKILLs the process group `pgid`. An already empty group is not an error.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: plain syscall; failures are reported through errno.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, "killing process group failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
