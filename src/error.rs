use std::path::PathBuf;

use thiserror::Error;

use crate::event::EventKind;

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Errors raised by the supervision engine, its registry and its plugins.
///
/// Context operations return these to their caller; the heartbeat loop logs
/// them and keeps ticking.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The task cannot be started (missing command, bad working directory...).
    #[error("run error: {0}")]
    RunError(String),

    /// A log-file directory referenced by a task does not exist.
    #[error("directory does not exist: {}", .0.display())]
    DictionaryNotExist(PathBuf),

    /// The process exited nonzero where success was expected.
    #[error("process `{task_name}` exited with code {exit_code}")]
    ProcessRuntimeError { task_name: String, exit_code: i32 },

    #[error("task `{0}` already exists")]
    DuplicateTaskName(String),

    #[error("mod `{0}` already exists")]
    DuplicateMod(String),

    #[error("mod `{0}` not found")]
    ModNotFound(String),

    #[error("task `{0}` not found")]
    TaskNotFound(String),

    #[error("invalid task `{task_name}`: {reason}")]
    InvalidTask { task_name: String, reason: String },

    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A subscriber failed while handling `event`.
    #[error("handler for {event} failed: {source}")]
    Handler {
        event: EventKind,
        #[source]
        source: Box<SupervisorError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::RunError(_) => "run_error",
            Self::DictionaryNotExist(_) => "dictionary_not_exist",
            Self::ProcessRuntimeError { .. } => "process_runtime_error",
            Self::DuplicateTaskName(_) => "duplicate_task_name",
            Self::DuplicateMod(_) => "duplicate_mod",
            Self::ModNotFound(_) => "mod_not_found",
            Self::TaskNotFound(_) => "task_not_found",
            Self::InvalidTask { .. } => "invalid_task",
            Self::UnknownEvent(_) => "unknown_event",
            Self::InvalidCron { .. } => "invalid_cron",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Handler { .. } => "handler",
            Self::Other(_) => "other",
        }
    }

    /// Unwraps nested `Handler` layers down to the error a subscriber raised.
    pub fn root(&self) -> &SupervisorError {
        match self {
            Self::Handler { source, .. } => source.root(),
            other => other,
        }
    }

    /// Logs the error at ERROR and hands it back, for use where it is raised.
    pub(crate) fn logged(self) -> Self {
        tracing::error!(error = self.as_label(), "{self}");
        self
    }

    pub(crate) fn run(message: impl Into<String>) -> Self {
        Self::RunError(message.into()).logged()
    }

    pub(crate) fn invalid_task(task_name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task_name: task_name.to_string(),
            reason: reason.into(),
        }
        .logged()
    }
}
