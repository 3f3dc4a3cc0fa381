//! Event vocabulary shared by the registry, the supervision loop and plugins.

pub(crate) mod bus;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Local};

use crate::{process::ProcessInfo, task::Task, SupervisorError, TaskName};

pub use bus::{EventBus, Handler, HandlerResult};

/// Every kind of event the engine and the built-in plugins produce or consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    SystemSetup,
    Heartbeat,
    ExecSystemClose,
    SystemClose,
    SystemTeardown,
    TaskAdd,
    TaskDelete,
    TaskPreStart,
    TaskRunning,
    TaskStop,
    TaskFinish,
    TaskRunningError,
    TaskFinishError,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        Self::SystemSetup,
        Self::Heartbeat,
        Self::ExecSystemClose,
        Self::SystemClose,
        Self::SystemTeardown,
        Self::TaskAdd,
        Self::TaskDelete,
        Self::TaskPreStart,
        Self::TaskRunning,
        Self::TaskStop,
        Self::TaskFinish,
        Self::TaskRunningError,
        Self::TaskFinishError,
    ];

    /// Kinds that describe a transition of a single task's process.
    pub const TASK_LIFECYCLE: [EventKind; 6] = [
        Self::TaskPreStart,
        Self::TaskRunning,
        Self::TaskStop,
        Self::TaskFinish,
        Self::TaskRunningError,
        Self::TaskFinishError,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SystemSetup => "SYSTEM_SETUP",
            Self::Heartbeat => "HEARTBEAT",
            Self::ExecSystemClose => "EXEC_SYSTEM_CLOSE",
            Self::SystemClose => "SYSTEM_CLOSE",
            Self::SystemTeardown => "SYSTEM_TEARDOWN",
            Self::TaskAdd => "TASK_ADD",
            Self::TaskDelete => "TASK_DELETE",
            Self::TaskPreStart => "TASK_PRE_START",
            Self::TaskRunning => "TASK_RUNNING",
            Self::TaskStop => "TASK_STOP",
            Self::TaskFinish => "TASK_FINISH",
            Self::TaskRunningError => "TASK_RUNNING_ERROR",
            Self::TaskFinishError => "TASK_FINISH_ERROR",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SupervisorError;

    /// Case-insensitive: `task_finish` and `TASK_FINISH` are the same kind.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == upper)
            .ok_or_else(|| SupervisorError::UnknownEvent(s.to_string()))
    }
}

/// An immutable event together with the attributes relevant to its kind.
#[derive(Debug, Clone)]
pub enum Event {
    SystemSetup,
    Heartbeat {
        now: DateTime<Local>,
    },
    ExecSystemClose,
    SystemClose,
    SystemTeardown,
    TaskAdd {
        task_name: TaskName,
        task: Task,
        process: ProcessInfo,
    },
    TaskDelete {
        task_name: TaskName,
        task: Task,
        process: ProcessInfo,
    },
    TaskPreStart {
        task_name: TaskName,
        task: Task,
        process: ProcessInfo,
    },
    TaskRunning {
        task_name: TaskName,
        task: Task,
        process: ProcessInfo,
    },
    TaskStop {
        task_name: TaskName,
        task: Task,
        process: ProcessInfo,
    },
    TaskFinish {
        task_name: TaskName,
    },
    TaskRunningError {
        task_name: TaskName,
        exit_code: i32,
    },
    TaskFinishError {
        task_name: TaskName,
    },
}

impl Event {
    pub fn heartbeat(now: DateTime<Local>) -> Self {
        Self::Heartbeat { now }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::SystemSetup => EventKind::SystemSetup,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
            Self::ExecSystemClose => EventKind::ExecSystemClose,
            Self::SystemClose => EventKind::SystemClose,
            Self::SystemTeardown => EventKind::SystemTeardown,
            Self::TaskAdd { .. } => EventKind::TaskAdd,
            Self::TaskDelete { .. } => EventKind::TaskDelete,
            Self::TaskPreStart { .. } => EventKind::TaskPreStart,
            Self::TaskRunning { .. } => EventKind::TaskRunning,
            Self::TaskStop { .. } => EventKind::TaskStop,
            Self::TaskFinish { .. } => EventKind::TaskFinish,
            Self::TaskRunningError { .. } => EventKind::TaskRunningError,
            Self::TaskFinishError { .. } => EventKind::TaskFinishError,
        }
    }

    /// The task this event is about, if any.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            Self::TaskAdd { task_name, .. }
            | Self::TaskDelete { task_name, .. }
            | Self::TaskPreStart { task_name, .. }
            | Self::TaskRunning { task_name, .. }
            | Self::TaskStop { task_name, .. }
            | Self::TaskFinish { task_name }
            | Self::TaskRunningError { task_name, .. }
            | Self::TaskFinishError { task_name } => Some(task_name),
            _ => None,
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::TaskAdd { task, .. }
            | Self::TaskDelete { task, .. }
            | Self::TaskPreStart { task, .. }
            | Self::TaskRunning { task, .. }
            | Self::TaskStop { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn process(&self) -> Option<&ProcessInfo> {
        match self {
            Self::TaskAdd { process, .. }
            | Self::TaskDelete { process, .. }
            | Self::TaskPreStart { process, .. }
            | Self::TaskRunning { process, .. }
            | Self::TaskStop { process, .. } => Some(process),
            _ => None,
        }
    }

    pub fn now(&self) -> Option<DateTime<Local>> {
        match self {
            Self::Heartbeat { now } => Some(*now),
            _ => None,
        }
    }
}

/// Returned by a handler to let the event reach the next handler or to stop it here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Continue,
    Stop,
}
