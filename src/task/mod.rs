use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{error::Result, event::EventKind, SupervisorError, TaskName};

/// Separator between the event name and the hook task name in a trigger token.
pub const TRIGGER_SEPARATOR: &str = "__";

/// Declarative description of a unit of work.
///
/// A `Task` is immutable once built: every construction path goes through
/// [`Task::validate`], so a `Task` held by the registry always has a
/// well-formed environment, cron expression and trigger list.
///
/// # Example
///
/// ```rust
/// use process_supervisor::Task;
///
/// let task = Task::builder("report")
///     .command("/bin/sh -c date")
///     .cron_expression("0 */5 * * * *")
///     .trigger_events("TASK_FINISH__extract")
///     .build()
///     .unwrap();
/// assert_eq!(task.name(), "report");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    name: TaskName,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    directory: Option<PathBuf>,
    /// `;`-separated `KEY=VALUE` pairs.
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    auto_restart: bool,
    #[serde(default)]
    restart_retries: u32,
    #[serde(default)]
    cron_expression: Option<String>,
    /// Whitespace-separated `EVENT_NAME__task_name` tokens.
    #[serde(default)]
    trigger_events: Option<String>,
    #[serde(default)]
    stdout_logfile: Option<PathBuf>,
    #[serde(default)]
    stderr_logfile: Option<PathBuf>,
}

impl Task {
    pub fn builder(name: impl Into<TaskName>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// Parses and validates a task from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let task: Task =
            toml::from_str(s).map_err(|e| SupervisorError::Config(format!("bad task: {e}")))?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if let Some(environment) = &self.environment {
            parse_environment(environment).map_err(|reason| {
                SupervisorError::invalid_task(&self.name, reason)
            })?;
        }
        if let Some(expression) = &self.cron_expression {
            parse_cron(expression)?;
        }
        if let Some(trigger_events) = &self.trigger_events {
            for token in trigger_events.split_whitespace() {
                let Some((event_name, _)) = split_trigger(token) else {
                    return Err(SupervisorError::invalid_task(
                        &self.name,
                        format!("trigger event `{token}` must look like EVENT_NAME{TRIGGER_SEPARATOR}task_name"),
                    ));
                };
                event_name
                    .parse::<EventKind>()
                    .map_err(SupervisorError::logged)?;
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn auto_restart(&self) -> bool {
        self.auto_restart
    }

    pub fn restart_retries(&self) -> u32 {
        self.restart_retries
    }

    pub fn cron_expression(&self) -> Option<&str> {
        self.cron_expression.as_deref()
    }

    pub fn trigger_events(&self) -> Option<&str> {
        self.trigger_events.as_deref()
    }

    pub fn stdout_logfile(&self) -> Option<&Path> {
        self.stdout_logfile.as_deref()
    }

    pub fn stderr_logfile(&self) -> Option<&Path> {
        self.stderr_logfile.as_deref()
    }

    /// The parsed environment overrides, in declaration order.
    pub fn environment_pairs(&self) -> Vec<(String, String)> {
        self.environment
            .as_deref()
            .and_then(|env| parse_environment(env).ok())
            .unwrap_or_default()
    }

    /// `(event_name, hook_task_name)` for each trigger token.
    pub fn trigger_pairs(&self) -> Vec<(&str, &str)> {
        self.trigger_events
            .as_deref()
            .map(|events| events.split_whitespace().filter_map(split_trigger).collect())
            .unwrap_or_default()
    }

    /// The parsed cron schedule, if the task is time-triggered.
    pub fn schedule(&self) -> Result<Option<cron::Schedule>> {
        self.cron_expression.as_deref().map(parse_cron).transpose()
    }
}

/// Builds a validated [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: impl Into<TaskName>) -> Self {
        Self {
            task: Task {
                name: name.into(),
                command: None,
                directory: None,
                environment: None,
                auto_restart: false,
                restart_retries: 0,
                cron_expression: None,
                trigger_events: None,
                stdout_logfile: None,
                stderr_logfile: None,
            },
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.task.command = Some(command.into());
        self
    }

    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.task.directory = Some(directory.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.task.environment = Some(environment.into());
        self
    }

    pub fn auto_restart(mut self, auto_restart: bool) -> Self {
        self.task.auto_restart = auto_restart;
        self
    }

    pub fn restart_retries(mut self, retries: u32) -> Self {
        self.task.restart_retries = retries;
        self
    }

    pub fn cron_expression(mut self, expression: impl Into<String>) -> Self {
        self.task.cron_expression = Some(expression.into());
        self
    }

    pub fn trigger_events(mut self, trigger_events: impl Into<String>) -> Self {
        self.task.trigger_events = Some(trigger_events.into());
        self
    }

    pub fn stdout_logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.task.stdout_logfile = Some(path.into());
        self
    }

    pub fn stderr_logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.task.stderr_logfile = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Task> {
        self.task.validate()?;
        Ok(self.task)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SupervisorError::invalid_task(name, "name must not be empty"));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err(SupervisorError::invalid_task(
            name,
            "name must not contain whitespace or path separators",
        ));
    }
    Ok(())
}

fn split_trigger(token: &str) -> Option<(&str, &str)> {
    let (event_name, hook_task_name) = token.split_once(TRIGGER_SEPARATOR)?;
    if event_name.is_empty() || hook_task_name.is_empty() {
        return None;
    }
    Some((event_name, hook_task_name))
}

fn parse_environment(environment: &str) -> std::result::Result<Vec<(String, String)>, String> {
    environment
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("environment entry `{entry}` must look like KEY=VALUE")),
        })
        .collect()
}

/// Parses a cron expression. Six/seven-field expressions carry seconds first;
/// a classic five-field expression fires at second 0.
pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        SupervisorError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
        .logged()
    })
}
