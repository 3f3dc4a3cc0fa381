use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{toml_files, Mod, ModCommand, ModConfig};
use crate::{error::Result, supervisor::Context, task::Task, SupervisorError};

/// Loads one task per `*.toml` file from a directory at setup.
///
/// ```toml
/// # tasks/backup.toml
/// name = "backup"
/// command = "/usr/local/bin/backup --incremental"
/// cron_expression = "0 3 * * *"
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskDirLoader;

impl TaskDirLoader {
    pub const NAME: &'static str = "TaskDirLoader";
    pub const DEFAULT_TASK_DIR: &'static str = "tasks";

    pub fn new() -> Self {
        Self
    }

    pub fn task_dir(config: &ModConfig) -> PathBuf {
        PathBuf::from(config.get_str("task_dir").unwrap_or(Self::DEFAULT_TASK_DIR))
    }

    /// Every `*.toml` file in `dir`, sorted by path.
    pub fn task_files(dir: &Path) -> Result<Vec<PathBuf>> {
        toml_files(dir)
    }

    /// Parses one task file. Empty files yield `None`.
    pub fn read_task_file(path: &Path) -> Result<Option<Task>> {
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Task::from_toml_str(&raw).map(Some).map_err(|e| {
            error!(path = %path.display(), "bad task file: {e}");
            e
        })
    }

    /// Every task defined in `dir`, in file-name order.
    pub fn load_tasks(dir: &Path) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for path in Self::task_files(dir)? {
            match Self::read_task_file(&path)? {
                Some(task) => tasks.push(task),
                None => warn!(path = %path.display(), "empty task file skipped"),
            }
        }
        Ok(tasks)
    }

    fn check_tasks(dir: &Path) -> Result<()> {
        let mut failures = 0usize;
        for path in Self::task_files(dir)? {
            match Self::read_task_file(&path) {
                Ok(Some(task)) => println!("ok      {} ({})", task.name(), path.display()),
                Ok(None) => println!("empty   {}", path.display()),
                Err(e) => {
                    failures += 1;
                    println!("invalid {}: {e}", path.display());
                }
            }
        }
        if failures > 0 {
            return Err(SupervisorError::Config(format!(
                "{failures} invalid task file(s) in {}",
                dir.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Mod for TaskDirLoader {
    async fn init_mod(&self, config: &ModConfig) -> Result<()> {
        let dir = Self::task_dir(config);
        fs::create_dir_all(&dir)?;
        info!(task_dir = %dir.display(), "task directory ready");
        Ok(())
    }

    async fn setup_mod(&self, ctx: &mut Context, config: &ModConfig) -> Result<()> {
        let dir = Self::task_dir(config);
        if !dir.is_dir() {
            warn!(task_dir = %dir.display(), "task directory missing; no tasks loaded");
            return Ok(());
        }
        let tasks = Self::load_tasks(&dir)?;
        let count = tasks.len();
        for task in tasks {
            ctx.add_task(task)?;
        }
        info!(task_dir = %dir.display(), count, "tasks loaded");
        Ok(())
    }

    async fn teardown_mod(&self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    fn get_commands(&self, config: &ModConfig) -> HashMap<String, ModCommand> {
        let dir = Self::task_dir(config);
        let check: ModCommand = Arc::new(move |_args: &[String]| Self::check_tasks(&dir));
        HashMap::from([("check-tasks".to_string(), check)])
    }
}
