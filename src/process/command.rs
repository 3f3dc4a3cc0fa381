use std::path::{Path, PathBuf};

use crate::{error::Result, task::Task, SupervisorError};

/// Directories searched for a command given without a path separator.
pub const SEARCH_PATH: [&str; 3] = ["/bin", "/usr/bin", "/usr/local/bin"];

/// Set to `1` in the environment of every supervised child.
pub const SUPERVISOR_MARKER_ENV: &str = "PROCESS_SUPERVISOR_ENABLED";

/// Everything needed to spawn a task's process.
#[derive(Debug)]
pub(crate) struct LaunchSpec {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) directory: Option<PathBuf>,
    pub(crate) env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub(crate) fn prepare(task: &Task) -> Result<Self> {
        let directory = working_directory(task)?;
        let Some(command) = task.command() else {
            return Err(SupervisorError::run(format!(
                "no command for task `{}`",
                task.name()
            )));
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(SupervisorError::run(format!(
                "empty command for task `{}`",
                task.name()
            )));
        };
        let program = resolve_executable(program, directory.as_deref(), &SEARCH_PATH)?;

        let mut env = vec![(SUPERVISOR_MARKER_ENV.to_string(), "1".to_string())];
        env.extend(task.environment_pairs());

        Ok(Self {
            program,
            args: parts.map(str::to_string).collect(),
            directory,
            env,
        })
    }
}

fn working_directory(task: &Task) -> Result<Option<PathBuf>> {
    let Some(dir) = task.directory() else {
        return Ok(None);
    };
    if !dir.is_dir() {
        return Err(SupervisorError::run(format!(
            "couldn't chdir to {}: not a directory",
            dir.display()
        )));
    }
    Ok(Some(dir.to_path_buf()))
}

/// Resolves `program` to an existing file. A name with a path separator is used
/// as-is (relative to `directory` when given); a bare name is looked up in `search`.
pub(crate) fn resolve_executable(
    program: &str,
    directory: Option<&Path>,
    search: &[&str],
) -> Result<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        let path = match directory {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if path.exists() {
            return Ok(path);
        }
        return Err(SupervisorError::run(format!(
            "command `{}` not found",
            path.display()
        )));
    }
    search
        .iter()
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            SupervisorError::run(format!(
                "command `{program}` not found in {}; give a path containing '/'",
                search.join(":")
            ))
        })
}
