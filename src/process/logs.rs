use std::path::{Path, PathBuf};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{error::Result, SupervisorError, TaskName};

/// Which child stream a drain is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn default_suffix(self) -> &'static str {
        match self {
            Self::Stdout => "out.log",
            Self::Stderr => "err.log",
        }
    }
}

/// Resolves where a task's stream is appended.
///
/// Without a configured path the file lives at `<log_dir>/<name>/<name>_<suffix>`
/// and its directory is created. A configured relative path is placed under
/// `log_dir`; the parent of a configured path must already exist.
pub(crate) fn resolve_log_file(
    log_dir: &Path,
    task_name: &str,
    configured: Option<&Path>,
    kind: StreamKind,
) -> Result<PathBuf> {
    let Some(configured) = configured else {
        let dir = log_dir.join(task_name);
        std::fs::create_dir_all(&dir)?;
        return Ok(dir.join(format!("{task_name}_{}", kind.default_suffix())));
    };

    let path = if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        log_dir.join(configured)
    };
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            error!(task_name, "log directory {} does not exist", parent.display());
            Err(SupervisorError::DictionaryNotExist(parent.to_path_buf()))
        }
        _ => Ok(path),
    }
}

/// Copies `stream` line by line into `path` and mirrors each line into the
/// supervisor's log, until end of stream or until `token` is cancelled.
pub(crate) async fn drain<R>(
    task_name: TaskName,
    stream: R,
    path: PathBuf,
    kind: StreamKind,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            error!(task_name = %task_name, "couldn't open {}: {e}", path.display());
            None
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = write_line(f, &line).await {
                        warn!(task_name = %task_name, "couldn't write to {}: {e}", path.display());
                    }
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                match kind {
                    StreamKind::Stdout => info!(task_name = %task_name, "[{task_name}] {text}"),
                    StreamKind::Stderr => error!(task_name = %task_name, "[{task_name}] {text}"),
                }
            }
            Err(e) => {
                warn!(task_name = %task_name, "stream closed with error: {e}");
                break;
            }
        }
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}
