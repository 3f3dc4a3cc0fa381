//! # process-supervisor
//!
//! `process-supervisor` launches, watches and restarts named child processes
//! ("tasks"), and exposes their lifecycle on a synchronous event bus that
//! plugins subscribe to.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use process_supervisor::{SupervisorBuilder, Task};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = SupervisorBuilder::new()
//!         .with_log_dir("/tmp/process-supervisor")
//!         .with_builtin_mods()
//!         .with_task(
//!             Task::builder("ticker")
//!                 .command("date")
//!                 .cron_expression("*/10 * * * * *")
//!                 .build()?,
//!         )
//!         .build()?;
//!
//!     let handle = supervisor.run();
//!     handle.start_task("ticker").await?;
//!     handle.wait().await?;   // returns after `shutdown()`
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Process lifecycle** – each task's child runs in its own process group,
//!   its stdout/stderr land in per-task log files, and its exit is reported
//!   without polling.
//! * **Event bus** – `TASK_ADD`, `TASK_RUNNING`, `TASK_FINISH`, `HEARTBEAT`, …
//!   are delivered to subscribers in order; handlers may call back into the
//!   [`Context`].
//! * **Plugins** – anything implementing [`Mod`]. Built in: [`TimeTrigger`]
//!   (cron), [`HookTrigger`] (start B when A finishes) and [`TaskDirLoader`].
//!   A `mod_dir` of TOML manifests instantiates plugins by kind through a
//!   [`ModCatalog`].
//! * **Automatic restarts** – `auto_restart` tasks are relaunched after a
//!   nonzero exit with exponential back-off.
//!
//! ## API overview
//!
//! | SupervisorHandle method         | Purpose                                   |
//! | ------------------------------- | ----------------------------------------- |
//! | `add_task(task).await`          | Register a task while running             |
//! | `start_task(name).await`        | Start its process                         |
//! | `stop_task(name).await`         | Kill its process                          |
//! | `restart_task(name).await`      | Stop then start                           |
//! | `delete_task(name).await`       | Stop and forget it                        |
//! | `get_process(name).await`       | Return a `ProcessInfo` snapshot           |
//! | `get_all_processes().await`     | Snapshots of every task                   |
//! | `shutdown()`                    | Stop every process and exit the loop      |

pub use config::Config;
pub use error::{Result, SupervisorError};
pub use event::{Event, EventBus, EventKind, Propagation};
pub use plugin::{
    HookTrigger, Mod, ModCatalog, ModCommand, ModConfig, ModFactory, ModManifest, ModRegistry,
    TaskDirLoader, TimeTrigger,
};
pub use process::{ManagedProcess, ProcessInfo, ProcessState, SEARCH_PATH, SUPERVISOR_MARKER_ENV};
pub use supervisor::{
    builder::SupervisorBuilder,
    handle::{SupervisorHandle, SupervisorHandleError},
    Context, Supervisor,
};
pub use task::{Task, TaskBuilder};

mod config;
mod error;
pub mod event;
pub mod plugin;
mod process;
mod supervisor;
mod task;

pub type TaskName = String;
