pub(crate) mod builder;
pub(crate) mod context;
pub(crate) mod handle;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    error::Result,
    event::Event,
    plugin::{self, ModCommand, ModConfig, ModRegistry},
    process::ProcessExit,
    supervisor::handle::SupervisorHandle,
    TaskName,
};

pub use context::Context;

/// Internal messages delivered to the supervision loop.
#[derive(Debug, Clone)]
pub(crate) enum SupervisedProcessMessage {
    /// Sent by a watcher when its process exits on its own.
    Exited(ProcessExit),
    /// Sent once an auto-restart back-off has elapsed, for the run that failed.
    Restart { task_name: TaskName, generation: u64 },
}

/// Owns a [`Context`] and the plugins to drive through it.
///
/// [`Supervisor::run`] spawns the main loop: plugins are set up,
/// `SYSTEM_SETUP` is published, `HEARTBEAT` ticks until `EXEC_SYSTEM_CLOSE`,
/// then `SYSTEM_TEARDOWN` is published and plugins and context are torn down.
pub struct Supervisor {
    pub(crate) context: Context,
    pub(crate) registry: ModRegistry,
    pub(crate) mod_configs: HashMap<String, ModConfig>,
}

impl Supervisor {
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn registry(&self) -> &ModRegistry {
        &self.registry
    }

    /// Runs `init_mod` for every enabled plugin.
    pub async fn init_mods(&self) -> Result<()> {
        self.registry.init_all(&self.mod_configs).await
    }

    /// Commands contributed by the enabled plugins.
    pub fn commands(&self) -> HashMap<String, ModCommand> {
        self.registry.commands(&self.mod_configs)
    }

    /// Runs the supervisor, consuming it and returning a handle for external control.
    pub fn run(mut self) -> SupervisorHandle {
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        self.context.attach_control(user_rx);
        let handle = tokio::spawn(self.run_and_supervise());
        SupervisorHandle::new(handle, user_tx)
    }

    async fn run_and_supervise(mut self) -> Result<()> {
        let ctx = &mut self.context;
        let mut result = self.registry.setup_all(ctx, &self.mod_configs).await;
        if result.is_ok() {
            result = ctx.publish(Event::SystemSetup);
        }
        if result.is_ok() {
            info!(tasks = ctx.get_all_processes().len(), mods = ?ctx.mod_names(), "supervisor started");
            ctx.entry_loop().await;
            if let Err(e) = ctx.publish(Event::SystemTeardown) {
                error!("SYSTEM_TEARDOWN handler failed: {e}");
            }
        }
        let teardown = plugin::teardown_all(ctx).await;
        ctx.teardown();
        ctx.reap().await;
        info!("supervisor exited");
        result.and(teardown)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("context", &self.context)
            .field("registry", &self.registry)
            .finish()
    }
}
