use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    config::Config,
    error::Result,
    plugin::{
        HookTrigger, Mod, ModCatalog, ModConfig, ModFactory, ModRegistry, TaskDirLoader,
        TimeTrigger,
    },
    supervisor::{Context, Supervisor},
    task::Task,
};

/// Builds a `Supervisor` instance with configurable parameters.
///
/// Allows customization of the heartbeat interval, log directory, restart
/// back-off, initial tasks and plugins. Plugins come from explicit
/// registrations followed by the manifests of `mod_dir`.
pub struct SupervisorBuilder {
    config: Config,
    tasks: Vec<Task>,
    mods: Vec<(String, Arc<dyn Mod>)>,
    factories: Vec<(String, ModFactory)>,
}

impl SupervisorBuilder {
    /// Creates a new builder with default configuration values.
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            mods: Vec::new(),
            factories: Vec::new(),
        }
    }

    /// Sets the pause between two `HEARTBEAT` events.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Sets the root directory of the per-task log files.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = log_dir.into();
        self
    }

    /// Sets the base delay for auto-restarts, used in exponential backoff.
    pub fn with_restart_base_delay(mut self, delay: Duration) -> Self {
        self.config.restart_base_delay = delay;
        self
    }

    /// Registers a task before the supervisor starts.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_mod(mut self, name: impl Into<String>, plugin: impl Mod) -> Self {
        self.mods.push((name.into(), Arc::new(plugin)));
        self
    }

    /// Adds the task-directory loader, the cron trigger and the hook trigger.
    pub fn with_builtin_mods(self) -> Self {
        self.with_mod(TaskDirLoader::NAME, TaskDirLoader::new())
            .with_mod(TimeTrigger::NAME, TimeTrigger::new())
            .with_mod(HookTrigger::NAME, HookTrigger::new())
    }

    /// Overrides the configuration of plugin `name`, including one loaded from `mod_dir`.
    pub fn with_mod_config(mut self, name: impl Into<String>, config: ModConfig) -> Self {
        self.config.mods.insert(name.into(), config);
        self
    }

    /// Scans `dir` for plugin manifests at build time.
    pub fn with_mod_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.mod_dir = Some(dir.into());
        self
    }

    /// Lets `mod_dir` manifests instantiate plugins of `kind`, next to the
    /// built-in kinds.
    pub fn with_mod_factory<F, M>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Mod,
    {
        let factory: ModFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Mod>);
        self.factories.push((kind.into(), factory));
        self
    }

    /// Constructs the `Supervisor`. Fails on a duplicate plugin, kind or task
    /// name, or on an unusable `mod_dir`.
    pub fn build(mut self) -> Result<Supervisor> {
        let mut registry = ModRegistry::new();
        for (name, plugin) in self.mods {
            registry.register(name, plugin)?;
        }
        if let Some(dir) = &self.config.mod_dir {
            let mut catalog = ModCatalog::with_builtin();
            for (kind, factory) in self.factories {
                catalog.register(kind, factory)?;
            }
            for (name, config) in catalog.load_dir(dir, &mut registry)? {
                self.config.mods.entry(name).or_insert(config);
            }
        }
        let mut context = Context::new(&self.config);
        for task in self.tasks {
            context.add_task(task)?;
        }
        Ok(Supervisor {
            context,
            registry,
            mod_configs: self.config.mods,
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
