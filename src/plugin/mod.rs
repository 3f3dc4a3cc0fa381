//! Optional components attached to the supervisor's event stream.
//!
//! A plugin ("mod") implements [`Mod`] and is registered under a unique name
//! in a [`ModRegistry`]. The registry drives every enabled plugin through the
//! same lifecycle: `init_mod` once at installation time, `setup_mod` before the
//! main loop starts and `teardown_mod` after it ends.

pub mod hook_trigger;
pub mod loader;
pub mod task_loader;
pub mod time_trigger;

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::{error::Result, supervisor::Context, SupervisorError};

pub use hook_trigger::HookTrigger;
pub use loader::{ModCatalog, ModFactory, ModManifest};
pub use task_loader::TaskDirLoader;
pub use time_trigger::TimeTrigger;

/// A named callable a plugin contributes to the command-line surface.
pub type ModCommand = Arc<dyn Fn(&[String]) -> Result<()> + Send + Sync>;

/// Capability contract for plugins.
///
/// Plugins keep their state behind `&self` (typically `Arc<Mutex<_>>`) because
/// the event handlers they subscribe share it.
#[async_trait]
pub trait Mod: Send + Sync + 'static {
    /// Materializes persistent resources (directories, schemas...) once, before
    /// any supervisor runs.
    async fn init_mod(&self, _config: &ModConfig) -> Result<()> {
        Ok(())
    }

    /// Subscribes handlers and loads state. Runs before `SYSTEM_SETUP`.
    async fn setup_mod(&self, ctx: &mut Context, config: &ModConfig) -> Result<()>;

    /// Releases what `setup_mod` acquired. Runs after `SYSTEM_TEARDOWN`.
    async fn teardown_mod(&self, ctx: &mut Context) -> Result<()>;

    fn get_commands(&self, _config: &ModConfig) -> HashMap<String, ModCommand> {
        HashMap::new()
    }
}

/// Per-plugin configuration: the `enable` switch plus free-form options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModConfig {
    #[serde(default = "enabled")]
    pub enable: bool,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

fn enabled() -> bool {
    true
}

impl Default for ModConfig {
    fn default() -> Self {
        Self {
            enable: true,
            options: Map::new(),
        }
    }
}

impl ModConfig {
    pub fn disabled() -> Self {
        Self {
            enable: false,
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }
}

/// Explicit name → plugin table, iterated in registration order.
#[derive(Default, Clone)]
pub struct ModRegistry {
    mods: Vec<(String, Arc<dyn Mod>)>,
}

impl ModRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under `name`. A second plugin under an existing name
    /// is rejected and the first one stays bound.
    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn Mod>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(SupervisorError::DuplicateMod(name).logged());
        }
        self.mods.push((name, plugin));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mods.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Mod>> {
        self.mods
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, plugin)| plugin.clone())
    }

    pub fn names(&self) -> Vec<&str> {
        self.mods.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    fn enabled<'a>(
        &'a self,
        configs: &'a HashMap<String, ModConfig>,
    ) -> impl Iterator<Item = (&'a str, &'a Arc<dyn Mod>, ModConfig)> + 'a {
        self.mods.iter().filter_map(move |(name, plugin)| {
            let config = configs.get(name).cloned().unwrap_or_default();
            if !config.enable {
                info!(mod_name = %name, "mod not enabled; skipped");
                return None;
            }
            Some((name.as_str(), plugin, config))
        })
    }

    /// Runs `init_mod` for every enabled plugin. Stops at the first failure.
    pub async fn init_all(&self, configs: &HashMap<String, ModConfig>) -> Result<()> {
        let started = Instant::now();
        for (name, plugin, config) in self.enabled(configs) {
            info!(mod_name = name, "mod init start");
            plugin.init_mod(&config).await.map_err(|e| {
                error!(mod_name = name, "mod init failed: {e}");
                e
            })?;
            info!(mod_name = name, "mod init finish");
        }
        info!(elapsed = ?started.elapsed(), "all mods initialized");
        Ok(())
    }

    /// Binds every enabled plugin into `ctx` and runs its `setup_mod`.
    /// Stops at the first failure; later plugins are neither bound nor set up.
    pub async fn setup_all(
        &self,
        ctx: &mut Context,
        configs: &HashMap<String, ModConfig>,
    ) -> Result<()> {
        let started = Instant::now();
        for (name, plugin, config) in self.enabled(configs) {
            ctx.add_mod(name, plugin.clone())?;
            info!(mod_name = name, "mod setup start");
            plugin.setup_mod(ctx, &config).await.map_err(|e| {
                error!(mod_name = name, "mod setup failed: {e}");
                e
            })?;
            info!(mod_name = name, "mod setup finish");
        }
        info!(elapsed = ?started.elapsed(), "all mods set up");
        Ok(())
    }

    /// Commands contributed by the enabled plugins. Later plugins win on name clashes.
    pub fn commands(&self, configs: &HashMap<String, ModConfig>) -> HashMap<String, ModCommand> {
        let mut commands = HashMap::new();
        for (name, plugin, config) in self.enabled(configs) {
            let contributed = plugin.get_commands(&config);
            if !contributed.is_empty() {
                info!(mod_name = name, commands = ?contributed.keys().collect::<Vec<_>>(), "mod commands loaded");
            }
            commands.extend(contributed);
        }
        commands
    }
}

impl fmt::Debug for ModRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModRegistry")
            .field("mods", &self.names())
            .finish()
    }
}

/// Every `*.toml` file in `dir`, sorted by path.
pub(crate) fn toml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Runs `teardown_mod` for every plugin bound into `ctx`, in binding order.
/// Every plugin is torn down even if an earlier one fails; the first error is returned.
pub async fn teardown_all(ctx: &mut Context) -> Result<()> {
    let started = Instant::now();
    let mut first_error = None;
    for (name, plugin) in ctx.mods() {
        info!(mod_name = %name, "mod teardown start");
        match plugin.teardown_mod(ctx).await {
            Ok(()) => info!(mod_name = %name, "mod teardown finish"),
            Err(e) => {
                error!(mod_name = %name, "mod teardown failed: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    info!(elapsed = ?started.elapsed(), "all mods torn down");
    first_error.map_or(Ok(()), Err)
}
