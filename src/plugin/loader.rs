use std::{collections::BTreeMap, fmt, fs, path::Path, sync::Arc};

use serde::Deserialize;
use tracing::{error, info, warn};

use super::{toml_files, HookTrigger, Mod, ModConfig, ModRegistry, TaskDirLoader, TimeTrigger};
use crate::{error::Result, SupervisorError};

/// Creates a fresh plugin instance of one kind.
pub type ModFactory = Arc<dyn Fn() -> Arc<dyn Mod> + Send + Sync>;

/// One `*.toml` file of a mod directory: which kind of plugin to create, the
/// name to register it under and its configuration.
///
/// ```toml
/// # mods/archive.toml
/// kind = "TaskDirLoader"
/// task_dir = "/srv/archive/tasks"
/// ```
///
/// `name` defaults to the file stem (`archive` above). Every other key,
/// `enable` included, is the plugin's [`ModConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct ModManifest {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub config: ModConfig,
}

impl ModManifest {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SupervisorError::Config(e.to_string()).logged())
    }
}

/// Plugin kinds a mod directory may instantiate, keyed by kind name.
#[derive(Clone, Default)]
pub struct ModCatalog {
    factories: BTreeMap<String, ModFactory>,
}

impl ModCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog knowing the built-in plugins under their `NAME`s.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.factories.insert(
            TaskDirLoader::NAME.to_string(),
            Arc::new(|| Arc::new(TaskDirLoader::new()) as Arc<dyn Mod>),
        );
        catalog.factories.insert(
            TimeTrigger::NAME.to_string(),
            Arc::new(|| Arc::new(TimeTrigger::new()) as Arc<dyn Mod>),
        );
        catalog.factories.insert(
            HookTrigger::NAME.to_string(),
            Arc::new(|| Arc::new(HookTrigger::new()) as Arc<dyn Mod>),
        );
        catalog
    }

    /// Makes `kind` loadable. A kind can only be registered once.
    pub fn register(&mut self, kind: impl Into<String>, factory: ModFactory) -> Result<()> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(SupervisorError::DuplicateMod(kind).logged());
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, kind: &str) -> Result<Arc<dyn Mod>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| SupervisorError::ModNotFound(kind.to_string()).logged())
    }

    /// Instantiates one plugin per manifest in `dir`, in file-name order, and
    /// registers it into `registry`. Returns the manifests' configurations by
    /// registered name.
    ///
    /// Empty files are skipped. Stops at the first unreadable manifest,
    /// unknown kind or name clash.
    pub fn load_dir(
        &self,
        dir: &Path,
        registry: &mut ModRegistry,
    ) -> Result<Vec<(String, ModConfig)>> {
        if !dir.is_dir() {
            return Err(SupervisorError::Config(format!(
                "mod directory {} does not exist",
                dir.display()
            ))
            .logged());
        }
        let mut loaded = Vec::new();
        for path in toml_files(dir)? {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                warn!(path = %path.display(), "empty mod manifest skipped");
                continue;
            }
            let manifest = ModManifest::from_toml_str(&raw).map_err(|e| {
                error!(path = %path.display(), "bad mod manifest: {e}");
                e
            })?;
            let name = match manifest.name {
                Some(name) => name,
                None => path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| manifest.kind.clone()),
            };
            registry.register(name.clone(), self.create(&manifest.kind)?)?;
            info!(mod_name = %name, kind = %manifest.kind, path = %path.display(), "mod loaded");
            loaded.push((name, manifest.config));
        }
        info!(mod_dir = %dir.display(), count = loaded.len(), "mod directory loaded");
        Ok(loaded)
    }
}

impl fmt::Debug for ModCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}
