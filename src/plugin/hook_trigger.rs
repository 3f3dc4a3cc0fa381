use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{Mod, ModConfig};
use crate::{
    error::Result,
    event::{Event, EventKind, HandlerResult, Propagation},
    supervisor::Context,
    task::Task,
    SupervisorError, TaskName,
};

/// Starts tasks in reaction to lifecycle events of other tasks.
///
/// A task declaring `trigger_events = "TASK_FINISH__extract"` is started every
/// time `extract` publishes `TASK_FINISH`.
#[derive(Debug, Clone, Default)]
pub struct HookTrigger {
    hooks: Arc<Mutex<HashMap<(EventKind, TaskName), Vec<TaskName>>>>,
}

impl HookTrigger {
    pub const NAME: &'static str = "HookTrigger";

    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks started when `hook_task` publishes an event of `kind`, in declaration order.
    pub fn hooked_tasks(&self, kind: EventKind, hook_task: &str) -> Vec<TaskName> {
        self.hooks
            .lock()
            .get(&(kind, hook_task.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn register_task(&self, task: &Task) -> Result<()> {
        let mut parsed = Vec::new();
        for (event_name, hook_task) in task.trigger_pairs() {
            let kind: EventKind = event_name.parse().map_err(SupervisorError::logged)?;
            if !EventKind::TASK_LIFECYCLE.contains(&kind) {
                warn!(
                    task_name = task.name(),
                    event = %kind,
                    "hook on an event that never carries a task; it will not fire"
                );
            }
            parsed.push((kind, hook_task.to_string()));
        }

        let mut hooks = self.hooks.lock();
        for key in parsed {
            let targets = hooks.entry(key).or_default();
            if !targets.iter().any(|name| name == task.name()) {
                targets.push(task.name().to_string());
            }
        }
        Ok(())
    }

    fn unregister_task(&self, task_name: &str) {
        let mut hooks = self.hooks.lock();
        hooks.retain(|_, targets| {
            targets.retain(|name| name != task_name);
            !targets.is_empty()
        });
    }

    fn on_lifecycle(&self, ctx: &mut Context, event: &Event) -> HandlerResult {
        let Some(hook_task) = event.task_name() else {
            return Ok(Propagation::Continue);
        };
        let targets = self.hooked_tasks(event.kind(), hook_task);
        let mut first_error = None;
        for target in targets {
            debug!(hook_task, target = %target, event = %event.kind(), "hook fired");
            if let Err(e) = ctx.start_task(&target) {
                error!(hook_task, target = %target, "hooked start failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(Propagation::Continue), Err)
    }
}

#[async_trait]
impl Mod for HookTrigger {
    async fn setup_mod(&self, ctx: &mut Context, _config: &ModConfig) -> Result<()> {
        let this = self.clone();
        ctx.subscribe(EventKind::SystemSetup, move |ctx, _| {
            for process in ctx.get_all_processes().values() {
                this.register_task(process.task())?;
            }
            Ok(Propagation::Continue)
        });
        let this = self.clone();
        ctx.subscribe(EventKind::TaskAdd, move |_, event| {
            if let Some(task) = event.task() {
                this.register_task(task)?;
            }
            Ok(Propagation::Continue)
        });
        let this = self.clone();
        ctx.subscribe(EventKind::TaskDelete, move |_, event| {
            if let Some(task_name) = event.task_name() {
                this.unregister_task(task_name);
            }
            Ok(Propagation::Continue)
        });
        for kind in EventKind::TASK_LIFECYCLE {
            let this = self.clone();
            ctx.subscribe(kind, move |ctx, event| this.on_lifecycle(ctx, event));
        }
        info!("hook trigger ready");
        Ok(())
    }

    async fn teardown_mod(&self, _ctx: &mut Context) -> Result<()> {
        self.hooks.lock().clear();
        Ok(())
    }
}
