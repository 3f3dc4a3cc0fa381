use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{Mod, ModConfig};
use crate::{
    error::Result,
    event::{EventKind, Propagation},
    supervisor::Context,
    task::Task,
    TaskName,
};

#[derive(Debug, Clone)]
struct Scheduled {
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Local>>,
}

/// Starts tasks carrying a `cron_expression` when a heartbeat reaches their
/// next fire time.
///
/// Schedules are seeded from the moment a task becomes known, so missed
/// occurrences from before a supervisor restart are never replayed. Within a
/// run, a due task that is not running is started once per heartbeat and its
/// next fire time moves to the occurrence after the one just used.
#[derive(Debug, Clone, Default)]
pub struct TimeTrigger {
    schedules: Arc<Mutex<BTreeMap<TaskName, Scheduled>>>,
}

impl TimeTrigger {
    pub const NAME: &'static str = "TimeTrigger";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_fire_time(&self, task_name: &str) -> Option<DateTime<Local>> {
        self.schedules
            .lock()
            .get(task_name)
            .and_then(|scheduled| scheduled.next_fire)
    }

    pub fn scheduled_tasks(&self) -> Vec<TaskName> {
        self.schedules.lock().keys().cloned().collect()
    }

    fn schedule_task(&self, task: &Task, after: DateTime<Local>) -> Result<()> {
        let Some(schedule) = task.schedule()? else {
            return Ok(());
        };
        let next_fire = schedule.after(&after).next();
        debug!(task_name = task.name(), ?next_fire, "task scheduled");
        self.schedules.lock().insert(
            task.name().to_string(),
            Scheduled {
                schedule,
                next_fire,
            },
        );
        Ok(())
    }

    fn unschedule(&self, task_name: &str) {
        if self.schedules.lock().remove(task_name).is_some() {
            debug!(task_name, "task unscheduled");
        }
    }

    /// Starts every due task that is not running and advances its schedule.
    /// Returns the first start error once every due task has been handled.
    pub fn on_heartbeat(&self, ctx: &mut Context, now: DateTime<Local>) -> Result<()> {
        let due: Vec<(TaskName, DateTime<Local>)> = self
            .schedules
            .lock()
            .iter()
            .filter_map(|(name, scheduled)| {
                let fire = scheduled.next_fire?;
                (fire <= now && !ctx.is_running(name)).then(|| (name.clone(), fire))
            })
            .collect();

        let mut first_error = None;
        for (task_name, fire) in due {
            info!(task_name = %task_name, %fire, "cron fire");
            if let Err(e) = ctx.start_task(&task_name) {
                error!(task_name = %task_name, "scheduled start failed: {e}");
                first_error.get_or_insert(e);
            }
            if let Some(scheduled) = self.schedules.lock().get_mut(&task_name) {
                scheduled.next_fire = scheduled.schedule.after(&fire).next();
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Mod for TimeTrigger {
    async fn setup_mod(&self, ctx: &mut Context, _config: &ModConfig) -> Result<()> {
        let now = Local::now();
        for process in ctx.get_all_processes().values() {
            self.schedule_task(process.task(), now)?;
        }

        let this = self.clone();
        ctx.subscribe(EventKind::TaskAdd, move |_, event| {
            if let Some(task) = event.task() {
                this.schedule_task(task, Local::now())?;
            }
            Ok(Propagation::Continue)
        });
        let this = self.clone();
        ctx.subscribe(EventKind::TaskDelete, move |_, event| {
            if let Some(task_name) = event.task_name() {
                this.unschedule(task_name);
            }
            Ok(Propagation::Continue)
        });
        let this = self.clone();
        ctx.subscribe(EventKind::Heartbeat, move |ctx, event| {
            this.on_heartbeat(ctx, event.now().unwrap_or_else(Local::now))?;
            Ok(Propagation::Continue)
        });
        info!(scheduled = self.schedules.lock().len(), "time trigger ready");
        Ok(())
    }

    async fn teardown_mod(&self, _ctx: &mut Context) -> Result<()> {
        self.schedules.lock().clear();
        Ok(())
    }
}
