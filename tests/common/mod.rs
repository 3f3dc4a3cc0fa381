use std::{
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use process_supervisor::{
    Config, Context, Event, EventKind, Mod, ModConfig, Propagation, SupervisorError, Task,
};
use tempfile::TempDir;

// Helper function to create a context logging under a fresh temp dir
#[allow(unused)]
pub fn create_context() -> (Context, TempDir) {
    let logs = tempfile::tempdir().unwrap();
    let ctx = Context::new(&test_config(logs.path()));
    (ctx, logs)
}

#[allow(unused)]
pub fn test_config(log_dir: &Path) -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(20),
        log_dir: log_dir.to_path_buf(),
        restart_base_delay: Duration::from_millis(10),
        ..Config::default()
    }
}

#[allow(unused)]
pub fn task(name: &str, command: &str) -> Task {
    Task::builder(name).command(command).build().unwrap()
}

#[allow(unused)]
/// Records `(kind, task_name)` for every event it is attached to.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<(EventKind, Option<String>)>>>);

#[allow(unused)]
impl EventLog {
    pub fn attach(&self, ctx: &mut Context) {
        for kind in EventKind::ALL {
            let log = self.clone();
            ctx.subscribe(kind, move |_, event| {
                log.0
                    .lock()
                    .push((event.kind(), event.task_name().map(str::to_string)));
                Ok(Propagation::Continue)
            });
        }
    }

    pub fn count(&self, kind: EventKind, task_name: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|(k, name)| *k == kind && name.as_deref() == Some(task_name))
            .count()
    }

    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.0.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Kinds published for `task_name`, in publish order, ignoring heartbeats.
    pub fn kinds_for(&self, task_name: &str) -> Vec<EventKind> {
        self.0
            .lock()
            .iter()
            .filter(|(_, name)| name.as_deref() == Some(task_name))
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn system_kinds(&self) -> Vec<EventKind> {
        self.0
            .lock()
            .iter()
            .filter(|(kind, name)| name.is_none() && *kind != EventKind::Heartbeat)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Runs the supervision loop until `done` holds at a heartbeat, then closes it.
/// A context can only be driven once this way since closing is final.
#[allow(unused)]
pub async fn run_until<F>(ctx: &mut Context, limit: Duration, done: F)
where
    F: Fn(&Context) -> bool + Send + Sync + 'static,
{
    ctx.subscribe(EventKind::Heartbeat, move |ctx, _| {
        if !ctx.is_closing() && done(ctx) {
            ctx.publish(Event::ExecSystemClose)?;
        }
        Ok(Propagation::Continue)
    });
    tokio::time::timeout(limit, ctx.entry_loop())
        .await
        .expect("condition not reached before the time limit");
}

/// Polls `check` until it holds or `limit` elapses.
#[allow(unused)]
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// True while `pid` is a live (non-zombie) process.
#[allow(unused)]
pub fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[allow(unused)]
/// A plugin that records every event it sees and counts its lifecycle calls.
#[derive(Clone, Default)]
pub struct RecorderMod {
    pub events: EventLog,
    pub inits: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Mod for RecorderMod {
    async fn init_mod(&self, _config: &ModConfig) -> process_supervisor::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn setup_mod(
        &self,
        ctx: &mut Context,
        _config: &ModConfig,
    ) -> process_supervisor::Result<()> {
        self.events.attach(ctx);
        Ok(())
    }

    async fn teardown_mod(&self, _ctx: &mut Context) -> process_supervisor::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[allow(unused)]
/// A plugin whose setup, or teardown, fails.
#[derive(Clone, Default)]
pub struct FailingMod {
    pub fail_setup: bool,
    pub fail_teardown: bool,
    pub setups: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Mod for FailingMod {
    async fn setup_mod(
        &self,
        _ctx: &mut Context,
        _config: &ModConfig,
    ) -> process_supervisor::Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(SupervisorError::Config("setup refused".into()));
        }
        Ok(())
    }

    async fn teardown_mod(&self, _ctx: &mut Context) -> process_supervisor::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(SupervisorError::Config("teardown refused".into()));
        }
        Ok(())
    }
}
