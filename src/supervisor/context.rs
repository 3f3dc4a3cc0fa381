use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Local;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{handle::SupervisorMessage, SupervisedProcessMessage};
use crate::{
    config::Config,
    error::Result,
    event::{bus::dispatch, Event, EventBus, EventKind, HandlerResult, Propagation},
    plugin::Mod,
    process::{ManagedProcess, ProcessExit, ProcessInfo, ProcessState},
    task::Task,
    SupervisorError, TaskName,
};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// The aggregate root of a supervisor: the event bus, the task/process
/// registry and the bound plugins.
///
/// Every process is in `all` and in exactly one of `running` / `stopped`,
/// except while its own start is being published. All operations are
/// synchronous and run on the supervision loop (or, before the loop starts,
/// on whoever owns the context), so handlers can call back into the context
/// they receive.
pub struct Context {
    bus: EventBus<Context>,
    processes: BTreeMap<TaskName, ManagedProcess>,
    running: BTreeSet<TaskName>,
    stopped: BTreeSet<TaskName>,
    mods: Vec<(String, Arc<dyn Mod>)>,
    loop_enabled: bool,
    closing: bool,
    heartbeat_interval: Duration,
    log_dir: PathBuf,
    restart_base_delay: Duration,
    tx: mpsc::UnboundedSender<SupervisedProcessMessage>,
    rx: mpsc::UnboundedReceiver<SupervisedProcessMessage>,
    control_rx: Option<mpsc::UnboundedReceiver<SupervisorMessage>>,
    /// Watchers of stopped processes that may not have killed their group yet.
    stopping: Vec<JoinHandle<()>>,
}

impl Context {
    pub fn new(config: &Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::ExecSystemClose, |ctx: &mut Context, _: &Event| {
            ctx.close()?;
            Ok(Propagation::Continue)
        });
        Self {
            bus,
            processes: BTreeMap::new(),
            running: BTreeSet::new(),
            stopped: BTreeSet::new(),
            mods: Vec::new(),
            loop_enabled: false,
            closing: false,
            heartbeat_interval: config.heartbeat_interval,
            log_dir: config.log_dir.clone(),
            restart_base_delay: config.restart_base_delay,
            tx,
            rx,
            control_rx: None,
            stopping: Vec::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// True between the start of [`Context::entry_loop`] and the handling of `EXEC_SYSTEM_CLOSE`.
    pub fn is_loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn event_bus(&self) -> &EventBus<Context> {
        &self.bus
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut Context, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler);
    }

    /// Delivers `event` to its subscribers, in subscription order, before returning.
    pub fn publish(&mut self, event: Event) -> Result<()> {
        let handlers = self.bus.listeners(event.kind());
        debug!(
            event = %event.kind(),
            task_name = event.task_name().unwrap_or_default(),
            handlers = handlers.len(),
            "publish"
        );
        dispatch(&handlers, self, &event)
    }

    /// Registers `task` in state `stopped` and publishes `TASK_ADD`.
    ///
    /// If a subscriber rejects `TASK_ADD` the task is deleted again (publishing
    /// `TASK_DELETE`, so plugins that already picked it up drop it) and the
    /// subscriber's error is returned.
    pub fn add_task(&mut self, task: Task) -> Result<&ManagedProcess> {
        task.validate()?;
        let task_name = task.name().to_string();
        if self.processes.contains_key(&task_name) {
            return Err(SupervisorError::DuplicateTaskName(task_name).logged());
        }

        let mut process = ManagedProcess::new(task.clone(), self.log_dir.clone(), self.tx.clone());
        process.mark(ProcessState::Stopped);
        let info = process.info();
        self.processes.insert(task_name.clone(), process);
        self.stopped.insert(task_name.clone());
        info!(task_name = %task_name, "task added");

        if let Err(e) = self.publish(Event::TaskAdd {
            task_name: task_name.clone(),
            task,
            process: info,
        }) {
            warn!(task_name = %task_name, "TASK_ADD rejected; rolling back: {e}");
            if let Err(rollback) = self.delete_task(&task_name) {
                error!(task_name = %task_name, "rollback of rejected task failed: {rollback}");
            }
            return Err(e);
        }
        self.get_process(&task_name)
    }

    /// Removes a task, killing its process first if it runs. No-op for unknown names.
    pub fn delete_task(&mut self, task_name: &str) -> Result<()> {
        let Some(mut process) = self.processes.remove(task_name) else {
            debug!(task_name, "unknown task; delete ignored");
            return Ok(());
        };
        self.running.remove(task_name);
        self.stopped.remove(task_name);
        let watcher = process.stop();
        self.track_stopping(watcher);
        let event = Event::TaskDelete {
            task_name: task_name.to_string(),
            task: process.task().clone(),
            process: process.info(),
        };
        drop(process);
        info!(task_name, "task deleted");
        self.publish(event)
    }

    /// Starts the task's process. No-op if it is already running.
    pub fn start_task(&mut self, task_name: &str) -> Result<()> {
        self.start_inner(task_name, true)
    }

    fn start_inner(&mut self, task_name: &str, reset_attempts: bool) -> Result<()> {
        let Some(process) = self.processes.get(task_name) else {
            return Err(SupervisorError::TaskNotFound(task_name.to_string()).logged());
        };
        if self.closing {
            debug!(task_name, "supervisor closing; start ignored");
            return Ok(());
        }
        if self.running.contains(task_name) {
            debug!(task_name, "already running; start ignored");
            return Ok(());
        }
        if !self.stopped.remove(task_name) {
            debug!(task_name, "start already in progress; start ignored");
            return Ok(());
        }

        let pre_start = Event::TaskPreStart {
            task_name: task_name.to_string(),
            task: process.task().clone(),
            process: process.info(),
        };
        if let Err(e) = self.publish(pre_start) {
            if self.processes.contains_key(task_name) {
                self.stopped.insert(task_name.to_string());
            }
            return Err(e);
        }

        let Some(process) = self.processes.get_mut(task_name) else {
            return Err(SupervisorError::TaskNotFound(task_name.to_string()).logged());
        };
        if reset_attempts {
            process.restart_attempts = 0;
        }
        if let Err(e) = process.start() {
            self.stopped.insert(task_name.to_string());
            return Err(e);
        }
        let running = Event::TaskRunning {
            task_name: task_name.to_string(),
            task: process.task().clone(),
            process: process.info(),
        };
        self.running.insert(task_name.to_string());
        self.publish(running)
    }

    /// Kills the task's process. No-op if it is not running.
    pub fn stop_task(&mut self, task_name: &str) -> Result<()> {
        let Some(process) = self.processes.get_mut(task_name) else {
            return Err(SupervisorError::TaskNotFound(task_name.to_string()).logged());
        };
        if !self.running.remove(task_name) {
            debug!(task_name, "not running; stop ignored");
            return Ok(());
        }
        process.restart_attempts = 0;
        let watcher = process.stop();
        let event = Event::TaskStop {
            task_name: task_name.to_string(),
            task: process.task().clone(),
            process: process.info(),
        };
        self.track_stopping(watcher);
        self.stopped.insert(task_name.to_string());
        self.publish(event)
    }

    pub fn restart_task(&mut self, task_name: &str) -> Result<()> {
        self.stop_task(task_name)?;
        self.start_task(task_name)
    }

    pub fn get_process(&self, task_name: &str) -> Result<&ManagedProcess> {
        self.processes
            .get(task_name)
            .ok_or_else(|| SupervisorError::TaskNotFound(task_name.to_string()).logged())
    }

    pub fn get_all_processes(&self) -> &BTreeMap<TaskName, ManagedProcess> {
        &self.processes
    }

    pub fn get_running_processes(&self) -> Vec<&ManagedProcess> {
        self.running
            .iter()
            .filter_map(|name| self.processes.get(name))
            .collect()
    }

    pub fn get_stopped_processes(&self) -> Vec<&ManagedProcess> {
        self.stopped
            .iter()
            .filter_map(|name| self.processes.get(name))
            .collect()
    }

    pub fn is_running(&self, task_name: &str) -> bool {
        self.running.contains(task_name)
    }

    /// Snapshot of every process, keyed by task name.
    pub fn snapshot(&self) -> BTreeMap<TaskName, ProcessInfo> {
        self.processes
            .iter()
            .map(|(name, process)| (name.clone(), process.info()))
            .collect()
    }

    pub fn add_mod(&mut self, name: impl Into<String>, plugin: Arc<dyn Mod>) -> Result<()> {
        let name = name.into();
        if self.mods.iter().any(|(n, _)| *n == name) {
            return Err(SupervisorError::DuplicateMod(name).logged());
        }
        info!(mod_name = %name, "mod bound");
        self.mods.push((name, plugin));
        Ok(())
    }

    pub fn get_mod(&self, name: &str) -> Result<Arc<dyn Mod>> {
        self.mods
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, plugin)| plugin.clone())
            .ok_or_else(|| SupervisorError::ModNotFound(name.to_string()).logged())
    }

    pub fn mod_names(&self) -> Vec<&str> {
        self.mods.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub(crate) fn mods(&self) -> Vec<(String, Arc<dyn Mod>)> {
        self.mods.clone()
    }

    pub(crate) fn attach_control(&mut self, rx: mpsc::UnboundedReceiver<SupervisorMessage>) {
        self.control_rx = Some(rx);
    }

    /// Kills every process that still runs. Publishes nothing.
    pub fn teardown(&mut self) {
        self.closing = true;
        self.loop_enabled = false;
        let running = std::mem::take(&mut self.running);
        for name in running {
            if let Some(process) = self.processes.get_mut(&name) {
                let watcher = process.stop();
                self.track_stopping(watcher);
            }
            self.stopped.insert(name);
        }
        info!("context torn down");
    }

    /// Waits until every stopped process has been killed and reaped.
    pub async fn reap(&mut self) {
        for watcher in std::mem::take(&mut self.stopping) {
            if let Err(e) = watcher.await {
                warn!("process watcher failed: {e}");
            }
        }
    }

    fn track_stopping(&mut self, watcher: Option<JoinHandle<()>>) {
        self.stopping.retain(|watcher| !watcher.is_finished());
        self.stopping.extend(watcher);
    }

    /// Publishes `HEARTBEAT` every interval and applies process exit reports and
    /// control requests, until `EXEC_SYSTEM_CLOSE` has been handled.
    pub async fn entry_loop(&mut self) {
        self.loop_enabled = true;
        let mut ticker = tokio::time::interval(self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.heartbeat_interval, "supervision loop started");

        while self.loop_enabled {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat();
                },
                Some(internal_msg) = self.rx.recv() => {
                    match internal_msg {
                        SupervisedProcessMessage::Exited(exit) => self.handle_exit(exit),
                        SupervisedProcessMessage::Restart { task_name, generation } => {
                            self.handle_restart(&task_name, generation)
                        }
                    }
                },
                Some(user_msg) = recv_control(&mut self.control_rx) => {
                    self.handle_control_message(user_msg);
                },
            }
        }
        info!("supervision loop stopped");
    }

    fn heartbeat(&mut self) {
        if let Err(e) = self.publish(Event::heartbeat(Local::now())) {
            error!(error = e.as_label(), "heartbeat handler failed: {e}");
        }
    }

    /// Stops everything that runs, publishes `SYSTEM_CLOSE` and ends the loop.
    fn close(&mut self) -> Result<()> {
        info!("closing supervisor");
        self.closing = true;
        let running: Vec<TaskName> = self.running.iter().cloned().collect();
        for task_name in running {
            if let Err(e) = self.stop_task(&task_name) {
                warn!(task_name = %task_name, "stop during close failed: {e}");
            }
        }
        let result = self.publish(Event::SystemClose);
        self.loop_enabled = false;
        result
    }

    /// Applies a watcher report and publishes the matching completion event.
    pub(crate) fn handle_exit(&mut self, exit: ProcessExit) {
        let task_name = exit.task_name.clone();
        let Some(process) = self.processes.get_mut(&task_name) else {
            debug!(task_name = %task_name, "exit report for a deleted task");
            return;
        };
        let Some(state) = process.record_exit(&exit) else {
            return;
        };
        let generation = exit.generation;
        let restart_delay = if state == ProcessState::ExitError
            && process.task().auto_restart()
            && !self.closing
        {
            if process.has_exceeded_max_retries() {
                warn!(
                    task_name = %task_name,
                    attempts = process.restart_attempts,
                    "restart retries exhausted"
                );
                None
            } else {
                let delay = process.restart_delay(self.restart_base_delay);
                process.restart_attempts = process.restart_attempts.saturating_add(1);
                Some(delay)
            }
        } else {
            None
        };
        self.running.remove(&task_name);
        self.stopped.insert(task_name.clone());

        if state == ProcessState::ExitNormal {
            if let Err(e) = self.publish(Event::TaskFinish {
                task_name: task_name.clone(),
            }) {
                error!(task_name = %task_name, "TASK_FINISH handler failed: {e}");
                if let Err(e) = self.publish(Event::TaskFinishError {
                    task_name: task_name.clone(),
                }) {
                    error!(task_name = %task_name, "TASK_FINISH_ERROR handler failed: {e}");
                }
            }
        } else if let Err(e) = self.publish(Event::TaskRunningError {
            task_name: task_name.clone(),
            exit_code: exit.exit_code,
        }) {
            error!(task_name = %task_name, "TASK_RUNNING_ERROR handler failed: {e}");
        }

        if let Some(delay) = restart_delay {
            info!(task_name = %task_name, ?delay, "scheduling restart");
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(SupervisedProcessMessage::Restart {
                    task_name,
                    generation,
                });
            });
        }
    }

    /// Auto-restart of a task that exited with an error, unless something else
    /// touched it in the meantime. `generation` is the run whose exit scheduled
    /// the restart; a newer run (even one that failed again) cancels it.
    fn handle_restart(&mut self, task_name: &str, generation: u64) {
        let Some(process) = self.processes.get(task_name) else {
            return;
        };
        if process.generation() != generation || process.state() != ProcessState::ExitError {
            debug!(
                task_name,
                generation,
                current = process.generation(),
                state = %process.state(),
                "restart no longer needed"
            );
            return;
        }
        if let Err(e) = self.start_inner(task_name, false) {
            error!(task_name, "auto-restart failed: {e}");
        }
    }

    fn handle_control_message(&mut self, msg: SupervisorMessage) {
        match msg {
            SupervisorMessage::AddTask(task, reply) => {
                let result = self.add_task(task).map(ManagedProcess::info);
                let _ = reply.send(result);
            }
            SupervisorMessage::StartTask(task_name, reply) => {
                let _ = reply.send(self.start_task(&task_name));
            }
            SupervisorMessage::StopTask(task_name, reply) => {
                let _ = reply.send(self.stop_task(&task_name));
            }
            SupervisorMessage::RestartTask(task_name, reply) => {
                let _ = reply.send(self.restart_task(&task_name));
            }
            SupervisorMessage::DeleteTask(task_name, reply) => {
                let _ = reply.send(self.delete_task(&task_name));
            }
            SupervisorMessage::GetProcess(task_name, reply) => {
                let _ = reply.send(self.get_process(&task_name).map(ManagedProcess::info));
            }
            SupervisorMessage::GetAllProcesses(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SupervisorMessage::Shutdown => {
                if let Err(e) = self.publish(Event::ExecSystemClose) {
                    error!("EXEC_SYSTEM_CLOSE handler failed: {e}");
                }
            }
        }
    }
}

async fn recv_control(
    rx: &mut Option<mpsc::UnboundedReceiver<SupervisorMessage>>,
) -> Option<SupervisorMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("running", &self.running)
            .field("stopped", &self.stopped)
            .field("mods", &self.mod_names())
            .field("loop_enabled", &self.loop_enabled)
            .field("closing", &self.closing)
            .finish_non_exhaustive()
    }
}
