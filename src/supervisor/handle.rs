use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::{error::Result, process::ProcessInfo, task::Task, SupervisorError, TaskName};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent from a [`SupervisorHandle`] to the supervision loop.
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    AddTask(Task, Reply<ProcessInfo>),
    StartTask(TaskName, Reply<()>),
    StopTask(TaskName, Reply<()>),
    RestartTask(TaskName, Reply<()>),
    DeleteTask(TaskName, Reply<()>),
    GetProcess(TaskName, Reply<ProcessInfo>),
    GetAllProcesses(oneshot::Sender<BTreeMap<TaskName, ProcessInfo>>),
    /// Publishes `EXEC_SYSTEM_CLOSE` inside the loop.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum SupervisorHandleError {
    #[error("failed to send message to supervisor: {0}")]
    SendError(String),

    #[error("failed to receive response from supervisor: {0}")]
    RecvError(#[from] oneshot::error::RecvError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Cloneable handle to a running supervisor.
///
/// Requests are applied by the supervision loop in the order they are sent.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    join_handle: Arc<Mutex<Option<JoinHandle<Result<()>>>>>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        join_handle: JoinHandle<Result<()>>,
        tx: mpsc::UnboundedSender<SupervisorMessage>,
    ) -> Self {
        Self {
            tx,
            join_handle: Arc::new(Mutex::new(Some(join_handle))),
        }
    }

    /// Adds a new task to the running supervisor.
    pub async fn add_task(&self, task: Task) -> Result<ProcessInfo, SupervisorHandleError> {
        Ok(self.request(|reply| SupervisorMessage::AddTask(task, reply)).await??)
    }

    pub async fn start_task(&self, task_name: &str) -> Result<(), SupervisorHandleError> {
        let task_name = task_name.to_string();
        Ok(self.request(|reply| SupervisorMessage::StartTask(task_name, reply)).await??)
    }

    pub async fn stop_task(&self, task_name: &str) -> Result<(), SupervisorHandleError> {
        let task_name = task_name.to_string();
        Ok(self.request(|reply| SupervisorMessage::StopTask(task_name, reply)).await??)
    }

    pub async fn restart_task(&self, task_name: &str) -> Result<(), SupervisorHandleError> {
        let task_name = task_name.to_string();
        Ok(self.request(|reply| SupervisorMessage::RestartTask(task_name, reply)).await??)
    }

    pub async fn delete_task(&self, task_name: &str) -> Result<(), SupervisorHandleError> {
        let task_name = task_name.to_string();
        Ok(self.request(|reply| SupervisorMessage::DeleteTask(task_name, reply)).await??)
    }

    pub async fn get_process(&self, task_name: &str) -> Result<ProcessInfo, SupervisorHandleError> {
        let task_name = task_name.to_string();
        Ok(self.request(|reply| SupervisorMessage::GetProcess(task_name, reply)).await??)
    }

    pub async fn get_all_processes(
        &self,
    ) -> Result<BTreeMap<TaskName, ProcessInfo>, SupervisorHandleError> {
        self.request(SupervisorMessage::GetAllProcesses).await
    }

    /// Asks the supervisor to stop every process and exit its loop.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.send(SupervisorMessage::Shutdown)
    }

    /// Waits for the supervisor to exit. Every clone may wait; only the first
    /// waiter observes the loop's own error.
    pub async fn wait(&self) -> Result<(), SupervisorHandleError> {
        let mut guard = self.join_handle.lock().await;
        match guard.take() {
            Some(join_handle) => Ok(join_handle.await??),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, msg: SupervisorMessage) -> Result<(), SupervisorHandleError> {
        self.tx
            .send(msg)
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> SupervisorMessage,
    ) -> Result<T, SupervisorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(msg(reply_tx))?;
        Ok(reply_rx.await?)
    }
}
