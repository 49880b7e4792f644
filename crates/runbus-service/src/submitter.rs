//! Synchronous surface a controller uses to talk to a worker.

use async_trait::async_trait;
use runbus_bus::topics::{
    DEVICES_QUERY, PLANS_QUERY, RUN_REQUEST, STATE_CHANGE, STATE_QUERY, TASK_START,
};
use runbus_bus::{send_and_receive, MessagingTemplate};
use runbus_core::{
    DeviceDescriptor, Error, PlanDescriptor, Result, StateChangeRequest, Task, TaskId,
    TaskResponse, Worker, WorkerState, WorkerTask,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::protocol::Reply;

/// Controller-side operations on a worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Register a task and get its id. Nothing is started.
    async fn create_task(&self, task: Task) -> Result<TaskResponse>;

    /// Start the task named in `task`.
    ///
    /// Subscribe to the task's events before calling this.
    async fn update_worker_task(&self, task: WorkerTask) -> Result<WorkerTask>;

    /// Current worker state.
    async fn get_state(&self) -> Result<WorkerState>;

    /// Request a worker state change and return the acknowledged state.
    async fn set_state(&self, request: StateChangeRequest) -> Result<WorkerState>;

    /// Abort or stop the active task.
    async fn cancel_current_task(
        &self,
        state: WorkerState,
        reason: Option<String>,
    ) -> Result<WorkerState>;

    /// Plans the worker can run.
    async fn get_plans(&self) -> Result<Vec<PlanDescriptor>>;

    /// Devices the worker can use.
    async fn get_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

fn cancel_request(state: WorkerState, reason: Option<String>) -> Result<StateChangeRequest> {
    match state {
        WorkerState::Aborting | WorkerState::Stopping => {
            Ok(StateChangeRequest::new(state).with_reason(reason))
        }
        other => Err(Error::Validation(format!(
            "cannot cancel a task with state {}; use ABORTING or STOPPING",
            other
        ))),
    }
}

/// Submitter calling a worker in the same process.
#[derive(Clone)]
pub struct LocalSubmitter {
    worker: Arc<dyn Worker>,
}

impl LocalSubmitter {
    /// Wrap a worker.
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl TaskSubmitter for LocalSubmitter {
    async fn create_task(&self, task: Task) -> Result<TaskResponse> {
        let task_id = TaskId::generate();
        self.worker.submit_task(task_id.clone(), task)?;
        Ok(TaskResponse { task_id })
    }

    async fn update_worker_task(&self, task: WorkerTask) -> Result<WorkerTask> {
        match task.task_id {
            Some(task_id) => self.worker.begin_task(&task_id),
            None => Ok(WorkerTask {
                task_id: self.worker.active_task(),
            }),
        }
    }

    async fn get_state(&self) -> Result<WorkerState> {
        Ok(self.worker.get_state())
    }

    async fn set_state(&self, request: StateChangeRequest) -> Result<WorkerState> {
        self.worker.set_state(&request)
    }

    async fn cancel_current_task(
        &self,
        state: WorkerState,
        reason: Option<String>,
    ) -> Result<WorkerState> {
        self.worker.set_state(&cancel_request(state, reason)?)
    }

    async fn get_plans(&self) -> Result<Vec<PlanDescriptor>> {
        Ok(self.worker.get_plans())
    }

    async fn get_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.worker.get_devices())
    }
}

/// Submitter using request/reply over the message bus.
#[derive(Clone)]
pub struct BusSubmitter {
    template: Arc<dyn MessagingTemplate>,
    timeout: Duration,
}

impl BusSubmitter {
    /// Create a submitter over a connected template.
    ///
    /// `timeout` bounds each request/reply exchange.
    pub fn new(template: Arc<dyn MessagingTemplate>, timeout: Duration) -> Self {
        Self { template, timeout }
    }

    async fn call<B, T>(&self, topic: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let body = serde_json::to_value(body)?;
        debug!(topic = %topic, "Sending request");
        let reply = send_and_receive(self.template.as_ref(), topic, &body, self.timeout).await?;
        Reply::from_value(reply)?.into_result()
    }
}

#[async_trait]
impl TaskSubmitter for BusSubmitter {
    async fn create_task(&self, task: Task) -> Result<TaskResponse> {
        let response: TaskResponse = self.call(RUN_REQUEST, &task).await?;
        info!(task_id = %response.task_id, plan = %task.name, "Task created");
        Ok(response)
    }

    async fn update_worker_task(&self, task: WorkerTask) -> Result<WorkerTask> {
        self.call(TASK_START, &task).await
    }

    async fn get_state(&self) -> Result<WorkerState> {
        self.call(STATE_QUERY, &Value::Null).await
    }

    async fn set_state(&self, request: StateChangeRequest) -> Result<WorkerState> {
        self.call(STATE_CHANGE, &request).await
    }

    async fn cancel_current_task(
        &self,
        state: WorkerState,
        reason: Option<String>,
    ) -> Result<WorkerState> {
        let request = cancel_request(state, reason)?;
        self.call(STATE_CHANGE, &request).await
    }

    async fn get_plans(&self) -> Result<Vec<PlanDescriptor>> {
        self.call(PLANS_QUERY, &Value::Null).await
    }

    async fn get_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.call(DEVICES_QUERY, &Value::Null).await
    }
}
