//! Worker command interface.
//!
//! The worker owns task execution. Controllers reach it through the bridge;
//! the bridge and in-process submitters call it through [`Worker`].

pub mod engine;
pub mod plan;
pub mod plans;

use tokio::sync::broadcast;

use crate::context::{DeviceDescriptor, PlanDescriptor};
use crate::error::Result;
use crate::events::{DataEvent, ProgressEvent, TaskEvent, WorkerEvent};
use crate::state::{StateChangeRequest, WorkerState};
use crate::task::{Task, TaskId, WorkerTask};

pub use engine::{PlanWorker, WorkerConfig};
pub use plan::{Plan, PlanError, RunContext};

/// Operations a worker exposes to controllers.
pub trait Worker: Send + Sync {
    /// Register a validated task under `task_id` without starting it.
    fn submit_task(&self, task_id: TaskId, task: Task) -> Result<()>;

    /// Start a previously submitted task.
    fn begin_task(&self, task_id: &TaskId) -> Result<WorkerTask>;

    /// Task currently executing, if any.
    fn active_task(&self) -> Option<TaskId>;

    /// Current engine state.
    fn get_state(&self) -> WorkerState;

    /// Pause, resume, abort or stop the active task.
    ///
    /// Returns the state the worker moved to.
    fn set_state(&self, request: &StateChangeRequest) -> Result<WorkerState>;

    /// Plans the worker can run.
    fn get_plans(&self) -> Vec<PlanDescriptor>;

    /// Devices the worker can use.
    fn get_devices(&self) -> Vec<DeviceDescriptor>;

    /// Worker state changes.
    fn worker_events(&self) -> broadcast::Receiver<WorkerEvent>;

    /// Task lifecycle changes.
    fn task_events(&self) -> broadcast::Receiver<TaskEvent>;

    /// Progress reports.
    fn progress_events(&self) -> broadcast::Receiver<ProgressEvent>;

    /// Data documents.
    fn data_events(&self) -> broadcast::Receiver<DataEvent>;
}
