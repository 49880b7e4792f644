//! Runbus Core - task and worker model
//!
//! This crate provides the pieces shared by the worker and the controller:
//! - Tasks: task descriptions and identifiers
//! - Events: worker, task, progress and data events
//! - State: worker states and the legal controller transitions
//! - Context: the explicit registry of plans and devices
//! - Worker: the worker command interface and an in-process plan worker

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod events;
pub mod state;
pub mod task;
pub mod worker;

pub use context::{
    Device, DeviceDescriptor, Movable, ParamKind, ParamSpec, PlanDescriptor, WorkerContext,
    WorkerContextBuilder,
};
pub use error::{format_error_for_cli, Error, ErrorKind, Result, UserFriendlyError};
pub use events::{
    BusEvent, DataEvent, EventPublisher, ProgressEvent, StatusView, TaskEvent, TaskPhase,
    TaskStatus, WorkerEvent,
};
pub use state::{StateAction, StateChangeRequest, WorkerState};
pub use task::{Task, TaskId, TaskResponse, WorkerTask};
pub use worker::{Plan, PlanError, PlanWorker, RunContext, Worker, WorkerConfig};
