//! Runbus Service - worker bridge and controller operations
//!
//! This crate provides:
//! - Bridge: republishes worker events and answers bus requests
//! - Submitter: the synchronous controller surface, in-process or over the bus
//! - Controller: the submit / subscribe / start / wait flow and completion reporting
//! - Protocol: the reply envelope used on request topics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod controller;
pub mod protocol;
pub mod submitter;

pub use bridge::{BridgeHandle, WorkerBridge, REQUEST_TOPICS};
pub use controller::{
    listen, log_event, process_event_after_finished, run_task, Completion, RunReport,
};
pub use protocol::{Reply, ReplyError};
pub use submitter::{BusSubmitter, LocalSubmitter, TaskSubmitter};
