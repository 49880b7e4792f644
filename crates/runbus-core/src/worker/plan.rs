//! Plan trait and the run context handed to a running plan.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::context::{Device, ParamSpec, WorkerContext};
use crate::error::Result;
use crate::events::{DataEvent, EventPublisher, ProgressEvent, StatusView};
use crate::task::TaskId;

/// Why a plan stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The controller cancelled the task (abort or stop)
    #[error("cancelled")]
    Cancelled,

    /// The plan failed on its own
    #[error("{0}")]
    Failed(String),
}

/// Executable unit of work.
#[async_trait]
pub trait Plan: Send + Sync {
    /// Name the plan is registered under
    fn name(&self) -> &str;

    /// One-line description for plan listings
    fn description(&self) -> &str {
        ""
    }

    /// Declared parameters
    fn params(&self) -> &[ParamSpec];

    /// Plan-specific checks on top of the declared parameter types.
    fn validate(&self, _params: &Map<String, Value>, _context: &WorkerContext) -> Result<()> {
        Ok(())
    }

    /// Execute the plan.
    ///
    /// Plans must reach `run.checkpoint()` or `run.sleep()` regularly so that
    /// pause and cancel requests take effect.
    async fn run(
        &self,
        params: &Map<String, Value>,
        run: &mut RunContext,
    ) -> std::result::Result<(), PlanError>;
}

/// Command from the controller to the running plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause { defer: bool },
    Cancel,
}

impl Control {
    /// Whether an in-progress wait must be cut short.
    fn interrupts(self) -> bool {
        matches!(self, Self::Pause { defer: false } | Self::Cancel)
    }
}

/// Handle a running plan uses to cooperate with the worker.
pub struct RunContext {
    task_id: TaskId,
    context: Arc<WorkerContext>,
    control: watch::Receiver<Control>,
    progress: EventPublisher<ProgressEvent>,
    data: EventPublisher<DataEvent>,
    statuses: BTreeMap<String, StatusView>,
    warnings: Vec<String>,
    checkpoint_interval: Duration,
}

impl RunContext {
    pub(crate) fn new(
        task_id: TaskId,
        context: Arc<WorkerContext>,
        control: watch::Receiver<Control>,
        progress: EventPublisher<ProgressEvent>,
        data: EventPublisher<DataEvent>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            task_id,
            context,
            control,
            progress,
            data,
            statuses: BTreeMap::new(),
            warnings: Vec::new(),
            checkpoint_interval,
        }
    }

    /// Task being executed.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Look up a device by name.
    #[must_use]
    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.context.device(name).cloned()
    }

    /// Suggested granularity for long operations.
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        self.checkpoint_interval
    }

    /// Block while paused; fail with [`PlanError::Cancelled`] once cancelled.
    pub async fn checkpoint(&mut self) -> std::result::Result<(), PlanError> {
        let current = *self
            .control
            .wait_for(|control| !matches!(control, Control::Pause { .. }))
            .await
            .map_err(|_| PlanError::Cancelled)?;
        match current {
            Control::Cancel => Err(PlanError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Wait for `duration` of running time.
    ///
    /// An immediate pause suspends the clock and the remainder is waited
    /// after resume. A deferred pause lets the wait finish and takes effect
    /// at the checkpoint that follows.
    pub async fn sleep(&mut self, duration: Duration) -> std::result::Result<(), PlanError> {
        let mut remaining = duration;
        loop {
            self.checkpoint().await?;
            if remaining.is_zero() {
                return Ok(());
            }
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    remaining = Duration::ZERO;
                }
                closed = async {
                    self.control.wait_for(|control| control.interrupts()).await.is_err()
                } => {
                    if closed {
                        return Err(PlanError::Cancelled);
                    }
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }
    }

    /// Record a warning; it is reported with the task's final event.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Update the progress of one operation and publish the full set.
    pub fn report_progress(&mut self, operation: impl Into<String>, status: StatusView) {
        self.statuses.insert(operation.into(), status);
        self.progress.publish(ProgressEvent {
            task_id: self.task_id.clone(),
            statuses: self.statuses.clone(),
        });
    }

    /// Publish a data document, stamped with the wall-clock time it was emitted.
    pub fn emit_document(&self, name: impl Into<String>, mut doc: Value) {
        if let Value::Object(fields) = &mut doc {
            fields
                .entry("timestamp")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }
        self.data.publish(DataEvent {
            name: name.into(),
            doc,
            task_id: self.task_id.clone(),
        });
    }

    pub(crate) fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_context() -> (watch::Sender<Control>, RunContext) {
        let (tx, rx) = watch::channel(Control::Run);
        let run = RunContext::new(
            TaskId::from("t1"),
            Arc::new(WorkerContext::default()),
            rx,
            EventPublisher::new(8),
            EventPublisher::new(8),
            Duration::from_millis(10),
        );
        (tx, run)
    }

    #[tokio::test]
    async fn test_sleep_runs_to_completion() {
        let (_tx, mut run) = run_context();
        let started = Instant::now();
        run.sleep(Duration::from_millis(30)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let (tx, mut run) = run_context();
        let handle = tokio::spawn(async move { run.sleep(Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(Control::Cancel).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleep should end promptly")
            .unwrap();
        assert_eq!(result, Err(PlanError::Cancelled));
    }

    #[tokio::test]
    async fn test_pause_holds_checkpoint_until_resume() {
        let (tx, mut run) = run_context();
        tx.send(Control::Pause { defer: false }).unwrap();
        let handle = tokio::spawn(async move { run.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        tx.send(Control::Run).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_progress_accumulates_statuses() {
        let (_tx, mut run) = run_context();
        let mut rx = run.progress.subscribe();
        let view = StatusView {
            display_name: "x".into(),
            current: Some(1.0),
            initial: Some(0.0),
            target: Some(2.0),
            unit: Some("mm".into()),
            percentage: Some(0.5),
            time_elapsed: None,
            done: false,
        };
        run.report_progress("x", view.clone());
        run.report_progress("y", view);
        rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.statuses.len(), 2);
        assert_eq!(event.task_id, TaskId::from("t1"));
    }

    #[tokio::test]
    async fn test_documents_are_timestamped() {
        let (_tx, run) = run_context();
        let mut rx = run.data.subscribe();
        run.emit_document("start", serde_json::json!({ "plan_name": "sleep" }));
        run.emit_document("note", serde_json::json!("not an object"));

        let start = rx.recv().await.unwrap();
        let stamp = start.doc["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(rx.recv().await.unwrap().doc, "not an object");
    }
}
