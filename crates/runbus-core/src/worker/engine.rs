//! In-process worker that executes registered plans.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::plan::{Control, Plan, PlanError, RunContext};
use super::Worker;
use crate::context::{DeviceDescriptor, PlanDescriptor, WorkerContext};
use crate::error::{Error, Result};
use crate::events::{
    DataEvent, EventPublisher, ProgressEvent, TaskEvent, TaskPhase, TaskStatus, WorkerEvent,
};
use crate::state::{StateAction, StateChangeRequest, WorkerState};
use crate::task::{Task, TaskId, WorkerTask};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Granularity plans use for long operations
    pub checkpoint_interval: Duration,
    /// Buffer size of each event stream
    pub event_capacity: usize,
    /// How long a submitted task may wait for its start command
    pub pending_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(50),
            event_capacity: 256,
            pending_ttl: Duration::from_secs(600),
        }
    }
}

impl WorkerConfig {
    /// Set the checkpoint interval
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set how long unstarted tasks are kept
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }
}

struct PendingTask {
    task: Task,
    submitted: Instant,
}

#[derive(Debug, Clone)]
struct Cancellation {
    failure: bool,
    reason: Option<String>,
}

struct ActiveTask {
    task_id: TaskId,
    name: String,
    control: watch::Sender<Control>,
    cancellation: Option<Cancellation>,
}

struct Engine {
    state: WorkerState,
    active: Option<ActiveTask>,
}

struct Inner {
    context: Arc<WorkerContext>,
    config: WorkerConfig,
    pending: DashMap<TaskId, PendingTask>,
    engine: Mutex<Engine>,
    worker_events: EventPublisher<WorkerEvent>,
    task_events: EventPublisher<TaskEvent>,
    progress_events: EventPublisher<ProgressEvent>,
    data_events: EventPublisher<DataEvent>,
}

impl Inner {
    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop tasks that were submitted but never started in time.
    fn evict_expired(&self) {
        let ttl = self.config.pending_ttl;
        self.pending.retain(|task_id, pending| {
            let keep = pending.submitted.elapsed() < ttl;
            if !keep {
                warn!(task_id = %task_id, plan = %pending.task.name, "Discarding task that was never started");
            }
            keep
        });
    }

    fn publish_state(&self, state: WorkerState, task_id: &TaskId) {
        self.worker_events.publish(WorkerEvent {
            state,
            task_status: Some(TaskStatus {
                task_id: task_id.clone(),
                task_complete: false,
                task_failed: false,
            }),
            errors: Vec::new(),
            warnings: Vec::new(),
        });
    }
}

/// Worker running plans from a [`WorkerContext`], one task at a time.
#[derive(Clone)]
pub struct PlanWorker {
    inner: Arc<Inner>,
}

impl PlanWorker {
    /// Create a worker over `context`.
    #[must_use]
    pub fn new(context: Arc<WorkerContext>, config: WorkerConfig) -> Self {
        let capacity = config.event_capacity;
        Self {
            inner: Arc::new(Inner {
                context,
                config,
                pending: DashMap::new(),
                engine: Mutex::new(Engine {
                    state: WorkerState::Idle,
                    active: None,
                }),
                worker_events: EventPublisher::new(capacity),
                task_events: EventPublisher::new(capacity),
                progress_events: EventPublisher::new(capacity),
                data_events: EventPublisher::new(capacity),
            }),
        }
    }

    /// Number of submitted tasks not yet started.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    async fn execute(
        inner: Arc<Inner>,
        task_id: TaskId,
        task: Task,
        plan: Arc<dyn Plan>,
        control: watch::Receiver<Control>,
    ) {
        let run = RunContext::new(
            task_id.clone(),
            inner.context.clone(),
            control,
            inner.progress_events.clone(),
            inner.data_events.clone(),
            inner.config.checkpoint_interval,
        );

        // Run the plan on its own task so a panicking plan still ends the run.
        let joined = tokio::spawn(async move {
            let mut run = run;
            let result = plan.run(&task.params, &mut run).await;
            (result, run.into_warnings())
        })
        .await;

        let mut engine = inner.engine();
        let cancellation = engine
            .active
            .as_ref()
            .and_then(|active| active.cancellation.clone());
        let name = engine
            .active
            .as_ref()
            .map(|active| active.name.clone())
            .unwrap_or_default();

        let (final_state, warnings, errors) = match joined {
            Ok((result, warnings)) => {
                let errors = match (result, cancellation) {
                    (
                        _,
                        Some(Cancellation {
                            failure: true,
                            reason,
                        }),
                    ) => vec![format!(
                        "Task aborted: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )],
                    (Ok(()), _) => Vec::new(),
                    (Err(PlanError::Cancelled), Some(_)) => Vec::new(),
                    (Err(PlanError::Cancelled), None) => {
                        vec!["Task cancelled unexpectedly".to_string()]
                    }
                    (Err(PlanError::Failed(message)), _) => vec![message],
                };
                (WorkerState::Idle, warnings, errors)
            }
            Err(join_error) => {
                error!(task_id = %task_id, error = %join_error, "Plan panicked");
                (
                    WorkerState::Panicked,
                    Vec::new(),
                    vec![format!("Plan panicked: {}", join_error)],
                )
            }
        };

        let failed = !errors.is_empty();
        engine.state = final_state;
        engine.active = None;

        inner.task_events.publish(TaskEvent {
            task_id: task_id.clone(),
            name,
            phase: if failed {
                TaskPhase::Failed
            } else {
                TaskPhase::Succeeded
            },
            errors: errors.clone(),
        });
        inner.worker_events.publish(WorkerEvent {
            state: final_state,
            task_status: Some(TaskStatus {
                task_id: task_id.clone(),
                task_complete: true,
                task_failed: failed,
            }),
            errors,
            warnings,
        });
        drop(engine);

        if failed {
            warn!(task_id = %task_id, "Task failed");
        } else {
            info!(task_id = %task_id, "Task completed");
        }
    }
}

impl Worker for PlanWorker {
    fn submit_task(&self, task_id: TaskId, task: Task) -> Result<()> {
        self.inner.context.validate(&task)?;
        self.inner.evict_expired();
        if self.inner.pending.contains_key(&task_id) {
            return Err(Error::Remote(format!("task id {} is already in use", task_id)));
        }
        let name = task.name.clone();
        self.inner.pending.insert(
            task_id.clone(),
            PendingTask {
                task,
                submitted: Instant::now(),
            },
        );
        self.inner.task_events.publish(TaskEvent {
            task_id: task_id.clone(),
            name: name.clone(),
            phase: TaskPhase::Pending,
            errors: Vec::new(),
        });
        info!(task_id = %task_id, plan = %name, "Task submitted");
        Ok(())
    }

    fn begin_task(&self, task_id: &TaskId) -> Result<WorkerTask> {
        let mut engine = self.inner.engine();
        if let Some(active) = &engine.active {
            return Err(Error::Remote(format!(
                "worker is busy with task {}",
                active.task_id
            )));
        }
        self.inner.evict_expired();
        let (task_id, PendingTask { task, .. }) = self
            .inner
            .pending
            .remove(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.clone()))?;
        let plan = self
            .inner
            .context
            .plan(&task.name)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("plan '{}' is no longer available", task.name)))?;

        let (control, control_rx) = watch::channel(Control::Run);
        engine.active = Some(ActiveTask {
            task_id: task_id.clone(),
            name: task.name.clone(),
            control,
            cancellation: None,
        });
        engine.state = WorkerState::Running;
        self.inner.task_events.publish(TaskEvent {
            task_id: task_id.clone(),
            name: task.name.clone(),
            phase: TaskPhase::Running,
            errors: Vec::new(),
        });
        self.inner.publish_state(WorkerState::Running, &task_id);
        drop(engine);

        info!(task_id = %task_id, plan = %task.name, "Task started");
        tokio::spawn(Self::execute(
            self.inner.clone(),
            task_id.clone(),
            task,
            plan,
            control_rx,
        ));
        Ok(WorkerTask {
            task_id: Some(task_id),
        })
    }

    fn active_task(&self) -> Option<TaskId> {
        self.inner
            .engine()
            .active
            .as_ref()
            .map(|active| active.task_id.clone())
    }

    fn get_state(&self) -> WorkerState {
        self.inner.engine().state
    }

    fn set_state(&self, request: &StateChangeRequest) -> Result<WorkerState> {
        let mut engine = self.inner.engine();
        let current = engine.state;
        let action = request.action(current)?;
        let Some(active) = engine.active.as_mut() else {
            return Err(Error::InvalidTransition {
                from: current,
                to: request.new_state,
            });
        };

        let next = match action {
            StateAction::Pause { defer } => {
                active.control.send_replace(Control::Pause { defer });
                WorkerState::Paused
            }
            StateAction::Resume => {
                active.control.send_replace(Control::Run);
                WorkerState::Running
            }
            StateAction::Cancel { failure, reason } => {
                active.cancellation = Some(Cancellation { failure, reason });
                active.control.send_replace(Control::Cancel);
                if failure {
                    WorkerState::Aborting
                } else {
                    WorkerState::Stopping
                }
            }
        };
        let task_id = active.task_id.clone();
        engine.state = next;
        self.inner.publish_state(next, &task_id);
        drop(engine);

        debug!(task_id = %task_id, from = %current, to = %next, "Worker state changed");
        Ok(next)
    }

    fn get_plans(&self) -> Vec<PlanDescriptor> {
        self.inner.context.plan_descriptors()
    }

    fn get_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.context.device_descriptors()
    }

    fn worker_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.worker_events.subscribe()
    }

    fn task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.task_events.subscribe()
    }

    fn progress_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress_events.subscribe()
    }

    fn data_events(&self) -> broadcast::Receiver<DataEvent> {
        self.inner.data_events.subscribe()
    }
}
