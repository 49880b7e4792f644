//! Controller flow: submit, subscribe, start, wait, report.

use runbus_bus::{EventBusClient, WaitOutcome};
use runbus_core::{BusEvent, Result, Task, TaskId, WorkerEvent, WorkerTask};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::submitter::TaskSubmitter;

/// How a finished task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// No errors, no warnings
    Passed,
    /// No errors, but the task raised warnings
    PassedWithWarnings(Vec<String>),
    /// The task reported errors
    Failed(Vec<String>),
}

impl Completion {
    /// Whether the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Completion::Failed(_))
    }
}

/// Classify and log a terminal worker event.
pub fn process_event_after_finished(event: &WorkerEvent) -> Completion {
    if event.is_error() {
        error!(errors = ?event.errors, "Failed with errors");
        Completion::Failed(event.errors.clone())
    } else if !event.warnings.is_empty() {
        warn!(warnings = ?event.warnings, "Passed with warnings");
        Completion::PassedWithWarnings(event.warnings.clone())
    } else {
        info!("Plan passed");
        Completion::Passed
    }
}

/// Result of [`run_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Task the worker ran
    pub task_id: TaskId,
    /// How waiting ended
    pub outcome: WaitOutcome,
    /// Classification of the terminal event, when one arrived
    pub completion: Option<Completion>,
}

/// Log one event the way the controller reports progress.
pub fn log_event(event: &BusEvent) {
    match event {
        BusEvent::Worker(event) => {
            debug!(state = %event.state, task_id = ?event.task_id(), "Worker state");
        }
        BusEvent::Progress(event) => {
            for (id, status) in &event.statuses {
                debug!(
                    task_id = %event.task_id,
                    operation = %id,
                    name = %status.display_name,
                    percentage = ?status.percentage,
                    done = status.done,
                    "Progress"
                );
            }
        }
        BusEvent::Task(event) => {
            debug!(task_id = %event.task_id, phase = ?event.phase, "Task");
        }
        BusEvent::Data(event) => {
            debug!(task_id = %event.task_id, name = %event.name, "Document");
        }
    }
}

/// Submit `task`, start it and wait for it to finish.
///
/// The task's events are subscribed to before the start command is sent.
/// A bounded `timeout` that elapses yields [`WaitOutcome::TimedOut`]; the
/// worker is not told to cancel.
pub async fn run_task(
    submitter: &dyn TaskSubmitter,
    client: &EventBusClient,
    task: Task,
    timeout: Option<Duration>,
) -> Result<RunReport> {
    let plan = task.name.clone();
    let task_id = submitter.create_task(task).await?.task_id;

    let mut events = client.subscribe_to_topics(&task_id).await?;
    let stop_events = events.cancellation().drop_guard();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    submitter
        .update_worker_task(WorkerTask {
            task_id: Some(task_id.clone()),
        })
        .await?;
    info!(task_id = %task_id, plan = %plan, "Task started");

    let outcome = client.wait_for_complete(timeout).await?;
    drop(stop_events);

    let completion = match &outcome {
        WaitOutcome::Complete(event) => Some(process_event_after_finished(event)),
        WaitOutcome::TimedOut { waited } => {
            warn!(
                task_id = %task_id,
                waited_secs = waited.as_secs_f64(),
                "Task did not finish in time; its state is unknown"
            );
            None
        }
    };

    Ok(RunReport {
        task_id,
        outcome,
        completion,
    })
}

/// Hand every event on the bus to `on_event` until `shutdown` fires.
pub async fn listen<F>(client: &EventBusClient, shutdown: CancellationToken, mut on_event: F) -> Result<()>
where
    F: FnMut(&BusEvent),
{
    let mut events = client.subscribe_to_all_events().await?;
    info!("Subscribed to all events");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => on_event(&event),
                None => break,
            },
        }
    }
    events.unsubscribe();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submitter::MockTaskSubmitter;
    use runbus_bus::topics::WORKER_EVENT;
    use runbus_bus::{Headers, InMemoryBroker, MessagingTemplate};
    use runbus_core::{Error, TaskResponse, TaskStatus, WorkerState};
    use std::sync::Arc;

    fn finished(task_id: &str, errors: Vec<String>, warnings: Vec<String>) -> WorkerEvent {
        WorkerEvent {
            state: WorkerState::Idle,
            task_status: Some(TaskStatus {
                task_id: TaskId::from(task_id),
                task_complete: true,
                task_failed: !errors.is_empty(),
            }),
            errors,
            warnings,
        }
    }

    #[test]
    fn test_completion_classification() {
        assert_eq!(
            process_event_after_finished(&finished("t", vec![], vec![])),
            Completion::Passed
        );
        assert_eq!(
            process_event_after_finished(&finished("t", vec![], vec!["slow".into()])),
            Completion::PassedWithWarnings(vec!["slow".into()])
        );
        let failed = process_event_after_finished(&finished(
            "t",
            vec!["boom".into()],
            vec!["slow".into()],
        ));
        assert_eq!(failed, Completion::Failed(vec!["boom".into()]));
        assert!(!failed.is_success());
    }

    async fn connected_client(broker: &InMemoryBroker) -> EventBusClient {
        EventBusClient::connect(Arc::new(broker.template()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_validation_error_stops_before_start() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;

        let mut submitter = MockTaskSubmitter::new();
        submitter
            .expect_create_task()
            .times(1)
            .returning(|_| Err(Error::Validation("time must be a number".into())));
        submitter.expect_update_worker_task().never();

        let result = run_task(&submitter, &client, Task::new("sleep"), None).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(client.tracked_task().is_none());
    }

    #[tokio::test]
    async fn test_start_happens_after_subscription() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;
        let publisher = broker.template();
        publisher.connect().await.unwrap();
        let publisher = Arc::new(publisher);

        let mut submitter = MockTaskSubmitter::new();
        submitter.expect_create_task().returning(|_| {
            Ok(TaskResponse {
                task_id: TaskId::from("t1"),
            })
        });
        // The terminal event goes out while the start request is handled:
        // it is only seen if the subscription already exists.
        let worker_side = publisher.clone();
        submitter.expect_update_worker_task().returning(move |task| {
            let body = serde_json::to_value(finished("t1", vec![], vec![])).unwrap();
            let template = worker_side.clone();
            tokio::spawn(async move {
                template
                    .send(WORKER_EVENT, &body, Headers::default())
                    .await
                    .unwrap();
            });
            Ok(task)
        });

        let report = run_task(
            &submitter,
            &client,
            Task::new("sleep").with_param("time", 0.1),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(report.task_id, TaskId::from("t1"));
        assert_eq!(report.completion, Some(Completion::Passed));
    }

    #[tokio::test]
    async fn test_timeout_reports_no_completion() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;

        let mut submitter = MockTaskSubmitter::new();
        submitter.expect_create_task().returning(|_| {
            Ok(TaskResponse {
                task_id: TaskId::from("slow"),
            })
        });
        submitter.expect_update_worker_task().returning(Ok);
        submitter.expect_cancel_current_task().never();
        submitter.expect_set_state().never();

        let report = run_task(
            &submitter,
            &client,
            Task::new("sleep").with_param("time", 5.0),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert!(report.outcome.is_timed_out());
        assert!(report.completion.is_none());
        assert!(client.timed_out());
    }

    #[tokio::test]
    async fn test_next_run_after_timeout() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;
        let publisher = Arc::new(broker.template());
        publisher.connect().await.unwrap();

        let submitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut submitter = MockTaskSubmitter::new();
        let counter = submitted.clone();
        submitter.expect_create_task().times(2).returning(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(TaskResponse {
                task_id: TaskId::from(format!("run-{}", n)),
            })
        });
        // Only the second task ever finishes
        let worker_side = publisher.clone();
        submitter.expect_update_worker_task().times(2).returning(move |task| {
            if task.task_id == Some(TaskId::from("run-1")) {
                let body = serde_json::to_value(finished("run-1", vec![], vec![])).unwrap();
                let template = worker_side.clone();
                tokio::spawn(async move {
                    template
                        .send(WORKER_EVENT, &body, Headers::default())
                        .await
                        .unwrap();
                });
            }
            Ok(task)
        });

        let first = run_task(
            &submitter,
            &client,
            Task::new("sleep").with_param("time", 5.0),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert!(first.outcome.is_timed_out());

        let second = run_task(
            &submitter,
            &client,
            Task::new("sleep").with_param("time", 0.1),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(second.task_id, TaskId::from("run-1"));
        assert_eq!(second.completion, Some(Completion::Passed));
        assert!(!client.timed_out());
    }

    #[tokio::test]
    async fn test_remote_start_failure_propagates() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;

        let mut submitter = MockTaskSubmitter::new();
        submitter.expect_create_task().returning(|_| {
            Ok(TaskResponse {
                task_id: TaskId::from("t1"),
            })
        });
        submitter
            .expect_update_worker_task()
            .returning(|_| Err(Error::Remote("worker is busy".into())));

        let result = run_task(&submitter, &client, Task::new("sleep"), None).await;
        assert!(matches!(result, Err(Error::Remote(_))));
    }

    #[tokio::test]
    async fn test_listen_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let client = connected_client(&broker).await;
        let publisher = broker.template();
        publisher.connect().await.unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let body = serde_json::to_value(finished("t1", vec![], vec![])).unwrap();

        let mut seen = Vec::new();
        let listening = listen(&client, shutdown, |event| {
            seen.push(event.clone());
            stopper.cancel();
        });
        let publishing = async {
            // Let the listener subscribe first
            while broker.subscriber_count() < 2 {
                tokio::task::yield_now().await;
            }
            publisher
                .send(WORKER_EVENT, &body, Headers::default())
                .await
                .unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(listening, publishing)
        })
        .await
        .unwrap();
        result.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_terminal().is_some());
    }
}
