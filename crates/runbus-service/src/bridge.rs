//! Worker-side bridge between a [`Worker`] and the message bus.
//!
//! Outbound, every in-process worker event is republished verbatim on its
//! broadcast topic. Inbound, requests on the request topics are forwarded
//! to the worker and answered on the requester's reply destination.

use runbus_bus::topics::{
    DEVICES_QUERY, PLANS_QUERY, RUN_REQUEST, STATE_CHANGE, STATE_QUERY, TASK_START,
};
use runbus_bus::{reply, topic_for, Delivery, Headers, MessagingTemplate, Subscription};
use runbus_core::{
    BusEvent, Error, Result, StateChangeRequest, Task, TaskId, TaskResponse, Worker, WorkerTask,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::Reply;

/// Topics the bridge answers on.
pub const REQUEST_TOPICS: [&str; 6] = [
    RUN_REQUEST,
    PLANS_QUERY,
    DEVICES_QUERY,
    TASK_START,
    STATE_QUERY,
    STATE_CHANGE,
];

struct Shared {
    worker: Arc<dyn Worker>,
    template: Arc<dyn MessagingTemplate>,
}

/// Bridge configuration and entry point.
pub struct WorkerBridge {
    shared: Arc<Shared>,
}

impl WorkerBridge {
    /// Create a bridge for `worker` publishing through `template`.
    pub fn new(worker: Arc<dyn Worker>, template: Arc<dyn MessagingTemplate>) -> Self {
        Self {
            shared: Arc::new(Shared { worker, template }),
        }
    }

    /// Connect, subscribe to the request topics and start forwarding.
    ///
    /// Returns once every subscription is live.
    pub async fn start(self) -> Result<BridgeHandle> {
        let shared = self.shared;
        shared.template.connect().await?;

        // Worker streams first so nothing emitted after start is lost.
        let worker_events = shared.worker.worker_events();
        let progress_events = shared.worker.progress_events();
        let task_events = shared.worker.task_events();
        let data_events = shared.worker.data_events();

        let mut requests = Vec::with_capacity(REQUEST_TOPICS.len());
        for topic in REQUEST_TOPICS {
            requests.push(shared.template.subscribe(topic).await?);
        }

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(republish(
            shared.clone(),
            worker_events,
            BusEvent::Worker,
            cancel.clone(),
        ));
        tasks.spawn(republish(
            shared.clone(),
            progress_events,
            BusEvent::Progress,
            cancel.clone(),
        ));
        tasks.spawn(republish(
            shared.clone(),
            task_events,
            BusEvent::Task,
            cancel.clone(),
        ));
        tasks.spawn(republish(
            shared.clone(),
            data_events,
            BusEvent::Data,
            cancel.clone(),
        ));
        for subscription in requests {
            tasks.spawn(serve_requests(shared.clone(), subscription, cancel.clone()));
        }

        info!("Worker bridge started");
        Ok(BridgeHandle {
            shared,
            cancel,
            tasks,
        })
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let handle = self.start().await?;
        shutdown.cancelled().await;
        handle.stop().await
    }
}

/// A running bridge.
pub struct BridgeHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl BridgeHandle {
    /// Stop forwarding and disconnect.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Bridge task ended abnormally");
            }
        }
        self.shared.template.disconnect().await?;
        info!("Worker bridge stopped");
        Ok(())
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn republish<T>(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<T>,
    wrap: fn(T) -> BusEvent,
    cancel: CancellationToken,
) where
    T: Clone + Send + 'static,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                let event = wrap(event);
                let topic = topic_for(&event);
                let body = match event.to_value() {
                    Ok(body) => body,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if let Err(e) = shared.template.send(topic, &body, Headers::default()).await {
                    warn!(topic = %topic, error = %e, "Failed to publish event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Bridge lagged behind the worker");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn serve_requests(shared: Arc<Shared>, mut requests: Subscription, cancel: CancellationToken) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            inbound = requests.recv() => inbound,
        };
        match inbound {
            Some(Ok(delivery)) => handle_request(&shared, delivery).await,
            Some(Err(e)) => warn!(pattern = %requests.pattern(), error = %e, "Broker error"),
            None => break,
        }
    }
    debug!(pattern = %requests.pattern(), "Request loop ended");
}

async fn handle_request(shared: &Shared, delivery: Delivery) {
    let Delivery { context, body } = delivery;
    // Checked before anything reaches the worker.
    if let Err(e) = context.require_reply_destination() {
        error!(topic = %context.destination, error = %e, "Dropping request");
        return;
    }

    let reply_body = dispatch(shared.worker.as_ref(), &context.destination, body).to_value();
    if let Err(e) = reply(shared.template.as_ref(), &context, &reply_body).await {
        warn!(topic = %context.destination, error = %e, "Failed to send reply");
    }
}

/// Answer one request against the worker.
fn dispatch(worker: &dyn Worker, destination: &str, body: Value) -> Reply {
    match destination {
        RUN_REQUEST => Reply::from_result(run_task(worker, body)),
        PLANS_QUERY => Reply::from_result(Ok(worker.get_plans())),
        DEVICES_QUERY => Reply::from_result(Ok(worker.get_devices())),
        TASK_START => Reply::from_result(start_task(worker, body)),
        STATE_QUERY => Reply::from_result(Ok(worker.get_state())),
        STATE_CHANGE => Reply::from_result(
            decode::<StateChangeRequest>(body).and_then(|request| worker.set_state(&request)),
        ),
        other => Reply::from_result::<()>(Err(Error::ContractViolation(format!(
            "no handler for '{}'",
            other
        )))),
    }
}

fn run_task(worker: &dyn Worker, body: Value) -> Result<TaskResponse> {
    let task: Task = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("malformed task: {}", e)))?;
    let task_id = TaskId::generate();
    worker.submit_task(task_id.clone(), task)?;
    Ok(TaskResponse { task_id })
}

fn start_task(worker: &dyn Worker, body: Value) -> Result<WorkerTask> {
    let request: WorkerTask = decode(body)?;
    match request.task_id {
        Some(task_id) => worker.begin_task(&task_id),
        None => Ok(WorkerTask {
            task_id: worker.active_task(),
        }),
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::ContractViolation(format!("malformed request: {}", e)))
}
