//! Controller-side event bus client.
//!
//! The client owns one broker connection for its whole life. It tracks at
//! most one unfinished task: [`EventBusClient::subscribe_to_topics`]
//! correlates events to that task and keeps the first terminal worker
//! event in a single-slot buffer that [`EventBusClient::wait_for_complete`]
//! reads. Dropping the client ends every stream and disconnects.

use runbus_core::{BusEvent, Error, Result, TaskId, WorkerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::template::{MessagingTemplate, Subscription};
use crate::topics::{decode_event, WORKER_EVENT};

/// Pattern for the nested event topics (`worker.event.task`, `worker.event.data`).
const NESTED_EVENTS: &str = "worker.event.>";

/// Content of the completion buffer.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Pending,
    Done(WorkerEvent),
    Failed(String),
}

impl Slot {
    fn is_settled(&self) -> bool {
        !matches!(self, Slot::Pending)
    }
}

#[derive(Debug)]
struct Tracked {
    task_id: TaskId,
    slot: Arc<watch::Sender<Slot>>,
    stream: CancellationToken,
}

impl Tracked {
    /// Whether another task may be tracked in place of this one.
    ///
    /// A cancelled stream releases its task at once, even before the
    /// delivery loop has noticed; the pending slot is settled here.
    fn release(&self) -> bool {
        if self.stream.is_cancelled() {
            settle_cancelled(&self.task_id, &self.slot, "subscription cancelled");
        }
        self.slot.borrow().is_settled()
    }
}

/// Mark a still-pending slot as failed. Returns whether it changed.
fn settle_cancelled(task_id: &TaskId, slot: &watch::Sender<Slot>, reason: &str) -> bool {
    slot.send_if_modified(|current| {
        if current.is_settled() {
            return false;
        }
        warn!(task_id = %task_id, reason = %reason, "Event stream ended before completion");
        *current = Slot::Failed(reason.to_string());
        true
    })
}

/// Result of [`EventBusClient::wait_for_complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The tracked task reached a terminal event
    Complete(WorkerEvent),
    /// The bound elapsed first; the task's state is unknown
    TimedOut {
        /// How long the call waited
        waited: Duration,
    },
}

impl WaitOutcome {
    /// Whether the wait ran out of time.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut { .. })
    }

    /// The terminal event, if one arrived.
    #[must_use]
    pub fn event(&self) -> Option<&WorkerEvent> {
        match self {
            WaitOutcome::Complete(event) => Some(event),
            WaitOutcome::TimedOut { .. } => None,
        }
    }
}

/// Stream of decoded events from one client subscription.
///
/// The stream keeps running when the handle is dropped, so completion
/// tracking continues; call [`EventStream::unsubscribe`] to stop it.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<BusEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Token cancelled when the stream ends.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the stream.
    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }
}

/// Event bus client for one controller session.
pub struct EventBusClient {
    template: Arc<dyn MessagingTemplate>,
    session: CancellationToken,
    tracked: Mutex<Option<Tracked>>,
    timed_out: AtomicBool,
}

impl std::fmt::Debug for EventBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusClient")
            .field("connected", &self.template.is_connected())
            .field("tracked", &self.tracked_task())
            .field("timed_out", &self.timed_out())
            .finish()
    }
}

impl EventBusClient {
    /// Connect and return a client owning the connection.
    ///
    /// A connection failure is returned before anything is subscribed.
    pub async fn connect(template: Arc<dyn MessagingTemplate>) -> Result<Self> {
        template.connect().await?;
        Ok(Self {
            template,
            session: CancellationToken::new(),
            tracked: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        })
    }

    /// The underlying messaging template.
    #[must_use]
    pub fn template(&self) -> &Arc<dyn MessagingTemplate> {
        &self.template
    }

    /// Task currently tracked for completion.
    #[must_use]
    pub fn tracked_task(&self) -> Option<TaskId> {
        self.tracked
            .lock()
            .ok()
            .and_then(|tracked| tracked.as_ref().map(|t| t.task_id.clone()))
    }

    /// Whether the last [`EventBusClient::wait_for_complete`] timed out.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Terminal event buffered for the tracked task, if any.
    #[must_use]
    pub fn completion(&self) -> Option<WorkerEvent> {
        let slot = self.slot().ok()?;
        let current = slot.borrow();
        match &*current {
            Slot::Done(event) => Some(event.clone()),
            _ => None,
        }
    }

    /// Subscribe to every event correlated with `task_id` and track the
    /// task for completion.
    ///
    /// Must be called before the task is started; events published earlier
    /// are not replayed.
    pub async fn subscribe_to_topics(&self, task_id: &TaskId) -> Result<EventStream> {
        let (slot, stream) = {
            let mut tracked = self
                .tracked
                .lock()
                .map_err(|_| Error::Internal("tracking lock poisoned".to_string()))?;
            if let Some(current) = tracked.as_ref() {
                if !current.release() {
                    return Err(Error::TaskAlreadyTracked(current.task_id.clone()));
                }
            }
            let (sender, _) = watch::channel(Slot::Pending);
            let slot = Arc::new(sender);
            let stream = self.session.child_token();
            *tracked = Some(Tracked {
                task_id: task_id.clone(),
                slot: Arc::clone(&slot),
                stream: stream.clone(),
            });
            (slot, stream)
        };

        let subscriptions = match self.open_event_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                stream.cancel();
                if let Ok(mut tracked) = self.tracked.lock() {
                    *tracked = None;
                }
                return Err(e);
            }
        };
        self.timed_out.store(false, Ordering::SeqCst);
        debug!(task_id = %task_id, "Tracking task");
        Ok(self.spawn_pump(subscriptions, stream, Some((task_id.clone(), slot))))
    }

    /// Subscribe to every event regardless of correlation.
    ///
    /// Runs until the stream is unsubscribed or the client is dropped.
    pub async fn subscribe_to_all_events(&self) -> Result<EventStream> {
        let subscriptions = self.open_event_subscriptions().await?;
        Ok(self.spawn_pump(subscriptions, self.session.child_token(), None))
    }

    /// Wait for the tracked task's terminal event.
    ///
    /// `None` waits without bound. A zero timeout never blocks. Timing out is
    /// not an error: the outcome is [`WaitOutcome::TimedOut`] and
    /// [`EventBusClient::timed_out`] becomes true. Nothing is sent to the
    /// worker on timeout.
    pub async fn wait_for_complete(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let mut receiver = self.slot()?.subscribe();
        self.timed_out.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let settled = {
            let current = receiver.borrow_and_update();
            current.is_settled().then(|| (*current).clone())
        };
        let settled = match (settled, timeout) {
            (Some(slot), _) => Some(slot),
            (None, Some(limit)) if limit.is_zero() => None,
            (None, limit) => {
                let wait = async {
                    receiver
                        .wait_for(Slot::is_settled)
                        .await
                        .map(|slot| (*slot).clone())
                        .map_err(|_| Error::NotConnected)
                };
                match limit {
                    Some(limit) => tokio::time::timeout(limit, wait).await.ok().transpose()?,
                    None => Some(wait.await?),
                }
            }
        };

        match settled {
            Some(Slot::Done(event)) => Ok(WaitOutcome::Complete(event)),
            Some(Slot::Failed(message)) => Err(Error::Remote(message)),
            Some(Slot::Pending) | None => {
                self.timed_out.store(true, Ordering::SeqCst);
                let waited = started.elapsed();
                info!(
                    waited_secs = waited.as_secs_f64(),
                    "Timed out waiting for the task to complete"
                );
                Ok(WaitOutcome::TimedOut { waited })
            }
        }
    }

    /// Close the connection.
    pub async fn disconnect(self) -> Result<()> {
        self.session.cancel();
        self.template.disconnect().await
    }

    fn slot(&self) -> Result<Arc<watch::Sender<Slot>>> {
        self.tracked
            .lock()
            .map_err(|_| Error::Internal("tracking lock poisoned".to_string()))?
            .as_ref()
            .map(|tracked| {
                tracked.release();
                Arc::clone(&tracked.slot)
            })
            .ok_or_else(|| Error::Internal("no task is being tracked".to_string()))
    }

    async fn open_event_subscriptions(&self) -> Result<(Subscription, Subscription)> {
        let top = self.template.subscribe(WORKER_EVENT).await?;
        let nested = self.template.subscribe(NESTED_EVENTS).await?;
        Ok((top, nested))
    }

    fn spawn_pump(
        &self,
        (mut top, mut nested): (Subscription, Subscription),
        cancel: CancellationToken,
        tracking: Option<(TaskId, Arc<watch::Sender<Slot>>)>,
    ) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stop = cancel.clone();

        tokio::spawn(async move {
            let exit = loop {
                let inbound = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break "subscription cancelled".to_string(),
                    item = top.recv() => item,
                    item = nested.recv() => item,
                };
                let delivery = match inbound {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(Error::Remote(message))) => break message,
                    Some(Err(other)) => break other.to_string(),
                    None => break "broker connection lost".to_string(),
                };
                let destination = delivery.context.destination.clone();
                let event = match decode_event(&destination, delivery.body) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(topic = %destination, error = %e, "Skipping undecodable event");
                        continue;
                    }
                };

                if let Some((task_id, slot)) = &tracking {
                    if event.task_id() != Some(task_id) {
                        continue;
                    }
                    if let Some(terminal) = event.as_terminal() {
                        let first = slot.send_if_modified(|current| {
                            if current.is_settled() {
                                return false;
                            }
                            *current = Slot::Done(terminal.clone());
                            true
                        });
                        if first {
                            debug!(task_id = %task_id, state = %terminal.state, "Terminal event captured");
                        } else {
                            debug!(task_id = %task_id, "Ignoring repeated terminal event");
                        }
                    }
                }
                // The receiving half may be gone; completion tracking goes on.
                let _ = sender.send(event);
            };

            if let Some((task_id, slot)) = &tracking {
                settle_cancelled(task_id, slot, &exit);
            }
        });

        EventStream { receiver, cancel }
    }
}

impl Drop for EventBusClient {
    fn drop(&mut self) {
        self.session.cancel();
        if !self.template.is_connected() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let template = Arc::clone(&self.template);
            handle.spawn(async move {
                if let Err(e) = template.disconnect().await {
                    warn!(error = %e, "Disconnect on drop failed");
                }
            });
        }
    }
}
