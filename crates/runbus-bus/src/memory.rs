//! In-process broker.
//!
//! Fan-out is synchronous: `send` hands the message to every matching
//! subscriber before returning, so ordering per publisher is preserved.
//! Used by tests and by `broker.kind = "memory"` deployments where worker
//! and controller share a process.

use async_trait::async_trait;
use dashmap::DashMap;
use runbus_core::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::template::{
    Delivery, Headers, MessageContext, MessagingTemplate, Subscription, SubscriptionSink,
};
use crate::topics::TopicPattern;

/// Shared in-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    subscribers: DashMap<u64, SubscriptionSink>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl InMemoryBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Make the broker reachable or unreachable for new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Whether new connections succeed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Deliver a broker-level error to every live subscriber.
    pub fn fail_subscribers(&self, message: &str) {
        for entry in self.inner.subscribers.iter() {
            entry.value().fail(Error::Remote(message.to_string()));
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.prune();
        self.inner.subscribers.len()
    }

    /// Template connected to this broker.
    #[must_use]
    pub fn template(&self) -> InMemoryTemplate {
        InMemoryTemplate::new(self.clone())
    }

    fn register(&self, sink: SubscriptionSink) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, sink);
    }

    fn publish(&self, delivery: &Delivery) {
        let mut delivered = 0usize;
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            let sink = entry.value();
            if !sink.offer(delivery) {
                closed.push(*entry.key());
            } else if sink.pattern().matches(&delivery.context.destination) {
                delivered += 1;
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
        trace!(
            destination = %delivery.context.destination,
            delivered,
            "Published"
        );
    }

    fn prune(&self) {
        self.inner.subscribers.retain(|_, sink| !sink.is_closed());
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryTemplate {
    broker: InMemoryBroker,
    connected: AtomicBool,
    connection: Mutex<CancellationToken>,
}

impl InMemoryTemplate {
    /// Create a disconnected template.
    #[must_use]
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            connection: Mutex::new(CancellationToken::new()),
        }
    }

    fn connection_token(&self) -> Result<CancellationToken> {
        self.connection
            .lock()
            .map(|token| token.clone())
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl MessagingTemplate for InMemoryTemplate {
    async fn connect(&self) -> Result<()> {
        if !self.broker.is_available() {
            return Err(Error::Connection("in-memory broker is unavailable".to_string()));
        }
        let mut token = self
            .connection
            .lock()
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))?;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("Connected to in-memory broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let token = self.connection_token()?;
        if self.connected.swap(false, Ordering::SeqCst) {
            token.cancel();
            self.broker.prune();
            debug!("Disconnected from in-memory broker");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, destination: &str, body: &Value, headers: Headers) -> Result<()> {
        self.ensure_connected()?;
        let delivery = Delivery {
            context: MessageContext {
                destination: destination.to_string(),
                reply_destination: headers.reply_to,
                correlation_id: headers.correlation_id,
            },
            body: body.clone(),
        };
        self.broker.publish(&delivery);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.ensure_connected()?;
        let pattern = TopicPattern::parse(pattern)?;
        let (sink, subscription) = Subscription::channel(pattern, &self.connection_token()?);
        debug!(pattern = %sink.pattern(), "Subscribed");
        self.broker.register(sink);
        Ok(subscription)
    }
}

impl Drop for InMemoryTemplate {
    fn drop(&mut self) {
        if let Ok(token) = self.connection.lock() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::send_and_receive;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_fails_when_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let template = broker.template();
        assert!(matches!(
            template.connect().await,
            Err(Error::Connection(_))
        ));
        assert!(!template.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_template_disconnected() {
        let broker = InMemoryBroker::new();
        let template = broker.template();
        // Poison the connection lock
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = template.connection.lock().unwrap();
                    panic!("poison");
                })
                .join();
        });

        assert!(matches!(template.connect().await, Err(Error::Internal(_))));
        assert!(!template.is_connected());
        assert!(matches!(
            template.subscribe("worker.event").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let template = InMemoryBroker::new().template();
        assert!(matches!(
            template.send("a", &json!(1), Headers::default()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            template.subscribe("a").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let broker = InMemoryBroker::new();
        let template = broker.template();
        template.connect().await.unwrap();

        let mut events = template.subscribe("worker.event.>").await.unwrap();
        let mut other = template.subscribe("worker.run").await.unwrap();

        template
            .send("worker.event.task", &json!({ "n": 1 }), Headers::default())
            .await
            .unwrap();

        let delivery = events.recv().await.unwrap().unwrap();
        assert_eq!(delivery.context.destination, "worker.event.task");
        assert_eq!(delivery.body, json!({ "n": 1 }));

        let nothing = tokio::time::timeout(Duration::from_millis(20), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let broker = InMemoryBroker::new();
        let template = broker.template();
        template.connect().await.unwrap();

        template
            .send("worker.event", &json!("early"), Headers::default())
            .await
            .unwrap();
        let mut late = template.subscribe("worker.event").await.unwrap();
        template
            .send("worker.event", &json!("late"), Headers::default())
            .await
            .unwrap();

        let delivery = late.recv().await.unwrap().unwrap();
        assert_eq!(delivery.body, json!("late"));
    }

    #[tokio::test]
    async fn test_disconnect_ends_subscriptions() {
        let broker = InMemoryBroker::new();
        let template = broker.template();
        template.connect().await.unwrap();
        let mut subscription = template.subscribe("a.b").await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);

        template.disconnect().await.unwrap();
        assert!(subscription.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);

        // Reconnecting gives a fresh connection
        template.connect().await.unwrap();
        let mut again = template.subscribe("a.b").await.unwrap();
        template
            .send("a.b", &json!(2), Headers::default())
            .await
            .unwrap();
        assert_eq!(again.recv().await.unwrap().unwrap().body, json!(2));
    }

    #[tokio::test]
    async fn test_broker_failure_is_delivered_as_error() {
        let broker = InMemoryBroker::new();
        let template = broker.template();
        template.connect().await.unwrap();
        let mut subscription = template.subscribe("a").await.unwrap();

        broker.fail_subscribers("broker restarted");
        match subscription.recv().await {
            Some(Err(Error::Remote(msg))) => assert_eq!(msg, "broker restarted"),
            other => panic!("expected broker error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = InMemoryBroker::new();
        let server = broker.template();
        let client = broker.template();
        server.connect().await.unwrap();
        client.connect().await.unwrap();

        let mut requests = server.subscribe("echo").await.unwrap();
        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap().unwrap();
            crate::template::reply(&server, &request.context, &request.body)
                .await
                .unwrap();
        });

        let reply = send_and_receive(&client, "echo", &json!({ "x": 1 }), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "x": 1 }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_responder_times_out() {
        let broker = InMemoryBroker::new();
        let client = broker.template();
        client.connect().await.unwrap();

        let result =
            send_and_receive(&client, "nobody", &json!(null), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Remote(_))));
    }
}
