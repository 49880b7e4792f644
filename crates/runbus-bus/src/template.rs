//! Messaging template: the broker-neutral send/subscribe surface.
//!
//! A template owns one broker connection. Subscriptions deliver messages
//! through a channel and stay live until they are dropped, unsubscribed,
//! or the connection is closed. Closing the connection discards anything
//! still queued.

use async_trait::async_trait;
use runbus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::topics::{TopicPattern, REPLY_PREFIX};

/// Delivery metadata for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    /// Topic the message was published on
    pub destination: String,
    /// Where the sender expects a reply
    #[serde(default)]
    pub reply_destination: Option<String>,
    /// Correlation key chosen by the sender
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl MessageContext {
    /// Reply destination, or a contract violation if the sender gave none.
    pub fn require_reply_destination(&self) -> Result<&str> {
        self.reply_destination.as_deref().ok_or_else(|| {
            Error::ContractViolation(format!(
                "request on '{}' carries no reply destination",
                self.destination
            ))
        })
    }
}

/// An inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Delivery metadata
    pub context: MessageContext,
    /// Decoded JSON body
    pub body: Value,
}

/// Headers carried next to a body on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Reply destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Correlation key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Serialized message as it travels through a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message headers
    #[serde(default)]
    pub headers: Headers,
    /// Message body
    pub body: Value,
}

impl Envelope {
    /// Attach the destination the envelope arrived on.
    #[must_use]
    pub fn into_delivery(self, destination: impl Into<String>) -> Delivery {
        Delivery {
            context: MessageContext {
                destination: destination.into(),
                reply_destination: self.headers.reply_to,
                correlation_id: self.headers.correlation_id,
            },
            body: self.body,
        }
    }
}

/// Item produced by a subscription: a message or a broker-level failure.
pub type Inbound = Result<Delivery>;

/// Live subscription.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    pattern: TopicPattern,
    receiver: mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a subscription and the sending half a broker feeds.
    ///
    /// `parent` is the owning connection's token; cancelling it ends the
    /// subscription.
    #[must_use]
    pub fn channel(
        pattern: TopicPattern,
        parent: &CancellationToken,
    ) -> (SubscriptionSink, Subscription) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        (
            SubscriptionSink {
                pattern: pattern.clone(),
                sender,
                cancel: cancel.clone(),
            },
            Subscription {
                pattern,
                receiver,
                cancel,
            },
        )
    }

    /// Pattern this subscription listens on.
    #[must_use]
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Next message, or `None` once the subscription has ended.
    ///
    /// After cancellation, queued messages are discarded rather than drained.
    pub async fn recv(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Token that is cancelled when this subscription ends.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the subscription has been cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop receiving.
    pub fn unsubscribe(self) {
        debug!(pattern = %self.pattern, "Unsubscribed");
        // Drop cancels the token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Broker-side half of a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSink {
    pattern: TopicPattern,
    sender: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
}

impl SubscriptionSink {
    /// Pattern the subscription was made with.
    #[must_use]
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Whether the subscriber is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    /// Token cancelled when the subscriber goes away.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forward a message if the topic matches. Returns false once closed.
    pub fn offer(&self, delivery: &Delivery) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.pattern.matches(&delivery.context.destination) {
            return self.sender.send(Ok(delivery.clone())).is_ok();
        }
        true
    }

    /// Report a broker-level failure to the subscriber.
    pub fn fail(&self, error: Error) -> bool {
        !self.is_closed() && self.sender.send(Err(error)).is_ok()
    }
}

/// Broker-neutral messaging surface.
#[async_trait]
pub trait MessagingTemplate: Send + Sync {
    /// Open the broker connection.
    async fn connect(&self) -> Result<()>;

    /// Close the broker connection and end every subscription made on it.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;

    /// Publish `body` to `destination`.
    async fn send(&self, destination: &str, body: &Value, headers: Headers) -> Result<()>;

    /// Subscribe to a topic pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;
}

/// Fresh temporary reply destination.
#[must_use]
pub fn temporary_destination() -> String {
    format!("{}.{}", REPLY_PREFIX, Uuid::new_v4().simple())
}

/// Send a request and wait for the first reply.
///
/// Subscribes to a temporary reply destination before sending, so a fast
/// reply cannot be missed.
pub async fn send_and_receive(
    template: &dyn MessagingTemplate,
    destination: &str,
    body: &Value,
    timeout: Duration,
) -> Result<Value> {
    let reply_to = temporary_destination();
    let mut replies = template.subscribe(&reply_to).await?;
    let correlation_id = Uuid::new_v4().to_string();
    template
        .send(
            destination,
            body,
            Headers {
                reply_to: Some(reply_to.clone()),
                correlation_id: Some(correlation_id.clone()),
            },
        )
        .await?;

    let reply = tokio::time::timeout(timeout, async {
        while let Some(inbound) = replies.recv().await {
            let delivery = inbound?;
            match delivery.context.correlation_id.as_deref() {
                Some(id) if id != correlation_id => continue,
                _ => return Ok(delivery.body),
            }
        }
        Err(Error::Connection(format!(
            "connection closed while waiting for a reply on '{}'",
            destination
        )))
    })
    .await
    .map_err(|_| {
        Error::Remote(format!(
            "no reply to '{}' within {:.1}s",
            destination,
            timeout.as_secs_f64()
        ))
    })?;
    replies.unsubscribe();
    reply
}

/// Reply to a request, echoing its correlation id.
pub async fn reply(
    template: &dyn MessagingTemplate,
    context: &MessageContext,
    body: &Value,
) -> Result<()> {
    let destination = context.require_reply_destination()?;
    template
        .send(
            destination,
            body,
            Headers {
                reply_to: None,
                correlation_id: context.correlation_id.clone(),
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(destination: &str) -> Delivery {
        Delivery {
            context: MessageContext {
                destination: destination.to_string(),
                reply_destination: None,
                correlation_id: None,
            },
            body: json!({ "n": 1 }),
        }
    }

    #[test]
    fn test_missing_reply_destination_is_contract_violation() {
        let context = delivery("worker.run").context;
        assert!(matches!(
            context.require_reply_destination(),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            headers: Headers {
                reply_to: Some("temp.reply.1".into()),
                correlation_id: None,
            },
            body: json!([1, 2]),
        };
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(!wire.contains("correlation_id"));
        let back: Envelope = serde_json::from_str(&wire).unwrap();
        let delivery = back.into_delivery("worker.plans");
        assert_eq!(
            delivery.context.reply_destination.as_deref(),
            Some("temp.reply.1")
        );
        assert_eq!(delivery.body, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_sink_filters_by_pattern() {
        let connection = CancellationToken::new();
        let (sink, mut subscription) =
            Subscription::channel(TopicPattern::parse("worker.*").unwrap(), &connection);
        assert!(sink.offer(&delivery("worker.event.task")));
        assert!(sink.offer(&delivery("worker.event")));
        let received = subscription.recv().await.unwrap().unwrap();
        assert_eq!(received.context.destination, "worker.event");
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_messages() {
        let connection = CancellationToken::new();
        let (sink, mut subscription) =
            Subscription::channel(TopicPattern::parse("a").unwrap(), &connection);
        sink.offer(&delivery("a"));
        connection.cancel();
        assert!(subscription.recv().await.is_none());
        assert!(sink.is_closed());
        assert!(!sink.offer(&delivery("a")));
    }

    #[tokio::test]
    async fn test_drop_closes_sink() {
        let connection = CancellationToken::new();
        let (sink, subscription) =
            Subscription::channel(TopicPattern::parse("a").unwrap(), &connection);
        drop(subscription);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_temporary_destinations_are_unique() {
        let a = temporary_destination();
        assert!(a.starts_with("temp.reply."));
        assert_ne!(a, temporary_destination());
    }
}
