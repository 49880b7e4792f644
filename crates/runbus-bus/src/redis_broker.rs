//! Redis pub/sub broker.
//!
//! Messages are JSON envelopes (`{"headers": {...}, "body": ...}`) published
//! with `PUBLISH`. Each subscription holds its own pub/sub connection and
//! uses `PSUBSCRIBE`; the glob is wider than the topic pattern, so
//! deliveries are filtered again before they reach the subscriber.

use async_trait::async_trait;
use futures::StreamExt;
use runbus_core::{Error, Result};
use serde_json::Value;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::template::{Envelope, Headers, MessagingTemplate, Subscription};
use crate::topics::TopicPattern;

/// Broker connection backed by Redis.
pub struct RedisTemplate {
    client: redis::Client,
    url: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    token: Mutex<CancellationToken>,
}

impl RedisTemplate {
    /// Create a disconnected template.
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Connection(format!("invalid Redis URL: {}", e)))?;
        Ok(Self {
            client,
            url: redis_url.to_string(),
            connection: Mutex::new(None),
            token: Mutex::new(CancellationToken::new()),
        })
    }

    fn current_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.connection
            .lock()
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))?
            .clone()
            .ok_or(Error::NotConnected)
    }

    fn current_token(&self) -> Result<CancellationToken> {
        self.token
            .lock()
            .map(|token| token.clone())
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for RedisTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTemplate")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl MessagingTemplate for RedisTemplate {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection(format!("Redis connection failed: {}", e)))?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Error::Connection(format!("Redis PING failed: {}", e)))?;

        {
            let mut token = self
                .token
                .lock()
                .map_err(|_| Error::Internal("connection lock poisoned".to_string()))?;
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        *self
            .connection
            .lock()
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))? = Some(conn);
        info!(url = %self.url, "Connected to Redis broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let previous = self
            .connection
            .lock()
            .map_err(|_| Error::Internal("connection lock poisoned".to_string()))?
            .take();
        if previous.is_some() {
            self.current_token()?.cancel();
            debug!(url = %self.url, "Disconnected from Redis broker");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .map(|conn| conn.is_some())
            .unwrap_or(false)
    }

    async fn send(&self, destination: &str, body: &Value, headers: Headers) -> Result<()> {
        let mut conn = self.current_connection()?;
        let payload = serde_json::to_string(&Envelope {
            headers,
            body: body.clone(),
        })?;
        redis::cmd("PUBLISH")
            .arg(destination)
            .arg(&payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Error::Connection(format!("Redis PUBLISH failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let pattern = TopicPattern::parse(pattern)?;
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Connection(format!("Redis pub/sub connection failed: {}", e)))?;
        if pattern.is_wildcard() {
            pubsub
                .psubscribe(pattern.to_glob())
                .await
                .map_err(|e| Error::Connection(format!("Redis PSUBSCRIBE failed: {}", e)))?;
        } else {
            pubsub
                .subscribe(pattern.as_str())
                .await
                .map_err(|e| Error::Connection(format!("Redis SUBSCRIBE failed: {}", e)))?;
        }

        let (sink, subscription) = Subscription::channel(pattern, &self.current_token()?);
        debug!(pattern = %sink.pattern(), "Subscribed");

        tokio::spawn(async move {
            let cancel = sink.cancellation().clone();
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            sink.fail(Error::Remote("broker connection lost".to_string()));
                            break;
                        };
                        let channel = message.get_channel_name().to_string();
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "Dropping unreadable message");
                                continue;
                            }
                        };
                        match serde_json::from_str::<Envelope>(&payload) {
                            Ok(envelope) => {
                                if !sink.offer(&envelope.into_delivery(channel)) {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "Dropping malformed envelope");
                            }
                        }
                    }
                }
            }
            debug!(pattern = %sink.pattern(), "Subscription closed");
        });

        Ok(subscription)
    }
}

impl Drop for RedisTemplate {
    fn drop(&mut self) {
        if let Ok(token) = self.token.lock() {
            token.cancel();
        }
    }
}
