//! Runbus Bus - broker messaging for workers and controllers
//!
//! This crate provides:
//! - Topics: the fixed topic names and `*` / `>` topic patterns
//! - Template: the broker-neutral send/subscribe trait and request/reply
//! - Brokers: an in-process broker and a Redis pub/sub broker
//! - Client: the controller-side event bus client with completion tracking

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod memory;
pub mod redis_broker;
pub mod template;
pub mod topics;

pub use client::{EventBusClient, EventStream, WaitOutcome};
pub use memory::{InMemoryBroker, InMemoryTemplate};
pub use redis_broker::RedisTemplate;
pub use template::{
    reply, send_and_receive, temporary_destination, Delivery, Envelope, Headers, Inbound,
    MessageContext, MessagingTemplate, Subscription, SubscriptionSink,
};
pub use topics::{decode_event, topic_for, TopicPattern};
