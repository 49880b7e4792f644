//! Topic names and topic patterns.
//!
//! Topics are dot-separated. Patterns may use `*` for exactly one segment
//! and `>` as the last segment for one or more remaining segments.

use runbus_core::{BusEvent, Error, Result};
use serde_json::Value;
use std::fmt;

/// Worker state changes and progress reports.
pub const WORKER_EVENT: &str = "worker.event";
/// Task lifecycle events.
pub const TASK_EVENT: &str = "worker.event.task";
/// Data documents.
pub const DATA_EVENT: &str = "worker.event.data";

/// Run request: task in, task id out.
pub const RUN_REQUEST: &str = "worker.run";
/// Plan listing request.
pub const PLANS_QUERY: &str = "worker.plans";
/// Device listing request.
pub const DEVICES_QUERY: &str = "worker.devices";
/// Start a submitted task.
pub const TASK_START: &str = "worker.task.start";
/// Read the worker state.
pub const STATE_QUERY: &str = "worker.state";
/// Change the worker state.
pub const STATE_CHANGE: &str = "worker.state.set";

/// Prefix of temporary reply destinations.
pub const REPLY_PREFIX: &str = "temp.reply";

/// Compiled topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

impl TopicPattern {
    /// Parse a pattern.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Validation("empty topic pattern".to_string()));
        }
        let parts: Vec<&str> = raw.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(Error::Validation(format!(
                        "empty segment in topic pattern '{}'",
                        raw
                    )))
                }
                "*" => Segment::One,
                ">" if i + 1 == parts.len() => Segment::Rest,
                ">" => {
                    return Err(Error::Validation(format!(
                        "'>' must be the last segment of '{}'",
                        raw
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Whether `topic` matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => return parts.len() > i,
                Segment::One => {
                    if i >= parts.len() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if parts.get(i) != Some(&literal.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.len() == self.segments.len()
    }

    /// Whether the pattern contains wildcards.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    /// Glob form understood by Redis `PSUBSCRIBE`.
    ///
    /// The glob is wider than the pattern; deliveries are filtered again
    /// with [`TopicPattern::matches`].
    #[must_use]
    pub fn to_glob(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.as_str(),
                Segment::One | Segment::Rest => "*",
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Decode an event delivered on one of the broadcast topics.
///
/// `worker.event` carries both worker-state and progress events; they are
/// told apart by their fields.
pub fn decode_event(destination: &str, body: Value) -> Result<BusEvent> {
    match destination {
        WORKER_EVENT => {
            if body.get("state").is_some() {
                Ok(BusEvent::Worker(serde_json::from_value(body)?))
            } else {
                Ok(BusEvent::Progress(serde_json::from_value(body)?))
            }
        }
        TASK_EVENT => Ok(BusEvent::Task(serde_json::from_value(body)?)),
        DATA_EVENT => Ok(BusEvent::Data(serde_json::from_value(body)?)),
        other => Err(Error::Validation(format!(
            "'{}' is not an event topic",
            other
        ))),
    }
}

/// Topic an event is published on.
#[must_use]
pub fn topic_for(event: &BusEvent) -> &'static str {
    match event {
        BusEvent::Worker(_) | BusEvent::Progress(_) => WORKER_EVENT,
        BusEvent::Task(_) => TASK_EVENT,
        BusEvent::Data(_) => DATA_EVENT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbus_core::{ProgressEvent, TaskId, WorkerState};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_literal_pattern() {
        let pattern = TopicPattern::parse("worker.event").unwrap();
        assert!(pattern.matches("worker.event"));
        assert!(!pattern.matches("worker.event.task"));
        assert!(!pattern.matches("worker"));
        assert!(!pattern.is_wildcard());
    }

    #[test]
    fn test_single_segment_wildcard() {
        let pattern = TopicPattern::parse("worker.*").unwrap();
        assert!(pattern.matches("worker.event"));
        assert!(pattern.matches("worker.run"));
        assert!(!pattern.matches("worker.event.task"));
        assert!(!pattern.matches("worker"));
    }

    #[test]
    fn test_rest_wildcard() {
        let pattern = TopicPattern::parse("worker.event.>").unwrap();
        assert!(pattern.matches("worker.event.task"));
        assert!(pattern.matches("worker.event.data"));
        assert!(!pattern.matches("worker.event"));
        assert_eq!(pattern.to_glob(), "worker.event.*");
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("worker..event").is_err());
        assert!(TopicPattern::parse("worker.>.event").is_err());
    }

    #[test]
    fn test_decode_worker_topic_variants() {
        let worker = json!({ "state": "RUNNING", "task_status": null });
        match decode_event(WORKER_EVENT, worker).unwrap() {
            BusEvent::Worker(event) => assert_eq!(event.state, WorkerState::Running),
            other => panic!("expected worker event, got {:?}", other),
        }

        let progress = serde_json::to_value(ProgressEvent {
            task_id: TaskId::from("t1"),
            statuses: BTreeMap::new(),
        })
        .unwrap();
        assert!(matches!(
            decode_event(WORKER_EVENT, progress).unwrap(),
            BusEvent::Progress(_)
        ));
    }

    #[test]
    fn test_decode_rejects_other_topics() {
        assert!(decode_event(RUN_REQUEST, json!({})).is_err());
        assert!(decode_event(TASK_EVENT, json!({ "bogus": 1 })).is_err());
    }
}
