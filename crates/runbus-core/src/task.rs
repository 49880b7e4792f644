//! Tasks and task identifiers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Opaque task identifier, generated once per submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh, never reused identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A named unit of work plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Plan name
    pub name: String,
    /// Plan parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Task {
    /// Create a task without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Build a task from a JSON parameter string as typed on the command line.
    ///
    /// An absent string means no parameters. Anything that is not a JSON
    /// object is a validation error.
    pub fn from_json_params(name: impl Into<String>, params: Option<&str>) -> crate::Result<Self> {
        let params = match params {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(crate::Error::Validation(format!(
                        "parameters must be a JSON object, got {}",
                        other
                    )))
                }
                Err(e) => {
                    return Err(crate::Error::Validation(format!(
                        "parameters are not valid JSON: {}",
                        e
                    )))
                }
            },
        };
        Ok(Self {
            name: name.into(),
            params,
        })
    }
}

/// Reply to a successful `create_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Identifier of the registered task
    pub task_id: TaskId,
}

/// Request and acknowledgement for `update_worker_task`.
///
/// `task_id = None` in an acknowledgement means the worker has no active task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Task to begin
    pub task_id: Option<TaskId>,
}
