//! Worker context: the plans and devices a worker offers.
//!
//! Built once at startup with [`WorkerContext::builder`] and shared by the
//! worker and the bridge. Nothing here is global.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::task::Task;
use crate::worker::plan::Plan;

/// Type of a plan parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Any JSON number
    Float,
    /// Whole JSON number
    Integer,
    /// JSON string
    String,
    /// JSON boolean
    Boolean,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Float => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
        }
    }

    fn json_type(self) -> &'static str {
        match self {
            Self::Float => "number",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Boolean => "boolean",
        }
    }
}

/// Declaration of one plan parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: &'static str,
    /// Expected type
    pub kind: ParamKind,
    /// Whether the parameter must be present
    pub required: bool,
    /// Short description for the schema
    pub description: &'static str,
}

impl ParamSpec {
    /// A required parameter.
    #[must_use]
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    /// An optional parameter.
    #[must_use]
    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// Check `params` against a parameter list.
pub fn validate_params(plan: &str, specs: &[ParamSpec], params: &Map<String, Value>) -> Result<()> {
    for key in params.keys() {
        if !specs.iter().any(|spec| spec.name == key) {
            return Err(Error::Validation(format!(
                "plan '{}' has no parameter '{}'",
                plan, key
            )));
        }
    }
    for spec in specs {
        match params.get(spec.name) {
            None if spec.required => {
                return Err(Error::Validation(format!(
                    "plan '{}' requires parameter '{}'",
                    plan, spec.name
                )))
            }
            Some(value) if !spec.kind.accepts(value) => {
                return Err(Error::Validation(format!(
                    "parameter '{}' of plan '{}' must be {}, got {}",
                    spec.name,
                    plan,
                    spec.kind.json_type(),
                    value
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// JSON schema describing a parameter list.
#[must_use]
pub fn params_schema(specs: &[ParamSpec]) -> Value {
    let properties: Map<String, Value> = specs
        .iter()
        .map(|spec| {
            (
                spec.name.to_string(),
                json!({ "type": spec.kind.json_type(), "description": spec.description }),
            )
        })
        .collect();
    let required: Vec<&str> = specs
        .iter()
        .filter(|spec| spec.required)
        .map(|spec| spec.name)
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Plan listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    /// Plan name
    pub name: String,
    /// What the plan does
    #[serde(default)]
    pub description: String,
    /// JSON schema of the parameters
    pub schema: Value,
}

/// Device listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device name
    pub name: String,
    /// Protocols the device implements ("Readable", "Movable", ...)
    pub protocols: Vec<String>,
}

/// Something the worker can talk to.
pub trait Device: Send + Sync {
    /// Unique device name
    fn name(&self) -> &str;

    /// Protocol names the device implements.
    fn protocols(&self) -> Vec<&'static str>;

    /// Movable view of the device, if it can be moved.
    fn as_movable(&self) -> Option<&dyn Movable> {
        None
    }
}

/// A device with a settable position.
pub trait Movable: Send + Sync {
    /// Current position
    fn position(&self) -> f64;

    /// Record a new position
    fn set_position(&self, position: f64);

    /// Units per second
    fn velocity(&self) -> f64;

    /// Position unit
    fn unit(&self) -> &str;
}

/// Registry of plans and devices.
#[derive(Clone, Default)]
pub struct WorkerContext {
    plans: BTreeMap<String, Arc<dyn Plan>>,
    devices: BTreeMap<String, Arc<dyn Device>>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("plans", &self.plans.keys().collect::<Vec<_>>())
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerContext {
    /// Start building a context.
    #[must_use]
    pub fn builder() -> WorkerContextBuilder {
        WorkerContextBuilder::default()
    }

    /// Look up a plan.
    #[must_use]
    pub fn plan(&self, name: &str) -> Option<&Arc<dyn Plan>> {
        self.plans.get(name)
    }

    /// Look up a device.
    #[must_use]
    pub fn device(&self, name: &str) -> Option<&Arc<dyn Device>> {
        self.devices.get(name)
    }

    /// Validate a task before it is registered.
    pub fn validate(&self, task: &Task) -> Result<()> {
        let plan = self
            .plan(&task.name)
            .ok_or_else(|| Error::Validation(format!("unknown plan '{}'", task.name)))?;
        validate_params(&task.name, plan.params(), &task.params)?;
        plan.validate(&task.params, self)
    }

    /// Plans in name order.
    #[must_use]
    pub fn plan_descriptors(&self) -> Vec<PlanDescriptor> {
        self.plans
            .iter()
            .map(|(name, plan)| PlanDescriptor {
                name: name.clone(),
                description: plan.description().to_string(),
                schema: params_schema(plan.params()),
            })
            .collect()
    }

    /// Devices in name order.
    #[must_use]
    pub fn device_descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .values()
            .map(|device| DeviceDescriptor {
                name: device.name().to_string(),
                protocols: device
                    .protocols()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            })
            .collect()
    }
}

/// Builder for [`WorkerContext`].
#[derive(Default)]
pub struct WorkerContextBuilder {
    context: WorkerContext,
}

impl WorkerContextBuilder {
    /// Register a plan under its own name.
    #[must_use]
    pub fn plan(mut self, plan: impl Plan + 'static) -> Self {
        self.context
            .plans
            .insert(plan.name().to_string(), Arc::new(plan));
        self
    }

    /// Register a device under its own name.
    #[must_use]
    pub fn device(mut self, device: impl Device + 'static) -> Self {
        self.context
            .devices
            .insert(device.name().to_string(), Arc::new(device));
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> WorkerContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::plans::{default_context, MovePlan, SimMotor, SleepPlan};

    #[test]
    fn test_validate_known_plan() {
        let ctx = default_context();
        let task = Task::new("sleep").with_param("time", 0.1);
        assert!(ctx.validate(&task).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_plan() {
        let ctx = default_context();
        let err = ctx.validate(&Task::new("scan")).unwrap_err();
        assert!(err.to_string().contains("unknown plan"));
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let ctx = default_context();
        let cases = vec![
            Task::new("sleep"),
            Task::new("sleep").with_param("time", "soon"),
            Task::new("sleep")
                .with_param("time", 1.0)
                .with_param("extra", true),
            Task::new("sleep").with_param("time", -1.0),
            Task::new("move").with_param("motor", "z").with_param("pos", 1.0),
            Task::new("move").with_param("motor", "det").with_param("pos", 1.0),
        ];
        for task in cases {
            assert!(
                matches!(ctx.validate(&task), Err(Error::Validation(_))),
                "{:?} should fail validation",
                task
            );
        }
    }

    #[test]
    fn test_integer_kind() {
        let specs = [ParamSpec::required("n", ParamKind::Integer, "count")];
        let mut params = Map::new();
        params.insert("n".into(), json!(3));
        assert!(validate_params("p", &specs, &params).is_ok());
        params.insert("n".into(), json!(3.5));
        assert!(validate_params("p", &specs, &params).is_err());
    }

    #[test]
    fn test_schema_shape() {
        let schema = params_schema(&[
            ParamSpec::required("motor", ParamKind::String, "device"),
            ParamSpec::optional("settle", ParamKind::Float, "seconds"),
        ]);
        assert_eq!(schema["properties"]["motor"]["type"], "string");
        assert_eq!(schema["properties"]["settle"]["type"], "number");
        assert_eq!(schema["required"], json!(["motor"]));
    }

    #[test]
    fn test_descriptors_are_sorted() {
        let ctx = WorkerContext::builder()
            .plan(SleepPlan)
            .plan(MovePlan)
            .device(SimMotor::new("y", 1.0))
            .device(SimMotor::new("x", 1.0))
            .build();
        let plans: Vec<_> = ctx.plan_descriptors().into_iter().map(|p| p.name).collect();
        assert_eq!(plans, vec!["move", "sleep"]);
        let devices = ctx.device_descriptors();
        assert_eq!(devices[0].name, "x");
        assert_eq!(devices[0].protocols, vec!["Readable", "Movable"]);
    }
}
