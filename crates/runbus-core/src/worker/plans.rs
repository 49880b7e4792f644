//! Built-in plans and simulated devices.
//!
//! These stand in for a real execution engine so the worker can be run and
//! tested end to end.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::plan::{Plan, PlanError, RunContext};
use crate::context::{Device, Movable, ParamKind, ParamSpec, WorkerContext};
use crate::error::{Error, Result};
use crate::events::StatusView;

/// Upper bound on a single sleep or move, in seconds.
const MAX_SLEEP_SECS: f64 = 86_400.0;

/// Largest absolute motor position, in device units.
const MAX_POSITION: f64 = 1_000_000.0;

/// Wait for a number of seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepPlan;

const SLEEP_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "time",
    ParamKind::Float,
    "Seconds to wait",
)];

fn sleep_duration(params: &Map<String, Value>) -> Result<Duration> {
    let secs = params
        .get("time")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Validation("parameter 'time' must be a number".to_string()))?;
    if !(0.0..=MAX_SLEEP_SECS).contains(&secs) {
        return Err(Error::Validation(format!(
            "parameter 'time' must be between 0 and {}, got {}",
            MAX_SLEEP_SECS, secs
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| Error::Validation(e.to_string()))
}

#[async_trait]
impl Plan for SleepPlan {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for the given number of seconds"
    }

    fn params(&self) -> &[ParamSpec] {
        SLEEP_PARAMS
    }

    fn validate(&self, params: &Map<String, Value>, _context: &WorkerContext) -> Result<()> {
        sleep_duration(params).map(|_| ())
    }

    async fn run(
        &self,
        params: &Map<String, Value>,
        run: &mut RunContext,
    ) -> std::result::Result<(), PlanError> {
        let duration = sleep_duration(params).map_err(|e| PlanError::Failed(e.to_string()))?;
        run.emit_document("start", json!({ "plan_name": "sleep", "time": duration.as_secs_f64() }));
        run.sleep(duration).await?;
        run.emit_document("stop", json!({ "exit_status": "success" }));
        Ok(())
    }
}

/// Move a motor to an absolute position.
#[derive(Debug, Default, Clone, Copy)]
pub struct MovePlan;

const MOVE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("motor", ParamKind::String, "Name of the motor to move"),
    ParamSpec::required("pos", ParamKind::Float, "Target position"),
];

fn move_args(params: &Map<String, Value>) -> Result<(&str, f64)> {
    let motor = params
        .get("motor")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("parameter 'motor' must be a string".to_string()))?;
    let pos = params
        .get("pos")
        .and_then(Value::as_f64)
        .filter(|pos| pos.is_finite())
        .ok_or_else(|| Error::Validation("parameter 'pos' must be a finite number".to_string()))?;
    if pos.abs() > MAX_POSITION {
        return Err(Error::Validation(format!(
            "parameter 'pos' must be between -{0} and {0}, got {1}",
            MAX_POSITION, pos
        )));
    }
    Ok((motor, pos))
}

/// Seconds a move from `initial` to `target` takes.
fn travel_secs(movable: &dyn Movable, initial: f64, target: f64) -> f64 {
    (target - initial).abs() / movable.velocity().max(f64::EPSILON)
}

#[async_trait]
impl Plan for MovePlan {
    fn name(&self) -> &str {
        "move"
    }

    fn description(&self) -> &str {
        "Move a motor to an absolute position"
    }

    fn params(&self) -> &[ParamSpec] {
        MOVE_PARAMS
    }

    fn validate(&self, params: &Map<String, Value>, context: &WorkerContext) -> Result<()> {
        let (motor, target) = move_args(params)?;
        let device = context
            .device(motor)
            .ok_or_else(|| Error::Validation(format!("no device named '{}'", motor)))?;
        let movable = device
            .as_movable()
            .ok_or_else(|| Error::Validation(format!("device '{}' cannot be moved", motor)))?;
        let travel = travel_secs(movable, movable.position(), target);
        if travel > MAX_SLEEP_SECS {
            return Err(Error::Validation(format!(
                "moving '{}' to {} would take {:.0}s, more than {}s",
                motor, target, travel, MAX_SLEEP_SECS
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        params: &Map<String, Value>,
        run: &mut RunContext,
    ) -> std::result::Result<(), PlanError> {
        let (motor, target) = move_args(params).map_err(|e| PlanError::Failed(e.to_string()))?;
        let device = run
            .device(motor)
            .ok_or_else(|| PlanError::Failed(format!("no device named '{}'", motor)))?;
        let movable = device
            .as_movable()
            .ok_or_else(|| PlanError::Failed(format!("device '{}' cannot be moved", motor)))?;

        let initial = movable.position();
        let travel = travel_secs(movable, initial, target);
        if travel > MAX_SLEEP_SECS {
            return Err(PlanError::Failed(format!(
                "moving '{}' to {} would take {:.0}s",
                motor, target, travel
            )));
        }
        let step = run.checkpoint_interval().max(Duration::from_millis(1));
        let steps = (travel / step.as_secs_f64()).ceil().clamp(1.0, f64::from(u32::MAX)) as u32;
        let per_step = Duration::try_from_secs_f64(travel / f64::from(steps))
            .map_err(|e| PlanError::Failed(format!("invalid move duration: {}", e)))?;
        let started = Instant::now();

        run.emit_document(
            "start",
            json!({ "plan_name": "move", "motor": motor, "target": target }),
        );
        for i in 1..=steps {
            run.sleep(per_step).await?;
            let fraction = f64::from(i) / f64::from(steps);
            let position = initial + (target - initial) * fraction;
            movable.set_position(position);
            run.report_progress(
                motor,
                StatusView {
                    display_name: motor.to_string(),
                    current: Some(position),
                    initial: Some(initial),
                    target: Some(target),
                    unit: Some(movable.unit().to_string()),
                    percentage: Some(fraction),
                    time_elapsed: Some(started.elapsed().as_secs_f64()),
                    done: i == steps,
                },
            );
            run.emit_document("event", json!({ "seq_num": i, "data": { motor: position } }));
        }
        run.emit_document("stop", json!({ "exit_status": "success", "num_events": steps }));
        Ok(())
    }
}

/// Simulated motor with a constant velocity.
#[derive(Debug)]
pub struct SimMotor {
    name: String,
    position: AtomicU64,
    velocity: f64,
}

impl SimMotor {
    /// Motor at position 0 moving `velocity` mm per second.
    pub fn new(name: impl Into<String>, velocity: f64) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0f64.to_bits()),
            velocity,
        }
    }
}

impl Device for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocols(&self) -> Vec<&'static str> {
        vec!["Readable", "Movable"]
    }

    fn as_movable(&self) -> Option<&dyn Movable> {
        Some(self)
    }
}

impl Movable for SimMotor {
    fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::SeqCst))
    }

    fn set_position(&self, position: f64) {
        self.position.store(position.to_bits(), Ordering::SeqCst);
    }

    fn velocity(&self) -> f64 {
        self.velocity
    }

    fn unit(&self) -> &str {
        "mm"
    }
}

/// Simulated read-only detector.
#[derive(Debug)]
pub struct SimDetector {
    name: String,
}

impl SimDetector {
    /// Detector with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Device for SimDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocols(&self) -> Vec<&'static str> {
        vec!["Readable"]
    }
}

/// Context with the built-in plans and a small simulated beamline.
#[must_use]
pub fn default_context() -> WorkerContext {
    WorkerContext::builder()
        .plan(SleepPlan)
        .plan(MovePlan)
        .device(SimMotor::new("x", 10.0))
        .device(SimMotor::new("y", 5.0))
        .device(SimDetector::new("det"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::task::TaskId;
    use crate::worker::plan::Control;
    use std::sync::Arc;
    use tokio::sync::watch;

    #[test]
    fn test_sleep_duration_bounds() {
        let mut params = Map::new();
        params.insert("time".into(), json!(0.25));
        assert_eq!(sleep_duration(&params).unwrap(), Duration::from_millis(250));
        params.insert("time".into(), json!(-0.1));
        assert!(sleep_duration(&params).is_err());
        params.insert("time".into(), json!(1e12));
        assert!(sleep_duration(&params).is_err());
    }

    #[test]
    fn test_move_rejects_unreachable_targets() {
        let ctx = default_context();
        let mut params = Map::new();
        params.insert("motor".into(), json!("x"));

        params.insert("pos".into(), json!(1e300));
        assert!(matches!(
            MovePlan.validate(&params, &ctx),
            Err(Error::Validation(_))
        ));

        // In range, but x moves 10 mm/s: 900000 mm takes longer than a day
        params.insert("pos".into(), json!(900_000.0));
        assert!(matches!(
            MovePlan.validate(&params, &ctx),
            Err(Error::Validation(_))
        ));

        params.insert("pos".into(), json!(25.0));
        assert!(MovePlan.validate(&params, &ctx).is_ok());
    }

    #[test]
    fn test_default_context_contents() {
        let ctx = default_context();
        assert!(ctx.plan("sleep").is_some());
        assert!(ctx.plan("move").is_some());
        assert!(ctx.device("x").and_then(|d| d.as_movable().map(|_| ())).is_some());
        assert!(ctx.device("det").unwrap().as_movable().is_none());
    }

    #[tokio::test]
    async fn test_move_reaches_target() {
        let ctx = Arc::new(
            WorkerContext::builder()
                .plan(MovePlan)
                .device(SimMotor::new("x", 100.0))
                .build(),
        );
        let (_tx, rx) = watch::channel(Control::Run);
        let data = EventPublisher::new(64);
        let mut docs = data.subscribe();
        let mut run = RunContext::new(
            TaskId::from("t1"),
            ctx.clone(),
            rx,
            EventPublisher::new(64),
            data,
            Duration::from_millis(5),
        );
        let mut params = Map::new();
        params.insert("motor".into(), json!("x"));
        params.insert("pos".into(), json!(2.0));

        MovePlan.run(&params, &mut run).await.unwrap();

        let motor = ctx.device("x").unwrap();
        let position = motor.as_movable().unwrap().position();
        assert!((position - 2.0).abs() < 1e-9);
        assert_eq!(docs.recv().await.unwrap().name, "start");
    }
}
