//! `runbus controller` subcommands

use clap::Subcommand;
use runbus_bus::{EventBusClient, WaitOutcome};
use runbus_core::{
    format_error_for_cli, Error, ErrorKind, Result, StateChangeRequest, Task, WorkerState,
};
use runbus_service::{listen, run_task, BridgeHandle, BusSubmitter, TaskSubmitter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::config::AppConfig;
use crate::server::{self, Broker};

#[derive(Subcommand, Debug)]
pub enum ControllerCommand {
    /// List the plans the worker can run
    Plans,
    /// List the devices the worker knows
    Devices,
    /// Print every event on the bus until Ctrl+C
    Listen,
    /// Run a plan and wait for it to finish
    Run {
        /// Plan name
        name: String,
        /// Plan parameters as a JSON object
        parameters: Option<String>,
        /// Seconds to wait for completion (default: wait forever)
        #[arg(short = 't', long)]
        timeout: Option<f64>,
    },
    /// Show the worker state
    State,
    /// Pause the running task
    Pause {
        /// Pause at the next checkpoint instead of immediately
        #[arg(long)]
        defer: bool,
    },
    /// Resume a paused task
    Resume,
    /// Abort the current task, marking it failed
    Abort {
        /// Reason to record
        reason: Option<String>,
    },
    /// Stop the current task, marking it successful
    Stop,
}

/// Broker connection for one command.
struct Session {
    client: EventBusClient,
    submitter: BusSubmitter,
    // Worker hosted in this process when the broker is in-memory
    embedded: Option<BridgeHandle>,
}

impl Session {
    async fn open(config: &AppConfig) -> Result<Self> {
        let broker = Broker::from_config(&config.broker);
        let embedded = match broker {
            Broker::Memory(_) => Some(server::start_worker(&broker, config).await?),
            Broker::Redis(_) => None,
        };
        let client = EventBusClient::connect(broker.template()?).await?;
        let submitter = BusSubmitter::new(
            client.template().clone(),
            config.broker.request_timeout(),
        );
        Ok(Self {
            client,
            submitter,
            embedded,
        })
    }

    async fn close(self) -> Result<()> {
        self.client.disconnect().await?;
        if let Some(worker) = self.embedded {
            worker.stop().await?;
        }
        Ok(())
    }
}

/// Run a controller command, reporting failures by kind.
pub async fn run(command: ControllerCommand, config: &AppConfig) -> anyhow::Result<()> {
    if let Err(e) = execute(command, config).await {
        debug!(error = ?e, kind = ?e.kind(), "Controller command failed");
        eprintln!("{}", format_error_for_cli(&e));
        if e.kind() != ErrorKind::Connection {
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn execute(command: ControllerCommand, config: &AppConfig) -> Result<()> {
    // Parameters are checked before anything is sent
    let task = match &command {
        ControllerCommand::Run {
            name, parameters, ..
        } => Some(Task::from_json_params(name.clone(), parameters.as_deref())?),
        _ => None,
    };

    let session = Session::open(config).await?;
    let result = dispatch(&session, command, task, config).await;
    let closed = session.close().await;
    result.and(closed)
}

async fn dispatch(
    session: &Session,
    command: ControllerCommand,
    task: Option<Task>,
    config: &AppConfig,
) -> Result<()> {
    let submitter = &session.submitter;
    match command {
        ControllerCommand::Plans => {
            for plan in submitter.get_plans().await? {
                println!("{}", plan.name);
                if !plan.description.is_empty() {
                    println!("    {}", plan.description);
                }
                println!("    Schema");
                for line in serde_json::to_string_pretty(&plan.schema)?.lines() {
                    println!("        {}", line);
                }
            }
        }
        ControllerCommand::Devices => {
            for device in submitter.get_devices().await? {
                println!("{}", device.name);
                for protocol in device.protocols {
                    println!("    {}", protocol);
                }
            }
        }
        ControllerCommand::Listen => {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                server::wait_for_shutdown_signal().await;
                trigger.cancel();
            });
            eprintln!("Subscribing to all bus events; press Ctrl+C to stop");
            listen(&session.client, shutdown, |event| match event.to_value() {
                Ok(body) => println!("{}", body),
                Err(e) => eprintln!("Undecodable event: {}", e),
            })
            .await?;
        }
        ControllerCommand::Run { timeout, .. } => {
            let task = task.ok_or_else(|| Error::Internal("task was not parsed".to_string()))?;
            let timeout = timeout_from_secs(timeout.or(config.controller.default_timeout_secs))?;
            let report = run_task(submitter, &session.client, task, timeout).await?;
            match report.outcome {
                WaitOutcome::Complete(_) => println!("Task {} finished", report.task_id),
                WaitOutcome::TimedOut { waited } => println!(
                    "Task {} did not finish within {:.2}s; its state is unknown",
                    report.task_id,
                    waited.as_secs_f64()
                ),
            }
        }
        ControllerCommand::State => {
            println!("{}", submitter.get_state().await?);
        }
        ControllerCommand::Pause { defer } => {
            let request = StateChangeRequest::new(WorkerState::Paused).deferred(defer);
            println!("{}", submitter.set_state(request).await?);
        }
        ControllerCommand::Resume => {
            let request = StateChangeRequest::new(WorkerState::Running);
            println!("{}", submitter.set_state(request).await?);
        }
        ControllerCommand::Abort { reason } => {
            println!(
                "{}",
                submitter
                    .cancel_current_task(WorkerState::Aborting, reason)
                    .await?
            );
        }
        ControllerCommand::Stop => {
            println!(
                "{}",
                submitter
                    .cancel_current_task(WorkerState::Stopping, None)
                    .await?
            );
        }
    }
    Ok(())
}

fn timeout_from_secs(secs: Option<f64>) -> Result<Option<Duration>> {
    secs.map(|secs| {
        Duration::try_from_secs_f64(secs)
            .map_err(|_| Error::Validation(format!("timeout must be a non-negative number of seconds, got {}", secs)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::BrokerKind;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.broker.kind = BrokerKind::Memory;
        config.worker.checkpoint_interval_ms = 5;
        config
    }

    #[test]
    fn test_timeout_parsing() {
        assert_eq!(timeout_from_secs(None).unwrap(), None);
        assert_eq!(
            timeout_from_secs(Some(0.5)).unwrap(),
            Some(Duration::from_millis(500))
        );
        assert!(matches!(
            timeout_from_secs(Some(-1.0)),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_run_on_embedded_worker() {
        let command = ControllerCommand::Run {
            name: "sleep".into(),
            parameters: Some(r#"{"time": 0.01}"#.into()),
            timeout: Some(2.0),
        };
        execute(command, &memory_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_parameters_fail_before_connecting() {
        let mut config = memory_config();
        // Would fail with a connection error if a connection were attempted
        config.broker.kind = BrokerKind::Redis;
        config.broker.url = "redis://127.0.0.1:1".into();
        let command = ControllerCommand::Run {
            name: "sleep".into(),
            parameters: Some("{not json".into()),
            timeout: None,
        };
        assert!(matches!(
            execute(command, &config).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let mut config = AppConfig::default();
        config.broker.url = "redis://127.0.0.1:1".into();
        let err = execute(ControllerCommand::State, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_pause_when_idle_is_remote_error() {
        let err = execute(ControllerCommand::Pause { defer: false }, &memory_config())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
    }
}
