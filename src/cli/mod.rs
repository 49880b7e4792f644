//! CLI module for Runbus
//!
//! Provides commands:
//! - `serve`: Run a worker and bridge it onto the message bus
//! - `controller`: Submit and control tasks on a running worker

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::server::config::AppConfig;

pub mod controller;

/// Runbus task orchestration CLI
#[derive(Parser, Debug)]
#[command(name = "runbus")]
#[command(about = "Submit, track and control tasks on a worker over a message bus")]
#[command(version)]
pub struct Cli {
    /// Extra configuration file (repeatable, later files win)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker and bridge it onto the message bus
    Serve,
    /// Client commands for a running worker
    Controller {
        #[command(subcommand)]
        command: controller::ControllerCommand,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve) => crate::server::run(config).await,
        Some(Commands::Controller { command }) => controller::run(command, &config).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}
