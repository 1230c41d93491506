//! trade-tasks CLI - Main entry point

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use trade_foundation::TaskConfig;
use trade_task::{load_stored_logs, TaskId, TaskManager, TaskRecord, TaskSpec, TaskStatus};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// trade-tasks - run and inspect backend jobs locally or on the worker host
#[derive(Parser, Debug)]
#[command(name = "trade-tasks")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to <config dir>/trade-tasks/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task, wait for it and print the finished record
    Run {
        /// Run on the worker host over SSH
        #[arg(short, long)]
        worker: bool,

        /// Free-form parameter stored on the record (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Task name, used as the ID prefix
        name: String,

        /// Program to execute
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the stored output of a finished task
    Logs {
        /// Task ID
        id: String,
    },
    /// Run every task in a JSON file concurrently, with retention sweeping
    Batch {
        /// JSON array of task specs
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute(args.command, args.config).await {
        Err(e) => match user_error(&e) {
            Some(err) => {
                eprintln!("error: {}", err);
                Ok(ExitCode::from(2))
            }
            None => Err(e),
        },
        result => result,
    }
}

async fn execute(command: Command, config_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = TaskConfig::load(config_path.as_deref()).context("failed to load config")?;

    match command {
        Command::Run {
            worker,
            params,
            name,
            program,
            args,
        } => {
            let spec = TaskSpec {
                name,
                command: program,
                args,
                params: params.into_iter().collect::<HashMap<_, _>>(),
                run_on_worker: worker,
            };
            let manager = TaskManager::from_config(&config)?;
            let records = run_tasks(&manager, vec![spec]).await?;
            for task in &records {
                print_json(task)?;
            }
            Ok(exit_code(&records))
        }
        Command::Logs { id } => {
            let logs = load_stored_logs(&config.log_dir, &TaskId::from(id)).await?;
            print_json(&logs)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let specs: Vec<TaskSpec> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file.display()))?;

            let manager = TaskManager::from_config(&config)?;
            let sweeper =
                manager.start_periodic_cleanup(config.cleanup_interval(), config.retention());
            let records = run_tasks(&manager, specs).await;
            sweeper.abort();

            let records = records?;
            print_json(&records)?;
            Ok(exit_code(&records))
        }
        Command::Config => {
            print_json(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Create and start every spec, then wait for all of them. Ctrl-C cancels
/// whatever is still running and keeps waiting for the records to settle.
async fn run_tasks(
    manager: &TaskManager,
    specs: Vec<TaskSpec>,
) -> anyhow::Result<Vec<TaskRecord>> {
    let mut ids = Vec::with_capacity(specs.len());
    for spec in specs {
        let task = manager.create(spec).await;
        manager.run(&task.id).await?;
        ids.push(task.id);
    }

    let wait_all = futures::future::join_all(ids.iter().map(|id| manager.wait(id)));
    tokio::pin!(wait_all);

    let results = tokio::select! {
        results = &mut wait_all => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running tasks");
            for id in manager.running_tasks().await {
                if let Err(e) = manager.cancel(&id).await {
                    warn!("Failed to cancel {}: {}", id, e);
                }
            }
            wait_all.await
        }
    };

    let records = results.into_iter().collect::<trade_foundation::Result<Vec<_>>>()?;
    let stats = manager.stats().await;
    info!(
        "{} tasks finished: {} completed, {} failed",
        records.len(),
        stats.completed,
        stats.failed
    );
    Ok(records)
}

/// `key=value`; the value is parsed as JSON when it is valid JSON, otherwise
/// kept as a string
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Caller mistakes (unknown ID, wrong state) reported without a backtrace
fn user_error(err: &anyhow::Error) -> Option<&trade_foundation::Error> {
    err.downcast_ref::<trade_foundation::Error>()
        .filter(|err| err.is_user_facing())
}

fn exit_code(records: &[TaskRecord]) -> ExitCode {
    if records
        .iter()
        .all(|task| task.status == TaskStatus::Completed)
    {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
