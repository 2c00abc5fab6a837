//! Lobster - distributed task-provisioning controller
//!
//! CLI entry point: loads configuration, acquires the working-directory
//! lock, resolves the checkpoint, and drives one obtain/release cycle.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use lobster::checkpoint::{Checkpoint, WorkdirLock};
use lobster::cli::{Cli, Command};
use lobster::config::Config;
use lobster::facade::fakes::{FakeExecutor, FakeMonitoringSink, FakeStorage};
use lobster::facade::{ExecutorFacade, MonitoringSink};
use lobster::paths;
use lobster::task_handler::{ReportDocument, TaskAssignment};
use lobster::task_provider::TaskProvider;
use unitstore::{Category, UnitStore, Workflow};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: &str) -> Result<()> {
    let level_str = cli_log_level.unwrap_or(config_log_level);
    let level = match level_str.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        other => {
            eprintln!("Warning: unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!(?level, "logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config.advanced.log_level).context("failed to set up logging")?;

    debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Some(Command::Run) | None => cmd_run(&config).await,
        Some(Command::Status) => cmd_status(&config).await,
        Some(Command::ValidateConfig) => cmd_validate_config(&config),
    }
}

async fn cmd_run(config: &Config) -> Result<()> {
    let workdir = &config.storage.workdir;
    let _lock = WorkdirLock::acquire(workdir).context("failed to acquire working-directory lock")?;
    let checkpoint = Checkpoint::load_or_create(workdir, &label_for_checkpoint(config))
        .context("failed to resolve checkpoint")?;
    info!(task_group_id = %checkpoint.task_group_id, fresh = checkpoint.is_fresh, "resolved checkpoint");

    let store_path = paths::store_path(workdir);
    let mut store =
        UnitStore::open(&store_path, config.advanced.retry_cap).context("failed to open unit store")?;

    if !checkpoint.is_fresh {
        let recovered = store.reset_units().context("failed to reset running units after restart")?;
        info!(count = recovered.len(), "reverted running tasks left over from a previous run");
    } else {
        for category in &config.categories {
            store
                .register_category(&Category {
                    name: category.name.clone(),
                    cores: category.cores,
                    memory_mb: category.memory_mb,
                    runtime_s: category.runtime_s,
                    tasks_max: category.tasks_max,
                })
                .context("failed to register category")?;
        }
        for workflow in &config.workflows {
            // A real dataset backend supplies file/unit counts (spec §6);
            // without one, workflows are registered empty and wait for a
            // later register_files propagation or manual seeding.
            store
                .register_dataset(
                    &Workflow {
                        label: workflow.label.clone(),
                        category: workflow.category.clone(),
                        prerequisite: workflow.prerequisite.clone(),
                        merge_size_bytes: workflow.merge_size_bytes,
                        unit_chunk_size: workflow.unit_chunk_size,
                        output_filename: workflow.output_filename.clone(),
                        total_events: 0,
                        total_units: 0,
                    },
                    &[],
                )
                .context("failed to register workflow")?;
            if let Some(prerequisite) = &workflow.prerequisite {
                store
                    .register_dependency(&workflow.label, prerequisite, 0)
                    .context("failed to register workflow dependency")?;
            }
        }
    }

    let sink = FakeMonitoringSink;
    sink.register_run().await;
    let storage = FakeStorage;
    let executor = FakeExecutor::default();

    let total_cores: u32 = config.categories.iter().map(|c| c.cores).sum();
    let mut assignments: HashMap<i64, TaskAssignment> = HashMap::new();
    let mut interval = tokio::time::interval(Duration::from_secs(config.advanced.cycle_interval_s.max(1)));

    // Single logical controller loop (spec §5): one tick drives an
    // obtain/provision/release cycle; SIGINT/SIGTERM flips monitoring state
    // to cancelled and exits without mutating store state further (the
    // next restart's `reset_units` call repairs anything left in flight).
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let descriptors = TaskProvider::obtain(&mut store, config, total_cores, &HashMap::new())
                    .context("failed to provision tasks")?;
                if !descriptors.is_empty() {
                    info!(count = descriptors.len(), "provisioned task batch(es) this cycle");
                    for descriptor in &descriptors {
                        debug!(
                            task_id = descriptor.task_id,
                            workflow = %descriptor.workflow_label,
                            merge = descriptor.merge,
                            units = descriptor.units.len(),
                            "task descriptor"
                        );
                    }
                    let new_assignments = TaskProvider::provision(
                        &mut store,
                        workdir,
                        config,
                        &checkpoint.task_group_id,
                        &descriptors,
                        &sink,
                        &storage,
                    )
                    .await
                    .context("failed to write parameter documents")?;
                    assignments.extend(new_assignments);
                }

                let completions = executor.completed_tasks().await;
                if !completions.is_empty() {
                    let reports: HashMap<i64, ReportDocument> = HashMap::new();
                    let summary = TaskProvider::release(
                        &mut store,
                        config,
                        workdir,
                        &sink,
                        &assignments,
                        completions.clone(),
                        &reports,
                    )
                    .await
                    .context("failed to release completed tasks")?;
                    info!(%summary, "release cycle summary");
                    for completed in &completions {
                        assignments.remove(&completed.task_id);
                    }
                }

                write_status(workdir, &mut store, config).context("failed to write status summary")?;

                if TaskProvider::done(&mut store).context("failed to check completion")? {
                    info!("all workflows merged, nothing left to do");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, terminating controller");
                TaskProvider::terminate(workdir, config, &sink).await.context("failed to terminate in-flight tasks")?;
                break;
            }
        }
    }

    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let status_path = paths::status_path(&config.storage.workdir);
    match fs::read_to_string(&status_path) {
        Ok(contents) => {
            println!("{contents}");
            Ok(())
        }
        Err(e) => {
            warn!(path = %status_path.display(), error = %e, "no cached status available");
            println!("no status available for {}", config.storage.workdir.display());
            Ok(())
        }
    }
}

fn cmd_validate_config(config: &Config) -> Result<()> {
    for workflow in &config.workflows {
        if config.category(&workflow.category).is_none() {
            eyre::bail!("workflow '{}' references unknown category '{}'", workflow.label, workflow.category);
        }
        if let Some(prerequisite) = &workflow.prerequisite {
            if config.workflow(prerequisite).is_none() {
                eyre::bail!("workflow '{}' references unknown prerequisite '{}'", workflow.label, prerequisite);
            }
        }
    }
    println!(
        "config OK: {} workflow(s), {} categor(y/ies)",
        config.workflows.len(),
        config.categories.len()
    );
    Ok(())
}

fn label_for_checkpoint(config: &Config) -> String {
    config.workflows.first().map(|w| w.label.clone()).unwrap_or_else(|| "run".to_string())
}

fn write_status(workdir: &PathBuf, store: &mut UnitStore, config: &Config) -> Result<()> {
    let mut statuses = Vec::new();
    for workflow in &config.workflows {
        statuses.push(store.workflow_status(&workflow.label).context("failed to read workflow status")?);
    }
    let yaml = serde_yaml::to_string(&statuses).context("failed to render status summary")?;
    fs::write(paths::status_path(workdir), yaml).context("failed to write status file")?;
    Ok(())
}
