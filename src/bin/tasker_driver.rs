//! Tasker Driver Binary
//!
//! Runs one polling driver against the task database: either the task worker
//! for one execution endpoint or the background activity worker.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use tasker_cluster::activities::{ActivityManager, ActivityRegistry};
use tasker_cluster::config::ConfigManager;
use tasker_cluster::execution::ClusterController;
use tasker_cluster::logging::init_structured_logging;
use tasker_cluster::scheduler::build_scheduler;
use tasker_cluster::state_machine::StatusTransitionEngine;
use tasker_cluster::storage::LocalDirectoryStorage;
use tasker_cluster::store::{SqliteStore, TaskStore};
use tasker_cluster::tools::ToolRegistry;
use tasker_cluster::worker::{ActivityWorker, Driver, DriverHandle, TaskWorker};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Advance the tasks of one endpoint
    Task,
    /// Process background activities
    Activity,
}

#[derive(Debug, Parser)]
#[command(name = "tasker-driver")]
#[command(about = "Polling driver for cluster tasks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: $TASKER_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Environment section to merge (development, test, production)
    #[arg(short, long, env = "TASKER_ENV", default_value = "development")]
    environment: String,

    /// Execution endpoint, overrides the configured one
    #[arg(long)]
    endpoint: Option<i64>,

    /// Database URL, overrides the configured one
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Root of the local file storage
    #[arg(long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Directory for the JSON log files
    #[arg(long, default_value = "log")]
    log_dir: PathBuf,

    #[arg(long, value_enum, default_value = "task")]
    mode: Mode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let component = match cli.mode {
        Mode::Task => "task-driver",
        Mode::Activity => "activity-driver",
    };
    init_structured_logging(component, &cli.environment, &cli.log_dir);

    let manager = ConfigManager::load_or_default(cli.config_dir.clone(), &cli.environment)
        .context("loading configuration")?;
    let mut config = manager.config().clone();
    if let Some(endpoint) = cli.endpoint {
        config.driver.endpoint_id = endpoint;
    }
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }

    info!(
        environment = %cli.environment,
        endpoint_id = config.driver.endpoint_id,
        mode = ?cli.mode,
        "Starting tasker driver"
    );

    let store = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("opening task database")?,
    );
    let task_store: Arc<dyn TaskStore> = store.clone();
    let engine = StatusTransitionEngine::with_builtin_callbacks(task_store);
    let storage = Arc::new(
        LocalDirectoryStorage::new(&cli.storage_dir)
            .await
            .context("opening file storage")?,
    );
    let cluster = ClusterController::new(
        engine,
        build_scheduler(&config.scheduler),
        storage,
        Arc::new(ToolRegistry::with_builtin()),
        config.execution.clone(),
        config.archive.clone(),
    );

    let outcome = match cli.mode {
        Mode::Task => {
            let mut driver = Driver::new(
                TaskWorker::new(cluster, config.driver.clone()),
                config.driver.check_interval(),
            )
            .with_endpoint(config.driver.endpoint_id);
            if let Some(heartbeat) = &config.driver.heartbeat_file {
                driver = driver.with_heartbeat_file(heartbeat);
            }
            stop_on_ctrl_c(driver.handle());
            driver.run().await.map(|_| ())
        }
        Mode::Activity => {
            let registry = Arc::new(ActivityRegistry::with_builtin(cluster));
            let worker = ActivityWorker::new(
                ActivityManager::new(store, registry),
                config.activity.clone(),
                config.driver.endpoint_id,
            );
            let driver = Driver::new(worker, config.activity.check_interval())
                .with_endpoint(config.driver.endpoint_id);
            stop_on_ctrl_c(driver.handle());
            driver.run().await.map(|_| ())
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Driver exited with an error");
    }
    outcome?;
    info!("Tasker driver stopped");
    Ok(())
}

fn stop_on_ctrl_c(handle: DriverHandle) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            handle.stop();
        }
    });
}
