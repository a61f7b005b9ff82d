//! The driver running against a SQLite database file.

mod common;

use common::*;
use std::sync::Arc;
use tasker_cluster::config::{ArchiveConfig, ExecutionConfig};
use tasker_cluster::execution::ClusterController;
use tasker_cluster::models::NewTask;
use tasker_cluster::state_machine::{StatusTransitionEngine, TaskStatus};
use tasker_cluster::storage::LocalDirectoryStorage;
use tasker_cluster::store::{SqliteStore, TaskStore};
use tasker_cluster::tools::{ShellTool, ToolRegistry};
use tasker_cluster::worker::TaskWorker;
use tempfile::TempDir;

struct SqliteCluster {
    _dir: TempDir,
    url: String,
    store: Arc<SqliteStore>,
    scheduler: Arc<MockScheduler>,
    controller: ClusterController,
}

async fn sqlite_cluster() -> SqliteCluster {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tasker.db").display());
    let store = Arc::new(SqliteStore::connect(&url, 4).await.unwrap());
    let scheduler = Arc::new(MockScheduler::new());
    let tools = ToolRegistry::new();
    tools.register(Arc::new(ShellTool));
    let execution = ExecutionConfig {
        workdir_root: dir.path().join("work"),
        post_process_grace_seconds: 0,
        max_post_process_deferral_seconds: 0,
        ..ExecutionConfig::default()
    };
    let task_store: Arc<dyn TaskStore> = store.clone();
    let controller = ClusterController::new(
        StatusTransitionEngine::with_builtin_callbacks(task_store),
        scheduler.clone(),
        Arc::new(
            LocalDirectoryStorage::new(dir.path().join("storage"))
                .await
                .unwrap(),
        ),
        Arc::new(tools),
        execution,
        ArchiveConfig::default(),
    );
    SqliteCluster {
        _dir: dir,
        url,
        store,
        scheduler,
        controller,
    }
}

#[tokio::test]
async fn test_shell_task_lifecycle_persists_across_reopen() {
    let cluster = sqlite_cluster().await;
    let task = cluster
        .store
        .create_task(NewTask::new(USER, ENDPOINT, "Shell").with_params(shell_params(&["true"])))
        .await
        .unwrap();
    let worker = TaskWorker::new(cluster.controller.clone(), test_driver_config());

    worker.process_task(task.task_id).await.unwrap();
    let queued = cluster.store.get_task(task.task_id).await.unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
    assert_eq!(queued.cluster_jobid.as_deref(), Some("mock-1"));

    let workdir = cluster.controller.existing_workdir(&queued).unwrap();
    let files = tasker_cluster::execution::JobFiles::for_task(&queued, &workdir);
    tokio::fs::write(files.exit_status(), "0\n").await.unwrap();
    tokio::fs::write(
        files.wrapper_stdout(),
        format!("{}\n", tasker_cluster::constants::workdir::END_OF_JOB_MARKER),
    )
    .await
    .unwrap();
    cluster.scheduler.finish("mock-1");
    worker.process_task(task.task_id).await.unwrap();

    let reopened = SqliteStore::connect(&cluster.url, 1).await.unwrap();
    let done = reopened.get_task(task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.data_ready_at.is_some());
    let log: Vec<_> = done.log.iter().map(|e| e.message.as_str()).collect();
    assert!(log.contains(&"Queued as job ID 'mock-1'."));
    assert!(log.contains(&"State updated to Data Ready"));
    assert!(log.contains(&"Asynchronous postprocessing completed."));
}

#[tokio::test]
async fn test_pollers_on_separate_connections_never_both_win() {
    let cluster = sqlite_cluster().await;
    let task = cluster
        .store
        .create_task(NewTask::new(USER, ENDPOINT, "Shell"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let url = cluster.url.clone();
        let task_id = task.task_id;
        handles.push(tokio::spawn(async move {
            let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::connect(&url, 1).await.unwrap());
            let engine = StatusTransitionEngine::with_builtin_callbacks(store);
            engine
                .transition_by_id(task_id, TaskStatus::New, TaskStatus::SettingUp)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(
        cluster.store.get_task(task.task_id).await.unwrap().status,
        TaskStatus::SettingUp
    );
}

#[tokio::test]
async fn test_stale_lock_is_reclaimed() {
    let cluster = sqlite_cluster().await;
    let task = cluster
        .store
        .create_task(NewTask::new(USER, ENDPOINT, "Shell"))
        .await
        .unwrap();
    let hour = std::time::Duration::from_secs(3600);

    assert!(cluster.store.acquire_lock(task.task_id, "crashed", hour).await.unwrap());
    assert!(!cluster.store.acquire_lock(task.task_id, "alive", hour).await.unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(cluster
        .store
        .acquire_lock(task.task_id, "alive", std::time::Duration::ZERO)
        .await
        .unwrap());
    assert!(!cluster.store.release_lock(task.task_id, "crashed").await.unwrap());
    assert!(cluster.store.release_lock(task.task_id, "alive").await.unwrap());
}
