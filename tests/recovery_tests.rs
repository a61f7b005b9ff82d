//! Recovery from failed stages and restarts of finished tasks.

mod common;

use common::*;
use serde_json::json;
use tasker_cluster::execution::JobFiles;
use tasker_cluster::models::{NewTask, TaskId};
use tasker_cluster::scheduler::RemoteState;
use tasker_cluster::state_machine::{Stage, TaskStatus};

/// Submit, let the job finish with `exit_code` and post-process
async fn run_to_end(cluster: &TestCluster, task_id: TaskId, exit_code: i32) -> TaskStatus {
    let worker = cluster.worker();
    worker.process_task(task_id).await.unwrap();
    let queued = cluster.task(task_id).await;
    assert_eq!(queued.status, TaskStatus::Queued);
    cluster.simulate_job_output(task_id, exit_code).await;
    cluster.scheduler.finish(queued.cluster_jobid.as_deref().unwrap());
    worker.process_task(task_id).await.unwrap();
    cluster.status(task_id).await
}

async fn request_recovery(cluster: &TestCluster, task_id: TaskId) -> bool {
    let mut task = cluster.task(task_id).await;
    cluster.recovery().request_recovery(&mut task).await.unwrap()
}

async fn request_restart(cluster: &TestCluster, task_id: TaskId, stage: Stage) -> bool {
    let mut task = cluster.task(task_id).await;
    cluster.recovery().request_restart(&mut task, stage).await.unwrap()
}

#[tokio::test]
async fn test_restart_at_post_process_keeps_previous_outputs() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({ "commands": ["x"] })).await;
    assert_eq!(run_to_end(&cluster, task.task_id, 0).await, TaskStatus::Completed);
    let first_run = {
        let done = cluster.task(task.task_id).await;
        JobFiles::for_task(&done, cluster.workdir(&done).unwrap())
    };

    assert!(request_restart(&cluster, task.task_id, Stage::PostProcess).await);
    let requested = cluster.task(task.task_id).await;
    assert_eq!(requested.status, TaskStatus::RestartPostProcess);
    assert_eq!(requested.run_number, 2);
    assert_eq!(requested.restart_return_status, Some(TaskStatus::Completed));

    let worker = cluster.worker();
    worker.process_task(task.task_id).await.unwrap();
    let restarted = cluster.task(task.task_id).await;
    assert_eq!(restarted.status, TaskStatus::DataReady);
    assert_eq!(restarted.run_number, 2);
    assert!(restarted.flags.no_end_marker_check);
    assert!(first_run.exit_status().exists());
    assert!(first_run.wrapper_stdout().exists());

    worker.process_task(task.task_id).await.unwrap();
    let done = cluster.task(task.task_id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(!done.flags.no_end_marker_check);
    assert_eq!(
        cluster.tool.calls_for(task.task_id),
        vec![
            "prepare",
            "build_remote_commands",
            "collect_results",
            "restart_at_post_process",
            "collect_results",
        ]
    );
    assert_eq!(cluster.scheduler.count_calls("submit"), 1);
}

#[tokio::test]
async fn test_shell_restart_at_post_process_reuses_exit_status() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .create(NewTask::new(USER, ENDPOINT, "Shell").with_params(shell_params(&["true"])))
        .await;
    assert_eq!(run_to_end(&cluster, task.task_id, 0).await, TaskStatus::Completed);

    assert!(request_restart(&cluster, task.task_id, Stage::PostProcess).await);
    assert_eq!(cluster.drive(task.task_id, 5).await, TaskStatus::Completed);

    let done = cluster.task(task.task_id).await;
    let workdir = cluster.workdir(&done).unwrap();
    let second_run = JobFiles::for_task(&done, &workdir);
    let first_run = JobFiles::for_run(&done, &workdir, 1);
    assert_eq!(second_run.exit_code().await.unwrap(), Some(0));
    assert_eq!(first_run.exit_code().await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_cluster_recovery_resubmits_without_setup() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .scripted(json!({ "commands": ["x"], "collect": "false" }))
        .await;
    assert_eq!(run_to_end(&cluster, task.task_id, 0).await, TaskStatus::FailedOnCluster);

    assert!(request_recovery(&cluster, task.task_id).await);
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::RecoverCluster);

    let worker = cluster.worker();
    worker.process_task(task.task_id).await.unwrap();
    let recovered = cluster.task(task.task_id).await;
    assert_eq!(recovered.status, TaskStatus::New);
    assert_eq!(recovered.run_number, 1);
    assert!(recovered.flags.submit_without_setup);
    let log = cluster.log_messages(task.task_id).await;
    assert!(log.contains(&"Scheduling recovery from 'Failed On Cluster'.".to_string()));
    assert!(log.contains(
        &"Successful recovery from 'Failed On Cluster' failure, now we retry it.".to_string()
    ));

    worker.process_task(task.task_id).await.unwrap();
    let resubmitted = cluster.task(task.task_id).await;
    assert_eq!(resubmitted.status, TaskStatus::Queued);
    assert_eq!(resubmitted.cluster_jobid.as_deref(), Some("mock-2"));
    assert_eq!(resubmitted.run_number, 1);
    assert!(!resubmitted.flags.submit_without_setup);
    assert_eq!(
        cluster.tool.calls_for(task.task_id),
        vec![
            "prepare",
            "build_remote_commands",
            "collect_results",
            "recover_from_cluster_failure",
            "build_remote_commands",
        ]
    );
}

#[tokio::test]
async fn test_recovery_finds_job_still_running() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({ "commands": ["x"] })).await;
    cluster.worker().process_task(task.task_id).await.unwrap();
    cluster.scheduler.set_state("mock-1", RemoteState::Running);
    assert!(cluster
        .controller
        .engine()
        .transition_by_id(task.task_id, TaskStatus::Queued, TaskStatus::FailedOnCluster)
        .await
        .unwrap());

    assert!(request_recovery(&cluster, task.task_id).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    assert_eq!(cluster.status(task.task_id).await, TaskStatus::OnCpu);
    assert!(cluster.log_messages(task.task_id).await.contains(
        &"While attempting recovery from 'Failed On Cluster' failure we found a cluster task still running! Resetting to 'On CPU'."
            .to_string()
    ));
    assert!(!cluster
        .tool
        .calls_for(task.task_id)
        .contains(&"recover_from_cluster_failure".to_string()));
}

#[tokio::test]
async fn test_unreachable_scheduler_defers_recovery() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({ "commands": ["x"] })).await;
    cluster.worker().process_task(task.task_id).await.unwrap();
    assert!(cluster
        .controller
        .engine()
        .transition_by_id(task.task_id, TaskStatus::Queued, TaskStatus::FailedOnCluster)
        .await
        .unwrap());
    assert!(request_recovery(&cluster, task.task_id).await);

    cluster.scheduler.fail_queries(true);
    cluster.worker().process_task(task.task_id).await.unwrap();
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::RecoverCluster);

    cluster.scheduler.fail_queries(false);
    cluster.scheduler.finish("mock-1");
    cluster.worker().process_task(task.task_id).await.unwrap();
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::New);
}

#[tokio::test]
async fn test_refused_recovery_returns_to_failed_state() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .scripted(json!({ "commands": ["x"], "prepare": "false", "recover": "false" }))
        .await;
    cluster.worker().process_task(task.task_id).await.unwrap();
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::FailedToSetup);

    assert!(request_recovery(&cluster, task.task_id).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    let task = cluster.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::FailedToSetup);
    assert_eq!(task.run_number, 1);
    assert!(cluster.log_messages(task.task_id).await.contains(
        &"Cannot recover from 'Failed To Setup' failure. Returning task to Failed state.".to_string()
    ));
    assert!(cluster
        .tool
        .calls_for(task.task_id)
        .contains(&"recover_from_setup_failure".to_string()));
}

#[tokio::test]
async fn test_recovery_hook_error_is_logged() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .scripted(json!({ "commands": [], "collect": "error", "recover": "error" }))
        .await;
    assert_eq!(cluster.drive(task.task_id, 5).await, TaskStatus::FailedToPostProcess);

    assert!(request_recovery(&cluster, task.task_id).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    assert_eq!(cluster.status(task.task_id).await, TaskStatus::FailedToPostProcess);
    assert!(cluster
        .log_messages(task.task_id)
        .await
        .iter()
        .any(|m| m.starts_with("Exception raised while recovering from 'Failed To PostProcess' failure")));
}

#[tokio::test]
async fn test_setup_recovery_without_workdir_moves_on() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .create(
            NewTask::new(USER, ENDPOINT, "Scripted")
                .with_params(json!({ "commands": [] }))
                .with_status(TaskStatus::FailedToSetup),
        )
        .await;

    assert!(request_recovery(&cluster, task.task_id).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    assert_eq!(cluster.status(task.task_id).await, TaskStatus::New);
    assert!(cluster.log_messages(task.task_id).await.contains(
        &"Work directory is missing. But since this was a setup failure, we will simply assume we can move on to 'New'."
            .to_string()
    ));
    assert!(cluster.tool.calls_for(task.task_id).is_empty());
}

#[tokio::test]
async fn test_prerequisite_failures_reset_to_their_gate() {
    let cluster = TestCluster::new().await;
    let setup = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::FailedSetupPrerequisites))
        .await;
    let post = cluster
        .create(
            NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::FailedPostProcessPrerequisites),
        )
        .await;

    assert!(request_recovery(&cluster, setup.task_id).await);
    assert!(request_recovery(&cluster, post.task_id).await);

    assert_eq!(cluster.status(setup.task_id).await, TaskStatus::New);
    assert_eq!(cluster.status(post.task_id).await, TaskStatus::DataReady);
    assert!(cluster
        .log_messages(setup.task_id)
        .await
        .contains(&"Resetting prerequisites checking for 'Setup'.".to_string()));
    assert!(cluster
        .log_messages(post.task_id)
        .await
        .contains(&"Resetting prerequisites checking for 'PostProcess'.".to_string()));
}

#[tokio::test]
async fn test_nothing_to_recover_or_restart() {
    let cluster = TestCluster::new().await;
    let completed = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::Completed))
        .await;
    let running = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::OnCpu))
        .await;

    assert!(!request_recovery(&cluster, completed.task_id).await);
    assert!(!request_recovery(&cluster, running.task_id).await);
    assert!(!request_restart(&cluster, running.task_id, Stage::Cluster).await);
    assert_eq!(cluster.status(completed.task_id).await, TaskStatus::Completed);
    assert_eq!(cluster.task(running.task_id).await.run_number, 1);
}

#[tokio::test]
async fn test_terminated_task_restarts_at_setup() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({ "commands": ["x"] })).await;
    cluster.worker().process_task(task.task_id).await.unwrap();
    let mut queued = cluster.task(task.task_id).await;
    assert!(cluster.controller.terminate(&mut queued).await.unwrap());

    assert!(request_restart(&cluster, task.task_id, Stage::PostProcess).await);
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::RestartSetup);

    let worker = cluster.worker();
    worker.process_task(task.task_id).await.unwrap();
    assert_eq!(cluster.status(task.task_id).await, TaskStatus::New);
    worker.process_task(task.task_id).await.unwrap();

    let resubmitted = cluster.task(task.task_id).await;
    assert_eq!(resubmitted.status, TaskStatus::Queued);
    assert_eq!(resubmitted.run_number, 2);
    assert_eq!(resubmitted.cluster_jobid.as_deref(), Some("mock-2"));
    let submitted = cluster.scheduler.submitted();
    assert_eq!(submitted.len(), 2);
    assert!(submitted[1]
        .script
        .to_string_lossy()
        .ends_with(&format!(".Scripted.{}-2.sh", task.task_id)));
}

#[tokio::test]
async fn test_restart_at_cluster_resubmits_directly() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({ "commands": ["x"] })).await;
    assert_eq!(run_to_end(&cluster, task.task_id, 0).await, TaskStatus::Completed);

    assert!(request_restart(&cluster, task.task_id, Stage::Cluster).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    let restarted = cluster.task(task.task_id).await;
    assert_eq!(restarted.status, TaskStatus::Queued);
    assert_eq!(restarted.cluster_jobid.as_deref(), Some("mock-2"));
    assert_eq!(restarted.restart_return_status, None);
    assert_eq!(
        cluster.tool.calls_for(task.task_id).iter().filter(|c| *c == "prepare").count(),
        1
    );
}

#[tokio::test]
async fn test_failed_restart_returns_to_previous_terminal_status() {
    let cluster = TestCluster::new().await;
    let task = cluster
        .scripted(json!({ "commands": [], "restart": "false" }))
        .await;
    assert_eq!(cluster.drive(task.task_id, 5).await, TaskStatus::Completed);

    assert!(request_restart(&cluster, task.task_id, Stage::Cluster).await);
    cluster.worker().process_task(task.task_id).await.unwrap();

    let task = cluster.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_number, 2);
    assert_eq!(task.restart_return_status, None);
    assert!(cluster.log_messages(task.task_id).await.contains(
        &"Cannot restart at 'Cluster'. Returning task status to 'Completed'.".to_string()
    ));
}
