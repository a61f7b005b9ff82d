//! Prerequisite gating of setup and post-processing.

mod common;

use common::*;
use serde_json::json;
use tasker_cluster::models::{GatingPoint, NewTask, Requirement, TaskId};
use tasker_cluster::prerequisites::Verdict;
use tasker_cluster::state_machine::TaskStatus;

fn depending_on(other: TaskId, required: Requirement, gate: GatingPoint) -> NewTask {
    let mut new_task = NewTask::new(USER, ENDPOINT, "Scripted").with_params(json!({ "commands": [] }));
    new_task.prerequisites.add(0, gate, other, required).unwrap();
    new_task
}

async fn force_status(cluster: &TestCluster, task_id: TaskId, from: TaskStatus, to: TaskStatus) {
    assert!(cluster
        .controller
        .engine()
        .transition_by_id(task_id, from, to)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_empty_prerequisites_go() {
    let cluster = TestCluster::new().await;
    let task = cluster.scripted(json!({})).await;
    let evaluation = cluster
        .evaluator()
        .check(&task, GatingPoint::BeforeSetup)
        .await
        .unwrap();
    assert_eq!(evaluation.verdict, Verdict::Go);
    assert!(evaluation.blockers.is_empty());
}

#[tokio::test]
async fn test_wait_then_fail_when_dependency_terminates() {
    let cluster = TestCluster::new().await;
    let b = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::OnCpu))
        .await;
    let a = cluster
        .create(depending_on(b.task_id, Requirement::Completed, GatingPoint::BeforeSetup))
        .await;
    let evaluator = cluster.evaluator();

    let verdict = evaluator.check(&a, GatingPoint::BeforeSetup).await.unwrap().verdict;
    assert_eq!(verdict, Verdict::Wait);

    // Waiting leaves the task alone
    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::New);

    force_status(&cluster, b.task_id, TaskStatus::OnCpu, TaskStatus::Terminated).await;
    let verdict = evaluator.check(&a, GatingPoint::BeforeSetup).await.unwrap().verdict;
    assert_eq!(verdict, Verdict::Fail);

    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::FailedSetupPrerequisites);
    let expected = format!(
        "Prerequisite Check Failure: Task '{}' is in state 'Terminated' while we wanted it in 'Completed'.",
        b.task_id
    );
    assert!(cluster.log_messages(a.task_id).await.contains(&expected));
}

#[tokio::test]
async fn test_setup_starts_once_dependency_completes() {
    let cluster = TestCluster::new().await;
    let b = cluster.scripted(json!({ "commands": [] })).await;
    let a = cluster
        .create(depending_on(b.task_id, Requirement::Completed, GatingPoint::BeforeSetup))
        .await;

    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::New);

    assert_eq!(cluster.drive(b.task_id, 5).await, TaskStatus::Completed);
    assert_eq!(cluster.drive(a.task_id, 5).await, TaskStatus::Completed);
}

#[tokio::test]
async fn test_post_processing_waits_for_dependency() {
    let cluster = TestCluster::new().await;
    let b = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::Queued))
        .await;
    let a = cluster
        .create(depending_on(
            b.task_id,
            Requirement::Completed,
            GatingPoint::BeforePostProcessing,
        ))
        .await;

    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::DataReady);
    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::DataReady);

    force_status(&cluster, b.task_id, TaskStatus::Queued, TaskStatus::FailedOnCluster).await;
    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(
        cluster.status(a.task_id).await,
        TaskStatus::FailedPostProcessPrerequisites
    );
}

#[tokio::test]
async fn test_missing_dependency_fails_with_log() {
    let cluster = TestCluster::new().await;
    let a = cluster
        .create(depending_on(9999, Requirement::Queued, GatingPoint::BeforeSetup))
        .await;

    cluster.worker().process_task(a.task_id).await.unwrap();
    assert_eq!(cluster.status(a.task_id).await, TaskStatus::FailedSetupPrerequisites);
    assert!(cluster
        .log_messages(a.task_id)
        .await
        .iter()
        .any(|m| m.starts_with("Prerequisite Check Error:") && m.contains("9999")));
}

#[tokio::test]
async fn test_prerequisite_failure_cascades_to_waiting_dependents() {
    let cluster = TestCluster::new().await;
    let root = cluster
        .create(NewTask::new(USER, ENDPOINT, "Scripted").with_status(TaskStatus::Terminated))
        .await;
    let middle = cluster
        .create(depending_on(root.task_id, Requirement::Completed, GatingPoint::BeforeSetup))
        .await;
    let leaf = cluster
        .create(depending_on(middle.task_id, Requirement::Completed, GatingPoint::BeforeSetup))
        .await;

    cluster.worker().process_task(middle.task_id).await.unwrap();

    assert_eq!(cluster.status(middle.task_id).await, TaskStatus::FailedSetupPrerequisites);
    assert_eq!(cluster.status(leaf.task_id).await, TaskStatus::FailedSetupPrerequisites);
    let expected = format!(
        "Prerequisite task {} failed its own prerequisites; this task cannot start.",
        middle.task_id
    );
    assert!(cluster.log_messages(leaf.task_id).await.contains(&expected));
}

#[tokio::test]
async fn test_shared_workdir_waits_for_owner_directory() {
    let cluster = TestCluster::new().await;
    let owner = cluster.scripted(json!({ "commands": [] })).await;
    let mut sharing = NewTask::new(USER, ENDPOINT, "Scripted").with_params(json!({ "commands": [] }));
    sharing.share_workdir_with = Some(owner.task_id);
    sharing
        .prerequisites
        .add(0, GatingPoint::BeforeSetup, owner.task_id, Requirement::Queued)
        .unwrap();
    let sharing = cluster.create(sharing).await;

    cluster.worker().process_task(sharing.task_id).await.unwrap();
    assert_eq!(cluster.status(sharing.task_id).await, TaskStatus::New);

    assert_eq!(cluster.drive(owner.task_id, 5).await, TaskStatus::Completed);
    assert_eq!(cluster.drive(sharing.task_id, 5).await, TaskStatus::Completed);

    let owner = cluster.task(owner.task_id).await;
    let sharing = cluster.task(sharing.task_id).await;
    assert_eq!(sharing.cluster_workdir, owner.cluster_workdir);
    assert_eq!(sharing.cluster_workdir_size, Some(0));
}

#[tokio::test]
async fn test_shared_workdir_with_missing_owner_fails_setup() {
    let cluster = TestCluster::new().await;
    let mut sharing = NewTask::new(USER, ENDPOINT, "Scripted");
    sharing.share_workdir_with = Some(4242);
    let sharing = cluster.create(sharing).await;

    cluster.worker().process_task(sharing.task_id).await.unwrap();
    assert_eq!(cluster.status(sharing.task_id).await, TaskStatus::FailedToSetup);
}
