#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SLURM in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Cluster
//!
//! Lifecycle management for tasks that run as batch jobs on a compute
//! cluster.
//!
//! ## Overview
//!
//! A task is a unit of work owned by a user and bound to an execution
//! endpoint. It moves through setup, queueing, remote execution,
//! post-processing and completion, with well-defined failure, recovery and
//! restart paths. Polling drivers advance tasks; users and administrators
//! request transitions. Every status change goes through one atomic
//! compare-and-set so concurrent drivers never double-process a task.
//!
//! ## Module Organization
//!
//! - [`state_machine`] - Status vocabulary, stages and the transition engine
//! - [`models`] - Task, prerequisite and background activity records
//! - [`store`] - Persistence traits with SQLite and in-memory implementations
//! - [`prerequisites`] - Gating of setup and post-processing on other tasks
//! - [`scheduler`] - Batch scheduler adapters (local processes, SLURM)
//! - [`tools`] - Tool handlers that prepare, run and collect task work
//! - [`execution`] - Work directories, job scripts, submission and archival
//! - [`recovery`] - User-initiated recovery and restart
//! - [`subtasks`] - Tasks submitted from inside a running job
//! - [`activities`] - Long-running administrative batch activities
//! - [`worker`] - Polling drivers for tasks and activities
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging setup and helpers
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_cluster::models::NewTask;
//! use tasker_cluster::state_machine::{StatusTransitionEngine, TaskStatus};
//! use tasker_cluster::store::{MemoryStore, TaskStore};
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let mut task = store
//!     .create_task(NewTask::new(1, 1, "Shell").with_params(serde_json::json!({
//!         "commands": ["echo hello"]
//!     })))
//!     .await
//!     .unwrap();
//! assert_eq!(task.status, TaskStatus::New);
//!
//! // Only one of several racing drivers wins a transition
//! let engine = StatusTransitionEngine::with_builtin_callbacks(store.clone());
//! assert!(engine.transition(&mut task, TaskStatus::New, TaskStatus::SettingUp).await.unwrap());
//! assert!(!engine.transition_by_id(task.task_id, TaskStatus::New, TaskStatus::SettingUp).await.unwrap());
//! # });
//! ```

pub mod activities;
pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod models;
pub mod prerequisites;
pub mod recovery;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod store;
pub mod subtasks;
pub mod tools;
pub mod worker;

pub use activities::{ActivityHandler, ActivityManager, ActivityRegistry};
pub use config::{
    ActivityConfig, ArchiveConfig, ConfigManager, DatabaseConfig, DriverConfig, ExecutionConfig,
    SchedulerConfig, TaskerConfig,
};
pub use error::{Result, TaskerError};
pub use execution::ClusterController;
pub use models::{BackgroundActivity, GatingPoint, NewTask, Requirement, Task, TaskId};
pub use prerequisites::{PrerequisiteEvaluator, Verdict};
pub use recovery::RecoveryController;
pub use scheduler::{ClusterScheduler, RemoteState};
pub use state_machine::{Stage, StatusTransitionEngine, TaskStatus};
pub use store::{ActivityStore, MemoryStore, SqliteStore, TaskStore};
pub use subtasks::SubtaskSubmitter;
pub use tools::{ToolHandler, ToolRegistry};
pub use worker::{ActivityWorker, Driver, DriverHandle, TaskWorker};
