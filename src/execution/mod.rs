//! # Cluster Execution
//!
//! Everything that touches a task's work directory or the batch system:
//! layout of the directory tree, generated job scripts, the
//! [`ClusterController`] driving setup, submission, polling and
//! post-processing, and archival.

pub mod archival;
pub mod controller;
pub mod script;
pub mod workdir;

pub use archival::archive_file_name;
pub use controller::{guarded, ClusterController};
pub use script::{capture_job_out_err, CapturedOutput, JobFiles};
pub use workdir::{directory_size, WorkdirLayout};
