//! # System Constants
//!
//! Fixed names and default durations that define the operational boundaries
//! of cluster task orchestration. Everything tunable at runtime has a matching
//! field in [`crate::config`]; the values here are the defaults.

pub use crate::state_machine::TaskStatus;

/// Default timings for drivers and controllers
pub mod timing {
    /// Interval between two units of work of a driver
    pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

    /// A task stuck in a local-code stage longer than this is force-terminated
    pub const STALENESS_WINDOW_SECS: u64 = 8 * 3600;

    /// Grace period during which a "not found" job may still be flushing output
    pub const POST_PROCESS_GRACE_SECS: u64 = 60;

    /// Upper bound on deferring post-processing while waiting for the end marker
    pub const MAX_POST_PROCESS_DEFERRAL_SECS: u64 = 600;

    /// How long an activity driver works on a single activity before yielding
    pub const ACTIVITY_SLICE_SECS: u64 = 15;

    /// An in-progress activity locked for longer than this is presumed crashed
    pub const CRASHED_ACTIVITY_SECS: u64 = 12 * 3600;

    /// Number of bursts the single-task optimization holds a lock for
    pub const SINGLE_TASK_BURSTS: u32 = 5;

    /// Pause between two bursts on the same locked task
    pub const SINGLE_TASK_BURST_PAUSE_MS: u64 = 2_000;

    /// Default walltime hint when a tool does not declare one
    pub const DEFAULT_WALLTIME_SECS: u64 = 3600;
}

/// File names inside a task work directory
pub mod workdir {
    /// Prefix of the generated wrapper script and its captured outputs
    pub const WRAPPER_BASENAME: &str = ".qsub";

    /// Prefix of the generated inner script and its captured outputs
    pub const SCIENCE_BASENAME: &str = ".science";

    /// Line echoed by the wrapper once the inner script has returned
    pub const END_OF_JOB_MARKER: &str = "__TASKER_END_OF_JOB__";

    /// Cooperative marker present while an archival is running
    pub const ARCHIVE_MARKER: &str = ".archiving_in_progress";

    /// Descriptor files dropped by a running job to request subtasks
    pub const SUBTASK_DESCRIPTOR_PREFIX: &str = ".new-task-";

    /// Suffix of descriptor files
    pub const SUBTASK_DESCRIPTOR_SUFFIX: &str = ".json";

    /// Suffix of the companion response file receiving the new task id
    pub const SUBTASK_RESPONSE_SUFFIX: &str = ".response";

    /// Number of trailing lines returned when capturing job output
    pub const CAPTURE_TAIL_LINES: usize = 2000;
}

/// Prerequisite requirement tokens
pub mod requirements {
    pub const QUEUED: &str = "Queued";
    pub const DATA_READY: &str = "Data Ready";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const STANDBY: &str = "Standby";
    pub const CONFIGURED: &str = "Configured";
}

/// Environment variable names read at startup
pub mod env {
    pub const ENVIRONMENT: &str = "TASKER_ENV";
    pub const FALLBACK_ENVIRONMENT: &str = "APP_ENV";
    pub const CONFIG_DIR: &str = "TASKER_CONFIG_DIR";
}
