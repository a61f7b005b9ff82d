use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage a failure, recovery or restart refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Setup,
    Cluster,
    PostProcess,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Setup, Stage::Cluster, Stage::PostProcess];

    /// Failed state an execution failure in this stage lands in
    pub fn failed_status(self) -> TaskStatus {
        match self {
            Self::Setup => TaskStatus::FailedToSetup,
            Self::Cluster => TaskStatus::FailedOnCluster,
            Self::PostProcess => TaskStatus::FailedToPostProcess,
        }
    }

    pub fn recover_status(self) -> TaskStatus {
        match self {
            Self::Setup => TaskStatus::RecoverSetup,
            Self::Cluster => TaskStatus::RecoverCluster,
            Self::PostProcess => TaskStatus::RecoverPostProcess,
        }
    }

    pub fn recovering_status(self) -> TaskStatus {
        match self {
            Self::Setup => TaskStatus::RecoveringSetup,
            Self::Cluster => TaskStatus::RecoveringCluster,
            Self::PostProcess => TaskStatus::RecoveringPostProcess,
        }
    }

    pub fn restart_status(self) -> TaskStatus {
        match self {
            Self::Setup => TaskStatus::RestartSetup,
            Self::Cluster => TaskStatus::RestartCluster,
            Self::PostProcess => TaskStatus::RestartPostProcess,
        }
    }

    pub fn restarting_status(self) -> TaskStatus {
        match self {
            Self::Setup => TaskStatus::RestartingSetup,
            Self::Cluster => TaskStatus::RestartingCluster,
            Self::PostProcess => TaskStatus::RestartingPostProcess,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "Setup"),
            Self::Cluster => write!(f, "Cluster"),
            Self::PostProcess => write!(f, "PostProcess"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Setup" => Ok(Self::Setup),
            "Cluster" => Ok(Self::Cluster),
            "PostProcess" => Ok(Self::PostProcess),
            _ => Err(format!("Invalid stage: {s}")),
        }
    }
}

/// Disjoint partition of the status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusGroup {
    /// Not yet executing, waiting for a driver to pick it up
    Queued,
    /// Local orchestration code is running for it
    Processing,
    /// Submitted and awaiting or under remote execution
    OnRemote,
    Completed,
    Failed,
    Recover,
    Restart,
    Administrative,
}

/// Task status vocabulary. The serialized form is the human readable token
/// stored in the task record (e.g. `"Failed To Setup"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "New")]
    New,
    #[serde(rename = "Setting Up")]
    SettingUp,
    #[serde(rename = "Queued")]
    Queued,
    #[serde(rename = "On CPU")]
    OnCpu,
    #[serde(rename = "Suspended")]
    Suspended,
    #[serde(rename = "On Hold")]
    OnHold,
    #[serde(rename = "Data Ready")]
    DataReady,
    #[serde(rename = "Post Processing")]
    PostProcessing,
    #[serde(rename = "Subtasking")]
    Subtasking,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Failed To Setup")]
    FailedToSetup,
    #[serde(rename = "Failed On Cluster")]
    FailedOnCluster,
    #[serde(rename = "Failed To PostProcess")]
    FailedToPostProcess,
    #[serde(rename = "Failed Setup Prerequisites")]
    FailedSetupPrerequisites,
    #[serde(rename = "Failed PostProcess Prerequisites")]
    FailedPostProcessPrerequisites,
    #[serde(rename = "Terminated")]
    Terminated,
    #[serde(rename = "Recover Setup")]
    RecoverSetup,
    #[serde(rename = "Recover Cluster")]
    RecoverCluster,
    #[serde(rename = "Recover PostProcess")]
    RecoverPostProcess,
    #[serde(rename = "Recovering Setup")]
    RecoveringSetup,
    #[serde(rename = "Recovering Cluster")]
    RecoveringCluster,
    #[serde(rename = "Recovering PostProcess")]
    RecoveringPostProcess,
    #[serde(rename = "Restart Setup")]
    RestartSetup,
    #[serde(rename = "Restart Cluster")]
    RestartCluster,
    #[serde(rename = "Restart PostProcess")]
    RestartPostProcess,
    #[serde(rename = "Restarting Setup")]
    RestartingSetup,
    #[serde(rename = "Restarting Cluster")]
    RestartingCluster,
    #[serde(rename = "Restarting PostProcess")]
    RestartingPostProcess,
    #[serde(rename = "Duplicated")]
    Duplicated,
    #[serde(rename = "Preset")]
    Preset,
    #[serde(rename = "Standby")]
    Standby,
    #[serde(rename = "Configured")]
    Configured,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 32] = [
        Self::New,
        Self::SettingUp,
        Self::Queued,
        Self::OnCpu,
        Self::Suspended,
        Self::OnHold,
        Self::DataReady,
        Self::PostProcessing,
        Self::Subtasking,
        Self::Completed,
        Self::FailedToSetup,
        Self::FailedOnCluster,
        Self::FailedToPostProcess,
        Self::FailedSetupPrerequisites,
        Self::FailedPostProcessPrerequisites,
        Self::Terminated,
        Self::RecoverSetup,
        Self::RecoverCluster,
        Self::RecoverPostProcess,
        Self::RecoveringSetup,
        Self::RecoveringCluster,
        Self::RecoveringPostProcess,
        Self::RestartSetup,
        Self::RestartCluster,
        Self::RestartPostProcess,
        Self::RestartingSetup,
        Self::RestartingCluster,
        Self::RestartingPostProcess,
        Self::Duplicated,
        Self::Preset,
        Self::Standby,
        Self::Configured,
    ];

    /// The stored token for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::SettingUp => "Setting Up",
            Self::Queued => "Queued",
            Self::OnCpu => "On CPU",
            Self::Suspended => "Suspended",
            Self::OnHold => "On Hold",
            Self::DataReady => "Data Ready",
            Self::PostProcessing => "Post Processing",
            Self::Subtasking => "Subtasking",
            Self::Completed => "Completed",
            Self::FailedToSetup => "Failed To Setup",
            Self::FailedOnCluster => "Failed On Cluster",
            Self::FailedToPostProcess => "Failed To PostProcess",
            Self::FailedSetupPrerequisites => "Failed Setup Prerequisites",
            Self::FailedPostProcessPrerequisites => "Failed PostProcess Prerequisites",
            Self::Terminated => "Terminated",
            Self::RecoverSetup => "Recover Setup",
            Self::RecoverCluster => "Recover Cluster",
            Self::RecoverPostProcess => "Recover PostProcess",
            Self::RecoveringSetup => "Recovering Setup",
            Self::RecoveringCluster => "Recovering Cluster",
            Self::RecoveringPostProcess => "Recovering PostProcess",
            Self::RestartSetup => "Restart Setup",
            Self::RestartCluster => "Restart Cluster",
            Self::RestartPostProcess => "Restart PostProcess",
            Self::RestartingSetup => "Restarting Setup",
            Self::RestartingCluster => "Restarting Cluster",
            Self::RestartingPostProcess => "Restarting PostProcess",
            Self::Duplicated => "Duplicated",
            Self::Preset => "Preset",
            Self::Standby => "Standby",
            Self::Configured => "Configured",
        }
    }

    /// Group membership. Exhaustive, so a new status must be placed somewhere.
    pub fn group(&self) -> StatusGroup {
        match self {
            Self::New | Self::DataReady => StatusGroup::Queued,
            Self::SettingUp | Self::PostProcessing | Self::Subtasking => StatusGroup::Processing,
            Self::Queued | Self::OnCpu | Self::Suspended | Self::OnHold => StatusGroup::OnRemote,
            Self::Completed => StatusGroup::Completed,
            Self::FailedToSetup
            | Self::FailedOnCluster
            | Self::FailedToPostProcess
            | Self::FailedSetupPrerequisites
            | Self::FailedPostProcessPrerequisites
            | Self::Terminated => StatusGroup::Failed,
            Self::RecoverSetup
            | Self::RecoverCluster
            | Self::RecoverPostProcess
            | Self::RecoveringSetup
            | Self::RecoveringCluster
            | Self::RecoveringPostProcess => StatusGroup::Recover,
            Self::RestartSetup
            | Self::RestartCluster
            | Self::RestartPostProcess
            | Self::RestartingSetup
            | Self::RestartingCluster
            | Self::RestartingPostProcess => StatusGroup::Restart,
            Self::Duplicated | Self::Preset | Self::Standby | Self::Configured => {
                StatusGroup::Administrative
            }
        }
    }

    pub fn is_queued(&self) -> bool {
        self.group() == StatusGroup::Queued
    }

    pub fn is_processing(&self) -> bool {
        self.group() == StatusGroup::Processing
    }

    /// Submitted to the scheduler; these are the states remote polling updates
    pub fn is_on_remote(&self) -> bool {
        self.group() == StatusGroup::OnRemote
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Any failed sub-kind, termination included
    pub fn is_failure(&self) -> bool {
        self.group() == StatusGroup::Failed
    }

    /// Failures caused by a dependency rather than by local code
    pub fn is_prerequisite_failure(&self) -> bool {
        matches!(
            self,
            Self::FailedSetupPrerequisites | Self::FailedPostProcessPrerequisites
        )
    }

    pub fn is_recover(&self) -> bool {
        self.group() == StatusGroup::Recover
    }

    pub fn is_restart(&self) -> bool {
        self.group() == StatusGroup::Restart
    }

    pub fn is_administrative(&self) -> bool {
        self.group() == StatusGroup::Administrative
    }

    /// No driver will move the task forward on its own from here
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failure() || matches!(self, Self::Duplicated)
    }

    /// Counted against endpoint and user activity limits. `New` is not active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::SettingUp
                | Self::Queued
                | Self::OnCpu
                | Self::OnHold
                | Self::Suspended
                | Self::PostProcessing
                | Self::RecoveringSetup
                | Self::RecoveringCluster
                | Self::RecoveringPostProcess
                | Self::RestartingSetup
                | Self::RestartingCluster
                | Self::RestartingPostProcess
        )
    }

    /// States a task driver advances
    pub fn is_ready_for_driver(&self) -> bool {
        matches!(
            self,
            Self::New
                | Self::Queued
                | Self::OnCpu
                | Self::OnHold
                | Self::Suspended
                | Self::DataReady
                | Self::RecoverSetup
                | Self::RecoverCluster
                | Self::RecoverPostProcess
                | Self::RestartSetup
                | Self::RestartCluster
                | Self::RestartPostProcess
        )
    }

    /// Advancing a task from this state may increase cluster activity
    pub fn increases_activity(&self) -> bool {
        matches!(self, Self::New) || self.is_recover() || self.is_restart()
    }

    /// States where local code runs and can get stuck if the process dies
    pub fn is_local_code_stage(&self) -> bool {
        matches!(
            self,
            Self::SettingUp
                | Self::PostProcessing
                | Self::Subtasking
                | Self::RecoveringSetup
                | Self::RecoveringCluster
                | Self::RecoveringPostProcess
                | Self::RestartingSetup
                | Self::RestartingCluster
                | Self::RestartingPostProcess
        )
    }

    /// Failed state a task stuck in local code is forced into
    pub fn stuck_failure_status(&self) -> Option<TaskStatus> {
        match self {
            Self::SettingUp | Self::RecoveringSetup | Self::RestartingSetup => {
                Some(Self::FailedToSetup)
            }
            Self::Subtasking | Self::RecoveringCluster | Self::RestartingCluster => {
                Some(Self::FailedOnCluster)
            }
            Self::PostProcessing | Self::RecoveringPostProcess | Self::RestartingPostProcess => {
                Some(Self::FailedToPostProcess)
            }
            _ => None,
        }
    }

    /// Work directory may be archived from this state
    pub fn is_archivable(&self) -> bool {
        self.is_completed() || self.is_failure() || matches!(self, Self::Duplicated)
    }

    /// Stage of a stage-specific execution failure (not prerequisite failures)
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::FailedToSetup => Some(Stage::Setup),
            Self::FailedOnCluster => Some(Stage::Cluster),
            Self::FailedToPostProcess => Some(Stage::PostProcess),
            _ => None,
        }
    }

    /// Stage of a `Recover X` or `Recovering X` status
    pub fn recover_stage(&self) -> Option<Stage> {
        match self {
            Self::RecoverSetup | Self::RecoveringSetup => Some(Stage::Setup),
            Self::RecoverCluster | Self::RecoveringCluster => Some(Stage::Cluster),
            Self::RecoverPostProcess | Self::RecoveringPostProcess => Some(Stage::PostProcess),
            _ => None,
        }
    }

    /// Stage of a `Restart X` or `Restarting X` status
    pub fn restart_stage(&self) -> Option<Stage> {
        match self {
            Self::RestartSetup | Self::RestartingSetup => Some(Stage::Setup),
            Self::RestartCluster | Self::RestartingCluster => Some(Stage::Cluster),
            Self::RestartPostProcess | Self::RestartingPostProcess => Some(Stage::PostProcess),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid task status: {s}"))
    }
}

/// Default status for freshly submitted tasks
impl Default for TaskStatus {
    fn default() -> Self {
        Self::New
    }
}
