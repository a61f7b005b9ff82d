use proptest::prelude::*;
use tasker_cluster::models::Requirement;
use tasker_cluster::state_machine::TaskStatus;

/// Any status of the vocabulary
pub fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

pub fn requirement_strategy() -> impl Strategy<Value = Requirement> {
    prop::sample::select(Requirement::ALL.to_vec())
}

/// Number of pollers racing on one transition
pub fn racer_count_strategy() -> impl Strategy<Value = usize> {
    2usize..8
}
