// Status vocabulary and the transition engine.
//
// Every status change goes through `StatusTransitionEngine`, a compare-and-set
// against the durable store followed by the callbacks registered for the
// `(from, to)` pair.

pub mod callbacks;
pub mod engine;
pub mod errors;
pub mod states;

// Re-export main types for convenient access
pub use callbacks::{CallbackTable, PrerequisiteFailureCascade, StatusPattern, TransitionCallback};
pub use engine::StatusTransitionEngine;
pub use errors::{StateMachineError, StateMachineResult};
pub use states::{Stage, StatusGroup, TaskStatus};
