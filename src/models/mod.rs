pub mod background_activity;
pub mod prerequisites;
pub mod task;

// Re-export core models for easy access
pub use background_activity::{ActivityId, ActivityStatus, BackgroundActivity};
pub use prerequisites::{GatingPoint, Prerequisites, Requirement};
pub use task::{NewTask, Task, TaskFlags, TaskId, TaskLogEntry};
