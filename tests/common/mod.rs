pub mod builders;
pub mod mock_scheduler;
pub mod strategies;

pub use builders::*;
pub use mock_scheduler::*;
pub use strategies::*;
