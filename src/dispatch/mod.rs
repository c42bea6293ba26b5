//! Scheduler/dispatcher — finds due work and executes it exactly once.

pub mod dispatcher;
pub mod model;
pub mod ticker;

pub use dispatcher::{Dispatcher, PassSummary};
pub use model::{DueItem, ExecutionRecord, ExecutionStatus, RuleRef};
pub use ticker::spawn_ticker;
