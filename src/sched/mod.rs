//! Evaluation scheduling - worker pool, work items, the scheduler itself.

pub mod scheduler;
pub mod work_items;
pub mod workers;

pub use scheduler::{CheckedOutImage, GraphEdit, Scheduler};
pub use work_items::{WorkItemId, WorkItemQueue};
pub use workers::EvalWorkers;
