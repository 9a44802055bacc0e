pub mod event_manager;
mod event_queue;

pub use event_manager::{CancelSummary, EventManager, JobOutcome};
pub use event_queue::RunningJob;
