pub mod dependency_manager;
pub mod job_worker;
pub mod producer;
pub mod queue_monitor;
pub mod settings;

pub use dependency_manager::DependencyManager;
pub use job_worker::{JobDisposition, JobWorker, JobWorkerBuilder};
pub use producer::JobProducer;
pub use queue_monitor::{JobState, MonitoredJob, QueueMonitor};
pub use settings::WorkerSettings;
