pub mod app_config;
pub mod event_manager;
pub mod observability;
pub mod queue;
pub mod services;
pub mod worker;

pub use app_config::*;
pub use event_manager::*;
pub use observability::*;
pub use queue::*;
pub use services::*;
pub use worker::*;
