pub mod events;
pub mod item;
pub mod jobs;
pub mod locks;
pub mod messaging;
pub mod repositories;
pub mod services;
pub mod state;

pub use events::*;
pub use item::*;
pub use jobs::*;
pub use locks::*;
pub use messaging::*;
pub use orchestrator_errors::{ErrorClass, OrchestratorError, OrchestratorResult};
pub use repositories::*;
pub use services::*;
pub use state::*;
