pub mod handle;
pub mod models;

pub use handle::ConfigHandle;
pub use models::*;
