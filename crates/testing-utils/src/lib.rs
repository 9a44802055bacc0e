//! # Orchestrator Testing Utils
//!
//! Shared testing utilities for the orchestration engine.
//!
//! - **Builders**: media items with sensible defaults
//! - **Services**: scripted, flaky and blocking `MediaService` doubles
//! - **Helpers**: `TestEnv::wait_for` and friends
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! orchestrator-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
