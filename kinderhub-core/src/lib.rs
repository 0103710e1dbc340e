//! Kinderhub Core - shared data structures and infrastructure
//!
//! Session bundle and user profile types, the error taxonomy, logging,
//! configuration and async helpers used by the rest of the workspace.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
