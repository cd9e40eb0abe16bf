//! service-core: Shared infrastructure for the identity services.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use tokio;
pub use tracing;
