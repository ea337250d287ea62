//! Process-level plumbing: telemetry installation and shared error types.

pub mod error;
pub mod telemetry;

pub use error::InfraError;
