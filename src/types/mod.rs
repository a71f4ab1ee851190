//! Core types for the control tower kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, EnvelopeId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the kernel and its subsystems

mod config;
mod errors;
mod ids;

pub use config::{Config, DefaultLimits, ObservabilityConfig, RateLimitDefaults, RuntimeConfig};
pub use errors::{Error, Result};
pub use ids::{
    CheckpointId, EnvelopeId, InterruptId, ProcessId, RequestId, ServiceName, SessionId, TaskId,
    UserId,
};
