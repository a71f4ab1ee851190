//! # Control Tower Kernel
//!
//! A microkernel for orchestrating agent-style workloads:
//! - Process lifecycle management with Unix-like state transitions
//! - Resource quota enforcement (LLM calls, tokens, hops, iterations)
//! - Rate limiting with configurable sliding windows
//! - Flow interrupts for human-in-the-loop patterns
//! - Service registry and async dispatch with retry/timeout
//! - A kernel-internal event bus decoupled from the interrupt plane
//! - Distributed worker coordination with heartbeats and checkpoints
//!
//! ## Architecture
//!
//! The kernel follows a single-lock model where the `Kernel` facade owns all
//! mutable state:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   submit_request →  │            Kernel              │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │Resources│ │Lifecycle│        │
//!                    │  │ Tracker │ │ Manager │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │Interrupt│ │RateLimit│        │
//!                    │  │ Service │ │   er    │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod envelope;
pub mod kernel;
pub mod types;
pub mod validation;
pub mod worker;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
