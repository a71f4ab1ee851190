//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Default resource limits propagated into every PCB's quota.
    #[serde(default)]
    pub defaults: DefaultLimits,

    /// Rate limiter defaults.
    #[serde(default)]
    pub rate_limits: RateLimitDefaults,

    /// Feature toggles and distributed-mode knobs.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default resource limits, propagated into every PCB's quota at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    pub max_llm_calls: u32,
    pub max_tool_calls: u32,
    pub max_agent_hops: u32,
    pub max_iterations: u32,

    #[serde(with = "humantime_serde")]
    pub hard_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub soft_timeout: Duration,

    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    pub max_context_tokens: u32,
    pub reserved_tokens: u32,

    pub default_service: String,
    pub default_priority: String,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            max_llm_calls: 100,
            max_tool_calls: 50,
            max_agent_hops: 10,
            max_iterations: 20,
            hard_timeout: Duration::from_secs(300),
            soft_timeout: Duration::from_secs(240),
            max_input_tokens: 128_000,
            max_output_tokens: 8_000,
            max_context_tokens: 200_000,
            reserved_tokens: 4_000,
            default_service: "default".to_string(),
            default_priority: "normal".to_string(),
        }
    }
}

/// Rate limiter defaults (overridable per user/endpoint at runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub bucket_count: u32,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            requests_per_day: 10_000,
            bucket_count: 10,
        }
    }
}

/// Feature toggles and distributed-execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub enable_distributed: bool,
    pub enable_checkpoints: bool,
    pub enable_tracing: bool,
    pub enable_telemetry: bool,
    pub max_concurrent_agents: usize,
    pub checkpoint_interval_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable_distributed: false,
            enable_checkpoints: false,
            enable_tracing: true,
            enable_telemetry: false,
            max_concurrent_agents: 10,
            checkpoint_interval_seconds: 30,
        }
    }
}
