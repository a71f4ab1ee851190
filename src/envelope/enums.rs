//! Core enumerations shared by the envelope and kernel.

use serde::{Deserialize, Serialize};

/// Why processing terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    Completed,
    MaxIterationsExceeded,
    MaxLlmCallsExceeded,
    MaxAgentHopsExceeded,
    MaxToolCallsExceeded,
    Timeout,
    Cancelled,
}

impl TerminalReason {
    /// Map a `check_quota` reason string onto the corresponding terminal reason.
    pub fn from_quota_reason(reason: &str) -> Option<Self> {
        match reason {
            "max_llm_calls_exceeded" => Some(Self::MaxLlmCallsExceeded),
            "max_tool_calls_exceeded" => Some(Self::MaxToolCallsExceeded),
            "max_agent_hops_exceeded" => Some(Self::MaxAgentHopsExceeded),
            "max_iterations_exceeded" => Some(Self::MaxIterationsExceeded),
            "hard_timeout_exceeded" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Interrupt type. At most one pending interrupt per PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Clarification,
    Confirmation,
    Approval,
    ResourceExhausted,
    Timeout,
    SystemError,
}

impl InterruptKind {
    /// Terminal interrupt kinds short-circuit: they set the envelope's
    /// terminated flag instead of creating a resumable record.
    pub fn is_terminal(self) -> bool {
        matches!(self, InterruptKind::ResourceExhausted | InterruptKind::Timeout)
    }
}

/// Health status, shared by the Service Registry and the Worker Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}
