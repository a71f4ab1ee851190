//! Kernel types: ProcessState, ProcessControlBlock, resource tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::envelope::InterruptKind;

/// Process lifecycle state.
///
/// State transitions:
/// ```text
/// NEW → READY → RUNNING → {WAITING | BLOCKED | TERMINATED}
///                    ↓         ↓
///                  READY     ZOMBIE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Blocked,
    Terminated,
    Zombie,
}

impl ProcessState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Zombie)
    }

    /// Check if process can be scheduled.
    pub fn can_schedule(self) -> bool {
        matches!(self, ProcessState::New | ProcessState::Ready)
    }

    /// Check if process is runnable.
    pub fn is_runnable(self) -> bool {
        self == ProcessState::Ready
    }

    /// Check if a transition to `to` is valid under the fixed adjacency set.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        match (self, to) {
            (ProcessState::New, ProcessState::Ready) => true,
            (ProcessState::New, ProcessState::Terminated) => true,
            (ProcessState::Ready, ProcessState::Running) => true,
            (ProcessState::Ready, ProcessState::Terminated) => true,
            (ProcessState::Running, ProcessState::Ready) => true,
            (ProcessState::Running, ProcessState::Waiting) => true,
            (ProcessState::Running, ProcessState::Blocked) => true,
            (ProcessState::Running, ProcessState::Terminated) => true,
            (ProcessState::Waiting, ProcessState::Ready) => true,
            (ProcessState::Waiting, ProcessState::Terminated) => true,
            (ProcessState::Blocked, ProcessState::Ready) => true,
            (ProcessState::Blocked, ProcessState::Terminated) => true,
            (ProcessState::Terminated, ProcessState::Zombie) => true,
            (ProcessState::Zombie, _) => false,
            _ => false,
        }
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPriority {
    Realtime,
    High,
    Normal,
    Low,
    Idle,
}

impl SchedulingPriority {
    /// Heap priority rank (lower sorts first / runs sooner).
    pub fn to_heap_value(self) -> i32 {
        match self {
            SchedulingPriority::Realtime => 0,
            SchedulingPriority::High => 1,
            SchedulingPriority::Normal => 2,
            SchedulingPriority::Low => 3,
            SchedulingPriority::Idle => 4,
        }
    }

    /// Map an integer priority (as used by distributed submission) onto the
    /// scheduler's enum: >=10 is HIGH, <=-10 is LOW, else NORMAL.
    pub fn from_integer(value: i32) -> Self {
        if value >= 10 {
            SchedulingPriority::High
        } else if value <= -10 {
            SchedulingPriority::Low
        } else {
            SchedulingPriority::Normal
        }
    }
}

impl Default for SchedulingPriority {
    fn default() -> Self {
        SchedulingPriority::Normal
    }
}

/// Resource quota — immutable after allocation except via explicit `adjust_quota`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceQuota {
    pub max_llm_calls: i32,
    pub max_tool_calls: i32,
    pub max_agent_hops: i32,
    pub max_iterations: i32,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
    pub max_context_tokens: i64,
    pub hard_timeout_seconds: i32,
    pub soft_timeout_seconds: i32,
}

impl ResourceQuota {
    pub fn default_quota() -> Self {
        Self {
            max_llm_calls: 100,
            max_tool_calls: 50,
            max_agent_hops: 10,
            max_iterations: 20,
            max_input_tokens: 128_000,
            max_output_tokens: 8_000,
            max_context_tokens: 200_000,
            hard_timeout_seconds: 300,
            soft_timeout_seconds: 240,
        }
    }
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::default_quota()
    }
}

impl From<&crate::types::DefaultLimits> for ResourceQuota {
    fn from(limits: &crate::types::DefaultLimits) -> Self {
        Self {
            max_llm_calls: limits.max_llm_calls as i32,
            max_tool_calls: limits.max_tool_calls as i32,
            max_agent_hops: limits.max_agent_hops as i32,
            max_iterations: limits.max_iterations as i32,
            max_input_tokens: limits.max_input_tokens as i64,
            max_output_tokens: limits.max_output_tokens as i64,
            max_context_tokens: limits.max_context_tokens as i64,
            hard_timeout_seconds: limits.hard_timeout.as_secs() as i32,
            soft_timeout_seconds: limits.soft_timeout.as_secs() as i32,
        }
    }
}

/// Resource usage — monotonic counters. Never decreases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    pub llm_calls: i32,
    pub tool_calls: i32,
    pub agent_hops: i32,
    pub iterations: i32,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub elapsed_seconds: f64,
}

impl ResourceUsage {
    /// Evaluate caps in the fixed order from the data model and return the
    /// name of the first exceeded cap, or `None` if all caps hold.
    pub fn exceeds_quota(&self, quota: &ResourceQuota) -> Option<String> {
        if self.llm_calls > quota.max_llm_calls {
            return Some("max_llm_calls_exceeded".to_string());
        }
        if self.tool_calls > quota.max_tool_calls {
            return Some("max_tool_calls_exceeded".to_string());
        }
        if self.agent_hops > quota.max_agent_hops {
            return Some("max_agent_hops_exceeded".to_string());
        }
        if self.iterations > quota.max_iterations {
            return Some("max_iterations_exceeded".to_string());
        }
        if self.elapsed_seconds >= quota.hard_timeout_seconds as f64 {
            return Some("hard_timeout_exceeded".to_string());
        }
        if self.tokens_in > quota.max_input_tokens {
            return Some("max_input_tokens_exceeded".to_string());
        }
        if self.tokens_out > quota.max_output_tokens {
            return Some("max_output_tokens_exceeded".to_string());
        }
        if self.tokens_in + self.tokens_out > quota.max_context_tokens {
            return Some("max_context_tokens_exceeded".to_string());
        }
        None
    }
}

/// Process Control Block — the kernel's record for a live request.
///
/// The envelope carries payload; the PCB tracks scheduling state, resource
/// accounting, and interrupt status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessControlBlock {
    pub pid: String,
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,

    pub state: ProcessState,
    pub priority: SchedulingPriority,

    pub quota: ResourceQuota,
    pub usage: ResourceUsage,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<InterruptKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_data: Option<HashMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<String>,

    pub child_pids: Vec<String>,
}

impl ProcessControlBlock {
    pub fn new(pid: String, request_id: String, user_id: String, session_id: String) -> Self {
        Self {
            pid,
            request_id,
            user_id,
            session_id,
            state: ProcessState::New,
            priority: SchedulingPriority::default(),
            quota: ResourceQuota::default(),
            usage: ResourceUsage::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_scheduled_at: None,
            current_stage: None,
            current_service: None,
            pending_interrupt: None,
            interrupt_data: None,
            parent_pid: None,
            child_pids: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        let now = Utc::now();
        self.state = ProcessState::Running;
        self.started_at.get_or_insert(now);
        self.last_scheduled_at = Some(now);
    }

    pub fn complete(&mut self) {
        let now = Utc::now();
        self.state = ProcessState::Terminated;
        self.completed_at = Some(now);
    }

    pub fn wait(&mut self, interrupt_kind: InterruptKind) {
        self.state = ProcessState::Waiting;
        self.pending_interrupt = Some(interrupt_kind);
    }

    pub fn block(&mut self, reason: String) {
        self.state = ProcessState::Blocked;
        let data = self.interrupt_data.get_or_insert_with(HashMap::new);
        data.insert(
            "block_reason".to_string(),
            serde_json::Value::String(reason),
        );
    }

    /// Resume from WAITING/BLOCKED to READY.
    pub fn resume(&mut self) {
        if matches!(self.state, ProcessState::Waiting | ProcessState::Blocked) {
            self.state = ProcessState::Ready;
            self.pending_interrupt = None;
        }
    }

    pub fn check_quota(&self) -> Option<String> {
        self.usage.exceeds_quota(&self.quota)
    }

    pub fn can_schedule(&self) -> bool {
        self.state.can_schedule()
    }

    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}
