//! Resource tracking and quota enforcement — cgroups equivalent.
//!
//! Tracks per-process usage against an allocated quota and rolls the same
//! counters into system-wide totals. NOT a separate actor: owned by `Kernel`
//! and called via `&mut self` under its lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::types::{ResourceQuota, ResourceUsage};
use crate::types::ProcessId;

#[derive(Debug, Clone)]
struct ProcessResources {
    quota: ResourceQuota,
    usage: ResourceUsage,
    allocated_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    last_envelope_bounds: EnvelopeBoundsSnapshot,
}

/// The envelope bounds counters last reported through
/// [`ResourceTracker::record_envelope_bounds`], used to turn an envelope's
/// cumulative totals into a one-shot delta.
#[derive(Debug, Clone, Default)]
struct EnvelopeBoundsSnapshot {
    llm_call_count: i32,
    tool_call_count: i32,
    tokens_in: i64,
    tokens_out: i64,
}

/// Aggregate, system-wide resource counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemUsage {
    pub total_processes: u64,
    pub active_processes: u64,
    pub system_llm_calls: i64,
    pub system_tool_calls: i64,
    pub system_tokens_in: i64,
    pub system_tokens_out: i64,
}

/// Remaining budget before each cap is hit, floored at zero.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemainingBudget {
    pub llm_calls: i32,
    pub tool_calls: i32,
    pub agent_hops: i32,
    pub iterations: i32,
    pub time_seconds: f64,
}

/// Sparse set of quota field overrides for `adjust_quota`.
#[derive(Debug, Clone, Default)]
pub struct QuotaAdjustment {
    pub max_llm_calls: Option<i32>,
    pub max_tool_calls: Option<i32>,
    pub max_agent_hops: Option<i32>,
    pub max_iterations: Option<i32>,
    pub max_input_tokens: Option<i64>,
    pub max_output_tokens: Option<i64>,
    pub max_context_tokens: Option<i64>,
    pub hard_timeout_seconds: Option<i32>,
    pub soft_timeout_seconds: Option<i32>,
}

/// Resource tracker — kernel cgroups equivalent.
#[derive(Debug)]
pub struct ResourceTracker {
    default_quota: ResourceQuota,
    resources: HashMap<ProcessId, ProcessResources>,
    system: SystemUsage,
}

impl ResourceTracker {
    pub fn new(default_quota: Option<ResourceQuota>) -> Self {
        Self {
            default_quota: default_quota.unwrap_or_default(),
            resources: HashMap::new(),
            system: SystemUsage::default(),
        }
    }

    /// Allocate a quota to a process. Returns false on duplicate allocation.
    pub fn allocate(&mut self, pid: ProcessId, quota: ResourceQuota) -> bool {
        if self.resources.contains_key(&pid) {
            tracing::warn!(pid = %pid, "duplicate_allocation");
            return false;
        }
        let now = Utc::now();
        self.resources.insert(
            pid,
            ProcessResources {
                quota,
                usage: ResourceUsage::default(),
                allocated_at: now,
                last_updated_at: now,
                last_envelope_bounds: EnvelopeBoundsSnapshot::default(),
            },
        );
        self.system.total_processes += 1;
        self.system.active_processes += 1;
        true
    }

    /// Release a process's tracked resources.
    pub fn release(&mut self, pid: &ProcessId) -> bool {
        if self.resources.remove(pid).is_some() {
            self.system.active_processes = self.system.active_processes.saturating_sub(1);
            true
        } else {
            false
        }
    }

    /// Record incremental usage, autovivifying a default-quota allocation if
    /// the process is not yet tracked. Returns the process's updated usage.
    pub fn record_usage(
        &mut self,
        pid: &ProcessId,
        llm_calls: i32,
        tool_calls: i32,
        agent_hops: i32,
        tokens_in: i64,
        tokens_out: i64,
    ) -> ResourceUsage {
        if !self.resources.contains_key(pid) {
            let now = Utc::now();
            self.resources.insert(
                pid.clone(),
                ProcessResources {
                    quota: self.default_quota.clone(),
                    usage: ResourceUsage::default(),
                    allocated_at: now,
                    last_updated_at: now,
                    last_envelope_bounds: EnvelopeBoundsSnapshot::default(),
                },
            );
            self.system.total_processes += 1;
            self.system.active_processes += 1;
        }
        let pr = self.resources.get_mut(pid).expect("just inserted or already present");

        pr.usage.llm_calls += llm_calls;
        pr.usage.tool_calls += tool_calls;
        pr.usage.agent_hops += agent_hops;
        pr.usage.tokens_in += tokens_in;
        pr.usage.tokens_out += tokens_out;
        pr.last_updated_at = Utc::now();
        pr.usage.elapsed_seconds = (pr.last_updated_at - pr.allocated_at).num_milliseconds() as f64 / 1000.0;

        self.system.system_llm_calls += llm_calls as i64;
        self.system.system_tool_calls += tool_calls as i64;
        self.system.system_tokens_in += tokens_in;
        self.system.system_tokens_out += tokens_out;

        if pr.usage.llm_calls as f64 >= pr.quota.max_llm_calls as f64 * 0.8 {
            tracing::warn!(
                pid = %pid,
                usage = pr.usage.llm_calls,
                quota = pr.quota.max_llm_calls,
                "approaching_llm_limit"
            );
        }
        if pr.usage.elapsed_seconds >= pr.quota.soft_timeout_seconds as f64 {
            tracing::warn!(
                pid = %pid,
                elapsed = pr.usage.elapsed_seconds,
                soft_timeout = pr.quota.soft_timeout_seconds,
                hard_timeout = pr.quota.hard_timeout_seconds,
                "approaching_timeout"
            );
        }

        pr.usage.clone()
    }

    /// Record usage from an envelope's own cumulative bounds counters.
    ///
    /// The envelope reports running totals, not per-call deltas: the same
    /// totals are seen again on every subsequent `execute()` pass for a
    /// pid (a dispatch retry, an interrupt/resume cycle) until the handler
    /// advances them further. Diffing against the last snapshot reported
    /// for this pid turns that into the non-negative per-call increments
    /// `record_usage` expects, so re-observing an unchanged or stale
    /// snapshot costs nothing.
    pub fn record_envelope_bounds(
        &mut self,
        pid: &ProcessId,
        llm_call_count: i32,
        tool_call_count: i32,
        agent_hops: i32,
        tokens_in: i64,
        tokens_out: i64,
    ) -> ResourceUsage {
        if !self.resources.contains_key(pid) {
            let now = Utc::now();
            self.resources.insert(
                pid.clone(),
                ProcessResources {
                    quota: self.default_quota.clone(),
                    usage: ResourceUsage::default(),
                    allocated_at: now,
                    last_updated_at: now,
                    last_envelope_bounds: EnvelopeBoundsSnapshot::default(),
                },
            );
            self.system.total_processes += 1;
            self.system.active_processes += 1;
        }

        let delta = {
            let pr = self.resources.get_mut(pid).expect("just inserted or already present");
            let prior = pr.last_envelope_bounds.clone();
            pr.last_envelope_bounds = EnvelopeBoundsSnapshot { llm_call_count, tool_call_count, tokens_in, tokens_out };
            EnvelopeBoundsSnapshot {
                llm_call_count: (llm_call_count - prior.llm_call_count).max(0),
                tool_call_count: (tool_call_count - prior.tool_call_count).max(0),
                tokens_in: (tokens_in - prior.tokens_in).max(0),
                tokens_out: (tokens_out - prior.tokens_out).max(0),
            }
        };

        self.record_usage(pid, delta.llm_call_count, delta.tool_call_count, agent_hops, delta.tokens_in, delta.tokens_out)
    }

    /// Check whether a tracked process is within quota. Untracked pids report
    /// no limit.
    pub fn check_quota(&self, pid: &ProcessId) -> Option<String> {
        self.resources.get(pid).and_then(|pr| pr.usage.exceeds_quota(&pr.quota))
    }

    pub fn get_usage(&self, pid: &ProcessId) -> Option<ResourceUsage> {
        self.resources.get(pid).map(|pr| pr.usage.clone())
    }

    pub fn get_quota(&self, pid: &ProcessId) -> Option<ResourceQuota> {
        self.resources.get(pid).map(|pr| pr.quota.clone())
    }

    pub fn get_system_usage(&self) -> SystemUsage {
        self.system.clone()
    }

    /// Refresh and return elapsed time for a process without recording usage.
    pub fn update_elapsed_time(&mut self, pid: &ProcessId) -> Option<f64> {
        let pr = self.resources.get_mut(pid)?;
        pr.last_updated_at = Utc::now();
        pr.usage.elapsed_seconds = (pr.last_updated_at - pr.allocated_at).num_milliseconds() as f64 / 1000.0;
        Some(pr.usage.elapsed_seconds)
    }

    pub fn get_remaining_budget(&self, pid: &ProcessId) -> Option<RemainingBudget> {
        let pr = self.resources.get(pid)?;
        let (quota, usage) = (&pr.quota, &pr.usage);
        Some(RemainingBudget {
            llm_calls: (quota.max_llm_calls - usage.llm_calls).max(0),
            tool_calls: (quota.max_tool_calls - usage.tool_calls).max(0),
            agent_hops: (quota.max_agent_hops - usage.agent_hops).max(0),
            iterations: (quota.max_iterations - usage.iterations).max(0),
            time_seconds: (quota.hard_timeout_seconds as f64 - usage.elapsed_seconds).max(0.0),
        })
    }

    /// Apply a sparse set of quota overrides to a tracked process.
    ///
    /// Rejects the whole adjustment (no partial application) if any given
    /// field would shrink a cap below what the process has already
    /// consumed — that would retroactively put the process in breach of a
    /// quota it was compliant with the moment before.
    pub fn adjust_quota(&mut self, pid: &ProcessId, adjustments: QuotaAdjustment) -> bool {
        let Some(pr) = self.resources.get_mut(pid) else {
            return false;
        };

        let retroactive = [
            (adjustments.max_llm_calls, pr.usage.llm_calls),
            (adjustments.max_tool_calls, pr.usage.tool_calls),
            (adjustments.max_agent_hops, pr.usage.agent_hops),
            (adjustments.max_iterations, pr.usage.iterations),
        ]
        .into_iter()
        .any(|(requested, used)| requested.is_some_and(|v| v < used))
            || [
                (adjustments.max_input_tokens, pr.usage.tokens_in),
                (adjustments.max_output_tokens, pr.usage.tokens_out),
            ]
            .into_iter()
            .any(|(requested, used)| requested.is_some_and(|v| v < used))
            || adjustments
                .hard_timeout_seconds
                .is_some_and(|v| (v as f64) < pr.usage.elapsed_seconds);

        if retroactive {
            tracing::warn!(pid = %pid, "quota_adjustment_rejected_retroactive_breach");
            return false;
        }

        if let Some(v) = adjustments.max_llm_calls {
            pr.quota.max_llm_calls = v;
        }
        if let Some(v) = adjustments.max_tool_calls {
            pr.quota.max_tool_calls = v;
        }
        if let Some(v) = adjustments.max_agent_hops {
            pr.quota.max_agent_hops = v;
        }
        if let Some(v) = adjustments.max_iterations {
            pr.quota.max_iterations = v;
        }
        if let Some(v) = adjustments.max_input_tokens {
            pr.quota.max_input_tokens = v;
        }
        if let Some(v) = adjustments.max_output_tokens {
            pr.quota.max_output_tokens = v;
        }
        if let Some(v) = adjustments.max_context_tokens {
            pr.quota.max_context_tokens = v;
        }
        if let Some(v) = adjustments.hard_timeout_seconds {
            pr.quota.hard_timeout_seconds = v;
        }
        if let Some(v) = adjustments.soft_timeout_seconds {
            pr.quota.soft_timeout_seconds = v;
        }
        tracing::info!(pid = %pid, "quota_adjusted");
        true
    }

    pub fn get_all_usage(&self) -> HashMap<ProcessId, ResourceUsage> {
        self.resources.iter().map(|(pid, pr)| (pid.clone(), pr.usage.clone())).collect()
    }

    pub fn is_tracked(&self, pid: &ProcessId) -> bool {
        self.resources.contains_key(pid)
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new(None)
    }
}
