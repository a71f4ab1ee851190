//! Kernel Facade — binds every subsystem together behind one lock.
//!
//! Each subsystem (`LifecycleManager`, `ResourceTracker`, `RateLimiter`,
//! `ServiceRegistry`, `Dispatcher`, `EventAggregator`, `InterruptService`) is
//! a plain struct with no internal concurrency of its own; `Kernel` owns them
//! all and the caller (an `Arc<Mutex<Kernel>>` or similar) supplies the
//! locking. This mirrors the teacher's single-actor model: one lock, many
//! cooperating components, no message passing between them.

pub mod cleanup;
pub mod dispatch;
pub mod events;
pub mod interrupts;
pub mod lifecycle;
pub mod rate_limiter;
pub mod resources;
pub mod services;
pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Envelope, FlowInterrupt, InterruptKind};
use crate::types::{Config, Error, InterruptId, ProcessId, RequestId, Result, SessionId, UserId};

use dispatch::{Dispatcher, Handler};
use events::{EventAggregator, EventHandler, KernelEvent, SubscriptionId};
use interrupts::{InterruptRecord, InterruptService, InterruptStore};
use lifecycle::LifecycleManager;
use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
use resources::{QuotaAdjustment, RemainingBudget, ResourceTracker};
use services::{ServiceInfo, ServiceRegistry};
use types::{ProcessState, ResourceQuota, ResourceUsage, SchedulingPriority};

/// Snapshot of a request's status, assembled from the lifecycle and resource
/// subsystems for `get_request_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    pub pid: String,
    pub state: ProcessState,
    pub priority: SchedulingPriority,
    pub current_stage: Option<String>,
    pub usage: ResourceUsage,
    pub remaining: Option<RemainingBudget>,
    pub interrupt_pending: bool,
    pub interrupt_kind: Option<InterruptKind>,
}

/// The kernel facade. NOT a separate actor: every subsystem here is a plain
/// struct called via `&mut self`; whoever holds the `Kernel` (typically
/// behind an `Arc<Mutex<_>>`) provides the single lock.
#[derive(Debug)]
pub struct Kernel {
    pub lifecycle: LifecycleManager,
    pub resources: ResourceTracker,
    pub rate_limiter: RateLimiter,
    pub services: ServiceRegistry,
    pub dispatcher: Dispatcher,
    pub events: EventAggregator,
    pub interrupts: InterruptService,

    envelopes: HashMap<String, Envelope>,
    default_service: String,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            lifecycle: LifecycleManager::default(),
            resources: ResourceTracker::default(),
            rate_limiter: RateLimiter::default(),
            services: ServiceRegistry::default(),
            dispatcher: Dispatcher::new(None),
            events: EventAggregator::default(),
            interrupts: InterruptService::default(),
            envelopes: HashMap::new(),
            default_service: "default".to_string(),
        }
    }

    /// Build a kernel from loaded configuration: default quota, rate limit
    /// defaults, and default dispatch target all come from `config`.
    pub fn with_config(config: &Config) -> Self {
        let mut kernel = Self {
            lifecycle: LifecycleManager::new(Some(ResourceQuota::from(&config.defaults))),
            resources: ResourceTracker::new(Some(ResourceQuota::from(&config.defaults))),
            rate_limiter: RateLimiter::new(Some(RateLimitConfig::from(&config.rate_limits))),
            services: ServiceRegistry::default(),
            dispatcher: Dispatcher::new(None),
            events: EventAggregator::default(),
            interrupts: InterruptService::default(),
            envelopes: HashMap::new(),
            default_service: config.defaults.default_service.clone(),
        };
        kernel.services.register_service(ServiceInfo::new(
            kernel.default_service.clone(),
            services::SERVICE_TYPE_FLOW.to_string(),
        ));
        kernel
    }

    pub fn with_interrupt_store(mut self, store: std::sync::Arc<dyn InterruptStore>) -> Self {
        self.interrupts = InterruptService::new(Some(store));
        self
    }

    // =========================================================================
    // Service / dispatch delegation
    // =========================================================================

    pub fn register_service(&mut self, info: ServiceInfo) -> bool {
        self.services.register_service(info)
    }

    pub fn register_handler(&mut self, service_name: &str, handler: Handler) {
        self.dispatcher.register_handler(service_name, handler);
    }

    pub fn unregister_handler(&mut self, service_name: &str) -> bool {
        self.dispatcher.unregister_handler(service_name)
    }

    // =========================================================================
    // Event bus delegation
    // =========================================================================

    pub fn subscribe(&mut self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        self.events.subscribe(event_type, handler)
    }

    pub fn unsubscribe(&mut self, event_type: &str, id: SubscriptionId) {
        self.events.unsubscribe(event_type, id);
    }

    // =========================================================================
    // Request lifecycle
    // =========================================================================

    /// Admit a new envelope: validate identity, enforce the submitter's rate
    /// limit, create and schedule a PCB, then run it to its first suspension
    /// point (interrupt, exhaustion, or completion).
    pub async fn submit_request(
        &mut self,
        mut envelope: Envelope,
        priority: SchedulingPriority,
        quota: Option<ResourceQuota>,
    ) -> Envelope {
        if let Err(e) = crate::validation::validate_non_empty(&envelope.raw_input, "raw_input") {
            envelope.terminate(e.to_string());
            return envelope;
        }

        let (pid, request_id, user_id, session_id) = match typed_identity(&envelope.identity) {
            Ok(ids) => ids,
            Err(e) => {
                envelope.terminate(e.to_string());
                return envelope;
            }
        };

        if let RateLimitResult::Exceeded { retry_after_seconds, .. } =
            self.rate_limiter.check_rate_limit(user_id.as_str(), "submit_request", true)
        {
            envelope.terminate(format!("rate limit exceeded, retry after {retry_after_seconds:.1}s"));
            return envelope;
        }

        let pcb = match self.lifecycle.submit(pid.clone(), request_id, user_id, session_id, priority, quota) {
            Ok(pcb) => pcb,
            Err(e) => {
                envelope.terminate(e.to_string());
                return envelope;
            }
        };

        self.events.emit_event(KernelEvent::new(
            "process.created",
            Some(pid.to_string()),
            serde_json::json!({ "priority": format!("{:?}", priority) }),
        ));
        self.resources.allocate(pid.clone(), pcb.quota.clone());
        self.lifecycle.schedule(&pid);
        self.envelopes.insert(pid.to_string(), envelope);

        self.execute(&pid).await
    }

    /// Resume a process waiting on `interrupt_id`, feeding `response` back
    /// through the interrupt service, then continue execution.
    pub async fn resume_request(
        &mut self,
        pid: &ProcessId,
        interrupt_id: &InterruptId,
        response: Value,
        actor: &str,
    ) -> Result<Envelope> {
        let kind = self
            .lifecycle
            .get(pid)
            .and_then(|pcb| pcb.pending_interrupt)
            .ok_or_else(|| Error::interrupt(format!("pid {pid} has no pending interrupt")))?;

        self.interrupts
            .respond(interrupt_id, kind, response, actor)
            .ok_or_else(|| Error::interrupt(format!("interrupt {interrupt_id} unresolved or kind mismatch")))?;

        self.events.clear_interrupt(pid.as_str());
        self.lifecycle.resume(pid)?;
        self.events.emit_event(KernelEvent::new(
            "process.state_changed",
            Some(pid.to_string()),
            serde_json::json!({ "new_state": "ready" }),
        ));

        Ok(self.execute(pid).await)
    }

    /// Cancel a process: force-terminate the PCB, release its resources, and
    /// drop per-process event/interrupt bookkeeping.
    pub fn cancel_request(&mut self, pid: &ProcessId, reason: &str) -> bool {
        let cancelled = self.lifecycle.terminate(pid, reason, true);
        if cancelled {
            self.resources.release(pid);
            self.events.cleanup_process(pid.as_str());
            self.events.emit_event(KernelEvent::new(
                "process.cancelled",
                Some(pid.to_string()),
                serde_json::json!({ "reason": reason }),
            ));
            if let Some(envelope) = self.envelopes.get_mut(pid.as_str()) {
                envelope.terminate(reason.to_string());
            }
        }
        cancelled
    }

    pub fn get_request_status(&self, pid: &ProcessId) -> Option<RequestStatus> {
        let pcb = self.lifecycle.get(pid)?;
        Some(RequestStatus {
            pid: pcb.pid.clone(),
            state: pcb.state,
            priority: pcb.priority,
            current_stage: pcb.current_stage.clone(),
            usage: self.resources.get_usage(pid).unwrap_or_default(),
            remaining: self.resources.get_remaining_budget(pid),
            interrupt_pending: pcb.pending_interrupt.is_some(),
            interrupt_kind: pcb.pending_interrupt,
        })
    }

    // =========================================================================
    // Resource accounting entry points
    // =========================================================================

    /// Record an LLM call and return the first exceeded cap, if any.
    pub fn record_llm_call(&mut self, pid: &ProcessId, tokens_in: i64, tokens_out: i64) -> Option<String> {
        self.resources.record_usage(pid, 1, 0, 0, tokens_in, tokens_out);
        self.resources.check_quota(pid)
    }

    pub fn record_tool_call(&mut self, pid: &ProcessId) -> Option<String> {
        self.resources.record_usage(pid, 0, 1, 0, 0, 0);
        self.resources.check_quota(pid)
    }

    pub fn record_agent_hop(&mut self, pid: &ProcessId) -> Option<String> {
        self.resources.record_usage(pid, 0, 0, 1, 0, 0);
        self.resources.check_quota(pid)
    }

    pub fn adjust_quota(&mut self, pid: &ProcessId, adjustments: QuotaAdjustment) -> bool {
        self.resources.adjust_quota(pid, adjustments)
    }

    // =========================================================================
    // Execution core
    // =========================================================================

    /// Run one pass of `pid` through the scheduler and dispatch, handling
    /// whatever condition the handler leaves behind: quota exhaustion, a
    /// pending interrupt, or completion.
    async fn execute(&mut self, pid: &ProcessId) -> Envelope {
        let runnable = match self.lifecycle.next_runnable() {
            Some(pcb) if pcb.pid == pid.as_str() => pcb,
            _ => {
                let mut envelope = self.envelopes.remove(pid.as_str()).unwrap_or_default();
                envelope.terminate("process not runnable");
                self.envelopes.insert(pid.to_string(), envelope.clone());
                return envelope;
            }
        };

        let mut envelope = self.envelopes.remove(pid.as_str()).unwrap_or_default();
        let target_service = runnable.current_service.clone().unwrap_or_else(|| self.default_service.clone());
        let timeout = Duration::from_secs(runnable.quota.hard_timeout_seconds.max(1) as u64);

        envelope = self.dispatcher.dispatch_with_timeout(&mut self.services, &target_service, envelope, timeout).await;

        self.resources.record_envelope_bounds(
            pid,
            envelope.bounds.llm_call_count,
            envelope.bounds.tool_call_count,
            1,
            envelope.bounds.tokens_in,
            envelope.bounds.tokens_out,
        );

        if let Some(reason) = self.resources.check_quota(pid) {
            envelope = self.handle_exhaustion(pid, envelope, reason);
        } else if envelope.interrupts.interrupt_pending {
            let (kind, data) = match &envelope.interrupts.interrupt {
                Some(fi) => (fi.kind, fi.data.clone().unwrap_or_default()),
                None => (InterruptKind::SystemError, HashMap::new()),
            };
            envelope = self.handle_interrupt(pid, envelope, kind, data);
        } else if envelope.bounds.terminated {
            let reason = envelope.bounds.termination_reason.clone().unwrap_or_else(|| "completed".to_string());
            self.lifecycle.terminate(pid, &reason, true);
            self.resources.release(pid);
            self.events.emit_event(KernelEvent::new(
                "process.state_changed",
                Some(pid.to_string()),
                serde_json::json!({ "new_state": "terminated", "reason": reason }),
            ));
        }

        self.envelopes.insert(pid.to_string(), envelope.clone());
        envelope
    }

    fn handle_exhaustion(&mut self, pid: &ProcessId, mut envelope: Envelope, reason: String) -> Envelope {
        let mut identifiers = HashMap::new();
        identifiers.insert("pid".to_string(), pid.to_string());
        let record = self.interrupts.create_interrupt(
            InterruptKind::ResourceExhausted,
            identifiers,
            serde_json::json!({ "reason": reason }),
        );
        self.events.emit_event(KernelEvent::new(
            "resource.exhausted",
            Some(pid.to_string()),
            serde_json::json!({ "reason": reason, "interrupt_id": record.id.to_string() }),
        ));
        envelope.terminate(reason);
        self.lifecycle.terminate(pid, "resource_exhausted", true);
        self.resources.release(pid);
        envelope
    }

    /// The handler signals "I need input" by setting `envelope.interrupts`;
    /// that's the only channel a handler has into the PCB, so this treats it
    /// as the PCB-level pending interrupt the facade must act on.
    fn handle_interrupt(
        &mut self,
        pid: &ProcessId,
        mut envelope: Envelope,
        kind: InterruptKind,
        data: HashMap<String, Value>,
    ) -> Envelope {
        if kind.is_terminal() {
            envelope.terminate(format!("{kind:?}"));
            self.lifecycle.terminate(pid, &format!("{kind:?}"), true);
            self.resources.release(pid);
            self.events.emit_event(KernelEvent::new(
                "process.state_changed",
                Some(pid.to_string()),
                serde_json::json!({ "new_state": "terminated", "reason": format!("{kind:?}") }),
            ));
            return envelope;
        }

        if self.lifecycle.wait(pid, kind).is_err() {
            envelope.terminate("cannot wait: invalid state");
            return envelope;
        }

        self.events.emit_event(KernelEvent::new(
            "process.state_changed",
            Some(pid.to_string()),
            serde_json::json!({ "new_state": "waiting" }),
        ));

        let mut identifiers = HashMap::new();
        identifiers.insert("pid".to_string(), pid.to_string());
        let record: InterruptRecord = self.interrupts.create_interrupt(kind, identifiers, serde_json::json!(data));
        self.events.emit_event(KernelEvent::new(
            "interrupt.raised",
            Some(pid.to_string()),
            serde_json::json!({ "kind": format!("{kind:?}"), "interrupt_id": record.id.to_string() }),
        ));

        if let Some(fi) = &mut envelope.interrupts.interrupt {
            fi.id = record.id.to_string();
        } else {
            envelope.set_interrupt(FlowInterrupt::new(kind));
            if let Some(fi) = &mut envelope.interrupts.interrupt {
                fi.id = record.id.to_string();
            }
        }
        envelope
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

fn typed_identity(identity: &crate::envelope::Identity) -> Result<(ProcessId, RequestId, UserId, SessionId)> {
    Ok((
        ProcessId::from_string(identity.envelope_id.clone()).map_err(Error::validation)?,
        RequestId::from_string(identity.request_id.clone()).map_err(Error::validation)?,
        UserId::from_string(identity.user_id.clone()).map_err(Error::validation)?,
        SessionId::from_string(identity.session_id.clone()).map_err(Error::validation)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope_with_input(text: &str) -> Envelope {
        let mut e = Envelope::new();
        e.raw_input = text.to_string();
        e
    }

    fn kernel_with_echo_service() -> Kernel {
        let mut kernel = Kernel::new();
        kernel.register_service(ServiceInfo::new("default".to_string(), services::SERVICE_TYPE_FLOW.to_string()));
        kernel.register_handler(
            "default",
            Arc::new(|mut e: Envelope| {
                Box::pin(async move {
                    e.terminate("completed");
                    Ok(e)
                })
            }),
        );
        kernel
    }

    #[tokio::test]
    async fn submit_request_runs_to_completion() {
        let mut kernel = kernel_with_echo_service();
        let result = kernel
            .submit_request(envelope_with_input("hi"), SchedulingPriority::Normal, None)
            .await;
        assert!(result.bounds.terminated);
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn submit_request_with_empty_input_is_rejected_before_scheduling() {
        let mut kernel = kernel_with_echo_service();
        let result = kernel.submit_request(Envelope::new(), SchedulingPriority::Normal, None).await;
        assert!(result.bounds.terminated);
        assert!(result.bounds.termination_reason.unwrap().contains("raw_input"));
    }

    #[tokio::test]
    async fn submit_request_interrupt_then_resume_completes() {
        let mut kernel = Kernel::new();
        kernel.register_service(ServiceInfo::new("default".to_string(), services::SERVICE_TYPE_FLOW.to_string()));
        kernel.register_handler(
            "default",
            Arc::new(|mut e: Envelope| {
                Box::pin(async move {
                    if !e.interrupts.interrupt_pending && e.audit.processing_history.is_empty() {
                        e.set_interrupt(FlowInterrupt::new(InterruptKind::Clarification).with_question("ok?".to_string()));
                        e.add_processing_record(crate::envelope::ProcessingRecord {
                            agent: "default".to_string(),
                            stage_order: 0,
                            started_at: chrono::Utc::now(),
                            completed_at: None,
                            duration_ms: 0,
                            status: "running".to_string(),
                            error: None,
                            llm_calls: 0,
                        });
                    } else {
                        e.clear_interrupt();
                        e.terminate("completed");
                    }
                    Ok(e)
                })
            }),
        );

        let envelope = envelope_with_input("hi");
        let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();
        let result = kernel.submit_request(envelope, SchedulingPriority::Normal, None).await;
        assert!(!result.bounds.terminated);
        assert!(result.interrupts.interrupt_pending);

        let interrupt_id = InterruptId::from_string(result.interrupts.interrupt.unwrap().id).unwrap();
        let resumed = kernel
            .resume_request(&pid, &interrupt_id, serde_json::json!({"a": "yes"}), "user-1")
            .await
            .unwrap();
        assert!(resumed.bounds.terminated);
    }

    #[tokio::test]
    async fn resume_does_not_double_count_usage_already_seen_before_the_interrupt() {
        let mut kernel = Kernel::new();
        kernel.register_service(ServiceInfo::new("default".to_string(), services::SERVICE_TYPE_FLOW.to_string()));
        kernel.register_handler(
            "default",
            Arc::new(|mut e: Envelope| {
                Box::pin(async move {
                    if e.audit.processing_history.is_empty() {
                        e.increment_llm_calls(2);
                        e.add_processing_record(crate::envelope::ProcessingRecord {
                            agent: "default".to_string(),
                            stage_order: 0,
                            started_at: chrono::Utc::now(),
                            completed_at: None,
                            duration_ms: 0,
                            status: "running".to_string(),
                            error: None,
                            llm_calls: 0,
                        });
                    } else {
                        // The handler re-reports the same cumulative count it
                        // reported before suspending, plus one more call.
                        e.increment_llm_calls(1);
                    }
                    e.set_interrupt(FlowInterrupt::new(InterruptKind::Clarification).with_question("ok?".to_string()));
                    Ok(e)
                })
            }),
        );

        let envelope = envelope_with_input("hi");
        let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();
        let suspended = kernel.submit_request(envelope, SchedulingPriority::Normal, None).await;
        assert_eq!(suspended.bounds.llm_call_count, 2);
        assert_eq!(kernel.resources.get_usage(&pid).unwrap().llm_calls, 2);

        let interrupt_id = InterruptId::from_string(suspended.interrupts.interrupt.unwrap().id).unwrap();
        let resumed = kernel
            .resume_request(&pid, &interrupt_id, serde_json::json!({"a": "yes"}), "user-1")
            .await
            .unwrap();

        assert_eq!(resumed.bounds.llm_call_count, 3);
        assert_eq!(kernel.resources.get_usage(&pid).unwrap().llm_calls, 3);
    }

    #[tokio::test]
    async fn cancel_request_releases_resources_and_terminates() {
        let mut kernel = Kernel::new();
        kernel.register_service(ServiceInfo::new("slow".to_string(), services::SERVICE_TYPE_FLOW.to_string()));
        kernel.register_handler(
            "slow",
            Arc::new(|e: Envelope| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(e)
                })
            }),
        );

        let mut envelope = envelope_with_input("hi");
        envelope.pipeline.current_stage = "slow".to_string();
        let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();
        kernel.lifecycle.submit(
            pid.clone(),
            RequestId::new(),
            UserId::from_string("u1".to_string()).unwrap(),
            SessionId::new(),
            SchedulingPriority::Normal,
            None,
        ).unwrap();
        kernel.resources.allocate(pid.clone(), ResourceQuota::default_quota());
        kernel.lifecycle.schedule(&pid);
        kernel.lifecycle.next_runnable();

        assert!(kernel.cancel_request(&pid, "user requested cancel"));
        assert!(!kernel.resources.is_tracked(&pid));
        assert_eq!(kernel.get_request_status(&pid).unwrap().state, ProcessState::Terminated);
    }

    #[tokio::test]
    async fn rate_limited_submission_is_rejected() {
        let mut kernel = kernel_with_echo_service();
        kernel.rate_limiter.set_default_config(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_hour: 0,
            requests_per_day: 0,
            bucket_count: 10,
        });
        kernel.rate_limiter.set_endpoint_limits(
            "submit_request",
            RateLimitConfig { requests_per_minute: 1, requests_per_hour: 100, requests_per_day: 100, bucket_count: 10 },
        );

        let first = kernel.submit_request(envelope_with_input("one"), SchedulingPriority::Normal, None).await;
        assert!(first.bounds.terminated);
        assert_eq!(first.bounds.termination_reason.as_deref(), Some("completed"));

        let second = kernel.submit_request(envelope_with_input("two"), SchedulingPriority::Normal, None).await;
        assert!(second.bounds.termination_reason.unwrap().contains("rate limit"));
    }

    #[tokio::test]
    async fn resource_exhaustion_raises_interrupt_and_terminates() {
        let mut kernel = Kernel::new();
        kernel.register_service(ServiceInfo::new("default".to_string(), services::SERVICE_TYPE_FLOW.to_string()));
        kernel.register_handler(
            "default",
            Arc::new(|mut e: Envelope| {
                Box::pin(async move {
                    e.bounds.llm_call_count = 1000;
                    Ok(e)
                })
            }),
        );

        let result = kernel
            .submit_request(
                envelope_with_input("hi"),
                SchedulingPriority::Normal,
                Some(ResourceQuota { max_llm_calls: 1, ..ResourceQuota::default_quota() }),
            )
            .await;
        assert!(result.bounds.terminated);
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("max_llm_calls_exceeded"));
    }
}
