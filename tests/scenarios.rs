//! End-to-end scenarios against the public `Kernel` facade, using an
//! in-memory local service handler in place of a real agent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use control_tower_kernel::envelope::{Envelope, FlowInterrupt, InterruptKind, ProcessingRecord};
use control_tower_kernel::kernel::events::KernelEvent;
use control_tower_kernel::kernel::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
use control_tower_kernel::kernel::services::{ServiceInfo, SERVICE_TYPE_FLOW};
use control_tower_kernel::kernel::types::{ProcessState, ResourceQuota, SchedulingPriority};
use control_tower_kernel::kernel::Kernel;
use control_tower_kernel::types::{InterruptId, ProcessId};

fn envelope_with_input(text: &str) -> Envelope {
    let mut e = Envelope::new();
    e.raw_input = text.to_string();
    e
}

fn record_event_types(kernel: &mut Kernel) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    kernel.subscribe(
        "*",
        Arc::new(move |event: &KernelEvent| sink.lock().unwrap().push(event.event_type.clone())),
    );
    seen
}

// Scenario A — happy path, single request.
#[tokio::test]
async fn scenario_a_happy_path_single_request() {
    let mut kernel = Kernel::new();
    kernel.register_service(ServiceInfo::new("default".to_string(), SERVICE_TYPE_FLOW.to_string()));
    kernel.register_handler(
        "default",
        Arc::new(|mut e: Envelope| {
            Box::pin(async move {
                e.increment_llm_calls(1);
                e.increment_agent_hops();
                e.terminate("completed");
                Ok(e)
            })
        }),
    );
    let seen = record_event_types(&mut kernel);

    let quota = ResourceQuota { max_llm_calls: 5, max_agent_hops: 5, ..ResourceQuota::default_quota() };
    let envelope = envelope_with_input("hello");
    let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();

    let result = kernel.submit_request(envelope, SchedulingPriority::Normal, Some(quota)).await;

    assert!(result.bounds.terminated);
    assert_eq!(result.bounds.llm_call_count, 1);

    let status = kernel.get_request_status(&pid).unwrap();
    assert_eq!(status.state, ProcessState::Terminated);
    assert_eq!(status.usage.llm_calls, 1);
    assert_eq!(status.usage.agent_hops, 1);

    let events = seen.lock().unwrap();
    assert!(events.contains(&"process.created".to_string()));
    assert!(events.iter().filter(|e| *e == "process.state_changed").count() >= 1);
}

// Scenario B — quota exhaustion.
#[tokio::test]
async fn scenario_b_quota_exhaustion_raises_interrupt_and_terminates() {
    let mut kernel = Kernel::new();
    kernel.register_service(ServiceInfo::new("default".to_string(), SERVICE_TYPE_FLOW.to_string()));
    kernel.register_handler(
        "default",
        Arc::new(|mut e: Envelope| {
            Box::pin(async move {
                e.increment_llm_calls(2);
                Ok(e)
            })
        }),
    );
    let seen = record_event_types(&mut kernel);

    let quota = ResourceQuota { max_llm_calls: 1, max_agent_hops: 1, ..ResourceQuota::default_quota() };
    let result = kernel.submit_request(envelope_with_input("hello"), SchedulingPriority::Normal, Some(quota)).await;

    assert!(result.bounds.terminated);
    assert_eq!(result.bounds.termination_reason.as_deref(), Some("max_llm_calls_exceeded"));

    let events = seen.lock().unwrap();
    assert!(events.contains(&"resource.exhausted".to_string()));
}

// Scenario C — clarification interrupt, then resume.
#[tokio::test]
async fn scenario_c_clarification_then_resume_completes() {
    let mut kernel = Kernel::new();
    kernel.register_service(ServiceInfo::new("default".to_string(), SERVICE_TYPE_FLOW.to_string()));
    kernel.register_handler(
        "default",
        Arc::new(|mut e: Envelope| {
            Box::pin(async move {
                if e.audit.processing_history.is_empty() {
                    e.set_interrupt(FlowInterrupt::new(InterruptKind::Clarification).with_question("which file?".to_string()));
                    e.add_processing_record(ProcessingRecord {
                        agent: "default".to_string(),
                        stage_order: 0,
                        started_at: chrono::Utc::now(),
                        completed_at: None,
                        duration_ms: 0,
                        status: "waiting".to_string(),
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
    let seen = record_event_types(&mut kernel);

    let envelope = envelope_with_input("hello");
    let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();

    let suspended = kernel.submit_request(envelope, SchedulingPriority::Normal, None).await;
    assert!(!suspended.bounds.terminated);
    assert!(suspended.interrupts.interrupt_pending);
    assert_eq!(kernel.get_request_status(&pid).unwrap().state, ProcessState::Waiting);

    {
        let events = seen.lock().unwrap();
        assert!(events.contains(&"interrupt.raised".to_string()));
    }

    let interrupt_id = InterruptId::from_string(suspended.interrupts.interrupt.unwrap().id).unwrap();
    let resumed = kernel
        .resume_request(&pid, &interrupt_id, serde_json::json!({"text": "main.py"}), "user-1")
        .await
        .unwrap();

    assert!(resumed.bounds.terminated);
    assert_eq!(resumed.bounds.termination_reason.as_deref(), Some("completed"));
    assert_eq!(kernel.get_request_status(&pid).unwrap().state, ProcessState::Terminated);
}

// Scenario D — dispatch timeout with retry.
#[tokio::test]
async fn scenario_d_dispatch_timeout_retries_then_completes() {
    let mut kernel = Kernel::new();
    kernel.register_service(ServiceInfo::new("default".to_string(), SERVICE_TYPE_FLOW.to_string()));

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    kernel.register_handler(
        "default",
        Arc::new(move |mut e: Envelope| {
            let calls = handler_calls.clone();
            Box::pin(async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_millis(1_200)).await;
                } else {
                    e.terminate("completed");
                }
                Ok(e)
            })
        }),
    );

    // hard_timeout_seconds rounds to whole seconds at the facade boundary,
    // so the slow first attempt (1.2s) blows the 1s timeout and the
    // dispatcher's default retry budget picks up the fast second attempt.
    let quota = ResourceQuota { hard_timeout_seconds: 1, ..ResourceQuota::default_quota() };
    let result = kernel.submit_request(envelope_with_input("hello"), SchedulingPriority::Normal, Some(quota)).await;

    assert!(result.bounds.terminated);
    assert_eq!(result.bounds.termination_reason.as_deref(), Some("completed"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// Scenario E — rate-limit sliding behavior.
#[test]
fn scenario_e_rate_limit_sliding_window_boundary() {
    let mut limiter = RateLimiter::new(Some(RateLimitConfig {
        requests_per_minute: 3,
        requests_per_hour: 1000,
        requests_per_day: 10000,
        bucket_count: 6,
    }));

    for _ in 0..3 {
        assert!(limiter.check_rate_limit("u1", "submit_request", true).is_allowed());
    }

    match limiter.check_rate_limit("u1", "submit_request", true) {
        RateLimitResult::Exceeded { window, current, limit, retry_after_seconds } => {
            assert_eq!(window, "minute");
            assert_eq!(current, 3);
            assert_eq!(limit, 3);
            assert!(retry_after_seconds > 0.0 && retry_after_seconds <= 60.0);
        }
        other => panic!("expected exceeded, got {other:?}"),
    }
}

// Scenario F — cancellation during RUNNING.
#[tokio::test]
async fn scenario_f_cancel_during_running_terminates_and_releases() {
    let mut kernel = Kernel::new();
    kernel.register_service(ServiceInfo::new("slow".to_string(), SERVICE_TYPE_FLOW.to_string()));
    kernel.register_handler(
        "slow",
        Arc::new(|e: Envelope| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(e)
            })
        }),
    );

    let mut envelope = envelope_with_input("hello");
    envelope.pipeline.current_stage = "slow".to_string();
    let pid = ProcessId::from_string(envelope.identity.envelope_id.clone()).unwrap();

    // submit_request would block on the handler's sleep, so drive admission
    // directly through the same steps the facade takes, mirroring the unit
    // test `cancel_request_releases_resources_and_terminates` in kernel::mod.
    kernel
        .lifecycle
        .submit(
            pid.clone(),
            control_tower_kernel::types::RequestId::new(),
            control_tower_kernel::types::UserId::from_string("u1".to_string()).unwrap(),
            control_tower_kernel::types::SessionId::new(),
            SchedulingPriority::Normal,
            None,
        )
        .unwrap();
    kernel.resources.allocate(pid.clone(), ResourceQuota::default_quota());
    kernel.lifecycle.schedule(&pid);
    kernel.lifecycle.next_runnable();
    assert_eq!(kernel.get_request_status(&pid).unwrap().state, ProcessState::Running);

    let seen = record_event_types(&mut kernel);
    assert!(kernel.cancel_request(&pid, "user requested cancel"));

    assert!(!kernel.resources.is_tracked(&pid));
    assert_eq!(kernel.get_request_status(&pid).unwrap().state, ProcessState::Terminated);

    let events = seen.lock().unwrap();
    assert!(events.contains(&"process.cancelled".to_string()));
}
