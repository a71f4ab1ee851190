//! Service registry — named dispatch targets with load and health tracking.
//!
//! Registration/discovery lives here; `kernel::dispatch` owns the actual
//! timeout/retry mechanics but reports each attempt's outcome back into
//! this registry so a flaky service degrades automatically instead of
//! staying marked healthy until an operator notices.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SERVICE_TYPE_FLOW: &str = "flow";
pub const SERVICE_TYPE_WORKER: &str = "worker";
pub const SERVICE_TYPE_INFERENCE: &str = "inference";

/// Health as observed by the registry, either set directly by an operator
/// or inferred from a run of dispatch outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// A registered dispatch target: a logical name the kernel routes envelopes
/// to, plus the capacity and health bookkeeping the dispatcher reads before
/// every attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: String,
    pub version: String,
    pub capabilities: Vec<String>,

    pub max_concurrent: i32,
    pub current_load: i32,
    pub timeout_seconds: u64,

    pub status: ServiceStatus,
    pub last_health_check: DateTime<Utc>,

    /// Consecutive dispatch failures (timeout or handler error) since the
    /// last success or manual health reset. Drives automatic degradation.
    pub consecutive_failures: u32,
    /// Failures in a row before the registry marks the service `Degraded`.
    pub degrade_after: u32,
    /// Failures in a row before the registry marks the service `Unhealthy`
    /// and the dispatcher stops sending it new work.
    pub unhealthy_after: u32,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceInfo {
    pub fn new(name: String, service_type: String) -> Self {
        Self {
            name,
            service_type,
            version: "1.0.0".to_string(),
            capabilities: Vec::new(),
            max_concurrent: 10,
            current_load: 0,
            timeout_seconds: 30,
            status: ServiceStatus::Healthy,
            last_health_check: Utc::now(),
            consecutive_failures: 0,
            degrade_after: 3,
            unhealthy_after: 5,
            metadata: HashMap::new(),
        }
    }

    pub fn can_accept(&self) -> bool {
        self.is_healthy() && self.current_load < self.max_concurrent
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, ServiceStatus::Healthy | ServiceStatus::Degraded)
    }

    /// Fold a dispatch outcome into the failure streak and recompute status
    /// from it. A success clears the streak outright; a failure advances it
    /// and only ever moves status toward worse, never better — recovery
    /// requires an actual success, not the streak falling idle.
    fn record_outcome(&mut self, succeeded: bool) {
        if succeeded {
            self.consecutive_failures = 0;
            if matches!(self.status, ServiceStatus::Degraded | ServiceStatus::Unhealthy) {
                self.status = ServiceStatus::Healthy;
            }
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.unhealthy_after {
                self.status = ServiceStatus::Unhealthy;
            } else if self.consecutive_failures >= self.degrade_after {
                self.status = ServiceStatus::Degraded;
            }
        }
        self.last_health_check = Utc::now();
    }
}

/// Service Registry — owned by `Kernel`, mutated via `&mut self`.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceInfo>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self { services: HashMap::new() }
    }

    pub fn register_service(&mut self, info: ServiceInfo) -> bool {
        if self.services.contains_key(&info.name) {
            return false;
        }
        self.services.insert(info.name.clone(), info);
        true
    }

    pub fn unregister_service(&mut self, service_name: &str) -> bool {
        self.services.remove(service_name).is_some()
    }

    pub fn get_service(&self, service_name: &str) -> Option<ServiceInfo> {
        self.services.get(service_name).cloned()
    }

    pub fn list_services(&self, service_type: Option<&str>, healthy_only: bool) -> Vec<ServiceInfo> {
        self.services
            .values()
            .filter(|svc| service_type.map(|t| svc.service_type == t).unwrap_or(true))
            .filter(|svc| !healthy_only || svc.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get_service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn has_service(&self, service_name: &str) -> bool {
        self.services.contains_key(service_name)
    }

    pub fn increment_load(&mut self, service_name: &str) -> bool {
        match self.services.get_mut(service_name) {
            Some(service) => {
                service.current_load += 1;
                true
            }
            None => false,
        }
    }

    pub fn decrement_load(&mut self, service_name: &str) -> bool {
        match self.services.get_mut(service_name) {
            Some(service) => {
                service.current_load = (service.current_load - 1).max(0);
                true
            }
            None => false,
        }
    }

    pub fn get_load(&self, service_name: &str) -> i32 {
        self.services.get(service_name).map(|s| s.current_load).unwrap_or(0)
    }

    /// Manual health override — an operator or health-probe task setting
    /// status directly, independent of the dispatch-outcome feedback loop.
    /// Also resets the failure streak so the service gets a clean slate.
    pub fn update_health(&mut self, service_name: &str, status: ServiceStatus) -> bool {
        match self.services.get_mut(service_name) {
            Some(service) => {
                service.status = status;
                service.consecutive_failures = 0;
                service.last_health_check = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Feed a completed dispatch attempt back into the target's health.
    /// This is what lets `kernel::dispatch` degrade a service automatically
    /// after a run of timeouts or handler failures, instead of leaving it
    /// `Healthy` until something else notices. Returns the service's status
    /// after folding in this outcome, or `None` if it isn't registered.
    pub fn record_dispatch_outcome(&mut self, service_name: &str, succeeded: bool) -> Option<ServiceStatus> {
        let service = self.services.get_mut(service_name)?;
        let before = service.status;
        service.record_outcome(succeeded);
        if service.status != before {
            tracing::warn!(
                service = service_name,
                from = ?before,
                to = ?service.status,
                consecutive_failures = service.consecutive_failures,
                "service_health_transition"
            );
        }
        Some(service.status)
    }

    pub fn get_healthy_count(&self) -> usize {
        self.services.values().filter(|s| s.is_healthy()).count()
    }

    pub fn get_service_stats(&self, service_name: &str) -> Option<ServiceStats> {
        self.services.get(service_name).map(|svc| ServiceStats {
            name: svc.name.clone(),
            service_type: svc.service_type.clone(),
            status: svc.status,
            current_load: svc.current_load,
            max_concurrent: svc.max_concurrent,
            utilization: if svc.max_concurrent > 0 {
                svc.current_load as f64 / svc.max_concurrent as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        stats.total_services = self.services.len();

        for svc in self.services.values() {
            match svc.status {
                ServiceStatus::Healthy => stats.healthy_services += 1,
                ServiceStatus::Degraded => stats.degraded_services += 1,
                ServiceStatus::Unhealthy => stats.unhealthy_services += 1,
                ServiceStatus::Unknown => {}
            }
            stats.total_load += svc.current_load as usize;
            stats.total_capacity += svc.max_concurrent as usize;
            *stats.services_by_type.entry(svc.service_type.clone()).or_insert(0) += 1;
        }

        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    pub current_load: i32,
    pub max_concurrent: i32,
    pub utilization: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub unhealthy_services: usize,
    pub total_load: usize,
    pub total_capacity: usize,
    pub services_by_type: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(registry: &mut ServiceRegistry, name: &str, service_type: &str) {
        registry.register_service(ServiceInfo::new(name.to_string(), service_type.to_string()));
    }

    #[test]
    fn register_service_rejects_duplicate_name() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flow", SERVICE_TYPE_FLOW);
        assert!(registry.get_service("flow").is_some());
        assert!(!registry.register_service(ServiceInfo::new("flow".to_string(), SERVICE_TYPE_FLOW.to_string())));
    }

    #[test]
    fn unregister_service_is_one_shot() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flow", SERVICE_TYPE_FLOW);
        assert!(registry.unregister_service("flow"));
        assert!(!registry.has_service("flow"));
        assert!(!registry.unregister_service("flow"));
    }

    #[test]
    fn list_services_filters_by_type_and_health() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flow1", SERVICE_TYPE_FLOW);
        registered(&mut registry, "flow2", SERVICE_TYPE_FLOW);
        registered(&mut registry, "worker1", SERVICE_TYPE_WORKER);
        registry.update_health("flow2", ServiceStatus::Unhealthy);

        assert_eq!(registry.list_services(None, false).len(), 3);
        assert_eq!(registry.list_services(Some(SERVICE_TYPE_FLOW), false).len(), 2);
        assert_eq!(registry.list_services(None, true).len(), 2);

        let healthy_flows = registry.list_services(Some(SERVICE_TYPE_FLOW), true);
        assert_eq!(healthy_flows.len(), 1);
        assert_eq!(healthy_flows[0].name, "flow1");
    }

    #[test]
    fn load_accounting_saturates_at_zero() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "worker1", SERVICE_TYPE_WORKER);

        assert!(registry.increment_load("worker1"));
        registry.increment_load("worker1");
        assert_eq!(registry.get_load("worker1"), 2);

        registry.decrement_load("worker1");
        registry.decrement_load("worker1");
        registry.decrement_load("worker1");
        assert_eq!(registry.get_load("worker1"), 0);

        assert!(!registry.increment_load("nonexistent"));
    }

    #[test]
    fn record_dispatch_outcome_degrades_then_marks_unhealthy_after_repeated_failures() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flaky", SERVICE_TYPE_FLOW);
        {
            let svc = registry.services.get_mut("flaky").unwrap();
            svc.degrade_after = 2;
            svc.unhealthy_after = 3;
        }

        assert_eq!(registry.record_dispatch_outcome("flaky", false), Some(ServiceStatus::Healthy));
        assert_eq!(registry.record_dispatch_outcome("flaky", false), Some(ServiceStatus::Degraded));
        assert_eq!(registry.record_dispatch_outcome("flaky", false), Some(ServiceStatus::Unhealthy));

        assert!(!registry.get_service("flaky").unwrap().can_accept());
    }

    #[test]
    fn record_dispatch_outcome_recovers_to_healthy_on_success() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flaky", SERVICE_TYPE_FLOW);
        {
            let svc = registry.services.get_mut("flaky").unwrap();
            svc.degrade_after = 1;
        }

        registry.record_dispatch_outcome("flaky", false);
        assert_eq!(registry.get_service("flaky").unwrap().status, ServiceStatus::Degraded);

        assert_eq!(registry.record_dispatch_outcome("flaky", true), Some(ServiceStatus::Healthy));
        assert_eq!(registry.get_service("flaky").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn update_health_is_a_manual_override_that_resets_the_streak() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "worker1", SERVICE_TYPE_WORKER);
        registry.record_dispatch_outcome("worker1", false);

        assert!(registry.update_health("worker1", ServiceStatus::Degraded));
        let svc = registry.get_service("worker1").unwrap();
        assert_eq!(svc.status, ServiceStatus::Degraded);
        assert_eq!(svc.consecutive_failures, 0);

        assert!(!registry.update_health("nonexistent", ServiceStatus::Healthy));
    }

    #[test]
    fn registry_stats_aggregate_across_services() {
        let mut registry = ServiceRegistry::new();
        registered(&mut registry, "flow1", SERVICE_TYPE_FLOW);
        let mut flow2 = ServiceInfo::new("flow2".to_string(), SERVICE_TYPE_FLOW.to_string());
        flow2.current_load = 3;
        flow2.max_concurrent = 5;
        registry.register_service(flow2);
        registry.update_health("flow2", ServiceStatus::Degraded);

        let mut worker1 = ServiceInfo::new("worker1".to_string(), SERVICE_TYPE_WORKER.to_string());
        worker1.current_load = 2;
        worker1.max_concurrent = 10;
        registry.register_service(worker1);

        let stats = registry.get_stats();
        assert_eq!(stats.total_services, 3);
        assert_eq!(stats.healthy_services, 2);
        assert_eq!(stats.degraded_services, 1);
        assert_eq!(stats.total_load, 5);
        assert_eq!(stats.total_capacity, 25);
        assert_eq!(stats.services_by_type.get(SERVICE_TYPE_FLOW), Some(&2));

        let flow2_stats = registry.get_service_stats("flow2").unwrap();
        assert_eq!(flow2_stats.utilization, 60.0);
    }

    #[test]
    fn can_accept_requires_healthy_and_under_capacity() {
        let mut service = ServiceInfo::new("test".to_string(), SERVICE_TYPE_FLOW.to_string());
        service.max_concurrent = 5;
        service.current_load = 5;
        assert!(!service.can_accept());

        service.current_load = 3;
        assert!(service.can_accept());

        service.status = ServiceStatus::Unhealthy;
        assert!(!service.can_accept());

        service.status = ServiceStatus::Degraded;
        assert!(service.can_accept());
    }
}
