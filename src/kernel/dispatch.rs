//! Dispatcher — resolves a service, applies timeout/retry, tracks load.
//!
//! Split from `kernel::services`, which owns registration and discovery.
//! Dispatch is inherently serialized per PCB: a PCB is RUNNING in at most
//! one dispatch at a time, so no per-dispatch locking is needed here beyond
//! what the registry itself provides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::services::ServiceRegistry;
use crate::envelope::Envelope;
use crate::types::Result;

const DEFAULT_MAX_RETRIES: u32 = 2;

/// A local handler: an async function mapping an envelope to an envelope.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<Envelope>> + Send + Sync>;

/// Remote transport adapter, used when no local handler is registered.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn dispatch(&self, service: &str, envelope: Envelope, timeout: Duration) -> Result<Envelope>;
}

enum Attempt {
    Ok(Envelope),
    Timeout(Envelope),
    Failed(Envelope, String),
}

/// Dispatcher — routes envelopes to local handlers or a remote transport.
///
/// NOT a separate actor: owned by `Kernel` and called via `&self`/`&mut
/// self` on the service registry it's handed.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    remote: Option<Arc<dyn RemoteTransport>>,
    max_retries: u32,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("has_remote", &self.remote.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(remote: Option<Arc<dyn RemoteTransport>>) -> Self {
        Self {
            handlers: HashMap::new(),
            remote,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn register_handler(&mut self, service_name: &str, handler: Handler) {
        self.handlers.insert(service_name.to_string(), handler);
    }

    pub fn unregister_handler(&mut self, service_name: &str) -> bool {
        self.handlers.remove(service_name).is_some()
    }

    /// Dispatch an envelope to `service_name`. Always returns an envelope:
    /// on any failure the envelope is terminated with a descriptive reason
    /// rather than propagated as an error, matching the facade's contract
    /// that dispatch never raises.
    pub async fn dispatch(&self, registry: &mut ServiceRegistry, service_name: &str, envelope: Envelope) -> Envelope {
        self.dispatch_attempt(registry, service_name, envelope, 0, None).await
    }

    /// Dispatch with an explicit timeout, overriding the service's own
    /// `timeout_seconds` — used by the kernel facade to derive the per-call
    /// timeout from a process's quota instead of the service default.
    pub async fn dispatch_with_timeout(
        &self,
        registry: &mut ServiceRegistry,
        service_name: &str,
        envelope: Envelope,
        timeout_override: Duration,
    ) -> Envelope {
        self.dispatch_attempt(registry, service_name, envelope, 0, Some(timeout_override)).await
    }

    fn dispatch_attempt<'a>(
        &'a self,
        registry: &'a mut ServiceRegistry,
        service_name: &'a str,
        mut envelope: Envelope,
        retry_count: u32,
        timeout_override: Option<Duration>,
    ) -> BoxFuture<'a, Envelope> {
        Box::pin(async move {
            let Some(info) = registry.get_service(service_name) else {
                envelope.terminate(format!("Unknown service: {service_name}"));
                return envelope;
            };
            if !info.is_healthy() {
                envelope.terminate("Service unhealthy");
                return envelope;
            }

            registry.increment_load(service_name);
            let attempt = self.run_once(&info, service_name, envelope, timeout_override).await;
            registry.decrement_load(service_name);
            registry.record_dispatch_outcome(service_name, matches!(attempt, Attempt::Ok(_)));

            match attempt {
                Attempt::Ok(envelope) => envelope,
                Attempt::Timeout(envelope) | Attempt::Failed(envelope, _) if retry_count < self.max_retries => {
                    self.dispatch_attempt(registry, service_name, envelope, retry_count + 1, timeout_override).await
                }
                Attempt::Timeout(mut envelope) => {
                    envelope.terminate("Dispatch timeout");
                    envelope
                }
                Attempt::Failed(mut envelope, message) => {
                    envelope.terminate(format!("Dispatch error: {message}"));
                    envelope
                }
            }
        })
    }

    async fn run_once(
        &self,
        info: &super::services::ServiceInfo,
        service_name: &str,
        envelope: Envelope,
        timeout_override: Option<Duration>,
    ) -> Attempt {
        let timeout = timeout_override.unwrap_or_else(|| Duration::from_secs(info.timeout_seconds));

        if let Some(handler) = self.handlers.get(service_name) {
            match tokio::time::timeout(timeout, handler(envelope.clone())).await {
                Ok(Ok(result)) => Attempt::Ok(result),
                Ok(Err(e)) => Attempt::Failed(envelope, e.to_string()),
                Err(_) => Attempt::Timeout(envelope),
            }
        } else if let Some(remote) = &self.remote {
            match remote.dispatch(service_name, envelope.clone(), timeout).await {
                Ok(result) => Attempt::Ok(result),
                Err(e) => Attempt::Failed(envelope, e.to_string()),
            }
        } else {
            Attempt::Failed(envelope, format!("No handler for service: {service_name}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::services::{ServiceInfo, ServiceStatus, SERVICE_TYPE_FLOW};
    use crate::types::Error;

    fn registry_with(name: &str, timeout_seconds: u64) -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        let mut info = ServiceInfo::new(name.to_string(), SERVICE_TYPE_FLOW.to_string());
        info.timeout_seconds = timeout_seconds;
        registry.register_service(info);
        registry
    }

    #[tokio::test]
    async fn dispatch_unknown_service_terminates_envelope() {
        let mut registry = ServiceRegistry::new();
        let dispatcher = Dispatcher::new(None);
        let result = dispatcher.dispatch(&mut registry, "ghost", Envelope::new()).await;
        assert!(result.bounds.terminated);
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("Unknown service: ghost"));
    }

    #[tokio::test]
    async fn dispatch_unhealthy_service_terminates_envelope() {
        let mut registry = registry_with("svc", 5);
        registry.update_health("svc", ServiceStatus::Unhealthy);
        let dispatcher = Dispatcher::new(None);
        let result = dispatcher.dispatch(&mut registry, "svc", Envelope::new()).await;
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("Service unhealthy"));
    }

    #[tokio::test]
    async fn dispatch_with_no_handler_and_no_remote_terminates_after_retries() {
        let mut registry = registry_with("svc", 5);
        let dispatcher = Dispatcher::new(None).with_max_retries(0);
        let result = dispatcher.dispatch(&mut registry, "svc", Envelope::new()).await;
        assert!(result.bounds.terminated);
        assert!(result.bounds.termination_reason.unwrap().contains("No handler for service"));
        assert_eq!(registry.get_load("svc"), 0);
    }

    #[tokio::test]
    async fn dispatch_calls_registered_handler() {
        let mut registry = registry_with("svc", 5);
        let mut dispatcher = Dispatcher::new(None);
        dispatcher.register_handler(
            "svc",
            Arc::new(|mut e: Envelope| {
                Box::pin(async move {
                    e.terminate("done");
                    Ok(e)
                })
            }),
        );

        let result = dispatcher.dispatch(&mut registry, "svc", Envelope::new()).await;
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("done"));
        assert_eq!(registry.get_load("svc"), 0);
    }

    #[tokio::test]
    async fn dispatch_retries_then_terminates_on_persistent_handler_error() {
        let mut registry = registry_with("svc", 5);
        let mut dispatcher = Dispatcher::new(None).with_max_retries(2);
        dispatcher.register_handler(
            "svc",
            Arc::new(|_: Envelope| Box::pin(async move { Err(Error::internal("boom")) })),
        );

        let result = dispatcher.dispatch(&mut registry, "svc", Envelope::new()).await;
        assert!(result.bounds.termination_reason.unwrap().contains("Dispatch error"));
        assert_eq!(registry.get_load("svc"), 0);
    }

    #[tokio::test]
    async fn dispatch_times_out_slow_handler() {
        let mut registry = registry_with("svc", 0);
        let mut dispatcher = Dispatcher::new(None).with_max_retries(0);
        dispatcher.register_handler(
            "svc",
            Arc::new(|e: Envelope| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(e)
                })
            }),
        );

        let result = dispatcher.dispatch(&mut registry, "svc", Envelope::new()).await;
        assert_eq!(result.bounds.termination_reason.as_deref(), Some("Dispatch timeout"));
    }
}
