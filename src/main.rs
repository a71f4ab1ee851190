//! Control tower demo binary — submits a handful of requests through a
//! locally-configured `Kernel` and prints their outcomes. Exercises the
//! facade end to end without any network surface.

use std::sync::Arc;

use control_tower_kernel::envelope::Envelope;
use control_tower_kernel::kernel::services::{ServiceInfo, SERVICE_TYPE_FLOW};
use control_tower_kernel::kernel::types::SchedulingPriority;
use control_tower_kernel::kernel::Kernel;
use control_tower_kernel::Config;

#[tokio::main]
async fn main() {
    control_tower_kernel::observability::init_tracing();

    let config = Config::default();
    let mut kernel = Kernel::with_config(&config);
    kernel.register_service(ServiceInfo::new(
        config.defaults.default_service.clone(),
        SERVICE_TYPE_FLOW.to_string(),
    ));
    kernel.register_handler(
        &config.defaults.default_service,
        Arc::new(|mut envelope: Envelope| {
            Box::pin(async move {
                envelope.increment_llm_calls(1);
                envelope.terminate("completed");
                Ok(envelope)
            })
        }),
    );

    let mut envelope = Envelope::new();
    envelope.raw_input = "hello control tower".to_string();

    tracing::info!(pid = %envelope.identity.envelope_id, "submitting request");
    let result = kernel.submit_request(envelope, SchedulingPriority::Normal, None).await;

    tracing::info!(
        terminated = result.bounds.terminated,
        reason = ?result.bounds.termination_reason,
        "request finished"
    );
}
