//! Background cleanup for the kernel's in-memory state.
//!
//! CleanupService provides periodic garbage collection of:
//! - Zombie processes (terminated, reaped, past their retention window)
//! - Resolved interrupts (old interrupt records)
//! - Expired rate limit windows
//! - Envelopes left behind for pids no longer in the process table
//!
//! This prevents memory growth in long-running deployments where many
//! requests are submitted and completed over the kernel's lifetime.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration as TokioDuration};

use crate::kernel::types::ProcessState;
use crate::kernel::Kernel;

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// How often to run cleanup (default: 5 minutes).
    pub interval_seconds: u64,
    /// How long to keep zombie processes before removing them (default: 24 hours).
    pub process_retention_seconds: i64,
    /// How long to keep resolved interrupts (default: 24 hours).
    pub interrupt_retention_seconds: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            process_retention_seconds: 86400,
            interrupt_retention_seconds: 86400,
        }
    }
}

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    pub zombies_removed: usize,
    pub interrupts_removed: usize,
    pub envelopes_evicted: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection over a shared kernel.
#[derive(Debug)]
pub struct CleanupService {
    kernel: Arc<Mutex<Kernel>>,
    config: CleanupConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CleanupService {
    pub fn new(kernel: Arc<Mutex<Kernel>>, config: CleanupConfig) -> Self {
        Self { kernel, config, stop_tx: None }
    }

    /// Start the cleanup loop in the background. Returns immediately; the
    /// cleanup cycle itself runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let kernel = self.kernel.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(TokioDuration::from_secs(config.interval_seconds));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut k = kernel.lock().await;
                        let stats = Self::run_cleanup_cycle(&mut k, &config);
                        tracing::debug!(
                            zombies = stats.zombies_removed,
                            interrupts = stats.interrupts_removed,
                            envelopes = stats.envelopes_evicted,
                            "cleanup_cycle_completed"
                        );
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cleanup cycle against a directly-held kernel.
    pub fn run_cleanup_cycle(kernel: &mut Kernel, config: &CleanupConfig) -> CleanupStats {
        let zombies_removed = Self::cleanup_zombies(kernel, config.process_retention_seconds);
        let interrupts_removed = kernel.interrupts.cleanup_resolved(Duration::seconds(config.interrupt_retention_seconds));
        kernel.rate_limiter.cleanup_expired();
        let envelopes_evicted = Self::cleanup_orphaned_envelopes(kernel);

        CleanupStats {
            zombies_removed,
            interrupts_removed,
            envelopes_evicted,
            completed_at: Some(Utc::now()),
        }
    }

    /// Reap-then-remove zombie processes whose completion predates the
    /// retention window. `lifecycle.reap` is assumed to have already run on
    /// terminated pids that are no longer needed by the facade.
    fn cleanup_zombies(kernel: &mut Kernel, max_age_seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(max_age_seconds);
        let stale: Vec<_> = kernel
            .lifecycle
            .list_by_state(ProcessState::Zombie)
            .into_iter()
            .filter(|pcb| pcb.completed_at.map(|t| t < cutoff).unwrap_or(false))
            .collect();

        let mut removed = 0;
        for pcb in stale {
            let pid = match crate::types::ProcessId::from_string(pcb.pid.clone()) {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            if kernel.lifecycle.cleanup(&pid) {
                removed += 1;
            }
        }
        removed
    }

    /// Drop envelopes kept for pids the process table no longer knows about
    /// (terminated-and-cleaned-up, or cancelled before admission completed).
    fn cleanup_orphaned_envelopes(kernel: &mut Kernel) -> usize {
        let live: std::collections::HashSet<String> =
            kernel.lifecycle.list().into_iter().map(|pcb| pcb.pid).collect();
        let before = kernel.envelopes.len();
        kernel.envelopes.retain(|pid, _| live.contains(pid));
        before - kernel.envelopes.len()
    }
}
