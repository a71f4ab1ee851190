//! Worker Coordinator — queue-driven distributed execution over the kernel.
//!
//! Submitting an envelope creates a PCB through the kernel facade (so
//! distributed and local submissions share one lifecycle and one resource
//! ledger) before the task is handed to the queue. Running as a worker pulls
//! tasks back off the queue, replays them through the same `ResourceTracker`
//! and `LifecycleManager`, and reports completion/failure to the bus.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};

use crate::envelope::Envelope;
use crate::kernel::dispatch::Handler;
use crate::kernel::types::{ResourceQuota, SchedulingPriority};
use crate::kernel::Kernel;
use crate::types::{EnvelopeId, Error, ProcessId, Result, TaskId};

use super::checkpoint::CheckpointStore;
use super::queue::{DistributedQueue, DistributedTask, QueueStats};

/// Configuration for a single distributed worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub heartbeat_interval_seconds: u64,
    pub task_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            queues: vec!["default".to_string()],
            max_concurrent_tasks: 5,
            heartbeat_interval_seconds: 30,
            task_timeout_seconds: 300,
        }
    }
}

/// Operational snapshot of a running or stopped worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub status: String,
    pub active_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub queues: Vec<String>,
}

impl WorkerStatus {
    fn new(worker_id: String, queues: Vec<String>) -> Self {
        Self {
            worker_id,
            status: "starting".to_string(),
            active_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            last_heartbeat: None,
            queues,
        }
    }
}

/// Coordinates distributed workers pulling tasks off a `DistributedQueue` and
/// driving them through a shared `Kernel`.
pub struct WorkerCoordinator {
    kernel: Arc<Mutex<Kernel>>,
    bus: Arc<dyn DistributedQueue>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    workers: Mutex<HashMap<String, WorkerStatus>>,
}

impl std::fmt::Debug for WorkerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCoordinator").field("has_checkpoints", &self.checkpoints.is_some()).finish()
    }
}

impl WorkerCoordinator {
    pub fn new(kernel: Arc<Mutex<Kernel>>, bus: Arc<dyn DistributedQueue>, checkpoints: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self { kernel, bus, checkpoints, workers: Mutex::new(HashMap::new()) }
    }

    /// Admit an envelope through the kernel, persist an initial checkpoint,
    /// and enqueue it for a worker to pick up.
    pub async fn submit_envelope(
        &self,
        envelope: Envelope,
        queue_name: &str,
        agent_name: Option<String>,
        priority: i32,
        resource_quota: Option<ResourceQuota>,
    ) -> Result<TaskId> {
        let task_id = TaskId::new();
        let envelope_id = EnvelopeId::from_string(envelope.identity.envelope_id.clone())
            .map_err(Error::validation)?;
        let pid = ProcessId::from_envelope(&envelope_id);
        let ct_priority = SchedulingPriority::from_integer(priority);

        {
            let mut kernel = self.kernel.lock().await;
            let pcb = kernel.lifecycle.submit(
                pid.clone(),
                crate::types::RequestId::from_string(envelope.identity.request_id.clone()).map_err(Error::validation)?,
                crate::types::UserId::from_string(envelope.identity.user_id.clone()).map_err(Error::validation)?,
                crate::types::SessionId::from_string(envelope.identity.session_id.clone()).map_err(Error::validation)?,
                ct_priority,
                resource_quota.clone(),
            )?;
            kernel.resources.allocate(pid.clone(), pcb.quota.clone());
            kernel.lifecycle.schedule(&pid);
            tracing::info!(pid = %pid, priority = ?ct_priority, "control_tower_process_created");
        }

        let checkpoint_id = if let Some(store) = &self.checkpoints {
            let checkpoint_id = crate::types::CheckpointId::new();
            store
                .save_checkpoint(&envelope_id, &checkpoint_id, agent_name.as_deref().unwrap_or("submit"), envelope.clone(), HashMap::new())
                .await?;
            Some(checkpoint_id)
        } else {
            None
        };

        let task = DistributedTask {
            task_id: task_id.clone(),
            envelope,
            agent_name: agent_name.unwrap_or_default(),
            stage_order: 0,
            checkpoint_id,
            priority,
            retry_count: 0,
            max_retries: 2,
        };

        self.bus.enqueue_task(queue_name, task).await?;
        tracing::info!(task_id = %task_id, queue = queue_name, "envelope_submitted");
        Ok(task_id)
    }

    /// Run as a worker: register with the bus, start heartbeating, and pull
    /// tasks from `config.queues` until `stop_worker` is called.
    pub async fn run_worker(self: &Arc<Self>, config: WorkerConfig, handler: Handler) -> Result<()> {
        self.bus.register_worker(&config.worker_id, &config.queues).await?;

        {
            let mut status = WorkerStatus::new(config.worker_id.clone(), config.queues.clone());
            status.status = "running".to_string();
            status.last_heartbeat = Some(Utc::now());
            self.workers.lock().await.insert(config.worker_id.clone(), status);
        }
        tracing::info!(worker_id = %config.worker_id, queues = ?config.queues, "worker_started");

        let shutdown = Arc::new(tokio::sync::Notify::new());
        let heartbeat_handle = {
            let coordinator = self.clone();
            let worker_id = config.worker_id.clone();
            let interval = config.heartbeat_interval_seconds;
            let shutdown = shutdown.clone();
            tokio::spawn(async move { coordinator.heartbeat_loop(worker_id, interval, shutdown).await })
        };

        self.process_loop(&config, handler, shutdown.clone()).await;

        shutdown.notify_waiters();
        heartbeat_handle.abort();

        self.bus.deregister_worker(&config.worker_id).await?;
        if let Some(status) = self.workers.lock().await.get_mut(&config.worker_id) {
            status.status = "stopped".to_string();
            tracing::info!(worker_id = %config.worker_id, completed = status.completed_tasks, failed = status.failed_tasks, "worker_stopped");
        }

        Ok(())
    }

    pub async fn get_worker_status(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.workers.lock().await.get(worker_id).cloned()
    }

    pub async fn list_workers(&self) -> Vec<WorkerStatus> {
        self.workers.lock().await.values().cloned().collect()
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        self.bus.get_queue_stats(queue_name).await
    }

    pub async fn list_queues(&self) -> Result<Vec<String>> {
        self.bus.list_queues().await
    }

    async fn process_loop(self: &Arc<Self>, config: &WorkerConfig, handler: Handler, shutdown: Arc<tokio::sync::Notify>) {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        let mut in_flight = Vec::new();

        loop {
            let shutdown_signalled = shutdown.notified();
            tokio::pin!(shutdown_signalled);

            for queue in &config.queues {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => continue,
                };

                match self.bus.dequeue_task(queue, &config.worker_id, 5).await {
                    Ok(Some(task)) => {
                        if let Some(status) = self.workers.lock().await.get_mut(&config.worker_id) {
                            status.active_tasks += 1;
                        }
                        let coordinator = self.clone();
                        let worker_id = config.worker_id.clone();
                        let task_handler = handler.clone();
                        let coordinator_task = async move { coordinator.process_task(task, worker_id, task_handler, permit).await };
                        in_flight.push(tokio::spawn(coordinator_task));
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        tracing::error!(queue = queue, error = %e, "worker_dequeue_error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                _ = &mut shutdown_signalled => break,
            }
        }

        for task in in_flight {
            let _ = task.await;
        }
    }

    /// Run one task to completion: RUNNING transition, quota accounting
    /// before and after the handler, optional checkpoint, then report back
    /// to the bus.
    async fn process_task(self: Arc<Self>, task: DistributedTask, worker_id: String, handler: Handler, _permit: tokio::sync::OwnedSemaphorePermit) {
        let pid = match ProcessId::from_string(task.envelope.identity.envelope_id.clone()) {
            Ok(pid) => pid,
            Err(_) => return,
        };

        let outcome = self.run_task_body(&task, &pid, handler).await;

        let mut workers = self.workers.lock().await;
        if let Some(status) = workers.get_mut(&worker_id) {
            status.active_tasks = status.active_tasks.saturating_sub(1);
            match &outcome {
                Ok(_) => status.completed_tasks += 1,
                Err(_) => status.failed_tasks += 1,
            }
        }
        drop(workers);

        match outcome {
            Ok(result) => {
                if let Some(store) = &self.checkpoints {
                    let envelope_id = EnvelopeId::from_string(result.identity.envelope_id.clone()).unwrap_or_else(|_| EnvelopeId::new());
                    let _ = store
                        .save_checkpoint(&envelope_id, &crate::types::CheckpointId::new(), &task.agent_name, result.clone(), HashMap::new())
                        .await;
                }
                let _ = self.bus.complete_task(&task.task_id, result).await;
                tracing::debug!(task_id = %task.task_id, agent = %task.agent_name, "task_completed");
            }
            Err(e) => {
                tracing::error!(task_id = %task.task_id, agent = %task.agent_name, error = %e, "task_failed");
                let _ = self.bus.fail_task(&task.task_id, &e.to_string(), task.retry_count < task.max_retries).await;
            }
        }
    }

    async fn run_task_body(&self, task: &DistributedTask, pid: &ProcessId, handler: Handler) -> Result<Envelope> {
        {
            let mut kernel = self.kernel.lock().await;
            if !kernel.lifecycle.transition(pid, crate::kernel::types::ProcessState::Running, Some(&task.agent_name)) {
                return Err(Error::state_transition(format!("pid {pid} not runnable")));
            }
            kernel.resources.record_usage(pid, 0, 0, 1, 0, 0);
            if let Some(reason) = kernel.resources.check_quota(pid) {
                kernel.lifecycle.terminate(pid, &reason, true);
                return Err(Error::quota_exceeded(reason));
            }
        }

        let result = handler(task.envelope.clone()).await?;

        {
            let mut kernel = self.kernel.lock().await;
            kernel.resources.record_envelope_bounds(
                pid,
                result.bounds.llm_call_count,
                result.bounds.tool_call_count,
                0,
                result.bounds.tokens_in,
                result.bounds.tokens_out,
            );
            if let Some(reason) = kernel.resources.check_quota(pid) {
                kernel.lifecycle.terminate(pid, &reason, true);
                let mut result = result;
                result.terminate(reason);
                return Ok(result);
            }
        }

        Ok(result)
    }

    async fn heartbeat_loop(&self, worker_id: String, interval_seconds: u64, shutdown: Arc<tokio::sync::Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval_seconds)) => {
                    if let Err(e) = self.bus.heartbeat(&worker_id).await {
                        tracing::warn!(worker_id = %worker_id, error = %e, "heartbeat_failed");
                        continue;
                    }
                    if let Some(status) = self.workers.lock().await.get_mut(&worker_id) {
                        status.last_heartbeat = Some(Utc::now());
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }
}
