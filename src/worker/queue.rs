//! Distributed queue transport — the abstracted bus a worker pulls tasks from.
//!
//! The kernel never talks to a concrete broker directly; anything implementing
//! `DistributedQueue` (Redis, SQS, an in-process channel for tests) can back
//! the worker coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{CheckpointId, Result, TaskId};

/// A unit of distributed work: an envelope snapshot plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTask {
    pub task_id: TaskId,
    pub envelope: Envelope,
    pub agent_name: String,
    pub stage_order: i32,
    pub checkpoint_id: Option<CheckpointId>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Point-in-time counts for a queue, used by operational surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
}

/// Transport contract a worker coordinator drives. Implementations own their
/// own durability and retry visibility semantics; the coordinator only calls
/// the methods below.
#[async_trait]
pub trait DistributedQueue: Send + Sync {
    async fn enqueue_task(&self, queue_name: &str, task: DistributedTask) -> Result<()>;
    async fn dequeue_task(&self, queue_name: &str, worker_id: &str, timeout_seconds: u64) -> Result<Option<DistributedTask>>;
    async fn complete_task(&self, task_id: &TaskId, result: Envelope) -> Result<()>;
    async fn fail_task(&self, task_id: &TaskId, reason: &str, retry: bool) -> Result<()>;
    async fn register_worker(&self, worker_id: &str, queues: &[String]) -> Result<()>;
    async fn deregister_worker(&self, worker_id: &str) -> Result<()>;
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;
    async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats>;
    async fn list_queues(&self) -> Result<Vec<String>>;
}

/// In-memory reference queue, FIFO per queue name. Suitable for tests and
/// single-process demos; not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<DistributedTask>>>,
    in_flight: Mutex<HashMap<TaskId, String>>,
}

#[async_trait]
impl DistributedQueue for InMemoryQueue {
    async fn enqueue_task(&self, queue_name: &str, task: DistributedTask) -> Result<()> {
        self.queues.lock().unwrap().entry(queue_name.to_string()).or_default().push_back(task);
        Ok(())
    }

    async fn dequeue_task(&self, queue_name: &str, _worker_id: &str, _timeout_seconds: u64) -> Result<Option<DistributedTask>> {
        let mut queues = self.queues.lock().unwrap();
        let Some(task) = queues.get_mut(queue_name).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };
        self.in_flight.lock().unwrap().insert(task.task_id.clone(), queue_name.to_string());
        Ok(Some(task))
    }

    async fn complete_task(&self, task_id: &TaskId, _result: Envelope) -> Result<()> {
        self.in_flight.lock().unwrap().remove(task_id);
        Ok(())
    }

    async fn fail_task(&self, task_id: &TaskId, _reason: &str, _retry: bool) -> Result<()> {
        self.in_flight.lock().unwrap().remove(task_id);
        Ok(())
    }

    async fn register_worker(&self, _worker_id: &str, _queues: &[String]) -> Result<()> {
        Ok(())
    }

    async fn deregister_worker(&self, _worker_id: &str) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _worker_id: &str) -> Result<()> {
        Ok(())
    }

    async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        let queues = self.queues.lock().unwrap();
        let pending = queues.get(queue_name).map(|q| q.len()).unwrap_or(0);
        let in_flight = self.in_flight.lock().unwrap().values().filter(|q| q.as_str() == queue_name).count();
        Ok(QueueStats { pending, in_flight })
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        Ok(self.queues.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(agent: &str) -> DistributedTask {
        DistributedTask {
            task_id: TaskId::new(),
            envelope: Envelope::new(),
            agent_name: agent.to_string(),
            stage_order: 0,
            checkpoint_id: None,
            priority: 0,
            retry_count: 0,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_fifo_order() {
        let queue = InMemoryQueue::default();
        queue.enqueue_task("q", task("a")).await.unwrap();
        queue.enqueue_task("q", task("b")).await.unwrap();

        let first = queue.dequeue_task("q", "w1", 5).await.unwrap().unwrap();
        assert_eq!(first.agent_name, "a");
        let second = queue.dequeue_task("q", "w1", 5).await.unwrap().unwrap();
        assert_eq!(second.agent_name, "b");
        assert!(queue.dequeue_task("q", "w1", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_stats_reflect_pending_and_in_flight() {
        let queue = InMemoryQueue::default();
        queue.enqueue_task("q", task("a")).await.unwrap();
        queue.enqueue_task("q", task("b")).await.unwrap();
        let dequeued = queue.dequeue_task("q", "w1", 5).await.unwrap().unwrap();

        let stats = queue.get_queue_stats("q").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);

        queue.complete_task(&dequeued.task_id, Envelope::new()).await.unwrap();
        let stats = queue.get_queue_stats("q").await.unwrap();
        assert_eq!(stats.in_flight, 0);
    }
}
