//! Worker Coordinator — distributed execution layer over the kernel.
//!
//! A thin shell around the same lifecycle/resource machinery the in-process
//! `Kernel` facade drives: `submit_envelope` admits work through the kernel
//! before handing it to a queue, and `run_worker` pulls tasks back off that
//! queue on a separate process, replaying them through the same PCB.

pub mod checkpoint;
pub mod coordinator;
pub mod queue;

pub use checkpoint::{fork_from_checkpoint, Checkpoint, CheckpointStore, InMemoryCheckpointStore};
pub use coordinator::{WorkerConfig, WorkerCoordinator, WorkerStatus};
pub use queue::{DistributedQueue, DistributedTask, InMemoryQueue, QueueStats};
