//! Checkpoint persistence — durable snapshots of an envelope mid-pipeline so
//! a worker crash can resume from the last saved point instead of restarting
//! the whole request.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::types::{CheckpointId, EnvelopeId, Result};

/// A saved snapshot of envelope state at a particular agent boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub envelope_id: EnvelopeId,
    pub agent_name: String,
    pub state: Envelope,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint durability contract. Implementations decide storage (Postgres,
/// object storage, in-memory for tests).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(
        &self,
        envelope_id: &EnvelopeId,
        checkpoint_id: &CheckpointId,
        agent_name: &str,
        state: Envelope,
        metadata: HashMap<String, Value>,
    ) -> Result<()>;

    async fn load_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>>;

    async fn latest_checkpoint(&self, envelope_id: &EnvelopeId) -> Result<Option<Checkpoint>>;
}

/// In-memory reference checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    by_id: Mutex<HashMap<CheckpointId, Checkpoint>>,
    by_envelope: Mutex<HashMap<EnvelopeId, Vec<CheckpointId>>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_checkpoint(
        &self,
        envelope_id: &EnvelopeId,
        checkpoint_id: &CheckpointId,
        agent_name: &str,
        state: Envelope,
        metadata: HashMap<String, Value>,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            envelope_id: envelope_id.clone(),
            agent_name: agent_name.to_string(),
            state,
            metadata,
            created_at: Utc::now(),
        };
        self.by_id.lock().unwrap().insert(checkpoint_id.clone(), checkpoint);
        self.by_envelope.lock().unwrap().entry(envelope_id.clone()).or_default().push(checkpoint_id.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>> {
        Ok(self.by_id.lock().unwrap().get(checkpoint_id).cloned())
    }

    async fn latest_checkpoint(&self, envelope_id: &EnvelopeId) -> Result<Option<Checkpoint>> {
        let by_envelope = self.by_envelope.lock().unwrap();
        let Some(id) = by_envelope.get(envelope_id).and_then(|ids| ids.last()) else {
            return Ok(None);
        };
        Ok(self.by_id.lock().unwrap().get(id).cloned())
    }
}

/// Rebuild a runnable envelope from the most recent checkpoint for
/// `envelope_id`, so a restarted worker can resume an in-flight pipeline
/// instead of re-running it from the start.
pub async fn fork_from_checkpoint(
    store: &dyn CheckpointStore,
    envelope_id: &EnvelopeId,
) -> Result<Option<Envelope>> {
    Ok(store.latest_checkpoint(envelope_id).await?.map(|checkpoint| checkpoint.state))
}
