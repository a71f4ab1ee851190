//! Interrupt Service — unified suspend/resume with response correlation.
//!
//! Complements the Event Aggregator's per-PCB interrupt slot: where that
//! slot is a single-value mailbox, this service keeps a durable, resolvable
//! record of every interrupt raised, so a response can be correlated back to
//! the original request even across a process restart (when a store is
//! injected).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::InterruptKind;
use crate::types::InterruptId;

/// A persisted interrupt awaiting (or having received) a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRecord {
    pub id: InterruptId,
    pub kind: InterruptKind,
    pub identifiers: HashMap<String, String>,
    pub body: Value,
    pub response: Option<Value>,
    pub actor: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Durable storage for interrupt records. The in-memory `InterruptService`
/// always keeps its own copy; a store is an optional side channel for
/// durability across restarts.
pub trait InterruptStore: Send + Sync {
    fn save(&self, record: &InterruptRecord);
}

/// Reference store used when no external store is configured.
#[derive(Debug, Default)]
pub struct InMemoryInterruptStore {
    records: Mutex<HashMap<InterruptId, InterruptRecord>>,
}

impl InterruptStore for InMemoryInterruptStore {
    fn save(&self, record: &InterruptRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record.clone());
    }
}

/// Interrupt Service (unified) — creates and resolves interrupt records.
///
/// NOT a separate actor: owned by `Kernel` and called via `&mut self`.
pub struct InterruptService {
    records: HashMap<InterruptId, InterruptRecord>,
    store: Option<Arc<dyn InterruptStore>>,
}

impl std::fmt::Debug for InterruptService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptService")
            .field("records", &self.records)
            .field("store", &self.store.as_ref().map(|_| "<dyn InterruptStore>"))
            .finish()
    }
}

impl InterruptService {
    pub fn new(store: Option<Arc<dyn InterruptStore>>) -> Self {
        Self {
            records: HashMap::new(),
            store,
        }
    }

    /// Create an interrupt record. Persists through the injected store (if
    /// any) and returns the new record; the caller (the kernel facade) is
    /// responsible for emitting the corresponding domain event, since this
    /// service has no dependency on the event bus.
    pub fn create_interrupt(
        &mut self,
        kind: InterruptKind,
        identifiers: HashMap<String, String>,
        body: Value,
    ) -> InterruptRecord {
        let record = InterruptRecord {
            id: InterruptId::new(),
            kind,
            identifiers,
            body,
            response: None,
            actor: None,
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
        };

        if let Some(store) = &self.store {
            store.save(&record);
        }
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Resolve an interrupt with a response. Returns `None` if the id is
    /// unknown or the response kind doesn't match the interrupt's kind.
    pub fn respond(
        &mut self,
        interrupt_id: &InterruptId,
        response_kind: InterruptKind,
        response_body: Value,
        actor: &str,
    ) -> Option<InterruptRecord> {
        let record = self.records.get_mut(interrupt_id)?;
        if record.kind != response_kind {
            tracing::warn!(
                interrupt_id = %interrupt_id,
                expected = ?record.kind,
                got = ?response_kind,
                "interrupt_response_kind_mismatch"
            );
            return None;
        }

        record.response = Some(response_body);
        record.actor = Some(actor.to_string());
        record.resolved = true;
        record.resolved_at = Some(Utc::now());

        let resolved = record.clone();
        if let Some(store) = &self.store {
            store.save(&resolved);
        }
        Some(resolved)
    }

    pub fn get(&self, interrupt_id: &InterruptId) -> Option<&InterruptRecord> {
        self.records.get(interrupt_id)
    }

    pub fn is_resolved(&self, interrupt_id: &InterruptId) -> bool {
        self.records.get(interrupt_id).map(|r| r.resolved).unwrap_or(false)
    }

    /// Drop resolved records older than `max_age`. Unresolved records are
    /// kept regardless of age since a late response must still correlate.
    pub fn cleanup_resolved(&mut self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.resolved && record.resolved_at.map(|t| t < cutoff).unwrap_or(false)));
        before - self.records.len()
    }
}

impl Default for InterruptService {
    fn default() -> Self {
        Self::new(None)
    }
}
