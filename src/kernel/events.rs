//! Event Aggregator — kernel event bus and per-process interrupt slot.
//!
//! Mirrors the kernel's interrupt handling: a single pending "software
//! interrupt" per process, a kernel-wide event bus with exact-then-wildcard
//! dispatch, and a bounded ring history (like `dmesg`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::InterruptKind;

const DEFAULT_HISTORY_SIZE: usize = 10_000;
const DEFAULT_PROCESS_HISTORY_SIZE: usize = 100;

/// A kernel-emitted event with a JSON-serializable payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub pid: Option<String>,
    pub data: Value,
}

impl KernelEvent {
    pub fn new(event_type: impl Into<String>, pid: Option<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            pid,
            data,
        }
    }
}

/// Event handler — invoked synchronously, outside the aggregator lock.
/// Handlers that need to do async work should spawn their own task.
pub type EventHandler = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event Aggregator — kernel event bus plus per-PCB interrupt slot.
///
/// NOT a separate actor: owned by `Kernel` and called via `&mut self`.
pub struct EventAggregator {
    history_size: usize,
    process_history_size: usize,

    pending_interrupts: HashMap<String, (InterruptKind, Value)>,
    subscribers: HashMap<String, Vec<(SubscriptionId, EventHandler)>>,
    wildcard_subscribers: Vec<(SubscriptionId, EventHandler)>,
    next_subscription_id: u64,

    history: VecDeque<KernelEvent>,
    process_history: HashMap<String, VecDeque<KernelEvent>>,
    event_counts: HashMap<String, u64>,
}

impl std::fmt::Debug for EventAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventAggregator")
            .field("history_len", &self.history.len())
            .field("pending_interrupts", &self.pending_interrupts.len())
            .finish()
    }
}

impl EventAggregator {
    pub fn new(history_size: Option<usize>) -> Self {
        Self {
            history_size: history_size.unwrap_or(DEFAULT_HISTORY_SIZE),
            process_history_size: DEFAULT_PROCESS_HISTORY_SIZE,
            pending_interrupts: HashMap::new(),
            subscribers: HashMap::new(),
            wildcard_subscribers: Vec::new(),
            next_subscription_id: 0,
            history: VecDeque::new(),
            process_history: HashMap::new(),
            event_counts: HashMap::new(),
        }
    }

    /// Raise an interrupt for a process. At most one pending interrupt per
    /// PCB; a second raise overwrites and logs a warning naming both kinds.
    pub fn raise_interrupt(&mut self, pid: &str, kind: InterruptKind, data: Value) {
        if let Some((existing, _)) = self.pending_interrupts.get(pid) {
            tracing::warn!(
                pid,
                existing_type = ?existing,
                new_type = ?kind,
                "interrupt_override"
            );
        }
        self.pending_interrupts.insert(pid.to_string(), (kind, data.clone()));

        tracing::info!(pid, interrupt_type = ?kind, "interrupt_raised");
        self.emit_event(KernelEvent::new(
            "interrupt.raised",
            Some(pid.to_string()),
            serde_json::json!({ "kind": format!("{:?}", kind), "data": data }),
        ));
    }

    pub fn get_pending_interrupt(&self, pid: &str) -> Option<(InterruptKind, Value)> {
        self.pending_interrupts.get(pid).cloned()
    }

    /// Clear a pending interrupt. Returns false if none was pending.
    pub fn clear_interrupt(&mut self, pid: &str) -> bool {
        self.pending_interrupts.remove(pid).is_some()
    }

    pub fn has_pending_interrupt(&self, pid: &str) -> bool {
        self.pending_interrupts.contains_key(pid)
    }

    pub fn get_all_pending_interrupts(&self) -> HashMap<String, InterruptKind> {
        self.pending_interrupts.iter().map(|(pid, (kind, _))| (pid.clone(), *kind)).collect()
    }

    /// Append an event to history, dispatch to subscribers outside the lock.
    /// Exact-type subscribers run first, then wildcard subscribers. Any
    /// handler panic is caught and logged; it never prevents other handlers
    /// from running or marks the event undelivered.
    pub fn emit_event(&mut self, event: KernelEvent) {
        push_bounded(&mut self.history, event.clone(), self.history_size);

        if let Some(pid) = &event.pid {
            let per_process = self
                .process_history
                .entry(pid.clone())
                .or_insert_with(|| VecDeque::with_capacity(self.process_history_size));
            push_bounded(per_process, event.clone(), self.process_history_size);
        }

        *self.event_counts.entry(event.event_type.clone()).or_insert(0) += 1;

        let handlers: Vec<EventHandler> = self
            .subscribers
            .get(&event.event_type)
            .map(|v| v.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        let wildcard: Vec<EventHandler> = self.wildcard_subscribers.iter().map(|(_, h)| h.clone()).collect();

        let handler_count = handlers.len() + wildcard.len();

        for handler in &handlers {
            invoke_handler(handler, &event, "event_handler_error");
        }
        for handler in &wildcard {
            invoke_handler(handler, &event, "wildcard_handler_error");
        }

        tracing::debug!(
            event_type = %event.event_type,
            pid = ?event.pid,
            handler_count,
            "event_emitted"
        );
    }

    /// Subscribe to an event type, or `"*"` for every event.
    pub fn subscribe(&mut self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;

        if event_type == "*" {
            self.wildcard_subscribers.push((id, handler));
        } else {
            self.subscribers.entry(event_type.to_string()).or_default().push((id, handler));
        }
        id
    }

    pub fn unsubscribe(&mut self, event_type: &str, id: SubscriptionId) {
        if event_type == "*" {
            self.wildcard_subscribers.retain(|(sid, _)| *sid != id);
        } else if let Some(v) = self.subscribers.get_mut(event_type) {
            v.retain(|(sid, _)| *sid != id);
        }
    }

    /// Event history, newest first, optionally filtered by pid and/or type.
    pub fn get_event_history(&self, pid: Option<&str>, event_type: Option<&str>, limit: usize) -> Vec<KernelEvent> {
        let source: Vec<&KernelEvent> = match pid {
            Some(pid) => self.process_history.get(pid).map(|d| d.iter().collect()).unwrap_or_default(),
            None => self.history.iter().collect(),
        };

        source
            .into_iter()
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_event_counts(&self) -> HashMap<String, u64> {
        self.event_counts.clone()
    }

    /// Drop all tracked state for a process (pending interrupt, per-pid
    /// history). Called when a process is reaped.
    pub fn cleanup_process(&mut self, pid: &str) {
        self.pending_interrupts.remove(pid);
        self.process_history.remove(pid);
    }

    pub fn get_recent_events(&self, seconds: f64) -> Vec<KernelEvent> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds((seconds * 1000.0) as i64);
        self.history.iter().filter(|e| e.timestamp > cutoff).cloned().collect()
    }

    pub fn get_subscriber_count(&self, event_type: &str) -> usize {
        if event_type == "*" {
            self.wildcard_subscribers.len()
        } else {
            self.subscribers.get(event_type).map(Vec::len).unwrap_or(0)
        }
    }

    pub fn get_history_size(&self) -> usize {
        self.history.len()
    }
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(None)
    }
}

fn push_bounded(deque: &mut VecDeque<KernelEvent>, event: KernelEvent, max_len: usize) {
    if deque.len() >= max_len {
        deque.pop_front();
    }
    deque.push_back(event);
}

/// Run one subscriber outside the aggregator lock, catching a panic so a
/// broken subscriber can't take the event bus down with it or block the
/// handlers after it in `emit_event`'s loop.
fn invoke_handler(handler: &EventHandler, event: &KernelEvent, error_tag: &'static str) {
    let handler = handler.clone();
    let event = event.clone();
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event))) {
        tracing::error!(
            error_tag,
            event_type = %event.event_type,
            panic = %panic_message(&payload),
            "subscriber_panicked"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn raise_interrupt_overwrites_and_emits_event() {
        let mut agg = EventAggregator::default();
        agg.raise_interrupt("p1", InterruptKind::Clarification, serde_json::json!({}));
        agg.raise_interrupt("p1", InterruptKind::Approval, serde_json::json!({}));

        let (kind, _) = agg.get_pending_interrupt("p1").unwrap();
        assert_eq!(kind, InterruptKind::Approval);
        assert_eq!(agg.get_event_counts().get("interrupt.raised"), Some(&2));
    }

    #[test]
    fn clear_interrupt_is_idempotent_returning_false_second_time() {
        let mut agg = EventAggregator::default();
        agg.raise_interrupt("p1", InterruptKind::Clarification, serde_json::json!({}));
        assert!(agg.clear_interrupt("p1"));
        assert!(!agg.clear_interrupt("p1"));
    }

    #[test]
    fn emit_event_dispatches_exact_then_wildcard() {
        let mut agg = EventAggregator::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        agg.subscribe(
            "process.created",
            Arc::new(move |_| o1.lock().unwrap().push("exact")),
        );
        let o2 = order.clone();
        agg.subscribe("*", Arc::new(move |_| o2.lock().unwrap().push("wildcard")));

        agg.emit_event(KernelEvent::new("process.created", Some("p1".to_string()), serde_json::json!({})));

        assert_eq!(*order.lock().unwrap(), vec!["exact", "wildcard"]);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let mut agg = EventAggregator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        agg.subscribe("x", Arc::new(|_| panic!("boom")));
        let c = calls.clone();
        agg.subscribe("x", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        agg.emit_event(KernelEvent::new("x", None, serde_json::json!({})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut agg = EventAggregator::new(Some(3));
        for i in 0..5 {
            agg.emit_event(KernelEvent::new("tick", None, serde_json::json!({ "i": i })));
        }
        assert_eq!(agg.get_history_size(), 3);
        let newest_first = agg.get_event_history(None, None, 10);
        assert_eq!(newest_first[0].data["i"], 4);
    }

    #[test]
    fn per_process_history_is_independent_of_global_ring() {
        let mut agg = EventAggregator::default();
        agg.emit_event(KernelEvent::new("a", Some("p1".to_string()), serde_json::json!({})));
        agg.emit_event(KernelEvent::new("b", Some("p2".to_string()), serde_json::json!({})));

        assert_eq!(agg.get_event_history(Some("p1"), None, 10).len(), 1);
        assert_eq!(agg.get_event_history(None, None, 10).len(), 2);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let mut agg = EventAggregator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = agg.subscribe("x", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        agg.emit_event(KernelEvent::new("x", None, serde_json::json!({})));
        agg.unsubscribe("x", id);
        agg.emit_event(KernelEvent::new("x", None, serde_json::json!({})));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_process_drops_pending_interrupt_and_history() {
        let mut agg = EventAggregator::default();
        agg.raise_interrupt("p1", InterruptKind::Clarification, serde_json::json!({}));
        agg.emit_event(KernelEvent::new("process.created", Some("p1".to_string()), serde_json::json!({})));

        agg.cleanup_process("p1");
        assert!(!agg.has_pending_interrupt("p1"));
        assert!(agg.get_event_history(Some("p1"), None, 10).is_empty());
    }
}
