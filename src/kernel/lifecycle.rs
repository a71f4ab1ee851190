//! Process Table and Scheduler.
//!
//! Owns PCBs; enforces admission and state transitions; selects the next
//! runnable PCB by priority. NEW → READY → RUNNING → {WAITING|BLOCKED|
//! TERMINATED} → ZOMBIE.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::types::{Error, ProcessId, RequestId, Result, SessionId, UserId};

pub use super::types::{ProcessControlBlock, ProcessState, ResourceQuota, SchedulingPriority};

/// Priority queue item (wraps for min-heap behavior).
#[derive(Debug, Clone, PartialEq, Eq)]
struct PriorityItem {
    pid: ProcessId,
    priority: i32,             // Lower = higher priority
    created_at: DateTime<Utc>, // FIFO within same priority
}

impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse priority so lower values pop first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Process Table and Scheduler — kernel's process table plus ready heap.
///
/// NOT a separate actor: owned by `Kernel` and called via `&mut self`. All
/// table and heap mutations happen under the Kernel's single reentrant lock.
#[derive(Debug)]
pub struct LifecycleManager {
    default_quota: ResourceQuota,
    pub(crate) processes: HashMap<ProcessId, ProcessControlBlock>,
    ready_queue: BinaryHeap<PriorityItem>,
}

impl LifecycleManager {
    pub fn new(default_quota: Option<ResourceQuota>) -> Self {
        Self {
            default_quota: default_quota.unwrap_or_default(),
            processes: HashMap::new(),
            ready_queue: BinaryHeap::new(),
        }
    }

    /// Create a new PCB in NEW state. Duplicate ids return the existing PCB
    /// unchanged (idempotent submit).
    pub fn submit(
        &mut self,
        pid: ProcessId,
        request_id: RequestId,
        user_id: UserId,
        session_id: SessionId,
        priority: SchedulingPriority,
        quota: Option<ResourceQuota>,
    ) -> Result<ProcessControlBlock> {
        if let Some(existing) = self.processes.get(&pid) {
            return Ok(existing.clone());
        }

        let mut pcb = ProcessControlBlock::new(
            pid.as_str().to_string(),
            request_id.as_str().to_string(),
            user_id.as_str().to_string(),
            session_id.as_str().to_string(),
        );
        pcb.priority = priority;
        pcb.quota = quota.unwrap_or_else(|| self.default_quota.clone());

        self.processes.insert(pid, pcb.clone());
        Ok(pcb)
    }

    /// Validate and apply a transition against the fixed adjacency set.
    /// Returns false (and logs) on an unknown pid or an invalid transition;
    /// the PCB's state is left unchanged in that case.
    pub fn transition(&mut self, pid: &ProcessId, target: ProcessState, reason: Option<&str>) -> bool {
        let Some(pcb) = self.processes.get_mut(pid) else {
            tracing::warn!(pid = %pid, "transition on unknown pid");
            return false;
        };

        if !pcb.state.can_transition_to(target) {
            tracing::warn!(
                pid = %pid,
                from = ?pcb.state,
                to = ?target,
                "invalid state transition rejected"
            );
            return false;
        }

        let from = pcb.state;
        pcb.state = target;

        match target {
            ProcessState::Ready => {
                pcb.pending_interrupt = None;
                self.ready_queue.push(PriorityItem {
                    pid: pid.clone(),
                    priority: pcb.priority.to_heap_value(),
                    created_at: Utc::now(),
                });
            }
            ProcessState::Running => {
                pcb.start();
            }
            ProcessState::Terminated => {
                pcb.completed_at = Some(Utc::now());
                if let Some(reason) = reason {
                    let data = pcb.interrupt_data.get_or_insert_with(HashMap::new);
                    data.insert(
                        "termination_reason".to_string(),
                        serde_json::Value::String(reason.to_string()),
                    );
                }
            }
            _ => {}
        }

        tracing::debug!(pid = %pid, from = ?from, to = ?target, "pcb state changed");
        true
    }

    /// Transition process from NEW to READY and add it to the ready heap.
    pub fn schedule(&mut self, pid: &ProcessId) -> bool {
        match self.processes.get(pid) {
            Some(pcb) if pcb.state == ProcessState::New => self.transition(pid, ProcessState::Ready, None),
            _ => false,
        }
    }

    /// Pop the highest-priority READY pcb, skipping entries whose pcb no
    /// longer exists or is no longer READY. Transitions the winner to
    /// RUNNING and records `last_scheduled_at`.
    pub fn next_runnable(&mut self) -> Option<ProcessControlBlock> {
        while let Some(item) = self.ready_queue.pop() {
            match self.processes.get(&item.pid) {
                Some(pcb) if pcb.state == ProcessState::Ready => {
                    self.transition(&item.pid, ProcessState::Running, None);
                    return self.processes.get(&item.pid).cloned();
                }
                _ => continue,
            }
        }
        None
    }

    pub fn wait(&mut self, pid: &ProcessId, interrupt_kind: crate::envelope::InterruptKind) -> Result<()> {
        let pcb = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        if pcb.state != ProcessState::Running {
            return Err(Error::state_transition(format!(
                "cannot wait pid {}: state is {:?}, expected Running",
                pid, pcb.state
            )));
        }
        if self.transition(pid, ProcessState::Waiting, None) {
            if let Some(pcb) = self.processes.get_mut(pid) {
                pcb.pending_interrupt = Some(interrupt_kind);
            }
            Ok(())
        } else {
            Err(Error::state_transition(format!("cannot wait pid {}", pid)))
        }
    }

    pub fn block(&mut self, pid: &ProcessId, reason: String) -> Result<()> {
        let pcb = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        if pcb.state != ProcessState::Running {
            return Err(Error::state_transition(format!(
                "cannot block pid {}: state is {:?}, expected Running",
                pid, pcb.state
            )));
        }
        if self.transition(pid, ProcessState::Blocked, None) {
            if let Some(pcb) = self.processes.get_mut(pid) {
                let data = pcb.interrupt_data.get_or_insert_with(HashMap::new);
                data.insert("block_reason".to_string(), serde_json::Value::String(reason));
            }
            Ok(())
        } else {
            Err(Error::state_transition(format!("cannot block pid {}", pid)))
        }
    }

    /// Resume from WAITING/BLOCKED to READY.
    pub fn resume(&mut self, pid: &ProcessId) -> Result<()> {
        let pcb = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        if !matches!(pcb.state, ProcessState::Waiting | ProcessState::Blocked) {
            return Err(Error::state_transition(format!(
                "cannot resume pid {}: state is {:?}, expected Waiting or Blocked",
                pid, pcb.state
            )));
        }
        if self.transition(pid, ProcessState::Ready, None) {
            Ok(())
        } else {
            Err(Error::state_transition(format!("cannot resume pid {}", pid)))
        }
    }

    /// Terminate a process. A RUNNING pcb may be terminated only with
    /// `force=true`; otherwise the call is refused.
    pub fn terminate(&mut self, pid: &ProcessId, reason: &str, force: bool) -> bool {
        let Some(pcb) = self.processes.get(pid) else {
            return false;
        };
        if pcb.state.is_terminal() {
            return true; // idempotent
        }
        if pcb.state == ProcessState::Running && !force {
            tracing::warn!(pid = %pid, "cannot_terminate_running");
            return false;
        }
        self.transition(pid, ProcessState::Terminated, Some(reason))
    }

    /// Transition a TERMINATED pcb to ZOMBIE bookkeeping state.
    pub fn reap(&mut self, pid: &ProcessId) -> bool {
        self.transition(pid, ProcessState::Zombie, None)
    }

    /// Remove a TERMINATED or ZOMBIE pcb from the table.
    pub fn cleanup(&mut self, pid: &ProcessId) -> bool {
        match self.processes.get(pid) {
            Some(pcb) if pcb.state.is_terminal() => {
                self.processes.remove(pid);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, pid: &ProcessId) -> Option<&ProcessControlBlock> {
        self.processes.get(pid)
    }

    pub fn get_mut(&mut self, pid: &ProcessId) -> Option<&mut ProcessControlBlock> {
        self.processes.get_mut(pid)
    }

    pub fn list(&self) -> Vec<ProcessControlBlock> {
        self.processes.values().cloned().collect()
    }

    pub fn list_by_state(&self, state: ProcessState) -> Vec<ProcessControlBlock> {
        self.processes.values().filter(|pcb| pcb.state == state).cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.processes.len()
    }

    pub fn count_by_state(&self, state: ProcessState) -> usize {
        self.processes.values().filter(|pcb| pcb.state == state).count()
    }

    pub fn get_default_quota(&self) -> &ResourceQuota {
        &self.default_quota
    }

    /// Merge default quota overrides; only non-zero fields overwrite.
    pub fn set_default_quota(&mut self, overrides: &ResourceQuota) {
        let q = &mut self.default_quota;
        if overrides.max_llm_calls > 0 {
            q.max_llm_calls = overrides.max_llm_calls;
        }
        if overrides.max_tool_calls > 0 {
            q.max_tool_calls = overrides.max_tool_calls;
        }
        if overrides.max_agent_hops > 0 {
            q.max_agent_hops = overrides.max_agent_hops;
        }
        if overrides.max_iterations > 0 {
            q.max_iterations = overrides.max_iterations;
        }
        if overrides.hard_timeout_seconds > 0 {
            q.hard_timeout_seconds = overrides.hard_timeout_seconds;
        }
        if overrides.soft_timeout_seconds > 0 {
            q.soft_timeout_seconds = overrides.soft_timeout_seconds;
        }
        if overrides.max_input_tokens > 0 {
            q.max_input_tokens = overrides.max_input_tokens;
        }
        if overrides.max_output_tokens > 0 {
            q.max_output_tokens = overrides.max_output_tokens;
        }
        if overrides.max_context_tokens > 0 {
            q.max_context_tokens = overrides.max_context_tokens;
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProcessId {
        ProcessId::from_string(s.to_string()).unwrap()
    }
    fn rid(s: &str) -> RequestId {
        RequestId::from_string(s.to_string()).unwrap()
    }
    fn uid(s: &str) -> UserId {
        UserId::from_string(s.to_string()).unwrap()
    }
    fn sid(s: &str) -> SessionId {
        SessionId::from_string(s.to_string()).unwrap()
    }

    #[test]
    fn state_transitions_happy_path() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");

        let pcb = lm
            .submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None)
            .unwrap();
        assert_eq!(pcb.state, ProcessState::New);

        assert!(lm.schedule(&p));
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Ready);

        let next = lm.next_runnable().unwrap();
        assert_eq!(next.pid, "pid1");
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Running);

        assert!(lm.terminate(&p, "completed", true));
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Terminated);

        assert!(lm.reap(&p));
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn priority_queue_orders_by_priority_then_fifo() {
        let mut lm = LifecycleManager::default();
        let low = pid("low");
        let high = pid("high");
        let normal = pid("normal");

        lm.submit(low.clone(), rid("r1"), uid("u1"), sid("s1"), SchedulingPriority::Low, None).unwrap();
        lm.submit(high.clone(), rid("r2"), uid("u2"), sid("s2"), SchedulingPriority::High, None).unwrap();
        lm.submit(normal.clone(), rid("r3"), uid("u3"), sid("s3"), SchedulingPriority::Normal, None).unwrap();

        lm.schedule(&low);
        lm.schedule(&high);
        lm.schedule(&normal);

        assert_eq!(lm.next_runnable().unwrap().pid, "high");
        assert_eq!(lm.next_runnable().unwrap().pid, "normal");
        assert_eq!(lm.next_runnable().unwrap().pid, "low");
    }

    #[test]
    fn submit_duplicate_pid_is_idempotent() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");

        let pcb1 = lm
            .submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None)
            .unwrap();
        let pcb2 = lm
            .submit(p, rid("req2"), uid("user2"), sid("sess2"), SchedulingPriority::High, None)
            .unwrap();

        assert_eq!(pcb1.pid, pcb2.pid);
        assert_eq!(pcb2.request_id, "req1");
    }

    #[test]
    fn schedule_non_new_pcb_returns_false() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        assert!(lm.schedule(&p));
        assert!(!lm.schedule(&p));
    }

    #[test]
    fn terminate_running_without_force_is_refused() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        lm.schedule(&p);
        lm.next_runnable();

        assert!(!lm.terminate(&p, "nope", false));
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Running);
        assert!(lm.terminate(&p, "forced", true));
    }

    #[test]
    fn terminate_new_pcb_is_allowed() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        assert!(lm.terminate(&p, "cancelled", false));
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        lm.schedule(&p);
        lm.next_runnable();
        assert!(lm.terminate(&p, "done", true));
        assert!(lm.terminate(&p, "done again", true));
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Terminated);
    }

    #[test]
    fn wait_and_resume_cycle() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        lm.schedule(&p);
        lm.next_runnable();

        lm.wait(&p, crate::envelope::InterruptKind::Clarification).unwrap();
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Waiting);

        lm.resume(&p).unwrap();
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Ready);
        assert_eq!(lm.next_runnable().unwrap().pid, "pid1");
    }

    #[test]
    fn block_and_resume_cycle() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();
        lm.schedule(&p);
        lm.next_runnable();

        lm.block(&p, "quota exceeded".to_string()).unwrap();
        assert_eq!(lm.get(&p).unwrap().state, ProcessState::Blocked);

        lm.resume(&p).unwrap();
        assert_eq!(lm.next_runnable().unwrap().pid, "pid1");
    }

    #[test]
    fn unknown_pid_operations_fail_cleanly() {
        let mut lm = LifecycleManager::default();
        let missing = pid("nonexistent");

        assert!(!lm.schedule(&missing));
        assert!(lm.wait(&missing, crate::envelope::InterruptKind::Clarification).is_err());
        assert!(lm.block(&missing, "reason".to_string()).is_err());
        assert!(lm.resume(&missing).is_err());
        assert!(!lm.terminate(&missing, "x", true));
        assert!(!lm.cleanup(&missing));
        assert!(lm.get(&missing).is_none());
    }

    #[test]
    fn cleanup_removes_only_terminal_pcbs() {
        let mut lm = LifecycleManager::default();
        let p = pid("pid1");
        lm.submit(p.clone(), rid("req1"), uid("user1"), sid("sess1"), SchedulingPriority::Normal, None).unwrap();

        assert!(!lm.cleanup(&p));
        lm.terminate(&p, "done", false);
        assert!(lm.cleanup(&p));
        assert_eq!(lm.count(), 0);
    }

    #[test]
    fn set_default_quota_merges_nonzero_fields_only() {
        let mut lm = LifecycleManager::default();

        let overrides = ResourceQuota {
            max_llm_calls: 200,
            ..zero_quota()
        };
        lm.set_default_quota(&overrides);

        let q = lm.get_default_quota();
        assert_eq!(q.max_llm_calls, 200);
        assert_eq!(q.max_tool_calls, 50); // unchanged default
    }

    #[test]
    fn set_default_quota_all_zero_is_a_no_op() {
        let mut lm = LifecycleManager::default();
        let expected = ResourceQuota::default_quota();
        lm.set_default_quota(&zero_quota());
        assert_eq!(*lm.get_default_quota(), expected);
    }

    fn zero_quota() -> ResourceQuota {
        ResourceQuota {
            max_llm_calls: 0,
            max_tool_calls: 0,
            max_agent_hops: 0,
            max_iterations: 0,
            max_input_tokens: 0,
            max_output_tokens: 0,
            max_context_tokens: 0,
            hard_timeout_seconds: 0,
            soft_timeout_seconds: 0,
        }
    }
}
