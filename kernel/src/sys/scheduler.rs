//! Scheduler
//!
//! Owns every registry and queue of the Kernel behind one value,
//! [`SchedulerState`], which callers guard with a single coarse lock.
//!
//! # Scheduling Policies
//!
//! 1. FIFO: one bucket, dispatch the head, never preempt
//! 2. Priority: one bucket, dispatch the lowest priority value (first
//!    enqueued wins ties), ask the CPU to preempt a less urgent runner
//! 3. Multilevel: one bucket per priority, dispatch the head of the most
//!    urgent bucket under a quantum, preempt like Priority
//!
//! Every dispatch stamps the running slot with a fresh generation. Quantum
//! timers and preemption notices carry that generation, so an event aimed
//! at an earlier dispatch is recognised and dropped.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::mutex::MutexHolder;
use super::process::{Pid, ProcessTable};
use super::queues::{Backlog, BlockReason, BlockedEntry, BlockedSet, IoQueue, IoRequest, ReadyQueues};
use super::thread::{Priority, ThreadKey, ThreadState, Tid};
use crate::{KernelError, KernelResult};

/// Short-term scheduling policy, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    #[serde(rename = "FIFO")]
    Fifo,
    #[serde(rename = "PRIORITY", alias = "PRIORIDADES")]
    Priority,
    #[serde(rename = "MULTILEVEL", alias = "CMN")]
    Multilevel,
}

impl Policy {
    /// Ready bucket a thread of `priority` belongs to
    pub fn bucket_for(&self, priority: Priority) -> Priority {
        match self {
            Policy::Multilevel => priority,
            Policy::Fifo | Policy::Priority => 0,
        }
    }

    /// Whether a more urgent ready thread triggers a preemption notice
    pub fn preempts(&self) -> bool {
        !matches!(self, Policy::Fifo)
    }

    /// Whether dispatches run under a quantum timer
    pub fn uses_quantum(&self) -> bool {
        matches!(self, Policy::Multilevel)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Fifo => write!(f, "FIFO"),
            Policy::Priority => write!(f, "PRIORITY"),
            Policy::Multilevel => write!(f, "MULTILEVEL"),
        }
    }
}

impl FromStr for Policy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FIFO" => Ok(Policy::Fifo),
            "PRIORITY" | "PRIORIDADES" => Ok(Policy::Priority),
            "MULTILEVEL" | "CMN" => Ok(Policy::Multilevel),
            _ => Err(KernelError::InvalidConfiguration(format!(
                "unknown scheduler algorithm: {}",
                s
            ))),
        }
    }
}

/// The thread the CPU is executing, with its dispatch generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSlot {
    pub key: ThreadKey,
    pub generation: u64,
}

/// What the dispatcher should do after inspecting the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing runs and nothing is ready
    Idle,
    /// Nothing to do until the state changes
    Wait,
    /// Send `key` to the CPU; the running slot is already updated
    Dispatch {
        key: ThreadKey,
        generation: u64,
        quantum: Option<Duration>,
    },
    /// Ask the CPU to evict the running thread for a more urgent one
    Preempt { key: ThreadKey, generation: u64 },
}

/// Ready queue entry as reported by `KERNEL_STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyStatus {
    pub bucket: Priority,
    pub pid: Pid,
    pub tid: Tid,
}

/// Live process as reported by `KERNEL_STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: Pid,
    pub path: String,
    pub size: u32,
    pub threads: Vec<Tid>,
    pub mutexes: BTreeMap<String, MutexHolder>,
}

/// Read-only snapshot of the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStatus {
    pub policy: Policy,
    pub running: Option<RunningSlot>,
    pub pending_compaction: bool,
    pub ready: Vec<ReadyStatus>,
    pub blocked: Vec<BlockedEntry>,
    pub io_pending: Vec<ThreadKey>,
    pub exited: Vec<ThreadKey>,
    pub backlog: Vec<Pid>,
    pub processes: Vec<ProcessStatus>,
}

/// Registries, queues and the running slot
#[derive(Debug)]
pub struct SchedulerState {
    policy: Policy,
    /// Quantum granted to new threads
    quantum: Duration,
    pub processes: ProcessTable,
    pub ready: ReadyQueues,
    pub blocked: BlockedSet,
    pub io: IoQueue,
    pub backlog: Backlog,
    exited: Vec<ThreadKey>,
    running: Option<RunningSlot>,
    generation: u64,
    /// Compactions waiting for or running on an idle machine
    pending_compactions: u32,
    /// Generation that already received a priority preemption notice
    preempt_sent: Option<u64>,
}

impl SchedulerState {
    pub fn new(policy: Policy, quantum: Duration) -> Self {
        Self {
            policy,
            quantum,
            processes: ProcessTable::new(),
            ready: ReadyQueues::new(),
            blocked: BlockedSet::new(),
            io: IoQueue::new(),
            backlog: Backlog::new(),
            exited: Vec::new(),
            running: None,
            generation: 0,
            pending_compactions: 0,
            preempt_sent: None,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    // ========== Running Slot ==========

    /// Mark `key` as running under a fresh generation
    pub fn set_running(&mut self, key: ThreadKey) -> u64 {
        self.generation += 1;
        self.running = Some(RunningSlot {
            key,
            generation: self.generation,
        });
        self.generation
    }

    pub fn clear_running(&mut self) {
        self.running = None;
    }

    pub fn running(&self) -> Option<RunningSlot> {
        self.running
    }

    pub fn is_running(&self, key: ThreadKey) -> bool {
        self.running.map_or(false, |slot| slot.key == key)
    }

    /// Priority of a live thread, read from its TCB
    pub fn current_priority(&self, key: ThreadKey) -> Option<Priority> {
        self.processes.priority_of(key)
    }

    // ========== Compaction ==========

    /// Hold off dispatching until the matching [`Self::end_compaction`]
    pub fn begin_compaction(&mut self) {
        self.pending_compactions += 1;
    }

    pub fn end_compaction(&mut self) {
        self.pending_compactions = self.pending_compactions.saturating_sub(1);
    }

    pub fn pending_compaction(&self) -> bool {
        self.pending_compactions > 0
    }

    /// Nothing executes except, possibly, the thread asking for compaction
    pub fn is_idle_for(&self, caller: Option<ThreadKey>) -> bool {
        match self.running {
            None => true,
            Some(slot) => Some(slot.key) == caller,
        }
    }

    // ========== Thread Creation ==========

    /// Register TID 0 of a process that just got memory and make it ready
    pub fn create_main_thread(&mut self, pid: Pid, priority: Priority) -> KernelResult<ThreadKey> {
        let tid = self.processes.reserve_tid(pid)?;
        self.admit_thread(pid, tid, priority)
    }

    /// Register a TCB under a reserved TID and make it ready
    pub fn admit_thread(&mut self, pid: Pid, tid: Tid, priority: Priority) -> KernelResult<ThreadKey> {
        let key = self.processes.insert_thread(pid, tid, priority, self.quantum)?;
        self.make_ready(key);
        info!("## {} Thread created - State: READY", key);
        Ok(key)
    }

    // ========== State Transitions ==========

    /// Append a live thread to its ready bucket
    pub fn make_ready(&mut self, key: ThreadKey) -> bool {
        match self.processes.priority_of(key) {
            Some(priority) => {
                self.ready.enqueue(self.policy.bucket_for(priority), key);
                true
            }
            None => {
                warn!("Cannot ready unknown thread {}", key);
                false
            }
        }
    }

    /// Suspend `key`, vacating the running slot if it held it
    pub fn block(&mut self, key: ThreadKey, reason: BlockReason, target: impl Into<String>) {
        self.detach(key);
        self.blocked.push(BlockedEntry::new(key, reason, target));
        info!("## {} - Blocked by: {}", key, reason);
    }

    /// Move a thread blocked for `reason` back to ready
    pub fn unblock(&mut self, key: ThreadKey, reason: BlockReason) -> bool {
        match self.blocked.take_key(key, reason) {
            Some(entry) => self.make_ready(entry.key),
            None => false,
        }
    }

    /// Queue an I/O request and suspend its issuer
    pub fn request_io(&mut self, key: ThreadKey, duration: Duration) {
        self.block(key, BlockReason::Io, "");
        self.io.push(IoRequest::new(key, duration));
    }

    /// Requeue a thread the CPU evicted, if it is still the running one
    pub fn requeue_evicted(&mut self, key: ThreadKey) -> bool {
        if !self.is_running(key) {
            return false;
        }
        self.running = None;
        self.make_ready(key)
    }

    /// Undo a dispatch the CPU never received
    pub fn dispatch_failed(&mut self, key: ThreadKey, generation: u64) {
        if self.running == Some(RunningSlot { key, generation }) {
            self.running = None;
            self.make_ready(key);
        }
    }

    /// Thread a quantum timer of `generation` should preempt, if still current
    pub fn quantum_expired(&self, generation: u64) -> Option<ThreadKey> {
        self.running
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.key)
    }

    // ========== Exit Paths ==========

    /// Finish one thread: wake its joiners, hand over its mutexes, retire it
    pub fn exit_thread(&mut self, key: ThreadKey) -> bool {
        if !self.processes.contains_thread(key) {
            return false;
        }

        let target = key.tid.to_string();
        let joiners = self.blocked.take_all(|e| {
            e.reason == BlockReason::Join && e.key.pid == key.pid && e.target == target
        });
        for joiner in joiners {
            self.make_ready(joiner.key);
        }

        let held = self
            .processes
            .get(key.pid)
            .map(|p| p.mutexes.held_by(key.tid))
            .unwrap_or_default();
        for name in held {
            let waiter = self.blocked.take_first(|e| {
                e.reason == BlockReason::Mutex && e.key.pid == key.pid && e.target == name
            });
            if let Some(process) = self.processes.get_mut(key.pid) {
                match &waiter {
                    Some(entry) => process.mutexes.assign(&name, entry.key.tid),
                    None => process.mutexes.release(&name),
                }
            }
            if let Some(entry) = waiter {
                debug!("Mutex {} handed from {} to {}", name, key, entry.key);
                self.make_ready(entry.key);
            }
        }

        self.retire(key);
        true
    }

    /// Finish every thread of `pid` and drop its PCB
    pub fn exit_process(&mut self, pid: Pid) -> bool {
        let keys: Vec<ThreadKey> = match self.processes.get(pid) {
            Some(process) => process.threads.values().map(|t| t.key()).collect(),
            None => return false,
        };
        for key in keys {
            self.retire(key);
        }
        self.backlog.remove_pid(pid);
        if let Err(err) = self.processes.remove_process(pid) {
            warn!("Failed to remove process {}: {}", pid, err);
            return false;
        }
        info!("## Process {} finished", pid);
        true
    }

    /// Take a thread out of every queue and the registry, into the exit list
    fn retire(&mut self, key: ThreadKey) {
        self.detach(key);
        if self.processes.remove_thread(key).is_ok() {
            self.exited.push(key);
            info!("## {} Thread finished", key);
        }
    }

    /// Remove a thread from the ready, blocked, I/O and running sets
    fn detach(&mut self, key: ThreadKey) {
        self.ready.remove(key);
        self.blocked.remove_key(key);
        self.io.remove_key(key);
        if self.is_running(key) {
            self.running = None;
        }
    }

    pub fn exited(&self) -> &[ThreadKey] {
        &self.exited
    }

    // ========== Selection ==========

    /// Derive the next dispatcher action from the current state
    pub fn decide(&mut self) -> Decision {
        if self.pending_compaction() {
            return Decision::Wait;
        }

        match self.policy {
            Policy::Fifo => {
                if self.running.is_some() {
                    return Decision::Wait;
                }
                match self.ready.dequeue(0) {
                    Some(key) => self.dispatch(key, None),
                    None => Decision::Idle,
                }
            }
            Policy::Priority => {
                let Some((index, key, priority)) = self.select_by_priority() else {
                    return self.nothing_ready();
                };
                match self.running {
                    None => {
                        self.ready.remove_at(0, index);
                        self.dispatch(key, None)
                    }
                    Some(slot) => self.preempt_if_more_urgent(slot, priority),
                }
            }
            Policy::Multilevel => {
                let Some((bucket, key)) = self.ready.peek_most_urgent() else {
                    return self.nothing_ready();
                };
                match self.running {
                    None => {
                        self.ready.dequeue(bucket);
                        let quantum = self
                            .processes
                            .thread(key)
                            .map_or(self.quantum, |t| t.quantum);
                        self.dispatch(key, Some(quantum))
                    }
                    Some(slot) => {
                        let priority = self.processes.priority_of(key).unwrap_or(bucket);
                        self.preempt_if_more_urgent(slot, priority)
                    }
                }
            }
        }
    }

    /// Lowest priority value in bucket 0, earliest arrival on ties
    fn select_by_priority(&self) -> Option<(usize, ThreadKey, Priority)> {
        self.ready
            .bucket(0)
            .enumerate()
            .filter_map(|(index, key)| {
                self.processes
                    .priority_of(*key)
                    .map(|priority| (index, *key, priority))
            })
            .min_by_key(|(_, _, priority)| *priority)
    }

    fn nothing_ready(&self) -> Decision {
        if self.running.is_some() {
            Decision::Wait
        } else {
            Decision::Idle
        }
    }

    fn dispatch(&mut self, key: ThreadKey, quantum: Option<Duration>) -> Decision {
        let generation = self.set_running(key);
        Decision::Dispatch {
            key,
            generation,
            quantum,
        }
    }

    fn preempt_if_more_urgent(&mut self, slot: RunningSlot, candidate: Priority) -> Decision {
        let Some(running) = self.processes.priority_of(slot.key) else {
            return Decision::Wait;
        };
        if candidate < running && self.preempt_sent != Some(slot.generation) {
            self.preempt_sent = Some(slot.generation);
            return Decision::Preempt {
                key: slot.key,
                generation: slot.generation,
            };
        }
        Decision::Wait
    }

    // ========== Inspection ==========

    /// Where a thread currently lives
    pub fn state_of(&self, key: ThreadKey) -> Option<ThreadState> {
        if self.is_running(key) {
            Some(ThreadState::Running)
        } else if self.ready.contains(key) {
            Some(ThreadState::Ready)
        } else if self.blocked.contains(key) {
            Some(ThreadState::Blocked)
        } else if self.exited.contains(&key) {
            Some(ThreadState::Exited)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> KernelStatus {
        KernelStatus {
            policy: self.policy,
            running: self.running,
            pending_compaction: self.pending_compaction(),
            ready: self
                .ready
                .iter()
                .map(|(bucket, key)| ReadyStatus {
                    bucket,
                    pid: key.pid,
                    tid: key.tid,
                })
                .collect(),
            blocked: self.blocked.iter().cloned().collect(),
            io_pending: self.io.iter().map(|r| r.key).collect(),
            exited: self.exited.clone(),
            backlog: self.backlog.pids(),
            processes: self
                .processes
                .processes()
                .map(|p| ProcessStatus {
                    pid: p.pid,
                    path: p.path.clone(),
                    size: p.size,
                    threads: p.threads.keys().copied().collect(),
                    mutexes: p.mutexes.iter().map(|(n, h)| (n.clone(), *h)).collect(),
                })
                .collect(),
        }
    }

    /// Check membership exclusivity and totality, and mutex holder validity
    pub fn verify(&self) -> KernelResult<()> {
        let mut placed = HashSet::new();
        let mut place = |key: ThreadKey, set: &str| -> KernelResult<()> {
            if !self.processes.contains_thread(key) {
                return Err(KernelError::InvariantViolation(format!(
                    "{} in {} is not a live thread",
                    key, set
                )));
            }
            if !placed.insert(key) {
                return Err(KernelError::InvariantViolation(format!(
                    "{} appears more than once (found again in {})",
                    key, set
                )));
            }
            Ok(())
        };

        if let Some(slot) = self.running {
            place(slot.key, "running slot")?;
        }
        for (_, key) in self.ready.iter() {
            place(key, "ready queues")?;
        }
        for entry in self.blocked.iter() {
            place(entry.key, "blocked set")?;
        }

        for key in &self.exited {
            if self.processes.contains_thread(*key) {
                return Err(KernelError::InvariantViolation(format!(
                    "{} is exited but still registered",
                    key
                )));
            }
        }
        for key in self.processes.thread_keys() {
            if !placed.contains(&key) {
                return Err(KernelError::InvariantViolation(format!(
                    "{} is in no queue",
                    key
                )));
            }
        }
        for process in self.processes.processes() {
            for (name, holder) in process.mutexes.iter() {
                if let MutexHolder::Held(tid) = holder {
                    if !process.has_thread(*tid) {
                        return Err(KernelError::InvariantViolation(format!(
                            "mutex {} of process {} held by missing thread {}",
                            name, process.pid, tid
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
