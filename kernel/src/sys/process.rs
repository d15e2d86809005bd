//! Process Management
//!
//! A process (PCB) is a container with:
//! - A PID, allocated monotonically from 1
//! - Its threads, keyed by TID
//! - A table of named mutexes
//!
//! The [`ProcessTable`] is the authoritative registry of every live PCB and
//! TCB. It performs no scheduling; queue membership is the scheduler's job.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::mutex::MutexTable;
use super::thread::{Priority, Thread, ThreadKey, Tid};
use crate::{KernelError, KernelResult};

/// Process ID type
pub type Pid = u32;

/// Process control block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Process ID
    pub pid: Pid,
    /// Pseudocode file the process was created from
    pub path: String,
    /// Requested memory size
    pub size: u32,
    /// Live threads
    pub threads: BTreeMap<Tid, Thread>,
    /// Named mutexes
    pub mutexes: MutexTable,
    /// Next TID to hand out
    next_tid: Tid,
}

impl Process {
    /// Create new process with no threads
    pub fn new(pid: Pid, path: &str, size: u32) -> Self {
        Self {
            pid,
            path: path.to_string(),
            size,
            threads: BTreeMap::new(),
            mutexes: MutexTable::new(),
            next_tid: 0,
        }
    }

    /// Hand out the next TID without registering a TCB; the first is TID 0
    pub fn reserve_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    /// Allocate a TCB under a fresh TID
    pub fn spawn_thread(&mut self, priority: Priority, quantum: Duration) -> Tid {
        let tid = self.reserve_tid();
        self.threads.insert(tid, Thread::new(self.pid, tid, priority, quantum));
        tid
    }

    pub fn has_thread(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }
}

/// Registry of PCBs and their TCBs
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    next_pid: Pid,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Register a new PCB and return its PID
    pub fn create_process(&mut self, path: &str, size: u32) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, path, size));
        pid
    }

    /// Register a new TCB under `pid`
    pub fn create_thread(
        &mut self,
        pid: Pid,
        priority: Priority,
        quantum: Duration,
    ) -> KernelResult<Tid> {
        let process = self.get_mut(pid).ok_or(KernelError::ProcessNotFound(pid))?;
        Ok(process.spawn_thread(priority, quantum))
    }

    /// Reserve a TID under `pid` for a thread registered later
    pub fn reserve_tid(&mut self, pid: Pid) -> KernelResult<Tid> {
        let process = self.get_mut(pid).ok_or(KernelError::ProcessNotFound(pid))?;
        Ok(process.reserve_tid())
    }

    /// Register a TCB under a previously reserved TID
    pub fn insert_thread(
        &mut self,
        pid: Pid,
        tid: Tid,
        priority: Priority,
        quantum: Duration,
    ) -> KernelResult<ThreadKey> {
        let process = self.get_mut(pid).ok_or(KernelError::ProcessNotFound(pid))?;
        process.threads.insert(tid, Thread::new(pid, tid, priority, quantum));
        Ok(ThreadKey::new(pid, tid))
    }

    /// Drop a TCB from the registry
    pub fn remove_thread(&mut self, key: ThreadKey) -> KernelResult<Thread> {
        let process = self
            .get_mut(key.pid)
            .ok_or(KernelError::ProcessNotFound(key.pid))?;
        process
            .threads
            .remove(&key.tid)
            .ok_or(KernelError::ThreadNotFound(key.pid, key.tid))
    }

    /// Drop a PCB; its threads must already be gone
    pub fn remove_process(&mut self, pid: Pid) -> KernelResult<Process> {
        let process = self.get(pid).ok_or(KernelError::ProcessNotFound(pid))?;
        if !process.threads.is_empty() {
            return Err(KernelError::ProcessHasThreads(pid));
        }
        self.processes
            .remove(&pid)
            .ok_or(KernelError::ProcessNotFound(pid))
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn thread(&self, key: ThreadKey) -> Option<&Thread> {
        self.get(key.pid).and_then(|p| p.threads.get(&key.tid))
    }

    pub fn contains_thread(&self, key: ThreadKey) -> bool {
        self.thread(key).is_some()
    }

    /// Live priority of a thread
    pub fn priority_of(&self, key: ThreadKey) -> Option<Priority> {
        self.thread(key).map(|t| t.priority)
    }

    /// Every live thread, ordered by key
    pub fn thread_keys(&self) -> Vec<ThreadKey> {
        self.processes
            .values()
            .flat_map(|p| p.threads.values().map(Thread::key))
            .collect()
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
