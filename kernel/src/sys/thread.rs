//! Thread Management
//!
//! A thread (TCB) is the unit of scheduling:
//! - Belongs to exactly one process
//! - Identified by a TID unique within that process (the first is TID 0)
//! - Carries a priority (0 = most urgent) and a quantum length
//!
//! Where a thread currently lives (ready, blocked, running, exited) is
//! tracked by the scheduler queues, not by the TCB itself.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::process::Pid;

/// Thread ID, unique within its process
pub type Tid = u32;

/// Thread priority (lower value = more urgent)
pub type Priority = u32;

/// Globally unique handle of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub pid: Pid,
    pub tid: Tid,
}

impl ThreadKey {
    pub fn new(pid: Pid, tid: Tid) -> Self {
        Self { pid, tid }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.pid, self.tid)
    }
}

/// Scheduling state of a thread, derived from queue membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    /// Waiting in a ready bucket
    Ready,
    /// Owns the running slot
    Running,
    /// Parked in the blocked set
    Blocked,
    /// Finished, kept in the exit list
    Exited,
}

/// Thread control block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread ID
    pub tid: Tid,
    /// Owning process ID
    pub pid: Pid,
    /// Priority (lower = more urgent)
    pub priority: Priority,
    /// Time slice granted under the multilevel policy
    #[serde(with = "humantime_serde")]
    pub quantum: Duration,
}

impl Thread {
    /// Create new thread
    pub fn new(pid: Pid, tid: Tid, priority: Priority, quantum: Duration) -> Self {
        Self {
            tid,
            pid,
            priority,
            quantum,
        }
    }

    /// Registry handle of this thread
    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.pid, self.tid)
    }
}
