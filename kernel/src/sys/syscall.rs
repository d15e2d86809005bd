//! System Call Interface
//!
//! The CPU issues syscalls on behalf of the thread it is executing. Each
//! request names the caller `(pid, tid)` plus syscall-specific arguments:
//!
//! | Method          | Arguments                 |
//! |-----------------|---------------------------|
//! | `PROCESS_CREATE`| `path`, `size`, `priority`|
//! | `PROCESS_EXIT`  |                           |
//! | `THREAD_CREATE` | `path`, `priority`        |
//! | `THREAD_JOIN`   | `target`                  |
//! | `THREAD_CANCEL` | `target`                  |
//! | `THREAD_EXIT`   |                           |
//! | `MUTEX_CREATE`  | `name`                    |
//! | `MUTEX_LOCK`    | `name`                    |
//! | `MUTEX_UNLOCK`  | `name`                    |
//! | `IO`            | `duration_ms`             |
//! | `DUMP_MEMORY`   |                           |
//!
//! The mutex and join handlers live here because they only touch the
//! scheduler state. Syscalls that talk to Memory are driven by
//! [`crate::service::Kernel`].

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::mutex::MutexHolder;
use super::process::Pid;
use super::queues::BlockReason;
use super::scheduler::SchedulerState;
use super::thread::{Priority, ThreadKey, Tid};
use crate::{KernelError, KernelResult};

/// A decoded syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    ProcessCreate {
        path: String,
        size: u32,
        priority: Priority,
    },
    ProcessExit,
    ThreadCreate {
        path: String,
        priority: Priority,
    },
    ThreadJoin {
        target: Tid,
    },
    ThreadCancel {
        target: Tid,
    },
    ThreadExit,
    MutexCreate {
        name: String,
    },
    MutexLock {
        name: String,
    },
    MutexUnlock {
        name: String,
    },
    Io {
        duration: Duration,
    },
    DumpMemory,
}

impl Syscall {
    /// Every method name accepted as a syscall
    pub const METHODS: [&'static str; 11] = [
        "PROCESS_CREATE",
        "PROCESS_EXIT",
        "THREAD_CREATE",
        "THREAD_JOIN",
        "THREAD_CANCEL",
        "THREAD_EXIT",
        "MUTEX_CREATE",
        "MUTEX_LOCK",
        "MUTEX_UNLOCK",
        "IO",
        "DUMP_MEMORY",
    ];

    /// Wire name of the syscall
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::ProcessCreate { .. } => "PROCESS_CREATE",
            Syscall::ProcessExit => "PROCESS_EXIT",
            Syscall::ThreadCreate { .. } => "THREAD_CREATE",
            Syscall::ThreadJoin { .. } => "THREAD_JOIN",
            Syscall::ThreadCancel { .. } => "THREAD_CANCEL",
            Syscall::ThreadExit => "THREAD_EXIT",
            Syscall::MutexCreate { .. } => "MUTEX_CREATE",
            Syscall::MutexLock { .. } => "MUTEX_LOCK",
            Syscall::MutexUnlock { .. } => "MUTEX_UNLOCK",
            Syscall::Io { .. } => "IO",
            Syscall::DumpMemory => "DUMP_MEMORY",
        }
    }

    pub fn is_syscall(method: &str) -> bool {
        Self::METHODS.contains(&method)
    }
}

#[derive(Deserialize)]
struct CallerParams {
    pid: Pid,
    tid: Tid,
}

#[derive(Deserialize)]
struct ProcessCreateParams {
    pid: Pid,
    tid: Tid,
    path: String,
    size: u32,
    #[serde(default)]
    priority: Priority,
}

#[derive(Deserialize)]
struct ThreadCreateParams {
    pid: Pid,
    tid: Tid,
    path: String,
    #[serde(default)]
    priority: Priority,
}

#[derive(Deserialize)]
struct TargetParams {
    pid: Pid,
    tid: Tid,
    target: Tid,
}

#[derive(Deserialize)]
struct MutexParams {
    pid: Pid,
    tid: Tid,
    name: String,
}

#[derive(Deserialize)]
struct IoParams {
    pid: Pid,
    tid: Tid,
    duration_ms: u64,
}

fn decode<T: DeserializeOwned>(params: serde_json::Value) -> KernelResult<T> {
    serde_json::from_value(params).map_err(KernelError::from)
}

/// A syscall together with the thread that issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRequest {
    pub caller: ThreadKey,
    pub call: Syscall,
}

impl SyscallRequest {
    /// Decode a syscall from its method name and JSON parameters
    pub fn from_rpc(method: &str, params: serde_json::Value) -> KernelResult<Self> {
        let (pid, tid, call) = match method {
            "PROCESS_CREATE" => {
                let p: ProcessCreateParams = decode(params)?;
                let call = Syscall::ProcessCreate {
                    path: p.path,
                    size: p.size,
                    priority: p.priority,
                };
                (p.pid, p.tid, call)
            }
            "THREAD_CREATE" => {
                let p: ThreadCreateParams = decode(params)?;
                let call = Syscall::ThreadCreate {
                    path: p.path,
                    priority: p.priority,
                };
                (p.pid, p.tid, call)
            }
            "THREAD_JOIN" | "THREAD_CANCEL" => {
                let p: TargetParams = decode(params)?;
                let call = if method == "THREAD_JOIN" {
                    Syscall::ThreadJoin { target: p.target }
                } else {
                    Syscall::ThreadCancel { target: p.target }
                };
                (p.pid, p.tid, call)
            }
            "MUTEX_CREATE" | "MUTEX_LOCK" | "MUTEX_UNLOCK" => {
                let p: MutexParams = decode(params)?;
                let call = match method {
                    "MUTEX_CREATE" => Syscall::MutexCreate { name: p.name },
                    "MUTEX_LOCK" => Syscall::MutexLock { name: p.name },
                    _ => Syscall::MutexUnlock { name: p.name },
                };
                (p.pid, p.tid, call)
            }
            "IO" => {
                let p: IoParams = decode(params)?;
                let call = Syscall::Io {
                    duration: Duration::from_millis(p.duration_ms),
                };
                (p.pid, p.tid, call)
            }
            "PROCESS_EXIT" | "THREAD_EXIT" | "DUMP_MEMORY" => {
                let p: CallerParams = decode(params)?;
                let call = match method {
                    "PROCESS_EXIT" => Syscall::ProcessExit,
                    "THREAD_EXIT" => Syscall::ThreadExit,
                    _ => Syscall::DumpMemory,
                };
                (p.pid, p.tid, call)
            }
            other => return Err(KernelError::UnknownMethod(other.to_string())),
        };
        Ok(Self {
            caller: ThreadKey::new(pid, tid),
            call,
        })
    }
}

/// Literal syscall results returned to the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyscallOutcome {
    Ok,
    Continue,
    ThreadTerminated,
    LockAcquired,
    ThreadBlocked,
    MutexAssigned,
    MutexFree,
    ThreadDoesNotHoldMutex,
    AlreadyExists,
}

impl SyscallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyscallOutcome::Ok => "OK",
            SyscallOutcome::Continue => "CONTINUE",
            SyscallOutcome::ThreadTerminated => "THREAD_TERMINATED",
            SyscallOutcome::LockAcquired => "LOCK_ACQUIRED",
            SyscallOutcome::ThreadBlocked => "THREAD_BLOCKED",
            SyscallOutcome::MutexAssigned => "MUTEX_ASSIGNED",
            SyscallOutcome::MutexFree => "MUTEX_FREE",
            SyscallOutcome::ThreadDoesNotHoldMutex => "THREAD_DOES_NOT_HOLD_MUTEX",
            SyscallOutcome::AlreadyExists => "ALREADY_EXISTS",
        }
    }
}

impl fmt::Display for SyscallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SchedulerState {
    /// Fail unless `caller` is a live thread
    pub fn check_caller(&self, caller: ThreadKey) -> KernelResult<()> {
        if self.processes.get(caller.pid).is_none() {
            return Err(KernelError::ProcessNotFound(caller.pid));
        }
        if !self.processes.contains_thread(caller) {
            return Err(KernelError::ThreadNotFound(caller.pid, caller.tid));
        }
        Ok(())
    }

    /// THREAD_JOIN: block until `target` exits, or continue if it is gone
    pub fn sys_thread_join(&mut self, caller: ThreadKey, target: Tid) -> SyscallOutcome {
        let target_key = ThreadKey::new(caller.pid, target);
        if target == caller.tid || !self.processes.contains_thread(target_key) {
            debug!("{} join on {} continues", caller, target_key);
            return SyscallOutcome::Continue;
        }
        self.block(caller, BlockReason::Join, target.to_string());
        SyscallOutcome::Ok
    }

    /// MUTEX_CREATE
    pub fn sys_mutex_create(&mut self, caller: ThreadKey, name: &str) -> KernelResult<SyscallOutcome> {
        let process = self
            .processes
            .get_mut(caller.pid)
            .ok_or(KernelError::ProcessNotFound(caller.pid))?;
        if process.mutexes.create(name) {
            info!("## {} Mutex {} created", caller, name);
            Ok(SyscallOutcome::Ok)
        } else {
            Ok(SyscallOutcome::AlreadyExists)
        }
    }

    /// MUTEX_LOCK
    pub fn sys_mutex_lock(&mut self, caller: ThreadKey, name: &str) -> KernelResult<SyscallOutcome> {
        let holder = self
            .processes
            .get(caller.pid)
            .ok_or(KernelError::ProcessNotFound(caller.pid))?
            .mutexes
            .holder(name);

        match holder {
            None => {
                info!("## {} locked missing mutex {}", caller, name);
                self.exit_thread(caller);
                Ok(SyscallOutcome::ThreadTerminated)
            }
            Some(MutexHolder::Free) => {
                if let Some(process) = self.processes.get_mut(caller.pid) {
                    process.mutexes.assign(name, caller.tid);
                }
                Ok(SyscallOutcome::LockAcquired)
            }
            Some(MutexHolder::Held(_)) => {
                self.block(caller, BlockReason::Mutex, name);
                Ok(SyscallOutcome::ThreadBlocked)
            }
        }
    }

    /// MUTEX_UNLOCK: hand the mutex to the oldest waiter or free it
    pub fn sys_mutex_unlock(&mut self, caller: ThreadKey, name: &str) -> KernelResult<SyscallOutcome> {
        let holder = self
            .processes
            .get(caller.pid)
            .ok_or(KernelError::ProcessNotFound(caller.pid))?
            .mutexes
            .holder(name);

        match holder {
            None => {
                info!("## {} unlocked missing mutex {}", caller, name);
                self.exit_thread(caller);
                Ok(SyscallOutcome::ThreadTerminated)
            }
            Some(MutexHolder::Held(tid)) if tid == caller.tid => {
                let waiter = self.blocked.take_first(|e| {
                    e.reason == BlockReason::Mutex && e.key.pid == caller.pid && e.target == name
                });
                let process = self
                    .processes
                    .get_mut(caller.pid)
                    .ok_or(KernelError::ProcessNotFound(caller.pid))?;
                match waiter {
                    Some(entry) => {
                        process.mutexes.assign(name, entry.key.tid);
                        self.make_ready(entry.key);
                        Ok(SyscallOutcome::MutexAssigned)
                    }
                    None => {
                        process.mutexes.release(name);
                        Ok(SyscallOutcome::MutexFree)
                    }
                }
            }
            Some(_) => Ok(SyscallOutcome::ThreadDoesNotHoldMutex),
        }
    }
}
