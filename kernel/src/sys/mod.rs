//! Core Kernel Services
//!
//! Provides the scheduling core:
//! - Process management
//! - Thread management
//! - Mutexes
//! - Scheduler queues and policies
//! - System calls

pub mod mutex;
pub mod process;
pub mod queues;
pub mod scheduler;
pub mod syscall;
pub mod thread;

pub use mutex::{MutexHolder, MutexTable};
pub use process::{Pid, Process, ProcessTable};
pub use queues::{Backlog, BlockReason, BlockedEntry, BlockedSet, IoQueue, IoRequest, NewProcess, ReadyQueues};
pub use scheduler::{Decision, KernelStatus, Policy, RunningSlot, SchedulerState};
pub use syscall::{Syscall, SyscallOutcome, SyscallRequest};
pub use thread::{Priority, Thread, ThreadKey, ThreadState, Tid};
