//! CPU and Memory collaborators
//!
//! The Kernel drives two external services. Both are abstracted behind
//! traits so the scheduler runs the same against the JSON-RPC clients in
//! [`crate::rpc::client`] and against in-process doubles.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::sys::{Pid, Tid};
use crate::KernelResult;

/// Why the Kernel asks the CPU to stop a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreemptReason {
    QuantumExpired,
    Priority,
}

impl fmt::Display for PreemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreemptReason::QuantumExpired => write!(f, "QUANTUM_EXPIRED"),
            PreemptReason::Priority => write!(f, "PRIORITY"),
        }
    }
}

/// Why the CPU stopped executing a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionReason {
    QuantumExpired,
    SegmentationFault,
    Priority,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::QuantumExpired => write!(f, "QUANTUM_EXPIRED"),
            EvictionReason::SegmentationFault => write!(f, "SEGMENTATION_FAULT"),
            EvictionReason::Priority => write!(f, "PRIORITY"),
        }
    }
}

/// Answer of Memory to a process allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Ok,
    InsufficientSpace,
    NeedsCompaction,
}

/// The CPU service
pub trait CpuEngine: Send + Sync + 'static {
    /// Start executing a thread
    fn dispatch(&self, pid: Pid, tid: Tid) -> impl Future<Output = KernelResult<()>> + Send;

    /// Ask the CPU to evict the thread it is running
    fn preempt(
        &self,
        pid: Pid,
        tid: Tid,
        reason: PreemptReason,
    ) -> impl Future<Output = KernelResult<()>> + Send;
}

/// The Memory service
pub trait MemoryEngine: Send + Sync + 'static {
    /// Reserve a partition and load the process image
    fn allocate_process(
        &self,
        pid: Pid,
        path: &str,
        size: u32,
    ) -> impl Future<Output = KernelResult<AllocationStatus>> + Send;

    fn free_process(&self, pid: Pid) -> impl Future<Output = KernelResult<()>> + Send;

    /// Load the pseudocode of a new thread
    fn allocate_thread(
        &self,
        pid: Pid,
        tid: Tid,
        path: &str,
    ) -> impl Future<Output = KernelResult<()>> + Send;

    fn free_thread(&self, pid: Pid, tid: Tid) -> impl Future<Output = KernelResult<()>> + Send;

    /// Merge free partitions; the CPU must be idle
    fn compact(&self) -> impl Future<Output = KernelResult<()>> + Send;

    /// Request a dump; the result arrives later as a dump response
    fn request_dump(&self, pid: Pid, tid: Tid) -> impl Future<Output = KernelResult<()>> + Send;
}
