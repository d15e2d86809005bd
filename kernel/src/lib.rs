//! Kernel service of a multiprogrammed OS simulator
//!
//! The simulator is split into cooperating network services. This crate is
//! the Kernel: it owns processes and threads, schedules them onto the CPU
//! service and coordinates with the Memory service.
//!
//! # Architecture
//!
//! ```text
//!            syscalls, EVICTED
//!   ┌─────┐ ──────────────────► ┌────────┐
//!   │ CPU │                     │ Kernel │
//!   └─────┘ ◄────────────────── └────────┘
//!            DISPATCH, PREEMPT     │    ▲
//!                 ALLOCATE_*, FREE_*│    │DUMP_RESPONSE
//!                 COMPACT, DUMP     ▼    │
//!                               ┌────────┐
//!                               │ Memory │
//!                               └────────┘
//! ```
//!
//! Inside the Kernel:
//!
//! 1. **State** - process/thread registries, queues, running slot ([`sys`])
//! 2. **Syscalls** - lifecycle, mutex, join, I/O and dump handlers
//! 3. **Dispatcher** - gated loop applying FIFO, Priority or Multilevel
//! 4. **Quantum timers** - generation-stamped preemption
//! 5. **I/O worker** - single-server completion of simulated I/O
//!
//! # Example
//!
//! ```ignore
//! use kernel::prelude::*;
//!
//! let config = KernelConfig::load(path)?;
//! let cpu = RemoteCpu::new(config.cpu_addr, config.rpc_timeout);
//! let memory = RemoteMemory::new(config.memory_addr, config.rpc_timeout);
//! let kernel = Kernel::new(config, cpu, memory);
//! let tasks = kernel.start();
//! kernel.create_initial_process("init", 256, 0).await?;
//! ```

pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod io;
pub mod rpc;
pub mod service;
pub mod sys;

pub use collab::{AllocationStatus, CpuEngine, EvictionReason, MemoryEngine, PreemptReason};
pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use service::{Kernel, KernelTasks};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        rpc::{RemoteCpu, RemoteMemory, RpcClient, RpcServer},
        sys::{Pid, Policy, Priority, SyscallOutcome, ThreadKey, Tid},
        AllocationStatus, CpuEngine, EvictionReason, Kernel, KernelConfig, KernelError,
        KernelResult, KernelTasks, MemoryEngine, PreemptReason,
    };
}

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// PID of the process created at boot
pub const INITIAL_PID: sys::Pid = 1;

/// TID of the first thread of every process
pub const MAIN_TID: sys::Tid = 0;
