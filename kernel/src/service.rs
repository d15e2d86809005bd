//! Kernel service
//!
//! [`Kernel`] ties the scheduler state to the CPU and Memory collaborators.
//! It serves syscalls, eviction notices and dump replies, and runs two
//! background tasks: the dispatcher and the I/O worker.
//!
//! All scheduler state sits behind one `parking_lot::Mutex`. The lock is
//! only ever taken inside [`Kernel::locked`], a synchronous helper, so no
//! guard can live across an `.await`. Handlers follow the same shape:
//! lock, mutate, compute what must be sent, unlock, then talk to the
//! collaborators.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collab::{AllocationStatus, CpuEngine, EvictionReason, MemoryEngine};
use crate::config::KernelConfig;
use crate::gate::WakeGate;
use crate::sys::{
    BlockReason, KernelStatus, NewProcess, Pid, Priority, SchedulerState, Syscall,
    SyscallOutcome, SyscallRequest, ThreadKey, Tid,
};
use crate::KernelResult;

/// Handles of the background tasks
#[derive(Debug)]
pub struct KernelTasks {
    pub dispatcher: JoinHandle<()>,
    pub io_worker: JoinHandle<()>,
}

impl KernelTasks {
    /// Stop both background tasks
    pub fn shutdown(self) {
        self.dispatcher.abort();
        self.io_worker.abort();
    }
}

/// The Kernel service
pub struct Kernel<C, M> {
    pub(crate) config: KernelConfig,
    state: Mutex<SchedulerState>,
    pub(crate) gate: WakeGate,
    pub(crate) cpu: C,
    pub(crate) memory: M,
    /// Held while the backlog is being admitted
    backlog_admission: tokio::sync::Mutex<()>,
}

impl<C: CpuEngine, M: MemoryEngine> Kernel<C, M> {
    /// Create a kernel; background tasks start with [`Kernel::start`]
    pub fn new(config: KernelConfig, cpu: C, memory: M) -> Arc<Self> {
        info!(
            "Kernel using {} scheduling (quantum {:?})",
            config.scheduler_algorithm, config.quantum
        );
        Arc::new(Self {
            state: Mutex::new(SchedulerState::new(config.scheduler_algorithm, config.quantum)),
            config,
            gate: WakeGate::new(),
            cpu,
            memory,
            backlog_admission: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn the dispatcher and the I/O worker
    pub fn start(self: &Arc<Self>) -> KernelTasks {
        KernelTasks {
            dispatcher: tokio::spawn(Arc::clone(self).run_dispatcher()),
            io_worker: tokio::spawn(Arc::clone(self).run_io_worker()),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Run `f` with exclusive access to the scheduler state
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Inspect the scheduler state
    pub fn with_state<R>(&self, f: impl FnOnce(&SchedulerState) -> R) -> R {
        let state = self.state.lock();
        f(&state)
    }

    /// Snapshot served by `KERNEL_STATUS`
    pub fn status(&self) -> KernelStatus {
        self.with_state(SchedulerState::snapshot)
    }

    /// Check the scheduler invariants
    pub fn verify(&self) -> KernelResult<()> {
        self.with_state(SchedulerState::verify)
    }

    /// Signal the dispatcher that a decision may be pending
    pub fn wake(&self) {
        self.gate.wake();
    }

    // ========== Entry Points ==========

    /// Create the first process, as a PROCESS_CREATE nobody issued
    pub async fn create_initial_process(
        &self,
        path: &str,
        size: u32,
        priority: Priority,
    ) -> KernelResult<Pid> {
        self.process_create(None, path, size, priority).await
    }

    /// Serve one syscall and return its literal outcome
    pub async fn handle_syscall(&self, request: SyscallRequest) -> KernelResult<SyscallOutcome> {
        let SyscallRequest { caller, call } = request;
        info!("## {} - Requested syscall: {}", caller, call.name());
        self.with_state(|s| s.check_caller(caller))?;

        let outcome = match call {
            Syscall::ProcessCreate {
                path,
                size,
                priority,
            } => {
                self.process_create(Some(caller), &path, size, priority).await?;
                SyscallOutcome::Ok
            }
            Syscall::ProcessExit => {
                self.process_exit(caller.pid, Some(caller)).await;
                SyscallOutcome::Ok
            }
            Syscall::ThreadCreate { path, priority } => {
                self.thread_create(caller, &path, priority).await?;
                SyscallOutcome::Ok
            }
            Syscall::ThreadJoin { target } => self.locked(|s| s.sys_thread_join(caller, target)),
            Syscall::ThreadCancel { target } => {
                self.thread_exit(ThreadKey::new(caller.pid, target), caller).await;
                SyscallOutcome::Ok
            }
            Syscall::ThreadExit => {
                self.thread_exit(caller, caller).await;
                SyscallOutcome::Ok
            }
            Syscall::MutexCreate { name } => self.locked(|s| s.sys_mutex_create(caller, &name))?,
            Syscall::MutexLock { name } => {
                let outcome = self.locked(|s| s.sys_mutex_lock(caller, &name))?;
                self.after_termination(caller, outcome).await;
                outcome
            }
            Syscall::MutexUnlock { name } => {
                let outcome = self.locked(|s| s.sys_mutex_unlock(caller, &name))?;
                self.after_termination(caller, outcome).await;
                outcome
            }
            Syscall::Io { duration } => {
                self.locked(|s| s.request_io(caller, duration));
                SyscallOutcome::Ok
            }
            Syscall::DumpMemory => {
                self.request_dump(caller).await;
                SyscallOutcome::Ok
            }
        };

        self.gate.wake();
        Ok(outcome)
    }

    /// The CPU stopped executing `(pid, tid)`
    pub async fn handle_eviction(&self, pid: Pid, tid: Tid, reason: EvictionReason) {
        let key = ThreadKey::new(pid, tid);
        info!("## {} - Evicted by {}", key, reason);

        match reason {
            EvictionReason::SegmentationFault => {
                self.process_exit(pid, None).await;
            }
            EvictionReason::QuantumExpired | EvictionReason::Priority => {
                if self.locked(|s| s.requeue_evicted(key)) {
                    self.gate.wake();
                } else {
                    debug!("Ignoring eviction of {}, it is not running", key);
                }
            }
        }
    }

    /// Memory finished the dump requested by `(pid, tid)`
    pub async fn handle_dump_result(&self, pid: Pid, tid: Tid, success: bool) {
        let key = ThreadKey::new(pid, tid);
        let found = self.locked(|s| {
            if success {
                s.unblock(key, BlockReason::Dump)
            } else {
                s.blocked
                    .iter()
                    .any(|e| e.key == key && e.reason == BlockReason::Dump)
            }
        });

        if !found {
            debug!("Ignoring dump result for {}, it is not waiting", key);
            return;
        }
        if success {
            info!("## {} finished DUMP and moves to READY", key);
            self.gate.wake();
        } else {
            warn!("Dump of {} failed, terminating process {}", key, pid);
            self.process_exit(pid, None).await;
        }
    }

    // ========== Process Lifecycle ==========

    async fn process_create(
        &self,
        caller: Option<ThreadKey>,
        path: &str,
        size: u32,
        priority: Priority,
    ) -> KernelResult<Pid> {
        let (entry, deferred) = self.locked(|s| {
            let pid = s.processes.create_process(path, size);
            let entry = NewProcess {
                pid,
                path: path.to_string(),
                size,
                priority,
            };
            let deferred = !s.backlog.is_empty();
            if deferred {
                s.backlog.push(entry.clone());
            }
            (entry, deferred)
        });
        let pid = entry.pid;
        info!("## ({}:0) Process created - State: NEW", pid);

        if deferred {
            debug!("Process {} queued behind the backlog", pid);
            return Ok(pid);
        }

        match self.admit(&entry, caller).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Process {} waits for memory", pid);
                self.locked(|s| s.backlog.push(entry));
            }
            Err(err) => {
                warn!("Process {} abandoned: {}", pid, err);
                if let Err(err) = self.locked(|s| s.processes.remove_process(pid)) {
                    warn!("Could not drop process {}: {}", pid, err);
                }
            }
        }
        Ok(pid)
    }

    /// Ask Memory for a partition, compacting once if it asks for it.
    /// On success the main thread is made ready.
    async fn admit(&self, entry: &NewProcess, caller: Option<ThreadKey>) -> KernelResult<bool> {
        let mut status = self
            .memory
            .allocate_process(entry.pid, &entry.path, entry.size)
            .await?;

        if status == AllocationStatus::NeedsCompaction {
            status = self.compact_and_retry(entry, caller).await?;
        }
        if status != AllocationStatus::Ok {
            return Ok(false);
        }

        self.locked(|s| {
            s.backlog.remove_pid(entry.pid);
            s.create_main_thread(entry.pid, entry.priority)
        })?;
        self.gate.wake();
        Ok(true)
    }

    /// Idle the machine, compact, and retry the allocation exactly once
    async fn compact_and_retry(
        &self,
        entry: &NewProcess,
        caller: Option<ThreadKey>,
    ) -> KernelResult<AllocationStatus> {
        self.locked(|s| s.begin_compaction());
        info!("Compaction needed to fit process {}", entry.pid);

        while !self.with_state(|s| s.is_idle_for(caller)) {
            tokio::time::sleep(self.config.compaction_poll_interval).await;
        }

        let result = match self.memory.compact().await {
            Ok(()) => {
                info!("Memory compacted, retrying process {}", entry.pid);
                self.memory
                    .allocate_process(entry.pid, &entry.path, entry.size)
                    .await
            }
            Err(err) => Err(err),
        };

        self.locked(|s| s.end_compaction());
        self.gate.wake();
        result
    }

    async fn process_exit(&self, pid: Pid, caller: Option<ThreadKey>) {
        if !self.locked(|s| s.exit_process(pid)) {
            debug!("Process {} already gone", pid);
            return;
        }
        self.gate.wake();

        if let Err(err) = self.memory.free_process(pid).await {
            warn!("Memory did not free process {}: {}", pid, err);
        }
        self.retry_backlog(caller).await;
    }

    /// Admit backlogged processes in order until one does not fit
    async fn retry_backlog(&self, caller: Option<ThreadKey>) {
        let Ok(_admission) = self.backlog_admission.try_lock() else {
            debug!("Backlog admission already in progress");
            return;
        };

        while let Some(entry) = self.with_state(|s| s.backlog.front().cloned()) {
            match self.admit(&entry, caller).await {
                Ok(true) => info!("Process {} admitted from backlog", entry.pid),
                Ok(false) => break,
                Err(err) => {
                    warn!("Backlog admission of process {} failed: {}", entry.pid, err);
                    break;
                }
            }
        }
    }

    // ========== Thread Lifecycle ==========

    async fn thread_create(&self, caller: ThreadKey, path: &str, priority: Priority) -> KernelResult<()> {
        let tid = self.locked(|s| s.processes.reserve_tid(caller.pid))?;

        if let Err(err) = self.memory.allocate_thread(caller.pid, tid, path).await {
            warn!("Thread ({}:{}) abandoned: {}", caller.pid, tid, err);
            return Ok(());
        }

        if let Err(err) = self.locked(|s| s.admit_thread(caller.pid, tid, priority)) {
            warn!("Thread ({}:{}) not admitted: {}", caller.pid, tid, err);
        }
        Ok(())
    }

    async fn thread_exit(&self, key: ThreadKey, caller: ThreadKey) {
        if !self.locked(|s| s.exit_thread(key)) {
            debug!("Thread {} already gone", key);
            return;
        }
        self.gate.wake();
        self.release_thread(key, caller).await;
    }

    /// Finish a thread a mutex syscall terminated
    async fn after_termination(&self, caller: ThreadKey, outcome: SyscallOutcome) {
        if outcome == SyscallOutcome::ThreadTerminated {
            self.gate.wake();
            self.release_thread(caller, caller).await;
        }
    }

    async fn release_thread(&self, key: ThreadKey, caller: ThreadKey) {
        if let Err(err) = self.memory.free_thread(key.pid, key.tid).await {
            warn!("Memory did not free thread {}: {}", key, err);
        }
        self.retry_backlog(Some(caller)).await;
    }

    // ========== Dumps ==========

    async fn request_dump(&self, caller: ThreadKey) {
        self.locked(|s| s.block(caller, BlockReason::Dump, ""));
        self.gate.wake();

        if let Err(err) = self.memory.request_dump(caller.pid, caller.tid).await {
            warn!("Dump request of {} failed: {}", caller, err);
            self.handle_dump_result(caller.pid, caller.tid, false).await;
        }
    }
}
