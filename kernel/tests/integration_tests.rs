//! Integration tests for the kernel service
//!
//! The CPU and Memory collaborators are replaced by recording doubles, and
//! the clock is paused so quantum timers and I/O durations are exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kernel::prelude::*;
use kernel::sys::{MutexHolder, Syscall, SyscallRequest, ThreadState};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Dispatch(ThreadKey),
    Preempt(ThreadKey, PreemptReason),
    AllocateProcess(Pid),
    FreeProcess(Pid),
    AllocateThread(ThreadKey),
    FreeThread(ThreadKey),
    Compact,
    Dump(ThreadKey),
}

type Events = Arc<Mutex<Vec<Event>>>;

fn key(pid: Pid, tid: Tid) -> ThreadKey {
    ThreadKey::new(pid, tid)
}

fn offline(service: &'static str) -> KernelError {
    KernelError::CollaboratorUnavailable(service, "offline".into())
}

struct TestCpu {
    events: Events,
    fail_dispatch: AtomicBool,
}

impl CpuEngine for TestCpu {
    async fn dispatch(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.events.lock().push(Event::Dispatch(key(pid, tid)));
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(offline("cpu"));
        }
        Ok(())
    }

    async fn preempt(&self, pid: Pid, tid: Tid, reason: PreemptReason) -> KernelResult<()> {
        self.events.lock().push(Event::Preempt(key(pid, tid), reason));
        Ok(())
    }
}

struct TestMemory {
    events: Events,
    /// Scripted allocation answers; `None` fails the call, an empty queue answers OK
    allocations: Mutex<VecDeque<Option<AllocationStatus>>>,
    fail_thread_allocation: AtomicBool,
    fail_dump: AtomicBool,
}

impl TestMemory {
    fn script(&self, replies: impl IntoIterator<Item = Option<AllocationStatus>>) {
        self.allocations.lock().extend(replies);
    }
}

impl MemoryEngine for TestMemory {
    async fn allocate_process(&self, pid: Pid, _path: &str, _size: u32) -> KernelResult<AllocationStatus> {
        self.events.lock().push(Event::AllocateProcess(pid));
        let reply = self
            .allocations
            .lock()
            .pop_front()
            .unwrap_or(Some(AllocationStatus::Ok));
        reply.ok_or_else(|| offline("memory"))
    }

    async fn free_process(&self, pid: Pid) -> KernelResult<()> {
        self.events.lock().push(Event::FreeProcess(pid));
        Ok(())
    }

    async fn allocate_thread(&self, pid: Pid, tid: Tid, _path: &str) -> KernelResult<()> {
        self.events.lock().push(Event::AllocateThread(key(pid, tid)));
        if self.fail_thread_allocation.load(Ordering::SeqCst) {
            return Err(offline("memory"));
        }
        Ok(())
    }

    async fn free_thread(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.events.lock().push(Event::FreeThread(key(pid, tid)));
        Ok(())
    }

    async fn compact(&self) -> KernelResult<()> {
        self.events.lock().push(Event::Compact);
        Ok(())
    }

    async fn request_dump(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.events.lock().push(Event::Dump(key(pid, tid)));
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(offline("memory"));
        }
        Ok(())
    }
}

struct Harness {
    kernel: Arc<Kernel<TestCpu, TestMemory>>,
    tasks: KernelTasks,
    events: Events,
}

impl Harness {
    fn start(config: KernelConfig) -> Self {
        let events = Events::default();
        let cpu = TestCpu {
            events: events.clone(),
            fail_dispatch: AtomicBool::new(false),
        };
        let memory = TestMemory {
            events: events.clone(),
            allocations: Mutex::new(VecDeque::new()),
            fail_thread_allocation: AtomicBool::new(false),
            fail_dump: AtomicBool::new(false),
        };
        let kernel = Kernel::new(config, cpu, memory);
        let tasks = kernel.start();
        Self {
            kernel,
            tasks,
            events,
        }
    }

    /// Start a kernel whose initial process (PID 1) is already running
    async fn boot(policy: Policy, priority: Priority) -> Self {
        Self::boot_with(KernelConfig::with_policy(policy), priority).await
    }

    async fn boot_with(config: KernelConfig, priority: Priority) -> Self {
        let harness = Self::start(config);
        let pid = harness
            .kernel
            .create_initial_process("init", 64, priority)
            .await
            .unwrap();
        assert_eq!(pid, kernel::INITIAL_PID);
        settle().await;
        assert_eq!(harness.running(), Some(key(1, 0)));
        harness
    }

    async fn call(&self, caller: ThreadKey, call: Syscall) -> SyscallOutcome {
        self.kernel
            .handle_syscall(SyscallRequest { caller, call })
            .await
            .unwrap()
    }

    async fn spawn_thread(&self, caller: ThreadKey, priority: Priority) -> SyscallOutcome {
        let call = Syscall::ThreadCreate {
            path: "worker".into(),
            priority,
        };
        self.call(caller, call).await
    }

    fn running(&self) -> Option<ThreadKey> {
        self.kernel.status().running.map(|slot| slot.key)
    }

    fn state(&self, key: ThreadKey) -> Option<ThreadState> {
        self.kernel.with_state(|s| s.state_of(key))
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn dispatches(&self) -> Vec<ThreadKey> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Dispatch(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    fn preemptions(&self) -> Vec<(ThreadKey, PreemptReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Preempt(key, reason) => Some((key, reason)),
                _ => None,
            })
            .collect()
    }

    fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    /// Check the invariants and stop the background tasks
    fn finish(self) {
        self.kernel.verify().unwrap();
        self.tasks.shutdown();
    }
}

/// Let the dispatcher and the I/O worker catch up
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

mod fifo_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_threads_run_in_arrival_order() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        assert_eq!(h.spawn_thread(key(1, 0), 0).await, SyscallOutcome::Ok);
        assert_eq!(h.spawn_thread(key(1, 0), 0).await, SyscallOutcome::Ok);
        settle().await;
        // The creator keeps the CPU
        assert_eq!(h.running(), Some(key(1, 0)));
        assert_eq!(h.state(key(1, 1)), Some(ThreadState::Ready));

        h.call(key(1, 0), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));

        h.call(key(1, 1), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 2)));

        assert_eq!(h.dispatches(), vec![key(1, 0), key(1, 1), key(1, 2)]);
        assert!(h.events().contains(&Event::AllocateThread(key(1, 2))));
        assert!(h.events().contains(&Event::FreeThread(key(1, 1))));
        assert_eq!(h.kernel.status().exited, vec![key(1, 0), key(1, 1)]);
        assert!(h.preemptions().is_empty());
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_requeues_at_tail() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        h.kernel
            .handle_eviction(1, 0, EvictionReason::QuantumExpired)
            .await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Ready));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_eviction_is_ignored() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        // (1:1) is ready, not running
        h.kernel
            .handle_eviction(1, 1, EvictionReason::QuantumExpired)
            .await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 0)));
        assert_eq!(h.kernel.status().ready.len(), 1);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispatch_returns_thread_to_ready() {
        let h = Harness::start(KernelConfig::with_policy(Policy::Fifo));
        h.kernel.cpu().fail_dispatch.store(true, Ordering::SeqCst);

        h.kernel.create_initial_process("init", 64, 0).await.unwrap();
        settle().await;

        assert_eq!(h.running(), None);
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Ready));
        // No wake after the failure, so no retry loop
        assert_eq!(h.dispatches(), vec![key(1, 0)]);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_caller_is_rejected() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        let err = h
            .kernel
            .handle_syscall(SyscallRequest {
                caller: key(9, 0),
                call: Syscall::ThreadExit,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ProcessNotFound(9)));

        let err = h
            .kernel
            .handle_syscall(SyscallRequest {
                caller: key(1, 4),
                call: Syscall::ThreadExit,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ThreadNotFound(1, 4)));
        h.finish();
    }
}

mod priority_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_more_urgent_thread_preempts_once() {
        let h = Harness::boot(Policy::Priority, 3).await;

        h.spawn_thread(key(1, 0), 1).await;
        settle().await;
        assert_eq!(h.preemptions(), vec![(key(1, 0), PreemptReason::Priority)]);

        // Still waiting on the CPU; no second notice for the same dispatch
        h.spawn_thread(key(1, 0), 2).await;
        settle().await;
        assert_eq!(h.preemptions().len(), 1);
        assert_eq!(h.running(), Some(key(1, 0)));

        h.kernel.handle_eviction(1, 0, EvictionReason::Priority).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));
        assert_eq!(h.dispatches(), vec![key(1, 0), key(1, 1)]);

        // Lowest value first once (1:1) leaves
        h.call(key(1, 1), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 2)));
        assert_eq!(h.preemptions().len(), 1);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_less_urgent_thread_waits() {
        let h = Harness::boot(Policy::Priority, 1).await;

        h.spawn_thread(key(1, 0), 1).await;
        h.spawn_thread(key(1, 0), 4).await;
        settle().await;
        assert!(h.preemptions().is_empty());
        assert_eq!(h.running(), Some(key(1, 0)));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_multilevel_preempts_for_lower_bucket() {
        let h = Harness::boot(Policy::Multilevel, 2).await;

        h.spawn_thread(key(1, 0), 0).await;
        settle().await;
        assert_eq!(h.preemptions(), vec![(key(1, 0), PreemptReason::Priority)]);

        h.kernel.handle_eviction(1, 0, EvictionReason::Priority).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));
        let status = h.kernel.status();
        assert_eq!(status.ready.len(), 1);
        assert_eq!(status.ready[0].bucket, 2);
        h.finish();
    }
}

mod quantum_tests {
    use super::*;

    fn multilevel(quantum_ms: u64) -> KernelConfig {
        KernelConfig {
            quantum: Duration::from_millis(quantum_ms),
            ..KernelConfig::with_policy(Policy::Multilevel)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantum_expiry_rotates_bucket() {
        let h = Harness::boot_with(multilevel(100), 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.preemptions(), vec![(key(1, 0), PreemptReason::QuantumExpired)]);

        h.kernel
            .handle_eviction(1, 0, EvictionReason::QuantumExpired)
            .await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Ready));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_preempt() {
        // (1:0) dispatched around t=0 with its timer at t=100
        let h = Harness::boot_with(multilevel(100), 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        // (1:0) leaves at t=50; (1:1) gets a fresh quantum until t=150
        tokio::time::sleep(Duration::from_millis(30)).await;
        let io = Syscall::Io {
            duration: Duration::from_secs(10),
        };
        h.call(key(1, 0), io).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.preemptions().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.preemptions(), vec![(key(1, 1), PreemptReason::QuantumExpired)]);
        h.finish();
    }
}

mod mutex_tests {
    use super::*;

    fn holder(h: &Harness, name: &str) -> Option<MutexHolder> {
        h.kernel
            .with_state(|s| s.processes.get(1).and_then(|p| p.mutexes.holder(name)))
    }

    fn mutex(name: &str) -> (Syscall, Syscall, Syscall) {
        (
            Syscall::MutexCreate { name: name.into() },
            Syscall::MutexLock { name: name.into() },
            Syscall::MutexUnlock { name: name.into() },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_hands_mutex_to_waiter() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        let (create, lock, unlock) = mutex("m");

        h.spawn_thread(key(1, 0), 0).await;
        assert_eq!(h.call(key(1, 0), create.clone()).await, SyscallOutcome::Ok);
        assert_eq!(h.call(key(1, 0), create).await, SyscallOutcome::AlreadyExists);
        assert_eq!(h.call(key(1, 0), lock.clone()).await, SyscallOutcome::LockAcquired);
        assert_eq!(h.running(), Some(key(1, 0)));

        h.kernel
            .handle_eviction(1, 0, EvictionReason::QuantumExpired)
            .await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));

        assert_eq!(h.call(key(1, 1), lock).await, SyscallOutcome::ThreadBlocked);
        settle().await;
        assert_eq!(h.state(key(1, 1)), Some(ThreadState::Blocked));
        assert_eq!(h.running(), Some(key(1, 0)));

        assert_eq!(h.call(key(1, 0), unlock.clone()).await, SyscallOutcome::MutexAssigned);
        assert_eq!(holder(&h, "m"), Some(MutexHolder::Held(1)));
        assert_eq!(h.state(key(1, 1)), Some(ThreadState::Ready));

        // No longer the holder
        assert_eq!(
            h.call(key(1, 0), unlock.clone()).await,
            SyscallOutcome::ThreadDoesNotHoldMutex
        );

        h.call(key(1, 0), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 1)));
        assert_eq!(h.call(key(1, 1), unlock).await, SyscallOutcome::MutexFree);
        assert_eq!(holder(&h, "m"), Some(MutexHolder::Free));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_hands_over_held_mutex() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        let (create, lock, _) = mutex("m");

        h.spawn_thread(key(1, 0), 0).await;
        h.call(key(1, 0), create).await;
        h.call(key(1, 0), lock.clone()).await;
        h.kernel
            .handle_eviction(1, 0, EvictionReason::QuantumExpired)
            .await;
        settle().await;
        h.call(key(1, 1), lock).await;
        settle().await;

        h.call(key(1, 0), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(holder(&h, "m"), Some(MutexHolder::Held(1)));
        assert_eq!(h.running(), Some(key(1, 1)));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_mutex_terminates_caller() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        let (_, lock, _) = mutex("ghost");
        assert_eq!(h.call(key(1, 0), lock).await, SyscallOutcome::ThreadTerminated);
        settle().await;

        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Exited));
        assert!(h.events().contains(&Event::FreeThread(key(1, 0))));
        assert_eq!(h.running(), Some(key(1, 1)));

        let (_, _, unlock) = mutex("ghost");
        assert_eq!(h.call(key(1, 1), unlock).await, SyscallOutcome::ThreadTerminated);
        h.finish();
    }
}

mod join_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_join_on_missing_thread_continues() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        let outcome = h.call(key(1, 0), Syscall::ThreadJoin { target: 7 }).await;
        assert_eq!(outcome, SyscallOutcome::Continue);
        let outcome = h.call(key(1, 0), Syscall::ThreadJoin { target: 0 }).await;
        assert_eq!(outcome, SyscallOutcome::Continue);

        settle().await;
        assert_eq!(h.running(), Some(key(1, 0)));
        assert_eq!(h.dispatches(), vec![key(1, 0)]);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_blocks_until_target_exits() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        let outcome = h.call(key(1, 0), Syscall::ThreadJoin { target: 1 }).await;
        assert_eq!(outcome, SyscallOutcome::Ok);
        settle().await;
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Blocked));
        assert_eq!(h.running(), Some(key(1, 1)));

        h.call(key(1, 1), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 0)));
        assert_eq!(h.dispatches(), vec![key(1, 0), key(1, 1), key(1, 0)]);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ready_thread() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        let outcome = h.call(key(1, 0), Syscall::ThreadCancel { target: 1 }).await;
        assert_eq!(outcome, SyscallOutcome::Ok);
        assert_eq!(h.state(key(1, 1)), Some(ThreadState::Exited));
        assert!(h.events().contains(&Event::FreeThread(key(1, 1))));
        assert_eq!(h.running(), Some(key(1, 0)));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_thread_allocation_burns_tid() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        h.kernel
            .memory()
            .fail_thread_allocation
            .store(true, Ordering::SeqCst);
        assert_eq!(h.spawn_thread(key(1, 0), 0).await, SyscallOutcome::Ok);
        assert_eq!(h.state(key(1, 1)), None);

        h.kernel
            .memory()
            .fail_thread_allocation
            .store(false, Ordering::SeqCst);
        h.spawn_thread(key(1, 0), 0).await;
        assert_eq!(h.state(key(1, 2)), Some(ThreadState::Ready));
        h.finish();
    }
}

mod io_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_io_blocks_then_readies() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        let io = Syscall::Io {
            duration: Duration::from_millis(100),
        };
        assert_eq!(h.call(key(1, 0), io).await, SyscallOutcome::Ok);
        settle().await;
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Blocked));
        assert_eq!(h.running(), Some(key(1, 1)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Ready));
        assert!(h.kernel.status().io_pending.is_empty());

        h.call(key(1, 1), Syscall::ThreadExit).await;
        settle().await;
        assert_eq!(h.dispatches(), vec![key(1, 0), key(1, 1), key(1, 0)]);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_served_one_at_a_time() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;
        let io = Syscall::Io {
            duration: Duration::from_millis(100),
        };

        h.call(key(1, 0), io.clone()).await;
        settle().await;
        h.call(key(1, 1), io).await;

        // (1:0) done around t=130, (1:1) waits behind it
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.state(key(1, 1)), Some(ThreadState::Blocked));
        assert_ne!(h.state(key(1, 0)), Some(ThreadState::Blocked));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(h.state(key(1, 1)), Some(ThreadState::Blocked));
        h.finish();
    }
}

mod memory_tests {
    use super::*;

    fn create(path: &str) -> Syscall {
        Syscall::ProcessCreate {
            path: path.into(),
            size: 32,
            priority: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_compaction_for_running_caller() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.kernel
            .memory()
            .script([Some(AllocationStatus::NeedsCompaction)]);

        assert_eq!(h.call(key(1, 0), create("p2")).await, SyscallOutcome::Ok);
        assert_eq!(
            h.events()
                .into_iter()
                .filter(|e| matches!(e, Event::AllocateProcess(2) | Event::Compact))
                .collect::<Vec<_>>(),
            vec![Event::AllocateProcess(2), Event::Compact, Event::AllocateProcess(2)]
        );
        assert!(!h.kernel.status().pending_compaction);
        assert_eq!(h.state(key(2, 0)), Some(ThreadState::Ready));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_compaction_waits_for_idle_cpu() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.kernel
            .memory()
            .script([Some(AllocationStatus::NeedsCompaction)]);

        let kernel = Arc::clone(&h.kernel);
        let creating = tokio::spawn(async move { kernel.create_initial_process("big", 128, 0).await });
        settle().await;
        assert!(h.kernel.status().pending_compaction);
        assert_eq!(h.position(&Event::Compact), None);

        h.call(key(1, 0), Syscall::ThreadExit).await;
        assert_eq!(creating.await.unwrap().unwrap(), 2);
        settle().await;

        let compacted = h.position(&Event::Compact).unwrap();
        let dispatched = h.position(&Event::Dispatch(key(2, 0))).unwrap();
        assert!(compacted < dispatched);
        assert!(!h.kernel.status().pending_compaction);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_admitted_after_exit() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.kernel
            .memory()
            .script([Some(AllocationStatus::InsufficientSpace)]);

        assert_eq!(h.call(key(1, 0), create("p2")).await, SyscallOutcome::Ok);
        // Queued behind p2 without asking Memory
        assert_eq!(h.call(key(1, 0), create("p3")).await, SyscallOutcome::Ok);
        assert_eq!(h.kernel.status().backlog, vec![2, 3]);
        assert_eq!(h.position(&Event::AllocateProcess(3)), None);

        assert_eq!(h.call(key(1, 0), Syscall::ProcessExit).await, SyscallOutcome::Ok);
        settle().await;

        let status = h.kernel.status();
        assert!(status.backlog.is_empty());
        assert!(h.events().contains(&Event::FreeProcess(1)));
        assert_eq!(h.running(), Some(key(2, 0)));
        assert_eq!(h.state(key(3, 0)), Some(ThreadState::Ready));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_allocation_abandons_process() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.kernel.memory().script([None]);

        assert_eq!(h.call(key(1, 0), create("p2")).await, SyscallOutcome::Ok);
        let status = h.kernel.status();
        assert!(status.processes.iter().all(|p| p.pid != 2));
        assert!(status.backlog.is_empty());
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_blocks_until_response() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        assert_eq!(h.call(key(1, 0), Syscall::DumpMemory).await, SyscallOutcome::Ok);
        settle().await;
        assert!(h.events().contains(&Event::Dump(key(1, 0))));
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Blocked));
        assert_eq!(h.running(), None);

        h.kernel.handle_dump_result(1, 0, true).await;
        settle().await;
        assert_eq!(h.running(), Some(key(1, 0)));
        assert_eq!(h.dispatches(), vec![key(1, 0), key(1, 0)]);
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dump_ends_process() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.kernel.memory().fail_dump.store(true, Ordering::SeqCst);

        h.call(key(1, 0), Syscall::DumpMemory).await;
        settle().await;

        assert!(h.kernel.status().processes.is_empty());
        assert!(h.events().contains(&Event::FreeProcess(1)));
        assert_eq!(h.state(key(1, 0)), Some(ThreadState::Exited));
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_dump_result_ends_process() {
        let h = Harness::boot(Policy::Fifo, 0).await;

        h.call(key(1, 0), Syscall::DumpMemory).await;
        h.kernel.handle_dump_result(1, 0, false).await;
        settle().await;
        assert!(h.kernel.status().processes.is_empty());

        // A late duplicate is ignored
        h.kernel.handle_dump_result(1, 0, true).await;
        h.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_segfault_ends_process() {
        let h = Harness::boot(Policy::Fifo, 0).await;
        h.spawn_thread(key(1, 0), 0).await;

        h.kernel
            .handle_eviction(1, 0, EvictionReason::SegmentationFault)
            .await;
        settle().await;

        let status = h.kernel.status();
        assert!(status.processes.is_empty());
        assert_eq!(status.exited, vec![key(1, 0), key(1, 1)]);
        assert_eq!(status.running, None);
        assert!(h.events().contains(&Event::FreeProcess(1)));
        h.finish();
    }
}

mod rpc_tests {
    use super::*;
    use kernel::rpc::server::handle_line;
    use kernel::sys::KernelStatus;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_syscalls_over_tcp() {
        let h = Harness::start(KernelConfig::default());
        h.kernel.create_initial_process("init", 64, 0).await.unwrap();

        let mut server = RpcServer::new("127.0.0.1:0".parse().unwrap());
        let addr = server.start(Arc::clone(&h.kernel)).await.unwrap();
        let client = RpcClient::new("kernel", addr, Duration::from_secs(2));

        let outcome: String = client
            .call("MUTEX_CREATE", json!({"pid": 1, "tid": 0, "name": "m"}))
            .await
            .unwrap();
        assert_eq!(outcome, "OK");

        let outcome: String = client
            .call("THREAD_JOIN", json!({"pid": 1, "tid": 0, "target": 5}))
            .await
            .unwrap();
        assert_eq!(outcome, "CONTINUE");

        let status: KernelStatus = client.call("KERNEL_STATUS", Value::Null).await.unwrap();
        assert_eq!(status.processes.len(), 1);
        assert_eq!(status.processes[0].mutexes.get("m"), Some(&MutexHolder::Free));

        let err = client
            .call::<_, Value>("REBOOT", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("-32601"));

        let err = client
            .call::<_, Value>("MUTEX_LOCK", json!({"pid": 1}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("-32602"));

        server.stop();
        h.finish();
    }

    #[tokio::test]
    async fn test_malformed_lines() {
        let h = Harness::start(KernelConfig::default());

        let response = handle_line(&h.kernel, "not json").await;
        assert_eq!(response.error.unwrap().code, -32700);

        let response = handle_line(&h.kernel, r#"{"id": 4, "params": {}}"#).await;
        assert_eq!(response.id, 4);
        assert_eq!(response.error.unwrap().code, -32600);

        let response = handle_line(
            &h.kernel,
            r#"{"id": 5, "method": "THREAD_EXIT", "params": {"pid": 3, "tid": 0}}"#,
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32001);

        let response = handle_line(
            &h.kernel,
            r#"{"id": 6, "method": "EVICTED", "params": {"pid": 3, "tid": 0, "reason": "PRIORITY"}}"#,
        )
        .await;
        assert_eq!(response.result, Some(json!("OK")));
        h.finish();
    }
}
