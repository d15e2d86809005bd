//! Dispatcher and quantum timers
//!
//! The dispatcher sleeps on the wake gate. Each wake re-derives the next
//! action from the scheduler state, so it does not matter which event
//! caused it or how many wakes were coalesced.
//!
//! Dispatch RPCs are sent from their own task because the CPU may keep the
//! request open while it executes the thread.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::collab::{CpuEngine, MemoryEngine, PreemptReason};
use crate::service::Kernel;
use crate::sys::{Decision, ThreadKey};

impl<C: CpuEngine, M: MemoryEngine> Kernel<C, M> {
    /// Dispatcher loop; runs until the task is aborted
    pub(crate) async fn run_dispatcher(self: Arc<Self>) {
        debug!("Dispatcher started");
        loop {
            self.gate.wait().await;

            match self.locked(|s| s.decide()) {
                Decision::Idle => {
                    trace!("Nothing to dispatch");
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
                Decision::Wait => {}
                Decision::Dispatch {
                    key,
                    generation,
                    quantum,
                } => {
                    info!("## {} - Dispatched to CPU", key);
                    self.send_dispatch(key, generation);
                    if let Some(quantum) = quantum {
                        self.start_quantum_timer(generation, quantum);
                    }
                }
                Decision::Preempt { key, generation } => {
                    debug!("Requesting priority preemption of {} (generation {})", key, generation);
                    if let Err(err) = self.cpu.preempt(key.pid, key.tid, PreemptReason::Priority).await {
                        warn!("Priority preemption of {} not delivered: {}", key, err);
                    }
                }
            }
        }
    }

    fn send_dispatch(self: &Arc<Self>, key: ThreadKey, generation: u64) {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = kernel.cpu.dispatch(key.pid, key.tid).await {
                error!("Dispatch of {} failed: {}", key, err);
                // Back to ready without a wake, so a dead CPU is not retried in a loop
                kernel.locked(|s| s.dispatch_failed(key, generation));
            }
        });
    }

    /// Preempt the thread dispatched as `generation` once `quantum` elapses
    pub(crate) fn start_quantum_timer(self: &Arc<Self>, generation: u64, quantum: Duration) {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(quantum).await;
            kernel.quantum_expired(generation).await;
        });
    }

    async fn quantum_expired(&self, generation: u64) {
        let Some(key) = self.with_state(|s| s.quantum_expired(generation)) else {
            trace!("Stale quantum timer for generation {}", generation);
            return;
        };

        info!("## {} - Quantum expired", key);
        if let Err(err) = self
            .cpu
            .preempt(key.pid, key.tid, PreemptReason::QuantumExpired)
            .await
        {
            warn!("Quantum preemption of {} not delivered: {}", key, err);
        }
    }
}
