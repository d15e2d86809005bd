//! I/O completion worker
//!
//! A single server: requests are retired one at a time in arrival order,
//! each after sleeping for its simulated duration.

use std::sync::Arc;

use tracing::{debug, info};

use crate::collab::{CpuEngine, MemoryEngine};
use crate::service::Kernel;
use crate::sys::BlockReason;

impl<C: CpuEngine, M: MemoryEngine> Kernel<C, M> {
    /// I/O worker loop; runs until the task is aborted
    pub(crate) async fn run_io_worker(self: Arc<Self>) {
        debug!("I/O worker started");
        loop {
            let Some(request) = self.locked(|s| s.io.pop()) else {
                tokio::time::sleep(self.config.io_poll_interval).await;
                continue;
            };

            debug!("Serving I/O of {} for {:?}", request.key, request.duration);
            tokio::time::sleep(request.duration).await;

            if self.locked(|s| s.unblock(request.key, BlockReason::Io)) {
                info!("## {} finished IO and moves to READY", request.key);
                self.gate.wake();
            } else {
                debug!("I/O of {} completed after it left", request.key);
            }
        }
    }
}
