//! Kernel Configuration
//!
//! Configuration of the Kernel service: where it listens, where its CPU and
//! Memory collaborators live, and which scheduling policy it runs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sys::Policy;
use crate::{KernelError, KernelResult};

/// Kernel service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Address the syscall server listens on
    pub listen_addr: SocketAddr,

    /// CPU service address
    pub cpu_addr: SocketAddr,

    /// Memory service address
    pub memory_addr: SocketAddr,

    /// Short-term scheduling policy
    pub scheduler_algorithm: Policy,

    /// Time slice under the multilevel policy
    #[serde(with = "humantime_serde")]
    pub quantum: Duration,

    /// Delay between polls of an empty I/O queue
    #[serde(with = "humantime_serde")]
    pub io_poll_interval: Duration,

    /// Pause of the dispatcher when nothing is ready
    #[serde(with = "humantime_serde")]
    pub idle_backoff: Duration,

    /// Delay between checks for an idle CPU before compacting memory
    #[serde(with = "humantime_serde")]
    pub compaction_poll_interval: Duration,

    /// Upper bound on one collaborator RPC
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Logging level
    pub log_level: String,

    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            cpu_addr: SocketAddr::from(([127, 0, 0, 1], 8004)),
            memory_addr: SocketAddr::from(([127, 0, 0, 1], 8002)),
            scheduler_algorithm: Policy::Fifo,
            quantum: Duration::from_millis(750),
            io_poll_interval: Duration::from_millis(10),
            idle_backoff: Duration::from_millis(10),
            compaction_poll_interval: Duration::from_millis(10),
            rpc_timeout: Duration::from_secs(5),
            log_level: "info".into(),
            log_file: None,
        }
    }
}

impl KernelConfig {
    /// Default configuration running `policy`
    pub fn with_policy(policy: Policy) -> Self {
        Self {
            scheduler_algorithm: policy,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| KernelError::InvalidConfiguration(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        if self.scheduler_algorithm.uses_quantum() && self.quantum.is_zero() {
            return Err(KernelError::InvalidConfiguration(
                "quantum must be non-zero under MULTILEVEL".into(),
            ));
        }

        if self.rpc_timeout.is_zero() {
            return Err(KernelError::InvalidConfiguration(
                "rpc_timeout must be non-zero".into(),
            ));
        }

        if self.listen_addr == self.cpu_addr || self.listen_addr == self.memory_addr {
            return Err(KernelError::InvalidConfiguration(format!(
                "listen address {} collides with a collaborator",
                self.listen_addr
            )));
        }

        if self.log_level.trim().is_empty() {
            return Err(KernelError::MissingConfiguration("log_level".into()));
        }

        Ok(())
    }
}
