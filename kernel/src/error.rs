//! Error types for the Kernel service
//!
//! One error enum for every layer: configuration, the JSON-RPC surface,
//! the scheduler registries and the CPU/Memory collaborators.

use thiserror::Error;

use crate::sys::{Pid, Tid};

/// Result type for Kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Error)]
pub enum KernelError {
    // ========== Configuration Errors ==========

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Missing configuration
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    // ========== Protocol Errors ==========

    /// Malformed request envelope or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Method not served by this endpoint
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    // ========== Registry Errors ==========

    /// Process not found
    #[error("Process not found: {0}")]
    ProcessNotFound(Pid),

    /// Thread not found
    #[error("Thread not found: ({0}:{1})")]
    ThreadNotFound(Pid, Tid),

    /// A syscall arrived while nothing was running
    #[error("No thread is running")]
    NoRunningThread,

    /// Process still owns threads outside the exit list
    #[error("Process {0} still owns live threads")]
    ProcessHasThreads(Pid),

    // ========== Memory Errors ==========

    /// Memory rejected the allocation for lack of space
    #[error("Insufficient memory for process {0}")]
    InsufficientMemory(Pid),

    /// Memory could fit the process only after compaction
    #[error("Memory needs compaction to fit process {0}")]
    NeedsCompaction(Pid),

    // ========== Collaborator Errors ==========

    /// RPC to a collaborator failed at the transport level
    #[error("Collaborator {0} unavailable: {1}")]
    CollaboratorUnavailable(&'static str, String),

    /// Collaborator answered with an error or an unexpected payload
    #[error("Unexpected reply from {0}: {1}")]
    UnexpectedReply(&'static str, String),

    /// Collaborator did not answer in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    // ========== Internal Errors ==========

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Scheduler bookkeeping broke an invariant
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl KernelError {
    /// Errors caused by the request itself rather than by the kernel
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            KernelError::InvalidRequest(_)
                | KernelError::UnknownMethod(_)
                | KernelError::ProcessNotFound(_)
                | KernelError::ThreadNotFound(..)
                | KernelError::NoRunningThread
        )
    }

    /// Errors raised while talking to the CPU or Memory services
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            KernelError::CollaboratorUnavailable(..)
                | KernelError::UnexpectedReply(..)
                | KernelError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::InvalidRequest(err.to_string())
    }
}
