//! JSON-RPC transport
//!
//! Newline-delimited JSON over TCP. Every request is one line
//! `{"id", "method", "params"}` answered by one line carrying either
//! `result` or `error`.
//!
//! - [`server`]: the Kernel endpoint the CPU and Memory call into
//! - [`client`]: calls from the Kernel out to the CPU and Memory

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collab::{EvictionReason, PreemptReason};
use crate::sys::{Pid, Tid};
use crate::KernelError;

pub use client::{RemoteCpu, RemoteMemory, RpcClient};
pub use server::RpcServer;

/// Method names beyond the syscalls
pub mod methods {
    // Served by the Kernel
    pub const EVICTED: &str = "EVICTED";
    pub const DUMP_RESPONSE: &str = "DUMP_RESPONSE";
    pub const KERNEL_STATUS: &str = "KERNEL_STATUS";

    // Served by the CPU
    pub const DISPATCH: &str = "DISPATCH";
    pub const PREEMPT: &str = "PREEMPT";

    // Served by Memory
    pub const ALLOCATE_PROCESS: &str = "ALLOCATE_PROCESS";
    pub const FREE_PROCESS: &str = "FREE_PROCESS";
    pub const ALLOCATE_THREAD: &str = "ALLOCATE_THREAD";
    pub const FREE_THREAD: &str = "FREE_THREAD";
    pub const COMPACT: &str = "COMPACT";
    pub const DUMP: &str = "DUMP";
}

/// RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    /// Parse error
    ParseError = -32700,
    /// Invalid request
    InvalidRequest = -32600,
    /// Method not found
    MethodNotFound = -32601,
    /// Invalid params
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,
    /// Resource not found
    ResourceNotFound = -32001,
}

impl RpcErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&KernelError> for RpcErrorCode {
    fn from(err: &KernelError) -> Self {
        match err {
            KernelError::InvalidRequest(_) => RpcErrorCode::InvalidParams,
            KernelError::UnknownMethod(_) => RpcErrorCode::MethodNotFound,
            KernelError::ProcessNotFound(_)
            | KernelError::ThreadNotFound(..)
            | KernelError::NoRunningThread => RpcErrorCode::ResourceNotFound,
            _ => RpcErrorCode::InternalError,
        }
    }
}

/// One request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Error object of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// One response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: code.code(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(id: u64, err: &KernelError) -> Self {
        Self::failure(id, RpcErrorCode::from(err), err.to_string())
    }
}

// ========== Method Parameters ==========

/// `(pid, tid)` pair, used by `DISPATCH`, `FREE_THREAD` and `DUMP`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadParams {
    pub pid: Pid,
    pub tid: Tid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptParams {
    pub pid: Pid,
    pub tid: Tid,
    pub reason: PreemptReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictedParams {
    pub pid: Pid,
    pub tid: Tid,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpResponseParams {
    pub pid: Pid,
    pub tid: Tid,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateProcessParams {
    pub pid: Pid,
    pub path: String,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParams {
    pub pid: Pid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateThreadParams {
    pub pid: Pid,
    pub tid: Tid,
    pub path: String,
}
