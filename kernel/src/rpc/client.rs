//! Outbound JSON-RPC calls
//!
//! One TCP connection per call, bounded by the configured RPC timeout.
//! [`RemoteCpu`] and [`RemoteMemory`] implement the collaborator traits on
//! top of [`RpcClient`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

use super::{
    methods, AllocateProcessParams, AllocateThreadParams, PreemptParams, ProcessParams,
    RpcRequest, RpcResponse, ThreadParams,
};
use crate::collab::{AllocationStatus, CpuEngine, MemoryEngine, PreemptReason};
use crate::sys::{Pid, Tid};
use crate::{KernelError, KernelResult};

/// JSON-RPC client of one remote service
#[derive(Debug)]
pub struct RpcClient {
    /// Name used in errors and logs
    service: &'static str,
    addr: SocketAddr,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(service: &'static str, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            service,
            addr,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Call `method` and decode its result
    pub async fn call<P, R>(&self, method: &str, params: P) -> KernelResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        trace!("-> {} {}", self.service, line.trim_end());
        let reply = tokio::time::timeout(self.timeout, self.exchange(&line))
            .await
            .map_err(|_| KernelError::Timeout(self.service))??;
        trace!("<- {} {}", self.service, reply.trim_end());

        let response: RpcResponse = serde_json::from_str(&reply)
            .map_err(|e| KernelError::UnexpectedReply(self.service, e.to_string()))?;
        if let Some(err) = response.error {
            return Err(KernelError::UnexpectedReply(
                self.service,
                format!("{} failed with {}: {}", method, err.code, err.message),
            ));
        }
        let result = response.result.ok_or_else(|| {
            KernelError::UnexpectedReply(self.service, format!("{} returned no result", method))
        })?;
        serde_json::from_value(result)
            .map_err(|e| KernelError::UnexpectedReply(self.service, e.to_string()))
    }

    async fn exchange(&self, line: &str) -> KernelResult<String> {
        let unavailable = |e: std::io::Error| KernelError::CollaboratorUnavailable(self.service, e.to_string());

        let stream = TcpStream::connect(self.addr).await.map_err(unavailable)?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await.map_err(unavailable)?;

        let mut reply = String::new();
        let read = BufReader::new(reader)
            .read_line(&mut reply)
            .await
            .map_err(unavailable)?;
        if read == 0 {
            return Err(KernelError::CollaboratorUnavailable(
                self.service,
                "connection closed before reply".into(),
            ));
        }
        Ok(reply)
    }
}

/// CPU service reached over JSON-RPC
///
/// The CPU acknowledges `DISPATCH` once it has taken the thread, not when
/// the thread stops running.
#[derive(Debug)]
pub struct RemoteCpu {
    client: RpcClient,
}

impl RemoteCpu {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new("cpu", addr, timeout),
        }
    }
}

impl CpuEngine for RemoteCpu {
    async fn dispatch(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::DISPATCH, ThreadParams { pid, tid })
            .await
            .map(drop)
    }

    async fn preempt(&self, pid: Pid, tid: Tid, reason: PreemptReason) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::PREEMPT, PreemptParams { pid, tid, reason })
            .await
            .map(drop)
    }
}

/// Memory service reached over JSON-RPC
#[derive(Debug)]
pub struct RemoteMemory {
    client: RpcClient,
}

impl RemoteMemory {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new("memory", addr, timeout),
        }
    }
}

impl MemoryEngine for RemoteMemory {
    async fn allocate_process(&self, pid: Pid, path: &str, size: u32) -> KernelResult<AllocationStatus> {
        let params = AllocateProcessParams {
            pid,
            path: path.to_string(),
            size,
        };
        self.client.call(methods::ALLOCATE_PROCESS, params).await
    }

    async fn free_process(&self, pid: Pid) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::FREE_PROCESS, ProcessParams { pid })
            .await
            .map(drop)
    }

    async fn allocate_thread(&self, pid: Pid, tid: Tid, path: &str) -> KernelResult<()> {
        let params = AllocateThreadParams {
            pid,
            tid,
            path: path.to_string(),
        };
        self.client
            .call::<_, Value>(methods::ALLOCATE_THREAD, params)
            .await
            .map(drop)
    }

    async fn free_thread(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::FREE_THREAD, ThreadParams { pid, tid })
            .await
            .map(drop)
    }

    async fn compact(&self) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::COMPACT, Value::Null)
            .await
            .map(drop)
    }

    async fn request_dump(&self, pid: Pid, tid: Tid) -> KernelResult<()> {
        self.client
            .call::<_, Value>(methods::DUMP, ThreadParams { pid, tid })
            .await
            .map(drop)
    }
}
