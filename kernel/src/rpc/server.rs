//! Kernel JSON-RPC server
//!
//! Accepts connections from the CPU and Memory services. Requests on one
//! connection are served in order; connections are served concurrently.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{methods, DumpResponseParams, EvictedParams, RpcErrorCode, RpcRequest, RpcResponse};
use crate::collab::{CpuEngine, MemoryEngine};
use crate::service::Kernel;
use crate::sys::{Syscall, SyscallRequest};
use crate::{KernelError, KernelResult};

/// RPC server handle
pub struct RpcServer {
    /// Listen address
    addr: SocketAddr,
    /// Server handle (for shutdown)
    handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Create new RPC server
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Bind and start serving; returns the bound address
    pub async fn start<C: CpuEngine, M: MemoryEngine>(
        &mut self,
        kernel: Arc<Kernel<C, M>>,
    ) -> KernelResult<SocketAddr> {
        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        self.addr = local;
        info!("Kernel RPC server listening on {}", local);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        let kernel = Arc::clone(&kernel);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(kernel, stream).await {
                                debug!("Connection from {} closed: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => warn!("Accept failed: {}", err),
                }
            }
        });

        self.handle = Some(handle);
        Ok(local)
    }

    /// Stop the RPC server
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("RPC server stopped");
        }
    }

    /// Get server address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn serve_connection<C: CpuEngine, M: MemoryEngine>(
    kernel: Arc<Kernel<C, M>>,
    stream: TcpStream,
) -> KernelResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&kernel, &line).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

/// Decode one request line and serve it
pub async fn handle_line<C: CpuEngine, M: MemoryEngine>(kernel: &Kernel<C, M>, line: &str) -> RpcResponse {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return RpcResponse::failure(0, RpcErrorCode::ParseError, err.to_string()),
    };
    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => return RpcResponse::failure(id, RpcErrorCode::InvalidRequest, err.to_string()),
    };
    handle_request(kernel, request).await
}

/// Route a request to the kernel
pub async fn handle_request<C: CpuEngine, M: MemoryEngine>(
    kernel: &Kernel<C, M>,
    request: RpcRequest,
) -> RpcResponse {
    let RpcRequest { id, method, params } = request;
    match route(kernel, &method, params).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(err) => {
            if err.is_client_error() {
                debug!("{} rejected: {}", method, err);
            } else {
                warn!("{} failed: {}", method, err);
            }
            RpcResponse::from_error(id, &err)
        }
    }
}

async fn route<C: CpuEngine, M: MemoryEngine>(
    kernel: &Kernel<C, M>,
    method: &str,
    params: Value,
) -> KernelResult<Value> {
    match method {
        methods::EVICTED => {
            let p: EvictedParams = serde_json::from_value(params)?;
            kernel.handle_eviction(p.pid, p.tid, p.reason).await;
            Ok(Value::from("OK"))
        }
        methods::DUMP_RESPONSE => {
            let p: DumpResponseParams = serde_json::from_value(params)?;
            kernel.handle_dump_result(p.pid, p.tid, p.success).await;
            Ok(Value::from("OK"))
        }
        methods::KERNEL_STATUS => Ok(serde_json::to_value(kernel.status())?),
        syscall if Syscall::is_syscall(syscall) => {
            let request = SyscallRequest::from_rpc(syscall, params)?;
            let outcome = kernel.handle_syscall(request).await?;
            Ok(Value::from(outcome.as_str()))
        }
        other => Err(KernelError::UnknownMethod(other.to_string())),
    }
}
