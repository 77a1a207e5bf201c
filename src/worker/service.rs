//! Request handling for the worker's listening endpoint
//!
//! One accepted connection counts as one request. What the request does is
//! up to the [`Service`]; the runtime only counts, tracks and drains.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Per-connection context handed to a [`Service`]
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub worker_id: u64,
    pub epoch: u64,

    /// 1-based position of this request in the worker's lifetime
    pub request_number: u64,

    pub peer: SocketAddr,
}

/// Handles one accepted connection
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, ctx: RequestContext) -> anyhow::Result<()>;
}

/// Minimal HTTP/1.1 status responder.
///
/// Reads whatever the client sent in its first segment and answers with a
/// plain-text line identifying the worker, then closes the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusService;

#[async_trait]
impl Service for StatusService {
    async fn handle(&self, mut stream: TcpStream, ctx: RequestContext) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await?;

        let body = format!(
            "worker={} epoch={} pid={} request={}\n",
            ctx.worker_id,
            ctx.epoch,
            std::process::id(),
            ctx.request_number
        );
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
