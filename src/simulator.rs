//! The TCP connection to the external microscopic traffic simulator.
//!
//! Wire format: each message is a 4-byte big-endian length prefix followed
//! by a JSON-encoded payload — `RpcRequest` in one direction, `RpcResult`
//! in the other. This implementation owns both ends of that framing (the
//! `bin/mock_simulator` binary speaks the same framing for tests), so the
//! simulator itself can be swapped without touching the Central
//! Controller's dispatch logic.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

use crate::config::SimulatorSettings;
use crate::transport::{RpcRequest, RpcResult};

pub struct SimulatorConnection {
    stream: TcpStream,
}

impl SimulatorConnection {
    /// Connects with bounded retry/backoff, matching the controller's
    /// startup sequence (§4.2 step 1).
    pub async fn connect_with_retry(settings: &SimulatorSettings) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::info!(addr, attempt, "connected to simulator");
                    return Ok(Self { stream });
                }
                Err(e) if attempt < settings.connect_retry_attempts => {
                    tracing::warn!(addr, attempt, error = %e, "simulator connection failed, retrying");
                    sleep(Duration::from_millis(settings.connect_retry_backoff_ms)).await;
                }
                Err(e) => {
                    bail!("failed to connect to simulator at {addr} after {attempt} attempts: {e}");
                }
            }
        }
    }

    pub async fn call(&mut self, request: &RpcRequest) -> Result<RpcResult> {
        self.send(request).await.context("sending RPC to simulator")?;
        self.recv().await.context("receiving RPC reply from simulator")
    }

    async fn send(&mut self, request: &RpcRequest) -> Result<()> {
        let payload = serde_json::to_vec(request)?;
        let len = u32::try_from(payload.len()).context("request too large to frame")?;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RpcResult> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}
