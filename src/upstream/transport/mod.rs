//! Connection policies over one upstream address.

pub mod pipeline;
pub mod reuse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub use pipeline::PipelineTransport;
pub use reuse::ReuseConnTransport;

/// UDP 读缓冲区 / Datagram read buffer size.
pub const UDP_BUF_SIZE: usize = 4096;
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONNS: usize = 2;

/// Raw wire exchange: one DNS message out, the matching message back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>>;

    async fn close(&self);
}

pub enum ConnReader {
    Udp(Arc<UdpSocket>),
    Tcp(OwnedReadHalf),
}

pub enum ConnWriter {
    Udp(Arc<UdpSocket>),
    Tcp(OwnedWriteHalf),
}

impl ConnReader {
    /// Reads one DNS message: a datagram, or one 2-byte length-prefixed frame.
    pub async fn read_msg(&mut self) -> anyhow::Result<Vec<u8>> {
        match self {
            ConnReader::Udp(sock) => {
                let mut buf = vec![0u8; UDP_BUF_SIZE];
                let n = sock.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            ConnReader::Tcp(r) => {
                let mut len_buf = [0u8; 2];
                r.read_exact(&mut len_buf).await?;
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

impl ConnWriter {
    pub async fn write_msg(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        match self {
            ConnWriter::Udp(sock) => {
                sock.send(packet).await?;
            }
            ConnWriter::Tcp(w) => {
                let Ok(len) = u16::try_from(packet.len()) else {
                    bail!("dns message too large for tcp frame ({} bytes)", packet.len());
                };
                let mut out = Vec::with_capacity(2 + packet.len());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(packet);
                w.write_all(&out).await?;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let ConnWriter::Tcp(w) = self {
            let _ = w.shutdown().await;
        }
    }
}
