//! Upstream resolvers: a transport bound to one configured address.

pub mod dial;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::debug;

use crate::error::SetupError;
use dial::{DialOptions, Dialer, Network, UpstreamAddr};
use transport::{
    DEFAULT_MAX_CONNS, DEFAULT_TCP_IDLE_TIMEOUT, DEFAULT_UDP_IDLE_TIMEOUT, PipelineTransport,
    ReuseConnTransport, Transport,
};

/// 统一的上游交换接口 / Uniform exchange interface used by the forward executor.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, query: &Message) -> anyhow::Result<Message>;

    /// Releases pooled connections.
    async fn close(&self) {}
}

/// Per-upstream settings after global defaults have been merged in.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    pub addr: String,
    pub dial: DialOptions,
    pub idle_timeout: Option<Duration>,
    pub enable_pipeline: bool,
    pub max_conns: Option<usize>,
}

/// Builds the resolver for one upstream address.
pub fn build_upstream(opts: &UpstreamOptions) -> Result<Arc<dyn Upstream>, SetupError> {
    let addr = UpstreamAddr::parse(&opts.addr)?;
    let network = addr.network;
    let dialer = Dialer::new(addr, opts.dial.clone())?;
    let upstream: Arc<dyn Upstream> = match network {
        Network::Udp => {
            let tcp = dialer.with_network(Network::Tcp);
            Arc::new(UdpUpstream::new(
                dialer,
                tcp,
                opts.idle_timeout.unwrap_or(DEFAULT_TCP_IDLE_TIMEOUT),
            ))
        }
        Network::Tcp => {
            let idle = opts.idle_timeout.unwrap_or(DEFAULT_TCP_IDLE_TIMEOUT);
            let transport: Box<dyn Transport> = if opts.enable_pipeline {
                Box::new(PipelineTransport::new(
                    dialer,
                    opts.max_conns.unwrap_or(DEFAULT_MAX_CONNS),
                    idle,
                ))
            } else {
                Box::new(ReuseConnTransport::new(dialer, idle))
            };
            Arc::new(StreamUpstream { transport })
        }
    };
    Ok(upstream)
}

fn decode(resp: &[u8]) -> anyhow::Result<Message> {
    Message::from_bytes(resp).context("malformed response")
}

/// UDP upstream: pipelined over a single socket, falls back to TCP on truncation.
pub struct UdpUpstream {
    udp: PipelineTransport,
    tcp: ReuseConnTransport,
}

impl UdpUpstream {
    pub fn new(udp_dialer: Arc<Dialer>, tcp_dialer: Arc<Dialer>, tcp_idle: Duration) -> Self {
        Self {
            udp: PipelineTransport::new(udp_dialer, 1, DEFAULT_UDP_IDLE_TIMEOUT),
            tcp: ReuseConnTransport::new(tcp_dialer, tcp_idle),
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let packet = query.to_bytes().context("encode query")?;
        let resp = decode(&self.udp.exchange(&packet).await?)?;
        if !resp.truncated() {
            return Ok(resp);
        }
        debug!(target = "upstream", id = query.id(), "truncated udp response, retrying over tcp");
        decode(&self.tcp.exchange(&packet).await?)
    }

    async fn close(&self) {
        self.udp.close().await;
        self.tcp.close().await;
    }
}

/// TCP upstream over either connection policy.
pub struct StreamUpstream {
    transport: Box<dyn Transport>,
}

#[async_trait]
impl Upstream for StreamUpstream {
    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let packet = query.to_bytes().context("encode query")?;
        decode(&self.transport.exchange(&packet).await?)
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}
