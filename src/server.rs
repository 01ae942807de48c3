//! UDP/TCP listeners feeding every query into the entry sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::context::QueryContext;
use crate::dns_utils::build_reply;
use crate::registry::{PluginRegistry, RegistryOptions};
use crate::sequence::ChainWalker;

const UDP_RECV_BUF: usize = 4096;
/// Without EDNS0 a UDP reply must fit the classic 512 bytes.
const MIN_UDP_PAYLOAD: usize = 512;
const MAX_TCP_FRAME: usize = 64 * 1024;
const TCP_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// 一次加载生成的运行时：插件、入口与查询超时 / Everything built from one config load.
pub struct Runtime {
    registry: PluginRegistry,
    entry: ChainWalker,
    query_timeout: Duration,
}

impl Runtime {
    pub fn build(cfg: &AppConfig) -> anyhow::Result<Self> {
        let opts = RegistryOptions {
            annotate: cfg.server.annotate,
        };
        let registry = PluginRegistry::build_with(&cfg.plugins, &opts).context("build plugins")?;
        let entry = registry.walker(&cfg.server.entry)?;
        Ok(Self {
            registry,
            entry,
            query_timeout: Duration::from_millis(cfg.server.query_timeout_ms.max(1)),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Runs the entry sequence; a failed walk or a missing response yields SERVFAIL.
    pub async fn handle(&self, query: Message, client: Option<SocketAddr>) -> Message {
        let mut ctx = QueryContext::new(query).with_timeout(self.query_timeout);
        if let Some(client) = client {
            ctx = ctx.with_client(client);
        }

        let result = tokio::time::timeout(self.query_timeout, self.entry.exec_next(&mut ctx)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    target = "server",
                    query_id = ctx.id(),
                    client = ?ctx.client(),
                    error = %format!("{:#}", err),
                    "query failed"
                );
                ctx.take_response();
            }
            Err(_) => {
                warn!(target = "server", query_id = ctx.id(), client = ?ctx.client(), "query timed out");
                ctx.take_response();
            }
        }

        let resp = match ctx.take_response() {
            Some(mut resp) => {
                resp.set_id(ctx.query().id());
                resp
            }
            None => build_reply(ctx.query(), ResponseCode::ServFail),
        };
        debug!(
            target = "server",
            query_id = ctx.id(),
            rcode = ?resp.response_code(),
            answers = resp.answers().len(),
            elapsed_ms = ctx.start_time().elapsed().as_millis() as u64,
            "query done"
        );
        resp
    }

    pub async fn close(&self) {
        self.registry.close().await;
    }
}

#[derive(Clone)]
pub struct Server {
    runtime: Arc<ArcSwap<Runtime>>,
}

impl Server {
    pub fn new(runtime: Arc<ArcSwap<Runtime>>) -> Self {
        Self { runtime }
    }

    /// Decodes, resolves and encodes one packet. Undecodable packets are dropped.
    pub async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        udp: bool,
    ) -> Option<Vec<u8>> {
        let query = match Message::from_bytes(packet) {
            Ok(q) => q,
            Err(err) => {
                debug!(target = "server", client = %peer, error = %err, "drop malformed query");
                return None;
            }
        };
        let limit = udp.then(|| udp_payload_limit(&query));
        // 持有当前运行时直到查询结束，热加载不会打断进行中的查询。
        let runtime = self.runtime.load_full();
        let resp = runtime.handle(query.clone(), Some(peer)).await;

        let bytes = match resp.to_bytes() {
            Ok(b) => b,
            Err(err) => {
                warn!(target = "server", client = %peer, error = %err, "encode response");
                build_reply(&query, ResponseCode::ServFail).to_bytes().ok()?
            }
        };
        match limit {
            Some(limit) if bytes.len() > limit => {
                let mut tc = build_reply(&query, resp.response_code());
                tc.set_truncated(true);
                tc.to_bytes().ok()
            }
            _ => Some(bytes),
        }
    }
}

fn udp_payload_limit(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map(|edns| (edns.max_payload() as usize).max(MIN_UDP_PAYLOAD))
        .unwrap_or(MIN_UDP_PAYLOAD)
}

/// Binds the listeners and serves until one of them fails.
pub async fn serve(
    server: Server,
    bind_udp: SocketAddr,
    bind_tcp: SocketAddr,
    udp_workers: usize,
) -> anyhow::Result<()> {
    let udp_workers = udp_workers.max(1);
    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns server started");

    let mut handles = Vec::with_capacity(udp_workers + 1);

    #[cfg(unix)]
    {
        // 每个 worker 独立 socket，SO_REUSEPORT 由内核分发。
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(bind_udp)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, server).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(UdpSocket::from_std(bind_udp_socket(bind_udp, false)?)?);
        for worker_id in 0..udp_workers {
            let socket = Arc::clone(&socket);
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, server).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    let listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_tcp(listener, server).await {
            error!(error = %err, "tcp server exited");
        }
    }));

    for h in handles {
        let _ = h.await;
    }
    Ok(())
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    bind_udp_socket(addr, true)
}

fn bind_udp_socket(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        // non-fatal: continue without reuseport
        if reuse_port {
            let _ = socket.set_reuse_port(true);
        }
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    Ok(socket.into())
}

pub async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    server: Server,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(UDP_RECV_BUF);
    loop {
        buf.resize(UDP_RECV_BUF, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                buf.truncate(len);
                let packet = buf.split().freeze();
                let server = server.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(resp) = server.handle_packet(&packet, peer, true).await {
                        if let Err(err) = socket.send_to(&resp, peer).await {
                            debug!(worker_id, client = %peer, error = %err, "udp send failed");
                        }
                    }
                });
            }
            Err(err) => {
                // 继续接收，不退出
                debug!(worker_id, error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

pub async fn run_tcp(listener: TcpListener, server: Server) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, server).await {
                debug!(client = %peer, error = %err, "tcp connection closed");
            }
        });
    }
}

/// Queries on one connection are handled concurrently; replies go out as they finish.
async fn handle_tcp_conn(stream: TcpStream, peer: SocketAddr, server: Server) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let write_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            if resp.len() > u16::MAX as usize {
                continue;
            }
            let mut frame = Vec::with_capacity(resp.len() + 2);
            frame.extend_from_slice(&(resp.len() as u16).to_be_bytes());
            frame.extend_from_slice(&resp);
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let mut len_buf = [0u8; 2];
    loop {
        match tokio::time::timeout(TCP_CLIENT_IDLE_TIMEOUT, reader.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(err)) => {
                write_task.abort();
                return Err(err.into());
            }
            Err(_) => break,
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            break;
        }
        let mut buf = vec![0u8; frame_len];
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }

        let server = server.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(resp) = server.handle_packet(&buf, peer, false).await {
                let _ = tx.send(resp).await;
            }
        });
    }

    // Pending handlers keep their sender clones; the writer drains them before exiting.
    drop(tx);
    let _ = write_task.await;
    Ok(())
}
