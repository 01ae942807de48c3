//! Pipelined transport: a small pool of connections, each multiplexing
//! concurrent exchanges by rewritten transaction id.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnReader, ConnWriter, Transport};
use crate::dns_utils::{set_wire_id, wire_id};
use crate::upstream::dial::Dialer;

type PendingMap = DashMap<u16, Pending, FxBuildHasher>;

struct Pending {
    original_id: u16,
    tx: oneshot::Sender<Vec<u8>>,
}

pub struct PipelineTransport {
    dialer: Arc<Dialer>,
    max_conns: usize,
    idle_timeout: Duration,
    conns: Mutex<Vec<Arc<PipelineConn>>>,
    closed: AtomicBool,
}

impl PipelineTransport {
    pub fn new(dialer: Arc<Dialer>, max_conns: usize, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            max_conns: max_conns.max(1),
            idle_timeout,
            conns: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Live connections currently in the pool.
    pub fn conn_count(&self) -> usize {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.retain(|c| !c.is_dead());
        conns.len()
    }

    /// 选择负载最低的连接，必要时新建 / Least loaded live connection, or a new one while below `max_conns`.
    fn pick_conn(&self) -> Arc<PipelineConn> {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.retain(|c| !c.is_dead());
        let best = conns.iter().min_by_key(|c| c.load()).cloned();
        match best {
            Some(c) if c.load() == 0 || conns.len() >= self.max_conns => c,
            _ => {
                let c = Arc::new(PipelineConn::new(self.idle_timeout));
                conns.push(Arc::clone(&c));
                c
            }
        }
    }
}

#[async_trait]
impl Transport for PipelineTransport {
    async fn exchange(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("transport closed");
        }
        let conn = self.pick_conn();
        conn.exchange(&self.dialer, packet).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let conns = std::mem::take(&mut *self.conns.lock().unwrap_or_else(|e| e.into_inner()));
        for c in conns {
            c.close();
        }
    }
}

/// One multiplexed connection. Dialed lazily by the first exchange bound to it.
struct PipelineConn {
    writer: OnceCell<AsyncMutex<ConnWriter>>,
    pending: Arc<PendingMap>,
    next_qid: AtomicU16,
    /// Exchanges bound to this connection, including ones still waiting for the dial.
    queued: Arc<AtomicUsize>,
    born: Instant,
    last_active_ms: Arc<AtomicU64>,
    idle_timeout: Duration,
    closed: CancellationToken,
}

struct QueuedGuard<'a> {
    conn: &'a PipelineConn,
    qid: Option<u16>,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        if let Some(qid) = self.qid {
            self.conn.pending.remove(&qid);
        }
        self.conn.queued.fetch_sub(1, Ordering::AcqRel);
        self.conn.touch();
    }
}

impl PipelineConn {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            writer: OnceCell::new(),
            pending: Arc::new(DashMap::with_hasher(FxBuildHasher)),
            next_qid: AtomicU16::new(1),
            queued: Arc::new(AtomicUsize::new(0)),
            born: Instant::now(),
            last_active_ms: Arc::new(AtomicU64::new(0)),
            idle_timeout,
            closed: CancellationToken::new(),
        }
    }

    fn load(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn is_dead(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
        self.pending.clear();
    }

    fn touch(&self) {
        let ms = self.born.elapsed().as_millis() as u64;
        self.last_active_ms.store(ms, Ordering::Release);
    }

    async fn exchange(&self, dialer: &Dialer, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let Some(original_id) = wire_id(packet) else {
            bail!("dns packet too short");
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        let mut guard = QueuedGuard {
            conn: self,
            qid: None,
        };

        let writer = self
            .writer
            .get_or_try_init(|| self.dial(dialer))
            .await
            .inspect_err(|_| self.close())?;

        let (qid, rx) = self.register(original_id)?;
        guard.qid = Some(qid);
        if self.is_dead() {
            bail!("connection closed");
        }

        let mut out = packet.to_vec();
        set_wire_id(&mut out, qid);
        {
            let mut w = writer.lock().await;
            if let Err(err) = w.write_msg(&out).await {
                self.close();
                return Err(err.context("write query"));
            }
        }
        self.touch();

        let resp = rx.await.context("connection closed before response")?;
        Ok(resp)
    }

    /// Allocates a free transaction id for this connection.
    fn register(&self, original_id: u16) -> anyhow::Result<(u16, oneshot::Receiver<Vec<u8>>)> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        for _ in 0..=u16::MAX as usize {
            let cand = self.next_qid.fetch_add(1, Ordering::Relaxed);
            if let dashmap::mapref::entry::Entry::Vacant(v) = self.pending.entry(cand) {
                if let Some(tx) = tx.take() {
                    v.insert(Pending { original_id, tx });
                }
                return Ok((cand, rx));
            }
        }
        bail!("no available dns ids on pipelined connection")
    }

    async fn dial(&self, dialer: &Dialer) -> anyhow::Result<AsyncMutex<ConnWriter>> {
        let (reader, writer) = dialer.connect().await?;
        debug!(target = "pipeline", upstream = %dialer.addr(), "connection established");
        self.touch();
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.pending),
            self.closed.clone(),
            dialer.addr().to_string(),
        ));
        tokio::spawn(idle_watch(
            self.born,
            Arc::clone(&self.last_active_ms),
            Arc::clone(&self.queued),
            self.idle_timeout,
            self.closed.clone(),
        ));
        Ok(AsyncMutex::new(writer))
    }
}

impl Drop for PipelineConn {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop(
    mut reader: ConnReader,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
    upstream: String,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            res = reader.read_msg() => res,
        };
        let mut buf = match msg {
            Ok(buf) => buf,
            Err(err) => {
                debug!(target = "pipeline", upstream = %upstream, error = %err, "read failed, closing connection");
                break;
            }
        };
        let Some(qid) = wire_id(&buf) else {
            continue;
        };
        if let Some((_, p)) = pending.remove(&qid) {
            set_wire_id(&mut buf, p.original_id);
            let _ = p.tx.send(buf);
        } else {
            debug!(target = "pipeline", upstream = %upstream, qid, "response with unknown id");
        }
    }
    closed.cancel();
    // Dropping the senders fails every exchange still bound to this connection.
    pending.clear();
}

async fn idle_watch(
    born: Instant,
    last_active_ms: Arc<AtomicU64>,
    queued: Arc<AtomicUsize>,
    idle_timeout: Duration,
    closed: CancellationToken,
) {
    loop {
        let last = born + Duration::from_millis(last_active_ms.load(Ordering::Acquire));
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep_until(last + idle_timeout) => {}
        }
        let last = born + Duration::from_millis(last_active_ms.load(Ordering::Acquire));
        if queued.load(Ordering::Acquire) == 0 && last.elapsed() >= idle_timeout {
            closed.cancel();
            return;
        }
        if queued.load(Ordering::Acquire) > 0 && last.elapsed() >= idle_timeout {
            // Busy but quiet: check again after another full period.
            tokio::select! {
                _ = closed.cancelled() => return,
                _ = tokio::time::sleep(idle_timeout) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures::future::join_all;
    use hickory_proto::op::Message;
    use hickory_proto::rr::RecordType;
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

    use super::*;
    use crate::dns_utils::testing::{a_reply, query};
    use crate::upstream::dial::{DialOptions, UpstreamAddr};
    use crate::upstream::transport::testing::{tcp_server, udp_server};

    fn answer(req: &Message) -> Option<Message> {
        Some(a_reply(req, std::net::Ipv4Addr::new(10, 0, 0, 1), 60))
    }

    fn dialer(addr: String) -> Arc<Dialer> {
        Dialer::new(UpstreamAddr::parse(&addr).unwrap(), DialOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn concurrent_exchanges_share_connections() {
        let (addr, conns, msgs) = tcp_server(Arc::new(answer)).await;
        let t = Arc::new(PipelineTransport::new(
            dialer(format!("tcp://{}", addr)),
            2,
            Duration::from_secs(10),
        ));

        let tasks = (0..32u16).map(|i| {
            let t = Arc::clone(&t);
            async move {
                let mut q = query("example.com.", RecordType::A);
                q.set_id(i);
                let resp = t.exchange(&q.to_bytes().unwrap()).await.unwrap();
                Message::from_bytes(&resp).unwrap().id()
            }
        });
        let ids = join_all(tasks).await;
        assert_eq!(ids, (0..32u16).collect::<Vec<_>>());
        assert!(conns.load(Ordering::SeqCst) <= 2);
        assert_eq!(msgs.load(Ordering::SeqCst), 32);
        assert!(t.conn_count() <= 2);
    }

    #[tokio::test]
    async fn udp_pipeline_restores_original_id() {
        let (addr, _) = udp_server(Arc::new(answer)).await;
        let t = PipelineTransport::new(dialer(format!("udp://{}", addr)), 1, Duration::from_secs(300));
        let mut q = query("example.com.", RecordType::A);
        q.set_id(0xABCD);
        let resp = t.exchange(&q.to_bytes().unwrap()).await.unwrap();
        assert_eq!(Message::from_bytes(&resp).unwrap().id(), 0xABCD);
        assert_eq!(t.conn_count(), 1);
    }

    #[tokio::test]
    async fn broken_connection_is_evicted_and_redialed() {
        // Every first message on a connection kills it; the server answers later ones.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut n = 0;
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                n += 1;
                if n == 1 {
                    drop(stream);
                    continue;
                }
                let (r, w) = stream.into_split();
                let mut reader = ConnReader::Tcp(r);
                let mut writer = ConnWriter::Tcp(w);
                tokio::spawn(async move {
                    while let Ok(buf) = reader.read_msg().await {
                        let req = Message::from_bytes(&buf).unwrap();
                        let resp = answer(&req).unwrap();
                        writer.write_msg(&resp.to_bytes().unwrap()).await.unwrap();
                    }
                });
            }
        });

        let t = PipelineTransport::new(dialer(format!("tcp://{}", addr)), 1, Duration::from_secs(10));
        let q = query("example.com.", RecordType::A).to_bytes().unwrap();
        assert!(t.exchange(&q).await.is_err());
        let resp = t.exchange(&q).await.expect("redialed connection");
        assert_eq!(Message::from_bytes(&resp).unwrap().id(), 0x1234);
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let (addr, conns, _) = tcp_server(Arc::new(answer)).await;
        let t = PipelineTransport::new(
            dialer(format!("tcp://{}", addr)),
            1,
            Duration::from_millis(50),
        );
        let q = query("example.com.", RecordType::A).to_bytes().unwrap();
        t.exchange(&q).await.unwrap();
        assert_eq!(t.conn_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(t.conn_count(), 0);
        t.exchange(&q).await.unwrap();
        assert_eq!(conns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_transport_refuses_exchange() {
        let (addr, _, _) = tcp_server(Arc::new(answer)).await;
        let t = PipelineTransport::new(dialer(format!("tcp://{}", addr)), 1, Duration::from_secs(10));
        t.close().await;
        let q = query("example.com.", RecordType::A).to_bytes().unwrap();
        assert!(t.exchange(&q).await.is_err());
    }
}
