//! Reuse-connection transport: one connection, one exchange at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ConnReader, ConnWriter, Transport};
use crate::dns_utils::wire_id;
use crate::upstream::dial::Dialer;

struct ReuseConn {
    reader: ConnReader,
    writer: ConnWriter,
}

struct Slot {
    conn: Option<ReuseConn>,
    /// Bumped on every successful exchange; an idle timer only closes the generation it saw.
    generation: u64,
}

pub struct ReuseConnTransport {
    dialer: Arc<Dialer>,
    idle_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
    dials: AtomicU64,
    closed: AtomicBool,
}

impl ReuseConnTransport {
    pub fn new(dialer: Arc<Dialer>, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            idle_timeout,
            slot: Arc::new(Mutex::new(Slot {
                conn: None,
                generation: 0,
            })),
            dials: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of connections dialed so far.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.conn.is_some()
    }

    fn schedule_idle_close(&self, generation: u64) {
        let slot: Weak<Mutex<Slot>> = Arc::downgrade(&self.slot);
        let idle = self.idle_timeout;
        let upstream = self.dialer.addr().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(slot) = slot.upgrade() else {
                return;
            };
            let mut slot = slot.lock().await;
            if slot.generation == generation {
                if let Some(mut conn) = slot.conn.take() {
                    conn.writer.shutdown().await;
                    debug!(target = "reuse_conn", upstream = %upstream, "idle connection closed");
                }
            }
        });
    }
}

#[async_trait]
impl Transport for ReuseConnTransport {
    async fn exchange(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let Some(id) = wire_id(packet) else {
            bail!("dns packet too short");
        };
        let mut slot = self.slot.lock().await;
        if self.closed.load(Ordering::Acquire) {
            bail!("transport closed");
        }
        // Taken out for the duration of the exchange: an error or a dropped
        // future leaves the slot empty, so the next exchange dials fresh.
        let mut conn = match slot.conn.take() {
            Some(conn) => conn,
            None => {
                let (reader, writer) = self.dialer.connect().await?;
                self.dials.fetch_add(1, Ordering::Relaxed);
                ReuseConn { reader, writer }
            }
        };

        conn.writer.write_msg(packet).await.context("write query")?;
        let resp = conn.reader.read_msg().await.context("read response")?;
        if wire_id(&resp) != Some(id) {
            bail!("response id mismatch");
        }

        slot.conn = Some(conn);
        slot.generation += 1;
        let generation = slot.generation;
        drop(slot);
        self.schedule_idle_close(generation);
        Ok(resp)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut slot = self.slot.lock().await;
        if let Some(mut conn) = slot.conn.take() {
            conn.writer.shutdown().await;
        }
    }
}
