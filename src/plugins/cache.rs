//! Answer cache with coalesced lazy refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hickory_proto::op::{Message, ResponseCode};
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::config::CacheArgs;
use crate::context::QueryContext;
use crate::dns_utils::{min_ttl, set_ttl, subtract_ttl};
use crate::sequence::{ChainWalker, RecursiveExecutable};

pub const MIN_CACHE_SIZE: usize = 1024;
pub const LAZY_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL of answers served past their expiry.
pub const STALE_ANSWER_TTL: u32 = 1;

/// 规范化缓存键：小写 FQDN + qtype + qclass / Canonical key of a single-question query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qname: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    /// `None` for queries that are not cacheable (not exactly one question).
    pub fn from_ctx(ctx: &QueryContext) -> Option<Self> {
        let (name, qtype, qclass) = ctx.single_question()?;
        let mut qname = name.to_lowercase().to_ascii();
        if !qname.ends_with('.') {
            qname.push('.');
        }
        Some(Self {
            qname,
            qtype: u16::from(qtype),
            qclass: u16::from(qclass),
        })
    }
}

#[derive(Debug, Clone)]
struct CacheItem {
    response: Arc<Message>,
    stored_at: Instant,
    msg_ttl: u32,
}

enum Lookup {
    Fresh(Message),
    Stale(Message),
    Miss,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    lazy_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    refreshes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub lazy_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub refreshes: u64,
}

struct CacheInner {
    store: moka::sync::Cache<CacheKey, CacheItem>,
    lazy_ttl: Duration,
    /// One entry per key with a refresh running.
    inflight: DashMap<CacheKey, (), FxBuildHasher>,
    stats: CacheStats,
}

pub struct Cache {
    inner: Arc<CacheInner>,
}

/// 刷新结束时清理 inflight 记录 / Removes the in-flight marker when the refresh task ends.
struct InflightCleanupGuard {
    inner: Arc<CacheInner>,
    key: CacheKey,
}

impl Drop for InflightCleanupGuard {
    fn drop(&mut self) {
        self.inner.inflight.remove(&self.key);
    }
}

fn storable(resp: &Message) -> Option<u32> {
    if !matches!(
        resp.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    ) || resp.truncated()
    {
        return None;
    }
    min_ttl(resp).filter(|ttl| *ttl > 0)
}

impl CacheInner {
    fn lookup(&self, key: &CacheKey, now: Instant) -> Lookup {
        let Some(item) = self.store.get(key) else {
            return Lookup::Miss;
        };
        let elapsed = now.saturating_duration_since(item.stored_at);
        let elapsed_secs = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);
        if elapsed_secs < item.msg_ttl {
            let mut resp = (*item.response).clone();
            subtract_ttl(&mut resp, elapsed_secs);
            return Lookup::Fresh(resp);
        }
        if !self.lazy_ttl.is_zero() {
            let window = self.lazy_ttl.max(Duration::from_secs(u64::from(item.msg_ttl)));
            if elapsed < window {
                let mut resp = (*item.response).clone();
                set_ttl(&mut resp, STALE_ANSWER_TTL);
                return Lookup::Stale(resp);
            }
        }
        self.evict_if_unchanged(key, item.stored_at);
        Lookup::Miss
    }

    /// Drops the entry only if it is still the one stored at `stored_at`;
    /// a newer store for the same key survives.
    fn evict_if_unchanged(&self, key: &CacheKey, stored_at: Instant) {
        let _ = self
            .store
            .entry(key.clone())
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().stored_at == stored_at => Op::Remove,
                _ => Op::Nop,
            });
    }

    fn store_at(&self, key: CacheKey, resp: &Message, stored_at: Instant) -> bool {
        let Some(msg_ttl) = storable(resp) else {
            return false;
        };
        self.store.insert(
            key,
            CacheItem {
                response: Arc::new(resp.clone()),
                stored_at,
                msg_ttl,
            },
        );
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl Cache {
    pub fn new(args: &CacheArgs) -> Self {
        let size = args.size.max(MIN_CACHE_SIZE);
        let store = moka::sync::Cache::builder()
            .max_capacity(size as u64)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            inner: Arc::new(CacheInner {
                store,
                lazy_ttl: Duration::from_secs(args.lazy_cache_ttl),
                inflight: DashMap::with_hasher(FxBuildHasher),
                stats: CacheStats::default(),
            }),
        }
    }

    /// `cache [size]` quick setup.
    pub fn quick_setup(size: Option<usize>) -> Self {
        Self::new(&CacheArgs {
            size: size.unwrap_or(MIN_CACHE_SIZE),
            lazy_cache_ttl: 0,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.inner.store.policy().max_capacity().unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let s = &self.inner.stats;
        CacheStatsSnapshot {
            hits: s.hits.load(Ordering::Relaxed),
            lazy_hits: s.lazy_hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            stores: s.stores.load(Ordering::Relaxed),
            refreshes: s.refreshes.load(Ordering::Relaxed),
        }
    }

    /// Stores `resp` as if it had been inserted at `stored_at`.
    pub fn insert_at(&self, key: CacheKey, resp: &Message, stored_at: Instant) -> bool {
        self.inner.store_at(key, resp, stored_at)
    }

    fn spawn_refresh(&self, key: CacheKey, ctx: &QueryContext, next: ChainWalker) {
        match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(v) => {
                v.insert(());
            }
        }
        let guard = InflightCleanupGuard {
            inner: Arc::clone(&self.inner),
            key,
        };
        let mut copy = ctx.detached_copy(tokio::time::Instant::now() + LAZY_REFRESH_TIMEOUT);
        copy.take_response();
        self.inner.stats.refreshes.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let uqid = copy.id();
            debug!(target = "cache", uqid, "start lazy cache update");
            match tokio::time::timeout(LAZY_REFRESH_TIMEOUT, next.exec_next(&mut copy)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target = "cache", uqid, error = %format!("{:#}", err), "failed to update lazy cache");
                }
                Err(_) => {
                    warn!(target = "cache", uqid, "lazy cache update timed out");
                }
            }
            if let Some(resp) = copy.response() {
                if !copy.response_from_cache() {
                    guard.inner.store_at(guard.key.clone(), resp, Instant::now());
                    debug!(target = "cache", uqid, "lazy cache updated");
                }
            }
        });
    }
}

#[async_trait]
impl RecursiveExecutable for Cache {
    async fn exec(&self, ctx: &mut QueryContext, next: ChainWalker) -> anyhow::Result<()> {
        let Some(key) = CacheKey::from_ctx(ctx) else {
            return next.exec_next(ctx).await;
        };

        match self.inner.lookup(&key, Instant::now()) {
            Lookup::Fresh(mut resp) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                resp.set_id(ctx.query().id());
                ctx.set_cached_response(resp);
                Ok(())
            }
            Lookup::Stale(mut resp) => {
                self.inner.stats.lazy_hits.fetch_add(1, Ordering::Relaxed);
                resp.set_id(ctx.query().id());
                ctx.set_cached_response(resp);
                self.spawn_refresh(key, ctx, next);
                Ok(())
            }
            Lookup::Miss => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                let res = next.exec_next(ctx).await;
                if let Some(resp) = ctx.response() {
                    if !ctx.response_from_cache() {
                        self.inner.store_at(key, resp, Instant::now());
                    }
                }
                res
            }
        }
    }

    async fn close(&self) {
        self.inner.store.invalidate_all();
    }
}
