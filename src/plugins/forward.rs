//! Forward executor: races bounded-concurrency exchanges against a set of
//! upstreams and keeps the first successful answer.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{ForwardArgs, UpstreamConfig};
use crate::context::QueryContext;
use crate::error::{FailureReason, ForwardError, SetupError, UpstreamFailure};
use crate::sequence::Executable;
use crate::upstream::dial::DialOptions;
use crate::upstream::{Upstream, UpstreamOptions, build_upstream};

/// Hard ceiling of concurrently raced upstreams.
pub const MAX_CONCURRENT: usize = 3;
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct UpstreamWrapper {
    name: String,
    tag: Option<String>,
    upstream: Arc<dyn Upstream>,
}

impl UpstreamWrapper {
    pub fn new(name: impl Into<String>, tag: Option<String>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            name: name.into(),
            tag,
            upstream,
        }
    }

    /// Tag if configured, else the address.
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Forward {
    upstreams: Vec<Arc<UpstreamWrapper>>,
    concurrent: usize,
    exchange_timeout: Duration,
    next_start: AtomicUsize,
}

impl Forward {
    pub fn from_args(args: &ForwardArgs) -> Result<Self, SetupError> {
        if args.upstreams.is_empty() {
            return Err(SetupError::NoUpstream);
        }
        let mut upstreams = Vec::with_capacity(args.upstreams.len());
        for (index, cfg) in args.upstreams.iter().enumerate() {
            if cfg.addr.is_empty() {
                return Err(SetupError::MissingUpstreamAddr { index });
            }
            let opts = merge_options(args, cfg);
            let upstream = build_upstream(&opts)?;
            let name = cfg.tag.clone().unwrap_or_else(|| cfg.addr.clone());
            upstreams.push(UpstreamWrapper::new(name, cfg.tag.clone(), upstream));
        }
        let timeout = match args.timeout_ms {
            0 => DEFAULT_EXCHANGE_TIMEOUT,
            ms => Duration::from_millis(ms),
        };
        Self::with_upstreams(upstreams, args.concurrent, timeout)
    }

    /// `forward udp://a tcp://b ..` quick setup.
    pub fn quick_setup(addrs: &[&str]) -> Result<Self, SetupError> {
        let args = ForwardArgs {
            concurrent: MAX_CONCURRENT,
            upstreams: addrs
                .iter()
                .map(|a| UpstreamConfig {
                    addr: a.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Self::from_args(&args)
    }

    pub fn with_upstreams(
        upstreams: Vec<UpstreamWrapper>,
        concurrent: usize,
        exchange_timeout: Duration,
    ) -> Result<Self, SetupError> {
        if upstreams.is_empty() {
            return Err(SetupError::NoUpstream);
        }
        let mut tags = HashSet::new();
        for u in &upstreams {
            if let Some(tag) = &u.tag {
                if !tags.insert(tag.as_str()) {
                    return Err(SetupError::DuplicateUpstreamTag(tag.clone()));
                }
            }
        }
        Ok(Self {
            upstreams: upstreams.into_iter().map(Arc::new).collect(),
            concurrent,
            exchange_timeout,
            next_start: AtomicUsize::new(0),
        })
    }

    /// min(configured, selected, 3); a configured 0 counts as 1.
    pub fn concurrency_bound(&self, selected: usize) -> usize {
        self.concurrent.max(1).min(selected).min(MAX_CONCURRENT)
    }

    /// Exchanges against the upstreams named by `tags`; every tag must exist.
    pub fn select(&self, tags: &[String]) -> Result<Vec<Arc<UpstreamWrapper>>, SetupError> {
        tags.iter()
            .map(|t| {
                self.upstreams
                    .iter()
                    .find(|u| u.tag.as_deref() == Some(t.as_str()))
                    .cloned()
                    .ok_or_else(|| SetupError::UnknownUpstreamTag(t.clone()))
            })
            .collect()
    }

    /// Tag-scoped executable over a fixed subset of upstreams.
    pub fn scoped(self: &Arc<Self>, tags: &[String]) -> Result<ScopedForward, SetupError> {
        let upstreams = self.select(tags)?;
        Ok(ScopedForward {
            forward: Arc::clone(self),
            upstreams,
        })
    }

    pub async fn exchange(
        &self,
        ctx: &QueryContext,
        upstreams: &[Arc<UpstreamWrapper>],
    ) -> Result<Message, ForwardError> {
        if upstreams.is_empty() {
            return Err(ForwardError::NoUpstream);
        }
        let bound = self.concurrency_bound(upstreams.len());
        let start = self.next_start.fetch_add(1, Ordering::Relaxed);
        let timeout = self.exchange_timeout;

        // Dropping the set aborts whatever is still running.
        let mut tasks = JoinSet::new();
        let mut launched = Vec::with_capacity(bound);
        for i in 0..bound {
            let u = Arc::clone(&upstreams[(start + i) % upstreams.len()]);
            launched.push(u.name().to_string());
            let query = ctx.query().clone();
            tasks.spawn(async move {
                let res = match tokio::time::timeout(timeout, u.upstream.exchange(&query)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow::anyhow!("upstream timeout after {:?}", timeout)),
                };
                (u, res)
            });
        }

        let mut failures = Vec::new();
        loop {
            let joined = tokio::select! {
                cause = ctx.done() => {
                    return Err(ForwardError::Aborted { cause, failures });
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                return Err(ForwardError::AllFailed(failures));
            };
            let (u, res) = match joined {
                Ok(v) => v,
                Err(err) => {
                    warn!(target = "forward", uqid = ctx.id(), error = %err, "exchange task failed");
                    failures.push(UpstreamFailure {
                        upstream: "<task>".to_string(),
                        reason: FailureReason::Error(err.to_string()),
                    });
                    continue;
                }
            };
            match res {
                Ok(resp) if resp.response_code() == ResponseCode::NoError => {
                    debug!(
                        target = "forward",
                        uqid = ctx.id(),
                        upstream = %u.name(),
                        launched = launched.len(),
                        "upstream answered"
                    );
                    return Ok(resp);
                }
                Ok(resp) => failures.push(UpstreamFailure {
                    upstream: u.name().to_string(),
                    reason: FailureReason::Rcode(resp.response_code()),
                }),
                Err(err) => {
                    debug!(target = "forward", uqid = ctx.id(), upstream = %u.name(), error = %err, "upstream failed");
                    failures.push(UpstreamFailure {
                        upstream: u.name().to_string(),
                        reason: FailureReason::Error(format!("{:#}", err)),
                    });
                }
            }
        }
    }

    pub async fn exec_with(
        &self,
        ctx: &mut QueryContext,
        upstreams: &[Arc<UpstreamWrapper>],
    ) -> anyhow::Result<()> {
        let resp = self.exchange(ctx, upstreams).await?;
        ctx.set_response(resp);
        Ok(())
    }

    pub async fn close_upstreams(&self) {
        for u in &self.upstreams {
            u.upstream.close().await;
        }
    }
}

fn merge_options(args: &ForwardArgs, cfg: &UpstreamConfig) -> UpstreamOptions {
    UpstreamOptions {
        addr: cfg.addr.clone(),
        dial: DialOptions {
            dial_addr: cfg.dial_addr.clone(),
            socks5: cfg.socks5.clone().or_else(|| args.socks5.clone()),
            so_mark: cfg.so_mark.or(args.so_mark),
            bind_to_device: cfg
                .bind_to_device
                .clone()
                .or_else(|| args.bind_to_device.clone()),
        },
        idle_timeout: cfg.idle_timeout.map(Duration::from_secs),
        enable_pipeline: cfg.enable_pipeline,
        max_conns: cfg.max_conns,
    }
}

#[async_trait]
impl Executable for Forward {
    async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()> {
        let upstreams = self.upstreams.clone();
        self.exec_with(ctx, &upstreams).await
    }

    async fn close(&self) {
        self.close_upstreams().await;
    }
}

/// `$forward tag1 tag2`: the forward executor limited to some upstreams.
///
/// A failed exchange is logged and leaves the response unset, so a later
/// node (e.g. `!has_resp`) can fall back to other upstreams.
pub struct ScopedForward {
    forward: Arc<Forward>,
    upstreams: Vec<Arc<UpstreamWrapper>>,
}

#[async_trait]
impl Executable for ScopedForward {
    async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()> {
        match self.forward.exchange(ctx, &self.upstreams).await {
            Ok(resp) => ctx.set_response(resp),
            Err(err) => {
                warn!(target = "forward", uqid = ctx.id(), error = %err, "scoped forward failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    use anyhow::bail;
    use hickory_proto::rr::RecordType;

    use super::*;
    use crate::dns_utils::build_reply;
    use crate::dns_utils::testing::{a_reply, query};

    enum Behavior {
        Answer(Duration),
        Rcode(ResponseCode),
        Fail,
        Hang,
    }

    struct Mock {
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Upstream for Mock {
        async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Answer(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(a_reply(query, Ipv4Addr::new(1, 2, 3, 4), 60))
                }
                Behavior::Rcode(rcode) => Ok(build_reply(query, rcode)),
                Behavior::Fail => bail!("connection refused"),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    fn mock(tag: &str, behavior: Behavior, calls: &Arc<AtomicUsize>) -> UpstreamWrapper {
        UpstreamWrapper::new(
            tag,
            Some(tag.to_string()),
            Arc::new(Mock {
                behavior,
                calls: Arc::clone(calls),
            }),
        )
    }

    fn ctx() -> QueryContext {
        QueryContext::new(query("example.com.", RecordType::A))
    }

    #[test]
    fn concurrency_is_min_of_configured_upstreams_and_three() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ups = |n: usize| {
            (0..n)
                .map(|i| mock(&format!("u{}", i), Behavior::Fail, &calls))
                .collect::<Vec<_>>()
        };
        let t = DEFAULT_EXCHANGE_TIMEOUT;
        assert_eq!(Forward::with_upstreams(ups(5), 10, t).unwrap().concurrency_bound(5), 3);
        assert_eq!(Forward::with_upstreams(ups(2), 10, t).unwrap().concurrency_bound(2), 2);
        assert_eq!(Forward::with_upstreams(ups(5), 2, t).unwrap().concurrency_bound(5), 2);
        assert_eq!(Forward::with_upstreams(ups(5), 0, t).unwrap().concurrency_bound(5), 1);
    }

    #[tokio::test]
    async fn launches_at_most_bound_upstreams() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ups = (0..5)
            .map(|i| mock(&format!("u{}", i), Behavior::Fail, &calls))
            .collect();
        let f = Forward::with_upstreams(ups, 8, DEFAULT_EXCHANGE_TIMEOUT).unwrap();
        let err = f.exchange(&ctx(), &f.upstreams).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.failures().len(), 3);
    }

    #[tokio::test]
    async fn single_success_wins_over_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ups = vec![
            mock("bad", Behavior::Fail, &calls),
            mock("refused", Behavior::Rcode(ResponseCode::Refused), &calls),
            mock("good", Behavior::Answer(Duration::from_millis(20)), &calls),
        ];
        let f = Forward::with_upstreams(ups, 3, DEFAULT_EXCHANGE_TIMEOUT).unwrap();
        let mut ctx = ctx();
        f.exec(&mut ctx).await.expect("one upstream succeeds");
        let resp = ctx.response().expect("response");
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.id(), ctx.query().id());
    }

    #[tokio::test]
    async fn all_failures_are_enumerated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ups = vec![
            mock("a", Behavior::Fail, &calls),
            mock("b", Behavior::Rcode(ResponseCode::ServFail), &calls),
            mock("c", Behavior::Hang, &calls),
        ];
        let f = Forward::with_upstreams(ups, 3, Duration::from_millis(50)).unwrap();
        let err = f.exchange(&ctx(), &f.upstreams).await.unwrap_err();
        let ForwardError::AllFailed(failures) = &err else {
            panic!("unexpected error {err}");
        };
        let mut names: Vec<_> = failures.iter().map(|f| f.upstream.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["a", "b", "c"]);
        let text = err.to_string();
        assert!(text.contains("connection refused"), "{}", text);
        assert!(text.contains("timeout"), "{}", text);
    }

    #[tokio::test]
    async fn cancellation_aborts_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let f = Forward::with_upstreams(
            vec![mock("slow", Behavior::Hang, &calls)],
            1,
            Duration::from_secs(30),
        )
        .unwrap();
        let ctx = ctx().with_timeout(Duration::from_millis(30));
        let err = f.exchange(&ctx, &f.upstreams).await.unwrap_err();
        assert!(matches!(err, ForwardError::Aborted { .. }));
    }

    #[test]
    fn construction_rejects_empty_and_duplicate_upstreams() {
        assert!(matches!(
            Forward::from_args(&ForwardArgs::default()),
            Err(SetupError::NoUpstream)
        ));
        assert!(matches!(
            Forward::with_upstreams(Vec::new(), 1, DEFAULT_EXCHANGE_TIMEOUT),
            Err(SetupError::NoUpstream)
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let dup = vec![mock("x", Behavior::Fail, &calls), mock("x", Behavior::Fail, &calls)];
        assert!(matches!(
            Forward::with_upstreams(dup, 1, DEFAULT_EXCHANGE_TIMEOUT),
            Err(SetupError::DuplicateUpstreamTag(_))
        ));
        let missing = ForwardArgs {
            upstreams: vec![UpstreamConfig::default()],
            ..Default::default()
        };
        assert!(matches!(
            Forward::from_args(&missing),
            Err(SetupError::MissingUpstreamAddr { index: 0 })
        ));
    }

    #[tokio::test]
    async fn scoped_forward_targets_tagged_subset() {
        let bad_calls = Arc::new(AtomicUsize::new(0));
        let good_calls = Arc::new(AtomicUsize::new(0));
        let ups = vec![
            mock("bad", Behavior::Fail, &bad_calls),
            mock("good", Behavior::Answer(Duration::ZERO), &good_calls),
        ];
        let f = Arc::new(Forward::with_upstreams(ups, 3, DEFAULT_EXCHANGE_TIMEOUT).unwrap());
        let scoped = f.scoped(&["good".to_string()]).unwrap();
        let mut ctx = ctx();
        scoped.exec(&mut ctx).await.unwrap();
        assert!(ctx.response().is_some());
        assert_eq!(bad_calls.load(Ordering::SeqCst), 0);
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);

        let failing = f.scoped(&["bad".to_string()]).unwrap();
        let mut ctx = self::ctx();
        failing.exec(&mut ctx).await.expect("scoped failure is not fatal");
        assert!(ctx.response().is_none());
        assert_eq!(bad_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.scoped(&["nope".to_string()]),
            Err(SetupError::UnknownUpstreamTag(_))
        ));
    }

    #[test]
    fn exchange_timeout_defaults_to_three_seconds() {
        assert_eq!(DEFAULT_EXCHANGE_TIMEOUT, Duration::from_secs(3));
        assert_eq!(MAX_CONCURRENT, 3);
    }
}
