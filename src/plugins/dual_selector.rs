//! `prefer_ipv4` / `prefer_ipv6`: races a query against its address-family
//! sibling and suppresses the non-preferred answer when the sibling has records.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::QueryContext;
use crate::dns_utils::{answer_has_type, build_reply, diagnostic_txt};
use crate::error::ContextError;
use crate::sequence::{ChainWalker, RecursiveExecutable};

/// How long a finished original waits for the reference verdict.
pub const REFERENCE_WAIT_TIMEOUT: Duration = Duration::from_millis(400);
/// Bound of both branches when the query itself carries no deadline.
pub const DEFAULT_SUB_ROUTINE_TIMEOUT: Duration = Duration::from_millis(4400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Block,
    Pass,
}

enum Branch {
    Reference(Verdict),
    Original(anyhow::Result<()>, Box<QueryContext>),
    OriginalPanicked,
}

#[derive(Debug, Clone)]
pub struct DualSelector {
    prefer: RecordType,
    annotate: bool,
}

impl DualSelector {
    pub fn prefer_ipv4(annotate: bool) -> Self {
        Self {
            prefer: RecordType::A,
            annotate,
        }
    }

    pub fn prefer_ipv6(annotate: bool) -> Self {
        Self {
            prefer: RecordType::AAAA,
            annotate,
        }
    }

    fn block(&self, ctx: &mut QueryContext) {
        let mut reply = build_reply(ctx.query(), ResponseCode::NoError);
        if self.annotate {
            reply.add_additional(diagnostic_txt(
                "block",
                format!("records may exist, but are blocked in favor of {}", self.prefer),
            ));
        }
        ctx.set_response(reply);
    }
}

fn with_qtype(ctx: &mut QueryContext, qtype: RecordType) {
    let mut queries = ctx.query_mut().take_queries();
    if let Some(q) = queries.first_mut() {
        q.set_query_type(qtype);
    }
    ctx.query_mut().add_queries(queries);
}

#[async_trait]
impl RecursiveExecutable for DualSelector {
    async fn exec(&self, ctx: &mut QueryContext, next: ChainWalker) -> anyhow::Result<()> {
        let qtype = match ctx.single_question() {
            Some((_, qtype, _)) => qtype,
            None => return next.exec_next(ctx).await,
        };
        if qtype == self.prefer || !matches!(qtype, RecordType::A | RecordType::AAAA) {
            return next.exec_next(ctx).await;
        }
        let ref_type = if qtype == RecordType::A {
            RecordType::AAAA
        } else {
            RecordType::A
        };
        let ddl = ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + DEFAULT_SUB_ROUTINE_TIMEOUT);
        let uqid = ctx.id();

        let mut ref_ctx = ctx.copy().with_deadline(ddl);
        with_qtype(&mut ref_ctx, ref_type);
        let mut org_ctx = ctx.copy().with_deadline(ddl);

        // Dropping the set on any return path aborts the branch still running.
        let mut branches = JoinSet::new();
        let ref_next = next.clone();
        branches.spawn(async move {
            let run = tokio::time::timeout_at(ddl, ref_next.exec_next(&mut ref_ctx));
            let verdict = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(Ok(()))) => match ref_ctx.response() {
                    Some(r) if answer_has_type(r, ref_type) => Verdict::Block,
                    _ => Verdict::Pass,
                },
                Ok(Ok(Err(err))) => {
                    warn!(target = "dual_selector", uqid, error = %format!("{:#}", err), "reference query routine err");
                    Verdict::Pass
                }
                Ok(Err(_)) => {
                    debug!(target = "dual_selector", uqid, "reference query timed out");
                    Verdict::Pass
                }
                Err(_) => {
                    warn!(target = "dual_selector", uqid, "reference query routine panicked");
                    Verdict::Pass
                }
            };
            Branch::Reference(verdict)
        });
        branches.spawn(async move {
            let run = tokio::time::timeout_at(ddl, next.exec_next(&mut org_ctx));
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(res)) => Branch::Original(res, Box::new(org_ctx)),
                Ok(Err(_)) => Branch::Original(
                    Err(ContextError::DeadlineExceeded.into()),
                    Box::new(org_ctx),
                ),
                Err(_) => Branch::OriginalPanicked,
            }
        });

        let mut reference: Option<Verdict> = None;
        let mut original: Option<(anyhow::Result<()>, Box<QueryContext>)> = None;
        let mut grace_until: Option<Instant> = None;
        loop {
            let joined = tokio::select! {
                cause = ctx.done() => return Err(cause.into()),
                _ = tokio::time::sleep_until(grace_until.unwrap_or(ddl)), if grace_until.is_some() => {
                    debug!(target = "dual_selector", uqid, "reference verdict not in time, accepting original");
                    None
                }
                joined = branches.join_next() => joined,
            };

            match joined {
                Some(Ok(Branch::Reference(Verdict::Block))) => {
                    debug!(target = "dual_selector", uqid, qtype = %qtype, "blocked by reference");
                    self.block(ctx);
                    return Ok(());
                }
                Some(Ok(Branch::Reference(Verdict::Pass))) => {
                    reference = Some(Verdict::Pass);
                }
                Some(Ok(Branch::Original(res, octx))) => {
                    original = Some((res, octx));
                    if reference.is_none() {
                        grace_until = Some(Instant::now() + REFERENCE_WAIT_TIMEOUT);
                        continue;
                    }
                }
                Some(Ok(Branch::OriginalPanicked)) => {
                    anyhow::bail!("original query routine panicked");
                }
                Some(Err(err)) => {
                    anyhow::bail!("selector branch failed: {}", err);
                }
                None => {}
            }

            // Pass verdict, grace expired, or both branches done: the original decides.
            if let Some((res, octx)) = original.take() {
                ctx.adopt(*octx);
                return res;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dns_utils::testing::{a_reply, aaaa_reply, query};
    use crate::sequence::testing::chain;
    use crate::sequence::{Action, ChainGraph, ChainNode, Executable};

    #[derive(Clone, Copy)]
    enum Reply {
        Records(Duration),
        Empty(Duration),
        Hang,
    }

    /// Answers A and AAAA questions according to the configured behaviour.
    struct Resolver {
        a: Reply,
        aaaa: Reply,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executable for Resolver {
        async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let qtype = ctx.single_question().map(|q| q.1).unwrap();
            let behaviour = if qtype == RecordType::A { self.a } else { self.aaaa };
            let resp = match behaviour {
                Reply::Hang => std::future::pending().await,
                Reply::Empty(d) => {
                    tokio::time::sleep(d).await;
                    build_reply(ctx.query(), ResponseCode::NoError)
                }
                Reply::Records(d) => {
                    tokio::time::sleep(d).await;
                    if qtype == RecordType::A {
                        a_reply(ctx.query(), Ipv4Addr::new(192, 0, 2, 1), 60)
                    } else {
                        aaaa_reply(ctx.query(), Ipv6Addr::LOCALHOST, 60)
                    }
                }
            };
            ctx.set_response(resp);
            Ok(())
        }
    }

    fn walker(selector: DualSelector, a: Reply, aaaa: Reply) -> (ChainWalker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = ChainGraph::new(vec![chain(
            "main",
            vec![
                ChainNode::new(Action::Recursive(Arc::new(selector))),
                ChainNode::new(Action::Exec(Arc::new(Resolver {
                    a,
                    aaaa,
                    calls: Arc::clone(&calls),
                }))),
            ],
        )])
        .unwrap();
        (ChainWalker::new(Arc::new(graph), 0), calls)
    }

    const FAST: Duration = Duration::from_millis(5);
    const SLOW: Duration = Duration::from_millis(80);

    #[tokio::test]
    async fn reference_with_records_blocks_original() {
        let (w, _) = walker(DualSelector::prefer_ipv6(false), Reply::Records(SLOW), Reply::Records(FAST));
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A));
        w.exec_next(&mut ctx).await.unwrap();
        let resp = ctx.response().unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        assert!(resp.additionals().is_empty());
    }

    #[tokio::test]
    async fn late_block_within_grace_still_blocks() {
        let (w, _) = walker(DualSelector::prefer_ipv6(true), Reply::Records(FAST), Reply::Records(SLOW));
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A));
        w.exec_next(&mut ctx).await.unwrap();
        let resp = ctx.response().unwrap();
        assert!(resp.answers().is_empty());
        assert_eq!(resp.additionals().len(), 1);
    }

    #[tokio::test]
    async fn reference_without_records_passes_original() {
        let (w, _) = walker(DualSelector::prefer_ipv6(false), Reply::Records(SLOW), Reply::Empty(FAST));
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A));
        w.exec_next(&mut ctx).await.unwrap();
        let resp = ctx.response().unwrap();
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].record_type(), RecordType::A);
    }

    #[tokio::test]
    async fn silent_reference_fails_open_after_grace() {
        let (w, _) = walker(DualSelector::prefer_ipv6(false), Reply::Records(FAST), Reply::Hang);
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A));
        let started = std::time::Instant::now();
        w.exec_next(&mut ctx).await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(ctx.response().unwrap().answers().len(), 1);
        assert!(elapsed >= REFERENCE_WAIT_TIMEOUT, "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn preferred_type_passes_through() {
        let (w, calls) = walker(DualSelector::prefer_ipv4(false), Reply::Records(FAST), Reply::Records(FAST));
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A));
        w.exec_next(&mut ctx).await.unwrap();
        assert_eq!(ctx.response().unwrap().answers().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut mx = QueryContext::new(query("dual.example.", RecordType::MX));
        w.exec_next(&mut mx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_is_a_hard_failure() {
        let (w, _) = walker(DualSelector::prefer_ipv6(false), Reply::Hang, Reply::Hang);
        let mut ctx = QueryContext::new(query("dual.example.", RecordType::A))
            .with_timeout(Duration::from_millis(30));
        let err = w.exec_next(&mut ctx).await.unwrap_err();
        assert!(err.downcast_ref::<ContextError>().is_some(), "{:#}", err);
        assert!(ctx.response().is_none());
    }

    #[test]
    fn timing_constants() {
        assert_eq!(REFERENCE_WAIT_TIMEOUT, Duration::from_millis(400));
        assert_eq!(DEFAULT_SUB_ROUTINE_TIMEOUT, Duration::from_millis(4400));
    }
}
