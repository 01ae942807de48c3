use std::fmt;

use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// 配置加载阶段的错误，出现即拒绝启动 / Load-time errors; the server never starts serving on these.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no upstream is configured")]
    NoUpstream,
    #[error("upstream #{index} invalid args, addr is required")]
    MissingUpstreamAddr { index: usize },
    #[error("duplicated upstream tag {0}")]
    DuplicateUpstreamTag(String),
    #[error("cannot find upstream by tag {0}")]
    UnknownUpstreamTag(String),
    #[error("duplicated plugin tag {0}")]
    DuplicatePluginTag(String),
    #[error("unknown plugin type {kind} (tag {tag})")]
    UnknownPluginType { tag: String, kind: String },
    #[error("can not find {action} target {target}")]
    UnresolvedTarget { action: &'static str, target: String },
    #[error("plugin {0} not found")]
    UnknownPlugin(String),
    #[error("plugin {0} is a sequence, use jump or goto")]
    SequenceAsExec(String),
    #[error("entry sequence {0} not found")]
    MissingEntry(String),
    #[error("invalid {what} [{value}]")]
    InvalidArgs { what: &'static str, value: String },
    #[error("unknown exec {0}")]
    UnknownExec(String),
    #[error("unknown matcher {0}")]
    UnknownMatcher(String),
}

/// 查询上下文被取消或超时 / The ambient context of a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
pub enum FailureReason {
    Error(String),
    Rcode(ResponseCode),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Error(err) => f.write_str(err),
            FailureReason::Rcode(rcode) => write!(f, "rcode {:?}", rcode),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamFailure {
    pub upstream: String,
    pub reason: FailureReason,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream {}: {}", self.upstream, self.reason)
    }
}

/// Forward 执行失败时的汇总错误，逐个列出每个上游 / Aggregate forward failure listing every upstream.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no upstream to exchange")]
    NoUpstream,
    #[error("all upstreams failed: {}", join_failures(.0))]
    AllFailed(Vec<UpstreamFailure>),
    #[error("exchange: {cause} (after {})", join_failures(.failures))]
    Aborted {
        cause: ContextError,
        failures: Vec<UpstreamFailure>,
    },
}

impl ForwardError {
    pub fn failures(&self) -> &[UpstreamFailure] {
        match self {
            ForwardError::NoUpstream => &[],
            ForwardError::AllFailed(f) => f,
            ForwardError::Aborted { failures, .. } => failures,
        }
    }
}

fn join_failures(failures: &[UpstreamFailure]) -> String {
    if failures.is_empty() {
        return "no result".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
