//! Per-query state carried through a sequence.
//!
//! A [`QueryContext`] is owned by exactly one task. Anything that fans out
//! (lazy refresh, dual-stack race, upstream race) works on a [`QueryContext::copy`]
//! and hands the result back explicitly through [`QueryContext::adopt`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant as StdInstant};

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

static NEXT_QUERY_ID: AtomicU32 = AtomicU32::new(1);

pub struct QueryContext {
    id: u32,
    start: StdInstant,
    client: Option<SocketAddr>,
    query: Message,
    response: Option<Message>,
    response_from_cache: bool,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(query: Message) -> Self {
        Self {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            start: StdInstant::now(),
            client: None,
            query,
            response: None,
            response_from_cache: false,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Numeric request id, shared by every copy of this query.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_time(&self) -> StdInstant {
        self.start
    }

    pub fn client(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn query(&self) -> &Message {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut Message {
        &mut self.query
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response_from_cache = false;
        self.response.take()
    }

    /// Sets a freshly produced response.
    pub fn set_response(&mut self, response: Message) {
        self.response = Some(response);
        self.response_from_cache = false;
    }

    /// Sets a response that was served out of a cache. Cache layers never store these again.
    pub fn set_cached_response(&mut self, response: Message) {
        self.response = Some(response);
        self.response_from_cache = true;
    }

    pub fn response_from_cache(&self) -> bool {
        self.response_from_cache
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 第一个问题（仅单问题查询） / The question of a single-question query.
    pub fn single_question(&self) -> Option<(&Name, RecordType, DNSClass)> {
        match self.query.queries() {
            [q] => Some((q.name(), q.query_type(), q.query_class())),
            _ => None,
        }
    }

    /// Independent copy for a concurrent sub-execution. Id and start time are
    /// shared; the copy inherits the deadline but gets a child cancellation token,
    /// so cancelling the original also cancels the copy but not the other way round.
    pub fn copy(&self) -> QueryContext {
        QueryContext {
            id: self.id,
            start: self.start,
            client: self.client,
            query: self.query.clone(),
            response: self.response.clone(),
            response_from_cache: self.response_from_cache,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Copy detached from the caller's cancellation, bounded only by `deadline`.
    pub fn detached_copy(&self, deadline: Instant) -> QueryContext {
        let mut copy = self.copy();
        copy.cancel = CancellationToken::new();
        copy.deadline = Some(deadline);
        copy
    }

    /// Re-adopts the result of a copy. Identity, deadline and cancellation stay with `self`.
    pub fn adopt(&mut self, other: QueryContext) {
        self.query = other.query;
        self.response = other.response;
        self.response_from_cache = other.response_from_cache;
    }

    pub fn check_done(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the query is cancelled or its deadline passes. Pending forever otherwise.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("QueryContext");
        s.field("id", &self.id);
        if let Some((name, qtype, qclass)) = self.single_question() {
            s.field("qname", &name.to_string())
                .field("qtype", &qtype)
                .field("qclass", &qclass);
        } else {
            s.field("questions", &self.query.queries().len());
        }
        s.field("has_resp", &self.response.is_some())
            .field("from_cache", &self.response_from_cache)
            .finish()
    }
}
