//! Sequence execution.
//!
//! A configuration is linked once into a [`ChainGraph`]: every sequence becomes a
//! [`Chain`] addressed by a [`ChainId`], and `jump`/`goto` targets are stored as
//! ids, never looked up by tag at query time. [`ChainWalker`] walks a chain with an
//! explicit position plus a jump-back stack instead of nested continuations.

pub mod builtin;
pub mod matchers;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use hickory_proto::op::ResponseCode;
use tracing::trace;

use crate::context::QueryContext;
use crate::dns_utils::build_reply;
use crate::error::SetupError;

pub type ChainId = usize;

/// Upper bound of jump/goto hops a single walk may take; guards against `jump` loops.
pub const MAX_CHAIN_HOPS: u32 = 64;

/// 纯谓词，不得修改上下文 / Pure predicate over a query context.
pub trait Matcher: Send + Sync {
    fn matches(&self, ctx: &QueryContext) -> anyhow::Result<bool>;
}

/// An action that runs and lets the walker move on to the next node.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()>;

    /// Releases resources held by the plugin (connections, background tasks).
    async fn close(&self) {}
}

/// An action that receives the rest of the walk and decides if and when to continue it.
#[async_trait]
pub trait RecursiveExecutable: Send + Sync {
    async fn exec(&self, ctx: &mut QueryContext, next: ChainWalker) -> anyhow::Result<()>;

    async fn close(&self) {}
}

#[derive(Clone)]
pub enum Action {
    Accept,
    Reject(ResponseCode),
    Return,
    Jump(ChainId),
    Goto(ChainId),
    Exec(Arc<dyn Executable>),
    Recursive(Arc<dyn RecursiveExecutable>),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Accept => f.write_str("Accept"),
            Action::Reject(rcode) => write!(f, "Reject({:?})", rcode),
            Action::Return => f.write_str("Return"),
            Action::Jump(id) => write!(f, "Jump({})", id),
            Action::Goto(id) => write!(f, "Goto({})", id),
            Action::Exec(_) => f.write_str("Exec"),
            Action::Recursive(_) => f.write_str("Recursive"),
        }
    }
}

#[derive(Clone)]
pub struct ChainNode {
    pub matchers: Vec<Arc<dyn Matcher>>,
    pub action: Action,
}

impl ChainNode {
    pub fn new(action: Action) -> Self {
        Self {
            matchers: Vec::new(),
            action,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// All matchers must hold; the first `false` short-circuits.
    fn matches(&self, ctx: &QueryContext) -> anyhow::Result<bool> {
        for m in &self.matchers {
            if !m.matches(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct Chain {
    pub tag: String,
    pub nodes: Vec<ChainNode>,
}

/// Fully linked set of sequences.
pub struct ChainGraph {
    chains: Vec<Chain>,
    by_tag: HashMap<String, ChainId>,
}

impl ChainGraph {
    /// Links the chains. Every jump/goto target must name an existing chain.
    pub fn new(chains: Vec<Chain>) -> Result<Self, SetupError> {
        let mut by_tag = HashMap::with_capacity(chains.len());
        for (id, chain) in chains.iter().enumerate() {
            if by_tag.insert(chain.tag.clone(), id).is_some() {
                return Err(SetupError::DuplicatePluginTag(chain.tag.clone()));
            }
        }
        for chain in &chains {
            for node in &chain.nodes {
                let (action, target) = match node.action {
                    Action::Jump(t) => ("jump", t),
                    Action::Goto(t) => ("goto", t),
                    _ => continue,
                };
                if target >= chains.len() {
                    return Err(SetupError::UnresolvedTarget {
                        action,
                        target: format!("#{}", target),
                    });
                }
            }
        }
        Ok(Self { chains, by_tag })
    }

    pub fn chain_id(&self, tag: &str) -> Option<ChainId> {
        self.by_tag.get(tag).copied()
    }

    pub fn chain(&self, id: ChainId) -> Option<&Chain> {
        self.chains.get(id)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    chain: ChainId,
    pos: usize,
}

/// The remaining part of a walk: current chain, next node index and the jump-back stack.
#[derive(Clone)]
pub struct ChainWalker {
    graph: Arc<ChainGraph>,
    chain: ChainId,
    pos: usize,
    jump_back: Vec<Frame>,
    hops: u32,
}

impl ChainWalker {
    pub fn new(graph: Arc<ChainGraph>, chain: ChainId) -> Self {
        Self {
            graph,
            chain,
            pos: 0,
            jump_back: Vec::new(),
            hops: 0,
        }
    }

    /// Runs the rest of the walk against `ctx`. The walker itself is not consumed,
    /// so a recursive executable may run the same continuation on a copied context.
    pub fn exec_next<'a>(&self, ctx: &'a mut QueryContext) -> BoxFuture<'a, anyhow::Result<()>> {
        let mut walker = self.clone();
        async move { walker.run(ctx).await }.boxed()
    }

    fn resume_jump_back(&mut self) -> bool {
        match self.jump_back.pop() {
            Some(frame) => {
                self.chain = frame.chain;
                self.pos = frame.pos;
                true
            }
            None => false,
        }
    }

    fn hop(&mut self, target: ChainId) -> anyhow::Result<()> {
        self.hops += 1;
        if self.hops > MAX_CHAIN_HOPS {
            bail!("max jump limit reached ({} hops)", MAX_CHAIN_HOPS);
        }
        self.chain = target;
        self.pos = 0;
        Ok(())
    }

    async fn run(&mut self, ctx: &mut QueryContext) -> anyhow::Result<()> {
        let graph = Arc::clone(&self.graph);
        loop {
            let Some(chain) = graph.chain(self.chain) else {
                bail!("chain #{} does not exist", self.chain);
            };
            let Some(node) = chain.nodes.get(self.pos) else {
                // End of chain: time to jump back, if we got here by a jump.
                if self.resume_jump_back() {
                    continue;
                }
                return Ok(());
            };

            if !node.matches(ctx)? {
                self.pos += 1;
                continue;
            }

            trace!(uqid = ctx.id(), chain = %chain.tag, node = self.pos, action = ?node.action, "exec node");
            match &node.action {
                Action::Accept => return Ok(()),
                Action::Reject(rcode) => {
                    let reply = build_reply(ctx.query(), *rcode);
                    ctx.set_response(reply);
                    return Ok(());
                }
                Action::Return => {
                    if self.resume_jump_back() {
                        continue;
                    }
                    return Ok(());
                }
                Action::Jump(target) => {
                    self.jump_back.push(Frame {
                        chain: self.chain,
                        pos: self.pos + 1,
                    });
                    self.hop(*target)?;
                }
                Action::Goto(target) => {
                    self.jump_back.clear();
                    self.hop(*target)?;
                }
                Action::Exec(exec) => {
                    exec.exec(ctx).await?;
                    self.pos += 1;
                }
                Action::Recursive(exec) => {
                    let mut next = self.clone();
                    next.pos += 1;
                    return exec.exec(ctx, next).await;
                }
            }
        }
    }
}
