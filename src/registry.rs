//! Typed plugin registry. Builds every plugin once from configuration and
//! links all sequences into a single [`ChainGraph`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use hickory_proto::op::ResponseCode;
use tracing::{debug, info};

use crate::config::{
    CacheArgs, ForwardArgs, PluginConfig, RuleConfig, SelectorArgs, plugin_args,
};
use crate::dns_utils::parse_rcode;
use crate::error::SetupError;
use crate::plugins::{Cache, DualSelector, Forward};
use crate::sequence::builtin::{LogQuery, Pong};
use crate::sequence::matchers::QueryMatcher;
use crate::sequence::{
    Action, Chain, ChainGraph, ChainId, ChainNode, ChainWalker, Executable, RecursiveExecutable,
};

const SEQUENCE: &str = "sequence";

/// A built, non-sequence plugin.
#[derive(Clone)]
pub enum PluginRef {
    Exec(Arc<dyn Executable>),
    Recursive(Arc<dyn RecursiveExecutable>),
    /// Kept typed so `$tag upstream..` can build a scoped variant.
    Forward(Arc<Forward>),
}

impl PluginRef {
    fn action(&self) -> Action {
        match self {
            PluginRef::Exec(e) => Action::Exec(Arc::clone(e)),
            PluginRef::Recursive(r) => Action::Recursive(Arc::clone(r)),
            PluginRef::Forward(f) => Action::Exec(Arc::clone(f) as Arc<dyn Executable>),
        }
    }

    async fn close(&self) {
        match self {
            PluginRef::Exec(e) => e.close().await,
            PluginRef::Recursive(r) => r.close().await,
            PluginRef::Forward(f) => f.close().await,
        }
    }
}

pub struct PluginRegistry {
    graph: Arc<ChainGraph>,
    plugins: HashMap<String, PluginRef>,
    /// Instances created by quick-setup strings; closed together with the tagged ones.
    anonymous: Vec<PluginRef>,
}

/// Registry-wide switches applied to quick-setup plugins.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Synthetic replies (`pong`, quick-setup selectors) carry a diagnostic TXT record.
    pub annotate: bool,
}

struct Linker<'a> {
    opts: &'a RegistryOptions,
    chain_ids: &'a HashMap<String, ChainId>,
    plugins: &'a HashMap<String, PluginRef>,
    anonymous: Vec<PluginRef>,
}

impl PluginRegistry {
    pub fn build(configs: &[PluginConfig]) -> Result<Self> {
        Self::build_with(configs, &RegistryOptions::default())
    }

    pub fn build_with(configs: &[PluginConfig], opts: &RegistryOptions) -> Result<Self> {
        // Sequences get their ids first so jump/goto may point forward or form cycles.
        let mut chain_ids = HashMap::new();
        let mut seen = HashSet::new();
        for cfg in configs {
            if !seen.insert(cfg.tag.as_str()) {
                return Err(SetupError::DuplicatePluginTag(cfg.tag.clone()).into());
            }
            if cfg.kind == SEQUENCE {
                let id = chain_ids.len();
                chain_ids.insert(cfg.tag.clone(), id);
            }
        }

        let mut plugins = HashMap::new();
        for cfg in configs.iter().filter(|c| c.kind != SEQUENCE) {
            let plugin = build_plugin(cfg)?;
            debug!(target = "registry", tag = %cfg.tag, kind = %cfg.kind, "plugin loaded");
            plugins.insert(cfg.tag.clone(), plugin);
        }

        let mut linker = Linker {
            opts,
            chain_ids: &chain_ids,
            plugins: &plugins,
            anonymous: Vec::new(),
        };
        let mut chains = Vec::with_capacity(chain_ids.len());
        for cfg in configs.iter().filter(|c| c.kind == SEQUENCE) {
            let rules: Vec<RuleConfig> = plugin_args(cfg)?;
            let mut nodes = Vec::with_capacity(rules.len());
            for rule in &rules {
                nodes.push(linker.node(rule)?);
            }
            chains.push(Chain {
                tag: cfg.tag.clone(),
                nodes,
            });
        }
        let anonymous = linker.anonymous;
        let graph = ChainGraph::new(chains)?;
        info!(
            target = "registry",
            sequences = graph.len(),
            plugins = plugins.len(),
            "plugin registry built"
        );
        Ok(Self {
            graph: Arc::new(graph),
            plugins,
            anonymous,
        })
    }

    pub fn graph(&self) -> &Arc<ChainGraph> {
        &self.graph
    }

    pub fn plugin(&self, tag: &str) -> Option<&PluginRef> {
        self.plugins.get(tag)
    }

    /// Walker positioned at the start of sequence `entry`.
    pub fn walker(&self, entry: &str) -> Result<ChainWalker, SetupError> {
        let id = self
            .graph
            .chain_id(entry)
            .ok_or_else(|| SetupError::MissingEntry(entry.to_string()))?;
        Ok(ChainWalker::new(Arc::clone(&self.graph), id))
    }

    /// Closes every plugin, releasing upstream connections.
    pub async fn close(&self) {
        for p in self.plugins.values().chain(self.anonymous.iter()) {
            p.close().await;
        }
    }
}

fn build_plugin(cfg: &PluginConfig) -> Result<PluginRef> {
    let plugin = match cfg.kind.as_str() {
        "forward" => {
            let args: ForwardArgs = plugin_args(cfg)?;
            PluginRef::Forward(Arc::new(Forward::from_args(&args)?))
        }
        "cache" => {
            let args: CacheArgs = plugin_args(cfg)?;
            PluginRef::Recursive(Arc::new(Cache::new(&args)))
        }
        "prefer_ipv4" => {
            let args: SelectorArgs = plugin_args(cfg)?;
            PluginRef::Recursive(Arc::new(DualSelector::prefer_ipv4(args.annotate)))
        }
        "prefer_ipv6" => {
            let args: SelectorArgs = plugin_args(cfg)?;
            PluginRef::Recursive(Arc::new(DualSelector::prefer_ipv6(args.annotate)))
        }
        other => {
            return Err(SetupError::UnknownPluginType {
                tag: cfg.tag.clone(),
                kind: other.to_string(),
            }
            .into());
        }
    };
    Ok(plugin)
}

impl Linker<'_> {
    fn node(&mut self, rule: &RuleConfig) -> Result<ChainNode, SetupError> {
        let matchers = rule
            .matches()
            .iter()
            .map(|m| QueryMatcher::parse(m).map(QueryMatcher::into_arc))
            .collect::<Result<Vec<_>, _>>()?;
        let action = self.action(rule.exec())?;
        Ok(ChainNode { matchers, action })
    }

    fn target(&self, action: &'static str, args: &[&str]) -> Result<ChainId, SetupError> {
        let tag = args.first().copied().unwrap_or_default();
        self.chain_ids
            .get(tag)
            .copied()
            .ok_or_else(|| SetupError::UnresolvedTarget {
                action,
                target: tag.to_string(),
            })
    }

    fn keep(&mut self, plugin: PluginRef) -> Action {
        let action = plugin.action();
        self.anonymous.push(plugin);
        action
    }

    /// Parses one quick-setup exec string.
    fn action(&mut self, exec: &str) -> Result<Action, SetupError> {
        let mut parts = exec.split_whitespace();
        let Some(head) = parts.next() else {
            return Err(SetupError::InvalidArgs {
                what: "exec",
                value: exec.to_string(),
            });
        };
        let args: Vec<&str> = parts.collect();

        if let Some(tag) = head.strip_prefix('$') {
            return self.plugin_action(tag, &args);
        }

        let action = match head {
            "accept" => Action::Accept,
            "return" => Action::Return,
            "reject" => {
                let rcode = match args.first() {
                    Some(s) => parse_rcode(s).ok_or_else(|| SetupError::InvalidArgs {
                        what: "rcode",
                        value: s.to_string(),
                    })?,
                    None => ResponseCode::NoError,
                };
                Action::Reject(rcode)
            }
            "jump" => Action::Jump(self.target("jump", &args)?),
            "goto" => Action::Goto(self.target("goto", &args)?),
            "pong" | "pongerr" => {
                let note = self.opts.annotate.then(|| args.join(" "));
                Action::Exec(Arc::new(Pong::new(head == "pongerr", note)))
            }
            "log" => Action::Exec(Arc::new(LogQuery::parse(args.first().copied())?)),
            "forward" => {
                let forward = Forward::quick_setup(&args)?;
                self.keep(PluginRef::Forward(Arc::new(forward)))
            }
            "cache" => {
                let size = match args.first() {
                    Some(s) => Some(s.parse::<usize>().map_err(|_| SetupError::InvalidArgs {
                        what: "cache size",
                        value: s.to_string(),
                    })?),
                    None => None,
                };
                self.keep(PluginRef::Recursive(Arc::new(Cache::quick_setup(size))))
            }
            "prefer_ipv4" => {
                Action::Recursive(Arc::new(DualSelector::prefer_ipv4(self.opts.annotate)))
            }
            "prefer_ipv6" => {
                Action::Recursive(Arc::new(DualSelector::prefer_ipv6(self.opts.annotate)))
            }
            other => return Err(SetupError::UnknownExec(other.to_string())),
        };
        Ok(action)
    }

    fn plugin_action(&mut self, tag: &str, args: &[&str]) -> Result<Action, SetupError> {
        if self.chain_ids.contains_key(tag) {
            return Err(SetupError::SequenceAsExec(tag.to_string()));
        }
        let Some(plugin) = self.plugins.get(tag) else {
            return Err(SetupError::UnknownPlugin(tag.to_string()));
        };
        if args.is_empty() {
            return Ok(plugin.action());
        }
        match plugin {
            PluginRef::Forward(forward) => {
                let tags: Vec<String> = args.iter().map(|s| s.to_string()).collect();
                Ok(Action::Exec(Arc::new(forward.scoped(&tags)?)))
            }
            _ => Err(SetupError::InvalidArgs {
                what: "plugin args",
                value: format!("${} {}", tag, args.join(" ")),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hickory_proto::op::Message;
    use hickory_proto::rr::RecordType;
    use serde_json::json;

    use super::*;
    use crate::context::QueryContext;
    use crate::dns_utils::build_reply;
    use crate::dns_utils::testing::{a_reply, query};
    use crate::upstream::transport::testing::udp_server;

    fn plugins(value: serde_json::Value) -> Vec<PluginConfig> {
        serde_json::from_value(value).expect("plugin configs")
    }

    fn setup_err(value: serde_json::Value) -> SetupError {
        let err = PluginRegistry::build(&plugins(value))
            .err()
            .expect("build must fail");
        match err.downcast::<SetupError>() {
            Ok(e) => e,
            Err(other) => panic!("not a setup error: {:#}", other),
        }
    }

    #[test]
    fn unresolved_jump_target_fails_at_load() {
        let err = setup_err(json!([
            { "tag": "main", "type": "sequence", "args": ["jump nowhere"] }
        ]));
        assert!(matches!(err, SetupError::UnresolvedTarget { action: "jump", .. }));

        let err = setup_err(json!([
            { "tag": "main", "type": "sequence", "args": [{ "exec": "goto" }] }
        ]));
        assert!(matches!(err, SetupError::UnresolvedTarget { action: "goto", .. }));
    }

    #[test]
    fn invalid_references_fail_at_load() {
        assert!(matches!(
            setup_err(json!([
                { "tag": "main", "type": "sequence", "args": ["$missing"] }
            ])),
            SetupError::UnknownPlugin(_)
        ));
        assert!(matches!(
            setup_err(json!([
                { "tag": "sub", "type": "sequence", "args": ["accept"] },
                { "tag": "main", "type": "sequence", "args": ["$sub"] }
            ])),
            SetupError::SequenceAsExec(_)
        ));
        assert!(matches!(
            setup_err(json!([
                { "tag": "a", "type": "sequence", "args": [] },
                { "tag": "a", "type": "cache" }
            ])),
            SetupError::DuplicatePluginTag(_)
        ));
        assert!(matches!(
            setup_err(json!([{ "tag": "x", "type": "geosite" }])),
            SetupError::UnknownPluginType { .. }
        ));
        assert!(matches!(
            setup_err(json!([
                { "tag": "main", "type": "sequence", "args": ["teleport"] }
            ])),
            SetupError::UnknownExec(_)
        ));
        assert!(matches!(
            setup_err(json!([
                { "tag": "fwd", "type": "forward", "args": { "upstreams": [] } }
            ])),
            SetupError::NoUpstream
        ));
        assert!(matches!(
            setup_err(json!([
                { "tag": "fwd", "type": "forward", "args": { "upstreams": [
                    { "tag": "a", "addr": "1.1.1.1" }
                ] } },
                { "tag": "main", "type": "sequence", "args": ["$fwd b"] }
            ])),
            SetupError::UnknownUpstreamTag(_)
        ));
    }

    #[tokio::test]
    async fn forward_references_and_cycles_link() {
        let registry = PluginRegistry::build(&plugins(json!([
            { "tag": "main", "type": "sequence", "args": [
                { "matches": "qname blocked.example", "exec": "reject 3" },
                "jump sub",
                "pongerr"
            ] },
            { "tag": "sub", "type": "sequence", "args": [
                { "matches": "qtype AAAA", "exec": "goto main" },
                "pong",
                "return"
            ] }
        ])))
        .expect("registry");
        let walker = registry.walker("main").unwrap();

        let mut blocked = QueryContext::new(query("www.blocked.example.", RecordType::A));
        walker.exec_next(&mut blocked).await.unwrap();
        assert_eq!(blocked.response().unwrap().response_code(), ResponseCode::NXDomain);

        let mut ok = QueryContext::new(query("www.example.", RecordType::A));
        walker.exec_next(&mut ok).await.unwrap();
        let resp = ok.response().unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.authoritative());

        assert!(matches!(registry.walker("nope"), Err(SetupError::MissingEntry(_))));
    }

    #[tokio::test]
    async fn configured_pipeline_forwards_and_caches() {
        let (addr, hits) = udp_server(Arc::new(|req: &Message| {
            Some(a_reply(req, Ipv4Addr::new(203, 0, 113, 5), 300))
        }))
        .await;
        let registry = PluginRegistry::build(&plugins(json!([
            { "tag": "fwd", "type": "forward", "args": {
                "upstreams": [{ "tag": "local", "addr": format!("udp://{}", addr) }]
            } },
            { "tag": "cache", "type": "cache", "args": { "size": 64 } },
            { "tag": "main", "type": "sequence", "args": [
                "$cache",
                { "matches": "has_resp", "exec": "accept" },
                "$fwd local"
            ] }
        ])))
        .expect("registry");
        let walker = registry.walker("main").unwrap();

        for _ in 0..3 {
            let mut ctx = QueryContext::new(query("cached.example.", RecordType::A));
            walker.exec_next(&mut ctx).await.unwrap();
            assert_eq!(ctx.response().unwrap().answers().len(), 1);
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        registry.close().await;
    }

    #[tokio::test]
    async fn failed_scoped_forward_falls_through_to_next_node() {
        let (bad, _) = udp_server(Arc::new(|req: &Message| {
            Some(build_reply(req, ResponseCode::ServFail))
        }))
        .await;
        let (good, good_hits) = udp_server(Arc::new(|req: &Message| {
            Some(a_reply(req, Ipv4Addr::new(198, 51, 100, 7), 60))
        }))
        .await;
        let registry = PluginRegistry::build(&plugins(json!([
            { "tag": "fwd", "type": "forward", "args": {
                "concurrent": 2,
                "upstreams": [
                    { "tag": "cf", "addr": format!("udp://{}", bad) },
                    { "tag": "good", "addr": format!("udp://{}", good) }
                ]
            } },
            { "tag": "main", "type": "sequence", "args": [
                "$fwd cf",
                { "matches": "!has_resp", "exec": "$fwd" }
            ] }
        ])))
        .expect("registry");
        let walker = registry.walker("main").unwrap();

        let mut ctx = QueryContext::new(query("fallback.example.", RecordType::A));
        walker.exec_next(&mut ctx).await.expect("fallback recovers");
        let resp = ctx.response().expect("fallback answered");
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
        assert!(good_hits.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        registry.close().await;
    }

    #[tokio::test]
    async fn bare_reject_replies_noerror() {
        let registry = PluginRegistry::build(&plugins(json!([
            { "tag": "main", "type": "sequence", "args": ["reject"] }
        ])))
        .expect("registry");
        let mut ctx = QueryContext::new(query("www.example.", RecordType::A));
        registry.walker("main").unwrap().exec_next(&mut ctx).await.unwrap();
        let resp = ctx.response().expect("response");
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn pong_text_is_annotated_only_when_enabled() {
        let config = plugins(json!([
            { "tag": "main", "type": "sequence", "args": ["pong blocked-by-list"] }
        ]));

        let plain = PluginRegistry::build(&config).expect("pong text loads");
        let mut ctx = QueryContext::new(query("www.example.", RecordType::A));
        plain.walker("main").unwrap().exec_next(&mut ctx).await.unwrap();
        assert!(ctx.response().unwrap().additionals().is_empty());

        let opts = RegistryOptions { annotate: true };
        let annotated = PluginRegistry::build_with(&config, &opts).expect("registry");
        let mut ctx = QueryContext::new(query("www.example.", RecordType::A));
        annotated.walker("main").unwrap().exec_next(&mut ctx).await.unwrap();
        let resp = ctx.response().unwrap();
        assert_eq!(resp.additionals().len(), 1);
        let txt = resp.additionals()[0].data().and_then(|d| d.as_txt()).expect("txt");
        let text = String::from_utf8_lossy(&txt.txt_data()[0]);
        assert!(text.starts_with("blocked-by-list elapsed"), "{}", text);
    }
}
