use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// 插件定义，按顺序构建。
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志级别：trace/debug/info/warn/error，缺省info。
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 格式日志。
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 入口 sequence 的 tag。
    #[serde(default = "default_entry")]
    pub entry: String,
    /// 单个查询的总超时（毫秒）。
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// UDP worker 数量，0 表示按 CPU 核数。
    #[serde(default)]
    pub udp_workers: usize,
    /// 本地合成应答（pong 等）附加诊断 TXT 记录。
    #[serde(default)]
    pub annotate: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            entry: default_entry(),
            query_timeout_ms: default_query_timeout_ms(),
            udp_workers: 0,
            annotate: false,
        }
    }
}

/// `{tag, type, args}`; `args` is decoded per plugin type when the registry is built.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 单条 sequence 规则：裸字符串，或 `{matches, exec}`。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Exec(String),
    Rule {
        #[serde(default)]
        matches: OneOrMany,
        #[serde(default)]
        exec: String,
    },
}

impl RuleConfig {
    pub fn matches(&self) -> &[String] {
        match self {
            RuleConfig::Exec(_) => &[],
            RuleConfig::Rule { matches, .. } => matches.as_slice(),
        }
    }

    pub fn exec(&self) -> &str {
        match self {
            RuleConfig::Exec(exec) => exec,
            RuleConfig::Rule { exec, .. } => exec,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_slice(&self) -> &[String] {
        match self {
            OneOrMany::None => &[],
            OneOrMany::One(s) => std::slice::from_ref(s),
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForwardArgs {
    /// 并发上游数量，0 视为 1，上限 3。
    #[serde(default)]
    pub concurrent: usize,
    /// 单次交换超时（毫秒），0 使用缺省 3000。
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// 以下为全局缺省值，可被单个上游覆盖。
    #[serde(default)]
    pub socks5: Option<String>,
    #[serde(default)]
    pub so_mark: Option<u32>,
    #[serde(default)]
    pub bind_to_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub tag: Option<String>,
    /// `scheme://host[:port]`，scheme 缺省 udp，端口缺省 53。
    #[serde(default)]
    pub addr: String,
    /// 实际拨号地址（IP 或 IP:port）。
    #[serde(default)]
    pub dial_addr: Option<String>,
    #[serde(default)]
    pub socks5: Option<String>,
    #[serde(default)]
    pub so_mark: Option<u32>,
    #[serde(default)]
    pub bind_to_device: Option<String>,
    /// 空闲连接超时（秒）。
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    /// TCP 上游是否启用 pipeline 复用。
    #[serde(default)]
    pub enable_pipeline: bool,
    #[serde(default)]
    pub max_conns: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheArgs {
    /// 缓存条目数，最小 1024。
    #[serde(default = "default_cache_size")]
    pub size: usize,
    /// 惰性缓存 TTL（秒），0 表示关闭。
    #[serde(default)]
    pub lazy_cache_ttl: u64,
}

impl Default for CacheArgs {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            lazy_cache_ttl: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SelectorArgs {
    /// 在阻断应答中附加诊断 TXT 记录。
    #[serde(default)]
    pub annotate: bool,
}

/// Decodes plugin `args`; a missing (`null`) value means all defaults.
pub fn plugin_args<T>(plugin: &PluginConfig) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if plugin.args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(plugin.args.clone())
        .with_context(|| format!("invalid args of plugin {} ({})", plugin.tag, plugin.kind))
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // 轻量校验：监听地址提前解析。
    cfg.server
        .bind_udp
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid bind_udp {}", cfg.server.bind_udp))?;
    cfg.server
        .bind_tcp
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid bind_tcp {}", cfg.server.bind_tcp))?;
    for plugin in &cfg.plugins {
        if plugin.tag.is_empty() {
            anyhow::bail!("plugin of type {} has an empty tag", plugin.kind);
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_and_log_sections_default_when_omitted() {
        let cfg: AppConfig = serde_json::from_value(json!({ "plugins": [] })).expect("parse config");
        assert_eq!(cfg.server.entry, "main");
        assert_eq!(cfg.server.bind_udp, "0.0.0.0:5353");
        assert_eq!(cfg.server.query_timeout_ms, 5000);
        assert!(!cfg.server.annotate);
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.log.json);
    }

    #[test]
    fn sequence_rules_accept_bare_and_full_entries() {
        let raw = json!({
            "plugins": [
                {
                    "tag": "main",
                    "type": "sequence",
                    "args": [
                        "log debug",
                        { "matches": "qtype AAAA", "exec": "reject 3" },
                        { "matches": ["qname example.com", "!has_resp"], "exec": "$forward" },
                        { "exec": "accept" }
                    ]
                }
            ]
        });
        let cfg: AppConfig = serde_json::from_value(raw).expect("parse config");
        let rules: Vec<RuleConfig> = plugin_args(&cfg.plugins[0]).expect("rules");
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].exec(), "log debug");
        assert!(rules[0].matches().is_empty());
        assert_eq!(rules[1].matches(), ["qtype AAAA".to_string()]);
        assert_eq!(rules[2].matches().len(), 2);
        assert_eq!(rules[3].exec(), "accept");
    }

    #[test]
    fn forward_args_parse_with_global_defaults() {
        let plugin: PluginConfig = serde_json::from_value(json!({
            "tag": "fwd",
            "type": "forward",
            "args": {
                "concurrent": 2,
                "so_mark": 255,
                "upstreams": [
                    { "tag": "a", "addr": "udp://1.1.1.1" },
                    { "addr": "tcp://8.8.8.8", "enable_pipeline": true, "max_conns": 4 }
                ]
            }
        }))
        .unwrap();
        let args: ForwardArgs = plugin_args(&plugin).expect("forward args");
        assert_eq!(args.concurrent, 2);
        assert_eq!(args.so_mark, Some(255));
        assert_eq!(args.upstreams.len(), 2);
        assert!(args.upstreams[1].enable_pipeline);
        assert_eq!(args.upstreams[1].max_conns, Some(4));
    }

    #[test]
    fn missing_args_fall_back_to_defaults() {
        let plugin: PluginConfig =
            serde_json::from_value(json!({ "tag": "c", "type": "cache" })).unwrap();
        let args: CacheArgs = plugin_args(&plugin).unwrap();
        assert_eq!(args.size, 1024);
        assert_eq!(args.lazy_cache_ttl, 0);
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_entry() -> String {
    "main".to_string()
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    1024
}
