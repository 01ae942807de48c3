use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, RecordType};
use ipnet::IpNet;
use regex::Regex;

use super::Matcher;
use crate::context::QueryContext;
use crate::dns_utils::{parse_dns_class, parse_rcode, parse_record_type};
use crate::error::SetupError;

/// Built-in query / response predicates.
#[derive(Debug, Clone)]
pub enum QueryMatcher {
    AlwaysTrue,
    AlwaysFalse,
    /// Domain suffix match on label boundary, values are lowercase without trailing dot.
    Qname { suffixes: Vec<String> },
    QnameRegex { regexes: Vec<Regex> },
    Qtype { types: Vec<RecordType> },
    Qclass { classes: Vec<DNSClass> },
    ClientIp { nets: Vec<IpNet> },
    HasResp,
    Rcode { codes: Vec<ResponseCode> },
    Not(Box<QueryMatcher>),
}

#[inline]
fn normalize_qname(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[inline]
fn suffix_match(qname: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return true;
    }
    match qname.strip_suffix(suffix) {
        Some("") => true,
        Some(rest) => rest.ends_with('.'),
        None => false,
    }
}

impl QueryMatcher {
    /// Parses one matcher expression, e.g. `qname example.com`, `!has_resp`, `qtype A AAAA`.
    pub fn parse(expr: &str) -> Result<Self, SetupError> {
        let expr = expr.trim();
        if let Some(inner) = expr.strip_prefix('!') {
            return Ok(QueryMatcher::Not(Box::new(Self::parse(inner)?)));
        }
        let mut parts = expr.split_whitespace();
        let kind = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let need_args = |what: &'static str| -> Result<(), SetupError> {
            if args.is_empty() {
                return Err(SetupError::InvalidArgs {
                    what,
                    value: expr.to_string(),
                });
            }
            Ok(())
        };
        let invalid = |what: &'static str, value: &str| SetupError::InvalidArgs {
            what,
            value: value.to_string(),
        };

        let m = match kind {
            "true" => QueryMatcher::AlwaysTrue,
            "false" => QueryMatcher::AlwaysFalse,
            "has_resp" => QueryMatcher::HasResp,
            "qname" => {
                need_args("qname matcher")?;
                QueryMatcher::Qname {
                    suffixes: args.iter().map(|s| normalize_qname(s)).collect(),
                }
            }
            "qname_regex" => {
                need_args("qname_regex matcher")?;
                let regexes = args
                    .iter()
                    .map(|s| Regex::new(s).map_err(|_| invalid("regex", s)))
                    .collect::<Result<_, _>>()?;
                QueryMatcher::QnameRegex { regexes }
            }
            "qtype" => {
                need_args("qtype matcher")?;
                let types = args
                    .iter()
                    .map(|s| parse_record_type(s).ok_or_else(|| invalid("qtype", s)))
                    .collect::<Result<_, _>>()?;
                QueryMatcher::Qtype { types }
            }
            "qclass" => {
                need_args("qclass matcher")?;
                let classes = args
                    .iter()
                    .map(|s| parse_dns_class(s).ok_or_else(|| invalid("qclass", s)))
                    .collect::<Result<_, _>>()?;
                QueryMatcher::Qclass { classes }
            }
            "client_ip" => {
                need_args("client_ip matcher")?;
                let nets = args
                    .iter()
                    .map(|s| {
                        s.parse::<IpNet>()
                            .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                            .map_err(|_| invalid("cidr", s))
                    })
                    .collect::<Result<_, _>>()?;
                QueryMatcher::ClientIp { nets }
            }
            "rcode" => {
                need_args("rcode matcher")?;
                let codes = args
                    .iter()
                    .map(|s| parse_rcode(s).ok_or_else(|| invalid("rcode", s)))
                    .collect::<Result<_, _>>()?;
                QueryMatcher::Rcode { codes }
            }
            other => return Err(SetupError::UnknownMatcher(other.to_string())),
        };
        Ok(m)
    }

    pub fn into_arc(self) -> Arc<dyn Matcher> {
        Arc::new(self)
    }

    fn eval(&self, ctx: &QueryContext) -> bool {
        match self {
            QueryMatcher::AlwaysTrue => true,
            QueryMatcher::AlwaysFalse => false,
            QueryMatcher::Qname { suffixes } => {
                let qname = match ctx.single_question() {
                    Some((name, _, _)) => normalize_qname(&name.to_utf8()),
                    None => return false,
                };
                suffixes.iter().any(|s| suffix_match(&qname, s))
            }
            QueryMatcher::QnameRegex { regexes } => {
                let qname = match ctx.single_question() {
                    Some((name, _, _)) => normalize_qname(&name.to_utf8()),
                    None => return false,
                };
                regexes.iter().any(|r| r.is_match(&qname))
            }
            QueryMatcher::Qtype { types } => ctx
                .query()
                .queries()
                .iter()
                .any(|q| types.contains(&q.query_type())),
            QueryMatcher::Qclass { classes } => ctx
                .query()
                .queries()
                .iter()
                .any(|q| classes.contains(&q.query_class())),
            QueryMatcher::ClientIp { nets } => match ctx.client() {
                Some(addr) => {
                    let ip = addr.ip().to_canonical();
                    nets.iter().any(|n| n.contains(&ip))
                }
                None => false,
            },
            QueryMatcher::HasResp => ctx.response().is_some(),
            QueryMatcher::Rcode { codes } => ctx
                .response()
                .is_some_and(|r| codes.contains(&r.response_code())),
            QueryMatcher::Not(inner) => !inner.eval(ctx),
        }
    }
}

impl Matcher for QueryMatcher {
    fn matches(&self, ctx: &QueryContext) -> anyhow::Result<bool> {
        Ok(self.eval(ctx))
    }
}
