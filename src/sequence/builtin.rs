//! Small built-in executables usable from quick-setup strings.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use tracing::{Level, debug, error, info, trace, warn};

use super::Executable;
use crate::context::QueryContext;
use crate::dns_utils::{build_reply, diagnostic_txt};
use crate::error::SetupError;

/// `pong` / `pongerr`: answer locally with an empty authoritative reply.
#[derive(Debug, Clone)]
pub struct Pong {
    /// `pongerr` keeps the rcode of an already present response.
    keep_rcode: bool,
    /// Free-form text for the diagnostic TXT record; `None` disables annotation.
    note: Option<String>,
}

impl Pong {
    pub fn new(keep_rcode: bool, note: Option<String>) -> Self {
        Self { keep_rcode, note }
    }
}

#[async_trait]
impl Executable for Pong {
    async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()> {
        let rcode = match ctx.response() {
            Some(resp) if self.keep_rcode => resp.response_code(),
            _ => ResponseCode::NoError,
        };
        let mut reply = build_reply(ctx.query(), rcode);
        reply.set_authoritative(true);
        if let Some(note) = &self.note {
            let elapsed = ctx.start_time().elapsed();
            let text = if note.is_empty() {
                format!("elapsed {:?}", elapsed)
            } else {
                format!("{} elapsed {:?}", note, elapsed)
            };
            reply.add_additional(diagnostic_txt("pong", text));
        }
        ctx.set_response(reply);
        Ok(())
    }
}

/// `log [level]`: one structured line describing the query and its current response.
#[derive(Debug, Clone)]
pub struct LogQuery {
    level: Level,
}

impl LogQuery {
    pub fn parse(level: Option<&str>) -> Result<Self, SetupError> {
        let level = match level.map(str::to_ascii_lowercase).as_deref() {
            None | Some("info") => Level::INFO,
            Some("trace") => Level::TRACE,
            Some("debug") => Level::DEBUG,
            Some("warn") => Level::WARN,
            Some("error") => Level::ERROR,
            Some(other) => {
                return Err(SetupError::InvalidArgs {
                    what: "log level",
                    value: other.to_string(),
                });
            }
        };
        Ok(Self { level })
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

#[async_trait]
impl Executable for LogQuery {
    async fn exec(&self, ctx: &mut QueryContext) -> anyhow::Result<()> {
        let (qname, qtype) = match ctx.single_question() {
            Some((name, qtype, _)) => (name.to_utf8(), qtype.to_string()),
            None => (String::new(), format!("{} questions", ctx.query().queries().len())),
        };
        let client = ctx.client().map(|c| c.to_string()).unwrap_or_default();
        let rcode = ctx
            .response()
            .map(|r| format!("{:?}", r.response_code()))
            .unwrap_or_default();
        let elapsed_ms = ctx.start_time().elapsed().as_millis() as u64;
        let uqid = ctx.id();
        let from_cache = ctx.response_from_cache();

        macro_rules! emit {
            ($mac:ident) => {
                $mac!(
                    event = "query_log",
                    uqid,
                    qname = %qname,
                    qtype = %qtype,
                    client = %client,
                    rcode = %rcode,
                    from_cache,
                    elapsed_ms,
                    "query"
                )
            };
        }
        match self.level {
            Level::TRACE => emit!(trace),
            Level::DEBUG => emit!(debug),
            Level::INFO => emit!(info),
            Level::WARN => emit!(warn),
            _ => emit!(error),
        }
        Ok(())
    }
}
