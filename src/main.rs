use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use seqdns::config::{LogConfig, load_config};
use seqdns::server::{self, Runtime, Server};
use seqdns::watcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Configurable DNS forwarder driven by plugin sequences", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/seqdns.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（覆盖配置，默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = load_config(&args.config).context("load initial config")?;
    init_tracing(args.debug, &cfg.log);

    let bind_udp: SocketAddr = cfg.server.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .server
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;
    let udp_workers = [args.udp_workers, cfg.server.udp_workers]
        .into_iter()
        .find(|n| *n > 0)
        .unwrap_or_else(num_cpus::get);

    let runtime = Arc::new(ArcSwap::from_pointee(
        Runtime::build(&cfg).context("build plugins")?,
    ));
    watcher::spawn(
        args.config.clone(),
        runtime.clone(),
        tokio::runtime::Handle::current(),
    );

    let server = Server::new(runtime.clone());
    tokio::select! {
        res = server::serve(server, bind_udp, bind_tcp, udp_workers) => {
            if let Err(err) = res {
                error!(error = %format!("{:#}", err), "server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    runtime.load_full().close().await;
    info!("plugins closed, bye");
    Ok(())
}

fn init_tracing(debug: bool, log: &LogConfig) {
    // RUST_LOG 优先，其次 --debug，最后配置文件中的级别。
    let level = if debug { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(fmt::layer().json().with_ansi(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}
