use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::server::Runtime;

/// 旧运行时在替换后延迟关闭，让进行中的查询先完成。
const RETIRE_DELAY: Duration = Duration::from_secs(10);
const RELOAD_RETRIES: usize = 3;

pub fn spawn(path: PathBuf, runtime: Arc<ArcSwap<Runtime>>, handle: Handle) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, runtime, handle) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, runtime: Arc<ArcSwap<Runtime>>, handle: Handle) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(event) if event.kind.is_access() => {}
            Ok(_event) => reload(&path, &runtime, &handle),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Rebuilds every plugin from the file; on failure the running config stays.
fn reload(path: &Path, runtime: &Arc<ArcSwap<Runtime>>, handle: &Handle) {
    // Plugins may start timers while being built.
    let _guard = handle.enter();
    // Retry to ride out truncate+write races.
    let mut retries = RELOAD_RETRIES;
    while retries > 0 {
        match config::load_config(path).and_then(|cfg| Runtime::build(&cfg)) {
            Ok(next) => {
                let old = runtime.swap(Arc::new(next));
                info!(target = "watcher", path = %path.display(), "config reloaded");
                handle.spawn(async move {
                    tokio::time::sleep(RETIRE_DELAY).await;
                    old.close().await;
                    debug!(target = "watcher", "previous plugins closed");
                });
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %format!("{:#}", err), "config reload failed, keeping old config");
                } else {
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}
