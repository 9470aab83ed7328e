use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config;
use crate::forward::Forwarder;
use crate::metrics::MetricsSink;

const RELOAD_RETRIES: u32 = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

pub fn spawn(
    path: PathBuf,
    forwarder: Arc<ArcSwap<Forwarder>>,
    metrics: Arc<dyn MetricsSink>,
    runtime: Handle,
) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, forwarder, metrics, runtime) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

/// 重新加载配置并在 tokio 运行时内构建新的 Forwarder（传输层需要 spawn 任务）。
fn reload(
    path: &Path,
    metrics: &Arc<dyn MetricsSink>,
    runtime: &Handle,
) -> anyhow::Result<Forwarder> {
    let cfg = config::load_config(path)?;
    let _guard = runtime.enter();
    Forwarder::from_config(&cfg.forward, Arc::clone(metrics))
}

fn run_watcher(
    path: PathBuf,
    forwarder: Arc<ArcSwap<Forwarder>>,
    metrics: Arc<dyn MetricsSink>,
    runtime: Handle,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Retry to ride out partial writes (truncate then write)
                let mut retries = RELOAD_RETRIES;
                while retries > 0 {
                    match reload(&path, &metrics, &runtime) {
                        Ok(next) => {
                            // 旧 Forwarder 在最后一个在途请求释放后 Drop，随之停止其传输层
                            forwarder.store(Arc::new(next));
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                            } else {
                                thread::sleep(RELOAD_BACKOFF);
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::testing::{UpstreamScript, udp_upstream};

    #[tokio::test(flavor = "multi_thread")]
    async fn reload_builds_forwarder_from_file() {
        let up = udp_upstream(UpstreamScript::Answer).await;
        let path = std::env::temp_dir().join(format!("kixfwd-watch-{}.json", std::process::id()));
        std::fs::write(
            &path,
            format!(r#"{{ "forward": {{ "upstreams": ["{}"] }} }}"#, up.addr),
        )
        .unwrap();

        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let handle = Handle::current();
        let p = path.clone();
        let fwd = tokio::task::spawn_blocking(move || reload(&p, &metrics, &handle))
            .await
            .unwrap()
            .expect("reload");
        assert_eq!(fwd.upstreams(), vec![up.addr]);

        std::fs::write(&path, "{ not json").unwrap();
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let handle = Handle::current();
        let p = path.clone();
        let res = tokio::task::spawn_blocking(move || reload(&p, &metrics, &handle))
            .await
            .unwrap();
        assert!(res.is_err());
        let _ = std::fs::remove_file(&path);
    }
}
