//! Inactivity reaper

use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Stop every instance whose last ping is older than `stale_after` as of `now`.
/// Returns the names that were stopped.
pub async fn sweep_at(supervisor: &Supervisor, now: Instant, stale_after: Duration) -> Vec<String> {
    let mut stopped = Vec::new();
    for (name, id) in supervisor.registry().stale(now, stale_after) {
        info!(name = %name, stale_after_secs = stale_after.as_secs(), "Keepalive expired, stopping instance");
        // A restart since the scan replaced the generation; leave it alone
        if supervisor.stop_generation(&name, id).await {
            stopped.push(name);
        }
    }
    stopped
}

/// Sweep on a fixed interval until shutdown is signalled
pub async fn run_reaper(
    supervisor: Arc<Supervisor>,
    interval: Duration,
    stale_after: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(
        interval_secs = interval.as_secs(),
        stale_after_secs = stale_after.as_secs(),
        "Reaper started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let stopped = sweep_at(&supervisor, Instant::now(), stale_after).await;
                if !stopped.is_empty() {
                    info!(count = stopped.len(), "Reaped stale instances");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Reaper stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ProjectsConfig, RunnerConfig};
    use crate::pool::PoolConfig;
    use crate::proxy::Proxy;
    use crate::registry::Registry;
    use crate::router::Router;
    use tempfile::TempDir;

    const STALE_AFTER: Duration = Duration::from_secs(60);

    fn create_supervisor() -> (Arc<Supervisor>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["demo", "other"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let registry = Arc::new(Registry::new());
        let proxy = Arc::new(Proxy::new(PoolConfig::default(), Duration::from_secs(5)));
        let router = Arc::new(Router::new("/preview", Arc::clone(&registry), proxy, Duration::from_secs(10)));
        let mut runner = RunnerConfig::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
        runner.shutdown_grace_period_secs = 1;
        let projects = ProjectsConfig {
            dir: dir.path().to_path_buf(),
        };
        (Arc::new(Supervisor::new(registry, router, runner, projects)), dir)
    }

    #[tokio::test]
    async fn test_fresh_instances_survive_sweep() {
        let (supervisor, _dir) = create_supervisor();
        supervisor.start("demo").await.unwrap();

        let stopped = sweep_at(&supervisor, Instant::now(), STALE_AFTER).await;
        assert!(stopped.is_empty());
        assert!(supervisor.registry().contains("demo"));

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_sweep_after_threshold_stops_and_unmounts() {
        let (supervisor, _dir) = create_supervisor();
        supervisor.start("demo").await.unwrap();
        assert!(supervisor.router().is_mounted("demo"));

        let later = Instant::now() + Duration::from_secs(61);
        let stopped = sweep_at(&supervisor, later, STALE_AFTER).await;

        assert_eq!(stopped, vec!["demo".to_string()]);
        assert!(supervisor.registry().get("demo").is_none());
        assert!(!supervisor.router().is_mounted("demo"));
        assert!(!supervisor.registry().touch("demo"));
        assert!(supervisor.wait_for_children(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_ping_keeps_instance_alive() {
        let (supervisor, _dir) = create_supervisor();
        supervisor.start("demo").await.unwrap();
        supervisor.start("other").await.unwrap();

        let stale_after = Duration::from_millis(500);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(supervisor.registry().touch("demo"));

        let stopped = sweep_at(&supervisor, Instant::now(), stale_after).await;
        assert_eq!(stopped, vec!["other".to_string()]);
        assert!(supervisor.registry().contains("demo"));
        assert!(!supervisor.registry().contains("other"));

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_run_reaper_exits_on_shutdown() {
        let (supervisor, _dir) = create_supervisor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_reaper(
            supervisor,
            Duration::from_secs(3600),
            STALE_AFTER,
            shutdown_rx,
        ));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaper should stop")
            .unwrap();
    }
}
