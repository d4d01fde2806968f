//! Shutdown coordination: signal handling and draining live instances

use crate::supervisor::Supervisor;
use std::time::Duration;
use tracing::{info, warn};

/// Resolve when the process is asked to terminate (Ctrl+C, or SIGTERM on unix)
pub async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Stop every instance and wait for their children to be reaped.
///
/// Returns false if some child outlived `grace_period` plus one second.
pub async fn drain(supervisor: &Supervisor, grace_period: Duration) -> bool {
    let count = supervisor.registry().len();
    supervisor.stop_all().await;

    let deadline = grace_period + Duration::from_secs(1);
    if supervisor.wait_for_children(deadline).await {
        info!(count, "All preview instances stopped");
        true
    } else {
        warn!(
            remaining = supervisor.live_children(),
            waited_secs = deadline.as_secs(),
            "Some dev servers did not exit in time"
        );
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ProjectsConfig, RunnerConfig};
    use crate::pool::PoolConfig;
    use crate::proxy::Proxy;
    use crate::registry::Registry;
    use crate::router::Router;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let registry = Arc::new(Registry::new());
        let proxy = Arc::new(Proxy::new(PoolConfig::default(), Duration::from_secs(5)));
        let router = Arc::new(Router::new("/preview", Arc::clone(&registry), proxy, Duration::from_secs(10)));
        // Ignores SIGTERM, so the grace period has to escalate
        let mut runner = RunnerConfig::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
        );
        runner.shutdown_grace_period_secs = 1;
        let projects = ProjectsConfig {
            dir: dir.path().to_path_buf(),
        };
        let supervisor = Arc::new(Supervisor::new(registry, router, runner, projects));

        for name in ["a", "b", "c"] {
            supervisor.start(name).await.unwrap();
        }
        assert_eq!(supervisor.live_children(), 3);

        assert!(drain(&supervisor, Duration::from_secs(1)).await);
        assert!(supervisor.registry().is_empty());
        assert_eq!(supervisor.live_children(), 0);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let proxy = Arc::new(Proxy::new(PoolConfig::default(), Duration::from_secs(5)));
        let router = Arc::new(Router::new("/preview", Arc::clone(&registry), proxy, Duration::from_secs(10)));
        let projects = ProjectsConfig {
            dir: dir.path().to_path_buf(),
        };
        let supervisor = Supervisor::new(registry, router, RunnerConfig::default(), projects);

        assert!(drain(&supervisor, Duration::from_secs(1)).await);
    }
}
