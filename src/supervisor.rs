//! Process supervisor for preview dev servers
//!
//! Owns the lifecycle of every child process:
//!
//! - `start` stops any prior instance of the same name, allocates a port,
//!   spawns the runner command in the project directory, mounts the routes and
//!   registers the instance as `starting`.
//! - Output readers feed each stdout/stderr line through the
//!   [`OutputClassifier`] and apply the resulting transition.
//! - A monitor task per child owns the `Child` handle. It tears the instance
//!   down when the child exits, fails it when the startup window lapses, and
//!   runs the SIGTERM-then-SIGKILL sequence when asked to terminate.
//!
//! Start and stop for one name are serialized by a per-name async lock, so two
//! concurrent starts can never leave an unowned child behind.

use crate::classify::{OutputClassifier, OutputStream};
use crate::config::{ProjectsConfig, RunnerConfig};
use crate::error::PreviewError;
use crate::port::PortClaims;
use crate::registry::{
    next_instance_id, Instance, InstanceId, InstanceStatus, Registry, StatusChange,
};
use crate::router::Router;
use crate::toolchain::resolve_command;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Longest accepted instance name
const MAX_NAME_LEN: usize = 64;

/// Check that `name` is usable as a route segment and project directory
pub fn validate_name(name: &str) -> Result<(), PreviewError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PreviewError::InvalidName(name.to_string()))
    }
}

/// Outcome of a successful start
#[derive(Debug, Clone)]
pub struct Started {
    pub id: InstanceId,
    pub port: u16,
    pub pid: Option<u32>,
}

/// Decrements the live-monitor count when a monitor task ends
struct MonitorGuard(Arc<watch::Sender<usize>>);

impl MonitorGuard {
    fn new(counter: Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct Supervisor {
    registry: Arc<Registry>,
    router: Arc<Router>,
    runner: RunnerConfig,
    projects: ProjectsConfig,
    classifier: OutputClassifier,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    ports: PortClaims,
    monitors: Arc<watch::Sender<usize>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        runner: RunnerConfig,
        projects: ProjectsConfig,
    ) -> Self {
        let classifier = OutputClassifier::new(runner.rules.clone());
        let (monitors, _) = watch::channel(0usize);
        Self {
            registry,
            router,
            runner,
            projects,
            classifier,
            locks: DashMap::new(),
            ports: PortClaims::new(),
            monitors: Arc::new(monitors),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Validate `name` and return its project directory if it exists
    pub async fn project_dir(&self, name: &str) -> Result<PathBuf, PreviewError> {
        validate_name(name)?;
        let dir = self.projects.project_dir(name);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(PreviewError::NotFound(name.to_string())),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start (or restart) the preview for `name`.
    ///
    /// Unknown projects and a missing toolchain are rejected before anything
    /// changes. A spawn failure leaves an `error` instance registered so the
    /// failure stays observable through status queries.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<Started, PreviewError> {
        let project_dir = self.project_dir(name).await?;
        let program = resolve_command(&self.runner.command)?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.stop_locked(name);

        let port = self.ports.allocate(self.runner.first_port)?;
        let id = next_instance_id();
        let routes = self.router.mount(name, port);

        info!(name, port, command = %program.display(), "Starting dev server");

        let mut cmd = Command::new(&program);
        cmd.args(self.runner.args_for_port(port))
            .current_dir(&project_dir)
            .envs(&self.runner.env)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so stop reaches the whole tree
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(name, port, error = %e, "Failed to spawn dev server");
                let instance = Instance::new(id, name, port, routes).with_spawn_error(e.to_string());
                self.registry.insert(instance);
                return Err(PreviewError::SpawnFailure {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        info!(name, port, pid = ?pid, "Dev server spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        self.registry
            .insert(Instance::new(id, name, port, routes).with_child(pid, terminate_tx));

        if let Some(stdout) = stdout {
            self.spawn_output_reader(name, id, OutputStream::Stdout, stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_output_reader(name, id, OutputStream::Stderr, stderr);
        }
        self.spawn_monitor(name, id, child, terminate_rx);

        Ok(Started { id, port, pid })
    }

    /// Stop the instance registered under `name`. Returns false if none was.
    pub async fn stop(&self, name: &str) -> bool {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.stop_locked(name)
    }

    /// Stop `name` only if generation `id` is still the registered one
    pub async fn stop_generation(&self, name: &str, id: InstanceId) -> bool {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        match self.registry.remove_generation(name, id) {
            Some(instance) => {
                self.teardown(instance);
                true
            }
            None => false,
        }
    }

    fn stop_locked(&self, name: &str) -> bool {
        match self.registry.remove(name) {
            Some(instance) => {
                self.teardown(instance);
                true
            }
            None => false,
        }
    }

    /// Unmount and signal an instance already removed from the registry
    fn teardown(&self, mut instance: Instance) {
        self.router.unmount(instance.routes());
        self.ports.release(instance.port());
        if let Some(terminate) = instance.take_terminate() {
            if terminate.send(()).is_err() {
                debug!(name = instance.name(), "Dev server already exited");
            }
        }
        info!(
            name = instance.name(),
            port = instance.port(),
            pid = ?instance.pid(),
            "Stopped preview instance"
        );
    }

    /// Stop every registered instance
    pub async fn stop_all(&self) {
        let names = self.registry.names();
        if !names.is_empty() {
            info!(count = names.len(), "Stopping all preview instances");
        }
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Wait until every monitor task has reaped its child.
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_children(&self, timeout: Duration) -> bool {
        let mut rx = self.monitors.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    /// Number of children still owned by a monitor task
    pub fn live_children(&self) -> usize {
        *self.monitors.borrow()
    }

    /// Feed one line of child output through the classifier
    pub fn record_output(
        &self,
        name: &str,
        id: InstanceId,
        stream: OutputStream,
        line: &str,
    ) -> Option<StatusChange> {
        debug!(name, stream = stream.as_str(), "{}", line);

        let transition = self.classifier.classify(stream, line)?;
        let change = self.registry.apply(name, id, transition)?;
        if change.changed() {
            match change.to {
                InstanceStatus::Running => info!(name, "Dev server is serving"),
                InstanceStatus::Error => warn!(name, line, "Dev server reported an error"),
                InstanceStatus::Starting => {}
            }
        }
        Some(change)
    }

    fn spawn_output_reader<R>(self: &Arc<Self>, name: &str, id: InstanceId, stream: OutputStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        supervisor.record_output(&name, id, stream, line);
                    }
                    Err(e) => {
                        debug!(name = %name, stream = stream.as_str(), error = %e, "Output stream closed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        name: &str,
        id: InstanceId,
        mut child: Child,
        mut terminate: oneshot::Receiver<()>,
    ) {
        let supervisor = Arc::clone(self);
        let guard = MonitorGuard::new(Arc::clone(&self.monitors));
        let name = name.to_string();
        let startup_timeout = self.runner.startup_timeout();
        let grace_period = self.runner.shutdown_grace_period();

        tokio::spawn(async move {
            let _guard = guard;
            let startup = async {
                match startup_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(startup);
            let mut startup_elapsed = false;

            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => info!(name = %name, ?status, "Dev server exited"),
                            Err(e) => warn!(name = %name, error = %e, "Error waiting for dev server"),
                        }
                        supervisor.on_child_exit(&name, id);
                        return;
                    }
                    // A dropped sender means the instance is gone as well
                    _ = &mut terminate => {
                        terminate_child(&name, &mut child, grace_period).await;
                        return;
                    }
                    _ = &mut startup, if !startup_elapsed => {
                        startup_elapsed = true;
                        let secs = startup_timeout.map(|t| t.as_secs()).unwrap_or_default();
                        let message = format!("no readiness signal within {} seconds", secs);
                        if supervisor.registry.fail_if_starting(&name, id, message) {
                            warn!(name = %name, timeout_secs = secs, "Dev server startup timed out");
                        }
                    }
                }
            }
        });
    }

    /// Tear down generation `id` after its child exited on its own
    fn on_child_exit(&self, name: &str, id: InstanceId) {
        if let Some(instance) = self.registry.remove_generation(name, id) {
            self.router.unmount(instance.routes());
            self.ports.release(instance.port());
            info!(name, port = instance.port(), "Removed exited preview instance");
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL after `grace_period`
async fn terminate_child(name: &str, child: &mut Child, grace_period: Duration) {
    let pid = child.id();
    if let Some(pid) = pid {
        info!(name, pid, "Sending SIGTERM to dev server");

        #[cfg(unix)]
        {
            signal_group(name, pid, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!(name, pid, error = %e, "Failed to signal dev server");
            }
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => info!(name, ?status, "Dev server exited gracefully"),
        Ok(Err(e)) => warn!(name, error = %e, "Error waiting for dev server to exit"),
        Err(_) => {
            warn!(
                name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    signal_group(name, pid, libc::SIGKILL);
                }
            }
            if let Err(e) = child.kill().await {
                warn!(name, error = %e, "Failed to kill dev server");
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(name: &str, pid: u32, signal: libc::c_int) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group the
    // child leads; the child is not yet reaped so the group id is ours.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        warn!(name, pid, signal, error = %err, "Failed to signal dev server process group");
    }
}
