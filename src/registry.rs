//! Instance registry: the single authority for "is X running"
//!
//! Entries are keyed by instance name. Each entry sits behind its own mutex
//! so that read-modify-write of one instance never interleaves with another
//! task touching the same instance.

use crate::classify::Transition;
use crate::error::ErrorKind;
use crate::router::RouteHandle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Generation id distinguishing successive instances with the same name
pub type InstanceId = u64;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique instance id
pub fn next_instance_id() -> InstanceId {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Spawned, no readiness signal seen yet
    Starting,
    /// The child announced it is serving
    Running,
    /// The child reported a failure or could not be spawned
    Error,
}

/// One live (starting, running or errored) preview
pub struct Instance {
    id: InstanceId,
    name: String,
    pid: Option<u32>,
    port: u16,
    status: InstanceStatus,
    last_ping: Instant,
    started_at: DateTime<Utc>,
    error: Option<String>,
    routes: RouteHandle,
    /// Asks the monitor task to terminate the child; `None` when nothing was spawned
    terminate: Option<oneshot::Sender<()>>,
}

impl Instance {
    pub fn new(id: InstanceId, name: &str, port: u16, routes: RouteHandle) -> Self {
        Self {
            id,
            name: name.to_string(),
            pid: None,
            port,
            status: InstanceStatus::Starting,
            last_ping: Instant::now(),
            started_at: Utc::now(),
            error: None,
            routes,
            terminate: None,
        }
    }

    /// Attach the spawned child's pid and termination channel
    pub fn with_child(mut self, pid: Option<u32>, terminate: oneshot::Sender<()>) -> Self {
        self.pid = pid;
        self.terminate = Some(terminate);
        self
    }

    /// Record a spawn failure
    pub fn with_spawn_error(mut self, error: String) -> Self {
        self.status = InstanceStatus::Error;
        self.error = Some(error);
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn routes(&self) -> &RouteHandle {
        &self.routes
    }

    /// Why the instance is in `error`: nothing spawned, or the child failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match (self.status, self.pid) {
            (InstanceStatus::Error, None) => Some(ErrorKind::SpawnFailure),
            (InstanceStatus::Error, Some(_)) => Some(ErrorKind::RuntimeFailure),
            _ => None,
        }
    }

    /// Take the termination channel, leaving `None` behind
    pub fn take_terminate(&mut self) -> Option<oneshot::Sender<()>> {
        self.terminate.take()
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            port: self.port,
            pid: self.pid,
            error: self.error.clone(),
            kind: self.error_kind(),
            started_at: self.started_at,
            last_ping_secs_ago: self.last_ping.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of an instance, as served by the status routes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    #[serde(skip)]
    pub id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    pub port: u16,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub last_ping_secs_ago: u64,
}

/// Result of applying an output transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Process-wide map from instance name to its live state
#[derive(Default)]
pub struct Registry {
    instances: DashMap<String, Mutex<Instance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance, returning any instance it displaced
    pub fn insert(&self, instance: Instance) -> Option<Instance> {
        self.instances
            .insert(instance.name.clone(), Mutex::new(instance))
            .map(Mutex::into_inner)
    }

    /// Remove whatever instance is registered under `name`
    pub fn remove(&self, name: &str) -> Option<Instance> {
        self.instances.remove(name).map(|(_, i)| i.into_inner())
    }

    /// Remove the instance under `name` only if it is generation `id`
    pub fn remove_generation(&self, name: &str, id: InstanceId) -> Option<Instance> {
        self.instances
            .remove_if(name, |_, i| i.lock().id == id)
            .map(|(_, i)| i.into_inner())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Current generation registered under `name`
    pub fn current_id(&self, name: &str) -> Option<InstanceId> {
        self.instances.get(name).map(|i| i.lock().id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Record a keepalive ping; returns false if `name` is not registered
    pub fn touch(&self, name: &str) -> bool {
        match self.instances.get(name) {
            Some(instance) => {
                instance.lock().last_ping = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Apply an output-derived transition to generation `id` of `name`
    pub fn apply(&self, name: &str, id: InstanceId, transition: Transition) -> Option<StatusChange> {
        let entry = self.instances.get(name)?;
        let mut instance = entry.lock();
        if instance.id != id {
            return None;
        }
        let from = instance.status;
        match transition {
            Transition::Running => instance.status = InstanceStatus::Running,
            Transition::Error(text) => {
                instance.status = InstanceStatus::Error;
                instance.error = Some(text);
            }
        }
        Some(StatusChange {
            from,
            to: instance.status,
        })
    }

    /// Move generation `id` of `name` to `error` if it is still `starting`
    pub fn fail_if_starting(&self, name: &str, id: InstanceId, error: String) -> bool {
        let Some(entry) = self.instances.get(name) else {
            return false;
        };
        let mut instance = entry.lock();
        if instance.id != id || instance.status != InstanceStatus::Starting {
            return false;
        }
        instance.status = InstanceStatus::Error;
        instance.error = Some(error);
        true
    }

    pub fn get(&self, name: &str) -> Option<InstanceSnapshot> {
        self.instances.get(name).map(|i| i.lock().snapshot())
    }

    /// Snapshots of every registered instance, ordered by name
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let mut all: Vec<InstanceSnapshot> =
            self.instances.iter().map(|e| e.value().lock().snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Instances whose last ping is older than `threshold` as of `now`
    pub fn stale(&self, now: Instant, threshold: Duration) -> Vec<(String, InstanceId)> {
        self.instances
            .iter()
            .filter_map(|entry| {
                let instance = entry.value().lock();
                let idle = now.saturating_duration_since(instance.last_ping);
                (idle > threshold).then(|| (entry.key().clone(), instance.id))
            })
            .collect()
    }
}
