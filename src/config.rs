use crate::classify::{OutputStream, StatusRule};
use crate::registry::InstanceStatus;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in runner arguments that is replaced with the allocated port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Global configuration for the preview server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where project trees live
    #[serde(default)]
    pub projects: ProjectsConfig,

    /// How the dev-server child process is launched and classified
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Keepalive and reaping settings
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port this server listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Externally visible base URL used to build preview URLs.
    /// Defaults to `http://localhost:{port}`.
    pub public_url: Option<String>,

    /// Path prefix under which per-instance routes are mounted
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Max time to wait for a proxied response from a child, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per child (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// Base URL for preview links, without a trailing slash
    pub fn public_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    /// Public URL of the preview page for `name`
    pub fn preview_url(&self, name: &str) -> String {
        format!("{}{}/{}", self.public_base_url(), self.route_prefix, name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            public_url: None,
            route_prefix: default_route_prefix(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectsConfig {
    /// Directory holding one sub-directory per project
    #[serde(default = "default_projects_dir")]
    pub dir: PathBuf,
}

impl ProjectsConfig {
    /// Working directory for the project called `name`
    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            dir: default_projects_dir(),
        }
    }
}

/// Configuration for the long-running dev-server command
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of this
/// server. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Executable to launch (resolved through PATH when not a path)
    #[serde(default = "default_runner_command")]
    pub command: String,

    /// Arguments; every `{port}` is replaced with the allocated port
    #[serde(default = "default_runner_args")]
    pub args: Vec<String>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// First port the allocator probes
    #[serde(default = "default_first_port")]
    pub first_port: u16,

    /// Seconds a child may stay `starting` before it is marked `error` (0 disables)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a child
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Ordered output classification rules
    #[serde(default = "default_rules")]
    pub rules: Vec<StatusRule>,
}

impl RunnerConfig {
    /// Create a runner config with default rules and timings
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            ..Self::default()
        }
    }

    /// Arguments with the port placeholder substituted
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        match self.startup_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            args: default_runner_args(),
            env: HashMap::new(),
            first_port: default_first_port(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// How often the preview page pings, in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// An instance without a ping for longer than this is reaped
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Interval between reaper sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_route_prefix() -> String {
    "/preview".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("./projects")
}

fn default_runner_command() -> String {
    "flutter".to_string()
}

fn default_runner_args() -> Vec<String> {
    [
        "run",
        "-d",
        "web-server",
        "--web-port={port}",
        "--web-hostname=127.0.0.1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_first_port() -> u16 {
    8081
}

fn default_startup_timeout() -> u64 {
    180 // first builds of a web app are slow
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_rules() -> Vec<StatusRule> {
    vec![
        StatusRule::contains(OutputStream::Stdout, "is being served at", InstanceStatus::Running),
        StatusRule::contains(OutputStream::Stdout, "Serving at", InstanceStatus::Running),
        StatusRule::contains(OutputStream::Stdout, "Listening on", InstanceStatus::Running),
        StatusRule::any(OutputStream::Stderr, InstanceStatus::Error),
    ]
}

fn default_ping_interval() -> u64 {
    10
}

fn default_stale_after() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.runner.command.trim().is_empty() {
            errors.push("runner: 'command' must not be empty".to_string());
        }
        if self.runner.first_port == 0 {
            errors.push("runner: 'first_port' must be greater than 0".to_string());
        }
        for (index, rule) in self.runner.rules.iter().enumerate() {
            if let Err(e) = rule.validate() {
                errors.push(format!("runner.rules[{}]: {}", index, e));
            }
        }
        if !self.server.route_prefix.starts_with('/') || self.server.route_prefix.len() < 2 {
            errors.push("server: 'route_prefix' must start with '/' and be non-empty".to_string());
        }
        if self.server.route_prefix.ends_with('/') {
            errors.push("server: 'route_prefix' must not end with '/'".to_string());
        }
        if self.keepalive.stale_after_secs == 0 {
            errors.push("keepalive: 'stale_after_secs' must be greater than 0".to_string());
        }
        if self.keepalive.sweep_interval_secs == 0 {
            errors.push("keepalive: 'sweep_interval_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
