//! previewd - on-demand dev-server previews behind stable routes
//!
//! This library provides a preview server that:
//! - Launches a project's long-running dev server as a child process on request
//! - Allocates a free local port for each child and hands it over via arguments and `PORT`
//! - Infers child status from its output with configurable classification rules
//! - Mounts per-instance routes (preview page, keepalive, reverse proxy) at runtime
//! - Reaps instances whose keepalive pings have gone stale
//! - Stops every child on shutdown so none is orphaned

pub mod classify;
pub mod config;
pub mod error;
pub mod page;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod toolchain;

/// Package name, for the startup banner
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version, for the startup banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
