//! Dynamic per-instance routes
//!
//! Every live instance gets a route set under `<prefix>/<name>`:
//!
//! - `GET  <prefix>/<name>`        preview page
//! - `POST <prefix>/<name>/ping`   keepalive
//! - `*    <prefix>/<name>/app/*`  reverse proxy to the child on its port
//!
//! Route sets are indexed by name. Mounting returns a [`RouteHandle`] that the
//! instance keeps for teardown; unmounting with a handle only removes the
//! exact set that handle refers to.

use crate::error::{json_error_response, ErrorKind};
use crate::page::render_preview_page;
use crate::proxy::Proxy;
use crate::registry::Registry;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Sub-path under which application traffic is proxied
const APP_SEGMENT: &str = "app";
/// Sub-path of the keepalive endpoint
const PING_SEGMENT: &str = "ping";

/// Reference to one mounted route set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHandle {
    name: String,
    port: u16,
    mount_id: u64,
}

impl RouteHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A handle that was never installed in any router
    #[cfg(test)]
    pub(crate) fn detached(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
            mount_id: 0,
        }
    }
}

/// Which route of a set a request path hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// The preview page
    Page,
    /// The keepalive endpoint
    Ping,
    /// Proxied application traffic; carries the child-relative path
    App { path: String },
}

/// Mount table plus the handlers behind it
pub struct Router {
    prefix: String,
    routes: DashMap<String, RouteHandle>,
    next_mount_id: AtomicU64,
    registry: Arc<Registry>,
    proxy: Arc<Proxy>,
    ping_interval: Duration,
}

impl Router {
    pub fn new(prefix: &str, registry: Arc<Registry>, proxy: Arc<Proxy>, ping_interval: Duration) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            routes: DashMap::new(),
            next_mount_id: AtomicU64::new(1),
            registry,
            proxy,
            ping_interval,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Install the route set for `name`, forwarding app traffic to `port`
    pub fn mount(&self, name: &str, port: u16) -> RouteHandle {
        let handle = RouteHandle {
            name: name.to_string(),
            port,
            mount_id: self.next_mount_id.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(previous) = self.routes.insert(name.to_string(), handle.clone()) {
            debug!(name, old_port = previous.port, "Replaced existing route set");
        }
        info!(name, port, prefix = %self.prefix, "Mounted preview routes");
        handle
    }

    /// Remove exactly the route set `handle` refers to
    pub fn unmount(&self, handle: &RouteHandle) -> bool {
        let removed = self
            .routes
            .remove_if(&handle.name, |_, mounted| mounted.mount_id == handle.mount_id)
            .is_some();
        if removed {
            info!(name = %handle.name, port = handle.port, "Unmounted preview routes");
        }
        removed
    }

    pub fn is_mounted(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Map a request path onto a mounted route set
    pub fn resolve(&self, path: &str) -> Option<(RouteHandle, RouteKind)> {
        let (name, kind) = parse_route(&self.prefix, path)?;
        let handle = self.routes.get(name)?.clone();
        Some((handle, kind))
    }

    /// Serve a request if it targets a mounted route; `Err` hands it back
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Request<Incoming>> {
        let Some((handle, kind)) = self.resolve(req.uri().path()) else {
            return Err(req);
        };

        let response = match kind {
            RouteKind::Page => match *req.method() {
                Method::GET | Method::HEAD => self.preview_page(&handle),
                _ => method_not_allowed(),
            },
            RouteKind::Ping => match *req.method() {
                Method::POST | Method::GET => self.ping(&handle),
                _ => method_not_allowed(),
            },
            RouteKind::App { path } => self.proxy.forward(req, &handle, &path, client_addr).await,
        };
        Ok(response)
    }

    fn preview_page(&self, handle: &RouteHandle) -> Response<BoxBody<Bytes, hyper::Error>> {
        let html = render_preview_page(&handle.name, &self.prefix, self.ping_interval);
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(hyper::header::CACHE_CONTROL, "no-store")
            .body(Full::new(Bytes::from(html)).map_err(|never| match never {}).boxed())
            .expect("valid response builder")
    }

    fn ping(&self, handle: &RouteHandle) -> Response<BoxBody<Bytes, hyper::Error>> {
        if self.registry.touch(&handle.name) {
            debug!(name = %handle.name, "Keepalive ping");
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from_static(br#"{"ok":true}"#)).map_err(|never| match never {}).boxed())
                .expect("valid response builder")
        } else {
            json_error_response(ErrorKind::NotFound, format!("instance '{}' is not running", handle.name))
        }
    }
}

fn method_not_allowed() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = json_error_response(ErrorKind::BadRequest, "method not allowed");
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
}

/// Split `<prefix>/<name>[/...]` into the instance name and route kind
fn parse_route<'a>(prefix: &str, path: &'a str) -> Option<(&'a str, RouteKind)> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let (name, tail) = match rest.split_once('/') {
        Some((name, tail)) => (name, Some(tail)),
        None => (rest, None),
    };
    if name.is_empty() {
        return None;
    }

    let kind = match tail {
        None | Some("") => RouteKind::Page,
        Some(PING_SEGMENT) => RouteKind::Ping,
        Some(tail) => {
            let app_rest = tail.strip_prefix(APP_SEGMENT)?;
            if !app_rest.is_empty() && !app_rest.starts_with('/') {
                return None;
            }
            RouteKind::App {
                path: rewrite_app_path(app_rest),
            }
        }
    };
    Some((name, kind))
}

/// Child-relative path for whatever followed the `/app` segment
fn rewrite_app_path(app_rest: &str) -> String {
    if app_rest.is_empty() {
        "/".to_string()
    } else {
        app_rest.to_string()
    }
}
