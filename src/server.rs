//! HTTP front end: control API plus the mounted preview routes
//!
//! | Route                  | Purpose                               |
//! |------------------------|---------------------------------------|
//! | `POST /run`            | start (or restart) a preview          |
//! | `POST /stop`           | stop a preview                        |
//! | `GET  /status/{name}`  | status of one preview                 |
//! | `GET  /instances`      | every live preview                    |
//! | `GET  /health`         | liveness, instance names, proxy stats |
//! | `<prefix>/{name}/...`  | preview page, keepalive, proxied app  |

use crate::config::ServerConfig;
use crate::error::{json_error_response, ErrorKind};
use crate::supervisor::{validate_name, Supervisor};
use anyhow::Context;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Body of `/run` and `/stop`
#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    status: &'static str,
    preview_url: String,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    running_instance_names: Vec<String>,
    proxy: ProxyStats,
}

/// Forwarding counters from the connection pool
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyStats {
    total_requests: u64,
    failed_requests: u64,
}

/// Shared state behind every connection
struct AppState {
    supervisor: Arc<Supervisor>,
    config: ServerConfig,
}

pub struct PreviewServer {
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PreviewServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config: ServerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: Arc::new(AppState { supervisor, config }),
            shutdown_rx,
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = format!("{}:{}", self.state.config.bind, self.state.config.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind preview server to {}", addr))
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Preview server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Preview server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<AppState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, addr, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match serde_json::to_vec(body) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return json_error_response(ErrorKind::InternalError, "failed to serialize response");
        }
    };
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

async fn read_name(req: Request<Incoming>) -> Result<String, Response<BoxBody<Bytes, hyper::Error>>> {
    let bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return Err(json_error_response(ErrorKind::BadRequest, "failed to read request body"));
        }
    };
    match serde_json::from_slice::<NameRequest>(&bytes) {
        Ok(body) => Ok(body.name),
        Err(e) => Err(json_error_response(
            ErrorKind::BadRequest,
            format!("invalid JSON body: {}", e),
        )),
    }
}

async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/run") => match read_name(req).await {
            Ok(name) => run(&state, &name).await,
            Err(response) => response,
        },

        (&Method::POST, "/stop") => match read_name(req).await {
            Ok(name) => stop(&state, &name).await,
            Err(response) => response,
        },

        (&Method::GET, path) if path.starts_with("/status/") => {
            let name = path.strip_prefix("/status/").unwrap_or_default();
            status(&state, name).await
        }

        (&Method::GET, "/instances") => {
            let instances = state.supervisor.registry().list();
            json_response(StatusCode::OK, &serde_json::json!({ "instances": instances }))
        }

        (&Method::GET, "/health") => health(&state),

        _ => match state.supervisor.router().handle(req, client_addr).await {
            Ok(response) => response,
            Err(_) => json_error_response(ErrorKind::NotFound, format!("no route for {} {}", method, path)),
        },
    };

    debug!(%method, %path, status = response.status().as_u16(), "Handled request");
    Ok(response)
}

fn health(state: &AppState) -> Response<BoxBody<Bytes, hyper::Error>> {
    let stats = state.supervisor.router().proxy().pool().stats();
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "ok",
            running_instance_names: state.supervisor.registry().names(),
            proxy: ProxyStats {
                total_requests: stats.get_total_requests(),
                failed_requests: stats.get_failed_requests(),
            },
        },
    )
}

async fn run(state: &AppState, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    match state.supervisor.start(name).await {
        Ok(started) => {
            let preview_url = state.config.preview_url(name);
            info!(name, port = started.port, preview_url = %preview_url, "Preview starting");
            json_response(
                StatusCode::OK,
                &RunResponse {
                    status: "loading",
                    preview_url,
                    port: started.port,
                },
            )
        }
        Err(e) => {
            warn!(name, error = %e, "Failed to start preview");
            e.to_response()
        }
    }
}

async fn stop(state: &AppState, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    if let Err(e) = validate_name(name) {
        return e.to_response();
    }
    // A live instance is stoppable even if its project tree has since vanished
    if !state.supervisor.registry().contains(name) {
        if let Err(e) = state.supervisor.project_dir(name).await {
            return e.to_response();
        }
    }
    let stopped = state.supervisor.stop(name).await;
    json_response(StatusCode::OK, &serde_json::json!({ "stopped": stopped }))
}

async fn status(state: &AppState, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    if let Err(e) = validate_name(name) {
        return e.to_response();
    }
    if let Some(snapshot) = state.supervisor.registry().get(name) {
        return json_response(StatusCode::OK, &snapshot);
    }
    match state.supervisor.project_dir(name).await {
        Ok(_) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": name, "status": "stopped" }),
        ),
        Err(e) => e.to_response(),
    }
}
