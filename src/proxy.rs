//! Reverse proxy from `<prefix>/<name>/app/*` to the child on its port
//!
//! Plain requests go through the pooled client with Host/Origin pointed at
//! the child. Upgrade requests (dev-server hot reload sockets) are replayed on
//! a raw connection and tunneled byte for byte once the child answers 101.

use crate::error::{json_error_response, ErrorKind};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::RouteHandle;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::upgrade::Upgraded;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Largest upgrade response head accepted from a child
const MAX_UPGRADE_HEAD: usize = 8192;

/// Reverse proxy from preview routes to child dev servers
pub struct Proxy {
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Proxy {
    pub fn new(pool_config: PoolConfig, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(pool_config)),
            request_timeout,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Forward `req` to the child behind `route`, as a request for `path`
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        route: &RouteHandle,
        path: &str,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let name = route.name();
        let port = route.port();
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };

        if is_upgrade_request(&req) {
            return handle_upgrade(req, name, port, &path_and_query, client_addr).await;
        }

        let (mut parts, body) = req.into_parts();
        let request_id = rewrite_headers(&mut parts.headers, port, client_addr);
        debug!(name, method = %parts.method, path = %path_and_query, request_id = %request_id, "Proxying request");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(parts, body, port, &path_and_query),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if e.is_connect() {
                    warn!(name, port, error = %e, "Child is not accepting connections");
                } else {
                    error!(name, port, error = %e, "Failed to forward request");
                }
                json_error_response(
                    ErrorKind::ProxyUnreachable,
                    format!("preview '{}' is not reachable", name),
                )
            }
            Err(_) => {
                warn!(
                    name,
                    port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Proxied request timed out"
                );
                json_error_response(
                    ErrorKind::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Point Host/Origin at the child and stamp forwarding headers.
/// Returns the request id in use.
fn rewrite_headers(headers: &mut HeaderMap, port: u16, client_addr: SocketAddr) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // Overwritten rather than appended; this server is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let target = format!("127.0.0.1:{}", port);
    if let Ok(value) = HeaderValue::from_str(&target) {
        headers.insert(hyper::header::HOST, value);
    }
    if headers.contains_key(hyper::header::ORIGIN) {
        if let Ok(value) = HeaderValue::from_str(&format!("http://{}", target)) {
            headers.insert(hyper::header::ORIGIN, value);
        }
    }

    request_id
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the child
fn build_upgrade_request(parts: &Parts, path_and_query: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", parts.method, path_and_query);
    for (name, value) in parts.headers.iter() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Parse the child's response to an upgrade request
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Header pair from a raw child response, if both halves are well-formed
fn valid_header(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}

/// Read the child's response head up to and including the blank line.
/// Returns the head and any bytes the child sent after it.
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() >= MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "child closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Tunnel an upgrade (WebSocket) request to the child
async fn handle_upgrade(
    req: Request<Incoming>,
    name: &str,
    port: u16,
    path_and_query: &str,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (mut parts, body) = req.into_parts();
    let request_id = rewrite_headers(&mut parts.headers, port, client_addr);
    debug!(name, request_id = %request_id, path = %path_and_query, "Handling upgrade request");

    let raw_request = build_upgrade_request(&parts, path_and_query);

    let mut child_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(name, port, error = %e, "Failed to connect to child for upgrade");
            return json_error_response(
                ErrorKind::ProxyUnreachable,
                format!("preview '{}' is not reachable", name),
            );
        }
    };

    if let Err(e) = child_stream.write_all(&raw_request).await {
        error!(name, error = %e, "Failed to send upgrade request to child");
        return json_error_response(ErrorKind::ProxyUnreachable, "Failed to send upgrade request");
    }

    let (head, early_data) = match read_response_head(&mut child_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(name, error = %e, "Failed to read upgrade response from child");
            return json_error_response(ErrorKind::ProxyUnreachable, "Failed to read child response");
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(name, "Failed to parse child upgrade response");
        return json_error_response(ErrorKind::ProxyUnreachable, "Invalid upgrade response from child");
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(name, status = %status, "Child rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (header, value) in &response_headers {
            // The body is not relayed
            if is_framing_header(header) {
                continue;
            }
            if let Some((header_name, header_value)) = valid_header(header, value) {
                response = response.header(header_name, header_value);
            }
        }
        return response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    info!(name, request_id = %request_id, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (header, value) in &response_headers {
        if is_framing_header(header) {
            continue;
        }
        if let Some((header_name, header_value)) = valid_header(header, value) {
            response = response.header(header_name, header_value);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let client_req = Request::from_parts(parts, body);
    let name = name.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(client_req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, child_stream, early_data, &name, &request_id).await
            }
            Err(e) => error!(name = %name, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

/// Copy bytes both ways between the upgraded client and the child.
/// `early_data` is whatever the child sent right behind its 101 head.
async fn forward_bidirectional(
    client: Upgraded,
    mut child: TcpStream,
    early_data: Vec<u8>,
    name: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(name, request_id, error = %e, "Failed to relay early upgrade data");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut child).await {
        Ok((to_child, to_client)) => {
            debug!(name, request_id, to_child, to_client, "WebSocket connection closed");
        }
        Err(e) => {
            debug!(name, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn test_rewrite_headers_targets_child() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, HeaderValue::from_static("previews.example.com"));
        headers.insert(hyper::header::ORIGIN, HeaderValue::from_static("https://previews.example.com"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));

        let request_id = rewrite_headers(&mut headers, 8081, client());

        assert_eq!(headers.get(hyper::header::HOST).unwrap(), "127.0.0.1:8081");
        assert_eq!(headers.get(hyper::header::ORIGIN).unwrap(), "http://127.0.0.1:8081");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "previews.example.com");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap().to_str().unwrap(), request_id);
    }

    #[test]
    fn test_rewrite_headers_keeps_request_id_and_skips_absent_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc-123"));

        let request_id = rewrite_headers(&mut headers, 9000, client());

        assert_eq!(request_id, "abc-123");
        assert!(headers.get(hyper::header::ORIGIN).is_none());
        assert!(headers.get(X_FORWARDED_HOST).is_none());
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: xyz\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers.contains(&("Upgrade".to_string(), "websocket".to_string())));
        assert_eq!(headers.len(), 3);

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_across_reads_keeps_trailing_bytes() {
        let (mut child, mut proxy_side) = tokio::io::duplex(64);
        tokio::spawn(async move {
            child.write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpg").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            child
                .write_all(b"rade: websocket\r\n\r\nfirst-frame")
                .await
                .unwrap();
        });

        let (head, rest) = read_response_head(&mut proxy_side).await.unwrap();
        let (status, headers) = parse_upgrade_response(&head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers, vec![("Upgrade".to_string(), "websocket".to_string())]);
        assert_eq!(rest, b"first-frame");
    }

    #[tokio::test]
    async fn test_read_response_head_rejects_eof_and_oversize() {
        let (mut child, mut proxy_side) = tokio::io::duplex(64);
        child.write_all(b"HTTP/1.1 101").await.unwrap();
        drop(child);
        let err = read_response_head(&mut proxy_side).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let (mut child, mut proxy_side) = tokio::io::duplex(MAX_UPGRADE_HEAD * 2);
        child.write_all(&vec![b'x'; MAX_UPGRADE_HEAD + 1]).await.unwrap();
        let err = read_response_head(&mut proxy_side).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
