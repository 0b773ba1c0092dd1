//! Host-control HTTP: a tiny authenticated control-plane listener on TCP/8300, bound to the
//! service address like every other in-fabric service. Currently exposes one endpoint,
//! `GET /ping`, reporting build info to the external agent that launched this fabric process.
//!
//! No HTTP crate is pulled in for this: a framework like `axum` assumes a real
//! `AsyncRead + AsyncWrite` transport, and pulling in `hyper`'s server connection machinery for
//! one fixed-shape endpoint over a virtual socket is not worth the weight, so this hand-rolls
//! the tiny HTTP/1.1 subset it needs — the same call `ntp.rs` makes for its one 48-byte struct.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use data_encoding::BASE32_NOPAD;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FabricConfig;
use crate::stack::{NetStack, VirtTcp};

/// Fixed port for the host-control listener.
const CONTROL_PORT: u16 = 8300;

/// Request line / header block is never more than this; anything larger is a malformed or
/// hostile request and is rejected outright.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Mints a fresh per-process bearer token: 32 random bytes, base32-encoded so it travels
/// safely through environment variables and RPC payloads.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

#[derive(Serialize)]
struct PingResponse {
    ok: bool,
    sftp_compiled: bool,
    sftp_enabled: bool,
}

/// Binds the host-control service on both families and serves every accepted
/// connection until the fabric is torn down.
pub async fn run(cfg: Arc<FabricConfig>, stack: Arc<NetStack>, token: String) -> std::io::Result<()> {
    let token = Arc::new(token);
    let addr_v4 = SocketAddr::new(IpAddr::V4(cfg.service_v4), CONTROL_PORT);
    let addr_v6 = SocketAddr::new(IpAddr::V6(cfg.service_v6), CONTROL_PORT);

    let mut conns_v4 = stack
        .bind_tcp_service(addr_v4)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut conns_v6 = stack
        .bind_tcp_service(addr_v6)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let cfg_v6 = cfg.clone();
    let token_v6 = token.clone();
    tokio::spawn(async move {
        while let Some(conn) = conns_v6.recv().await {
            let cfg = cfg_v6.clone();
            let token = token_v6.clone();
            tokio::spawn(async move { handle_connection(conn, &cfg, &token).await });
        }
    });

    while let Some(conn) = conns_v4.recv().await {
        let cfg = cfg.clone();
        let token = token.clone();
        tokio::spawn(async move { handle_connection(conn, &cfg, &token).await });
    }
    Ok(())
}

async fn handle_connection(mut conn: VirtTcp, cfg: &FabricConfig, token: &str) {
    let request = match read_request(&mut conn).await {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "host-control request read failed");
            return;
        }
    };

    let response = route(&request, cfg, token);
    let _ = conn.write(response.as_bytes());
    conn.close_write();
}

struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
}

async fn read_request(conn: &mut VirtTcp) -> std::io::Result<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request too large"));
        }
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("authorization") {
                authorization = Some(value.trim().to_string());
            }
        }
    }

    Ok(Request { method, path, authorization })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn route(request: &Request, cfg: &FabricConfig, token: &str) -> String {
    let expected = format!("Bearer {token}");
    if request.authorization.as_deref() != Some(expected.as_str()) {
        return http_response(401, "text/plain", "unauthorized");
    }

    if request.method != "GET" {
        return http_response(405, "text/plain", "method not allowed");
    }

    match request.path.as_str() {
        "/ping" => {
            let body = PingResponse {
                ok: true,
                sftp_compiled: cfg!(feature = "sftp"),
                sftp_enabled: cfg.enable_sftp,
            };
            match serde_json::to_string(&body) {
                Ok(json) => http_response(200, "application/json", &json),
                Err(e) => {
                    warn!(error = %e, "failed to serialize /ping response");
                    http_response(500, "text/plain", "internal error")
                }
            }
        }
        _ => http_response(404, "text/plain", "not found"),
    }
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> FabricConfig {
        FabricConfig::default()
    }

    #[test]
    fn rejects_missing_bearer_token() {
        let request = Request { method: "GET".into(), path: "/ping".into(), authorization: None };
        let response = route(&request, &base_cfg(), "secret");
        assert!(response.starts_with("HTTP/1.1 401"));
    }

    #[test]
    fn rejects_wrong_bearer_token() {
        let request =
            Request { method: "GET".into(), path: "/ping".into(), authorization: Some("Bearer wrong".into()) };
        let response = route(&request, &base_cfg(), "secret");
        assert!(response.starts_with("HTTP/1.1 401"));
    }

    #[test]
    fn ping_reports_ok_with_valid_token() {
        let request =
            Request { method: "GET".into(), path: "/ping".into(), authorization: Some("Bearer secret".into()) };
        let response = route(&request, &base_cfg(), "secret");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"ok\":true"));
    }

    #[test]
    fn unknown_path_is_404() {
        let request =
            Request { method: "GET".into(), path: "/nope".into(), authorization: Some("Bearer secret".into()) };
        let response = route(&request, &base_cfg(), "secret");
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn header_end_detection_finds_blank_line() {
        let buf = b"GET /ping HTTP/1.1\r\nAuthorization: Bearer x\r\n\r\n";
        assert_eq!(find_header_end(buf), Some(buf.len()));
        assert_eq!(find_header_end(b"GET /ping HTTP/1.1\r\n"), None);
    }

    #[test]
    fn token_is_base32_and_32_bytes_of_entropy() {
        let token = mint_token();
        assert!(BASE32_NOPAD.decode(token.as_bytes()).is_ok());
    }
}
