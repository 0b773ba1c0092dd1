//! Transparent TLS MITM proxy (spec §4.I): intercepts container-destined `:443` traffic from the
//! host, mints a per-SNI certificate from a local root CA, and reverse-proxies the decrypted
//! bytes to the container's plaintext `:80`. Unlike the in-fabric services in `services/`, this
//! listener binds *real* host sockets — its clients are host-side processes (the developer's own
//! browser), not guest-originated flows arriving over the virtual link (§8 scenario 4).
//!
//! Grounded on `host_forward.rs`'s dial-into-guest pattern for the upstream leg (`stack.connect_tcp`
//! with a spoofed, non-loopback source) and on `pump.rs` for the bidirectional relay once the
//! proxy has decided which side of the MITM decision a connection falls on.

mod certs;
mod trust_store;

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::FabricConfig;
use crate::pump::{pump, AsyncIoDuplex, FullDuplex};
use crate::registry::{NameRegistry, RecordType};
use crate::stack::NetStack;

use certs::{RootCa, SniCertResolver};

/// How long the proxy waits for a direct connection to the container's own `:443` before
/// concluding it must terminate TLS itself (§4.I: "500ms direct-dial probe").
const DIRECT_DIAL_PROBE: Duration = Duration::from_millis(500);
/// Upper bound on how long the proxy will buffer bytes looking for a complete ClientHello
/// record before giving up on a connection that is not actually a TLS client.
const SNI_SNIFF_TIMEOUT: Duration = Duration::from_secs(2);
const SNI_SNIFF_MAX_BYTES: usize = 16 * 1024;
/// Plaintext port the decrypted traffic is reverse-proxied to inside the container (§4.I).
const UPSTREAM_PLAINTEXT_PORT: u16 = 80;
/// TLS port the proxy tries first when probing for a container that serves TLS itself.
const UPSTREAM_TLS_PORT: u16 = 443;

pub async fn run(cfg: Arc<FabricConfig>, stack: Arc<NetStack>, registry: Arc<NameRegistry>) -> std::io::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ca = RootCa::generate().map_err(|e| std::io::Error::other(e.to_string()))?;
    let cert_pem = ca.cert_pem();
    let resolver = Arc::new(SniCertResolver::new(ca));
    tokio::spawn(async move { trust_store::import(&cert_pem).await });

    let server_config = Arc::new(
        ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver as Arc<dyn rustls::server::ResolvesServerCert>),
    );
    let acceptor = TlsAcceptor::from(server_config);

    let listener_v4 = tokio::net::TcpListener::bind(cfg.tls_proxy_v4).await?;
    let listener_v6 = match tokio::net::TcpListener::bind(cfg.tls_proxy_v6).await {
        Ok(l) => Some(l),
        Err(e) => {
            warn!(addr = %cfg.tls_proxy_v6, error = %e, "tls proxy ipv6 listener bind failed, continuing ipv4-only");
            None
        }
    };

    info!(v4 = %cfg.tls_proxy_v4, "tls mitm proxy listening");

    if let Some(listener_v6) = listener_v6 {
        let stack6 = stack.clone();
        let registry6 = registry.clone();
        let cfg6 = cfg.clone();
        let acceptor6 = acceptor.clone();
        tokio::spawn(async move { accept_loop(listener_v6, acceptor6, cfg6, stack6, registry6).await });
    }

    accept_loop(listener_v4, acceptor, cfg, stack, registry).await;
    Ok(())
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    cfg: Arc<FabricConfig>,
    stack: Arc<NetStack>,
    registry: Arc<NameRegistry>,
) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tls proxy accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let acceptor = acceptor.clone();
        let cfg = cfg.clone();
        let stack = stack.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, acceptor, cfg, stack, registry).await {
                debug!(%client_addr, error = %e, "tls proxy connection ended");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    acceptor: TlsAcceptor,
    cfg: Arc<FabricConfig>,
    stack: Arc<NetStack>,
    registry: Arc<NameRegistry>,
) -> std::io::Result<()> {
    let (prefix, stream) = match timeout(SNI_SNIFF_TIMEOUT, sniff_client_hello(stream)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "sni sniff timed out")),
    };

    let Some(hostname) = parse_sni(&prefix) else {
        debug!(%client_addr, "tls proxy connection carried no SNI, dropping");
        return Ok(());
    };

    let Some(container_ip) = resolve_container(&registry, &hostname) else {
        debug!(%client_addr, %hostname, "tls proxy could not resolve sni hostname to a container");
        return Ok(());
    };

    let local_v4_or_v6 =
        if container_ip.is_ipv4() { IpAddr::V4(cfg.gateway_v4) } else { IpAddr::V6(cfg.gateway_v6) };
    let probe_local = SocketAddr::new(local_v4_or_v6, 0);
    let probe_remote = SocketAddr::new(container_ip, UPSTREAM_TLS_PORT);

    match timeout(DIRECT_DIAL_PROBE, stack.connect_tcp(probe_local, probe_remote)).await {
        Ok(Ok(upstream)) => {
            debug!(%hostname, %container_ip, "container serves tls directly, passing through unmodified");
            pass_through(PeekedStream::new(prefix, stream), upstream).await
        }
        _ => {
            debug!(%hostname, %container_ip, "no direct tls upstream, terminating tls and reverse-proxying to :80");
            terminate_and_proxy(PeekedStream::new(prefix, stream), acceptor, &hostname, container_ip, local_v4_or_v6, &stack)
                .await
        }
    }
}

fn resolve_container(registry: &NameRegistry, hostname: &str) -> Option<IpAddr> {
    registry.resolve(hostname, RecordType::Any).into_iter().map(|rr| rr.addr).next()
}

async fn pass_through(client: PeekedStream, upstream: crate::stack::VirtTcp) -> std::io::Result<()> {
    let mut client = AsyncIoDuplex(client);
    let mut upstream = upstream;
    let (up, down) = pump(&mut client, &mut upstream).await?;
    debug!(bytes_up = up, bytes_down = down, "tls proxy pass-through flow closed");
    Ok(())
}

async fn terminate_and_proxy(
    client: PeekedStream,
    acceptor: TlsAcceptor,
    hostname: &str,
    container_ip: IpAddr,
    spoofed_local_ip: IpAddr,
    stack: &NetStack,
) -> std::io::Result<()> {
    let tls_stream = acceptor.accept(client).await?;
    let remote = SocketAddr::new(container_ip, UPSTREAM_PLAINTEXT_PORT);
    let local = SocketAddr::new(spoofed_local_ip, 0);
    let upstream = stack
        .connect_tcp(local, remote)
        .await
        .map_err(|e| std::io::Error::other(format!("dial to {hostname} upstream failed: {e}")))?;

    let mut client_side = AsyncIoDuplex(tls_stream);
    let mut upstream_side = upstream;
    let (up, down) = pump(&mut client_side, &mut upstream_side).await?;
    debug!(%hostname, bytes_up = up, bytes_down = down, "tls proxy mitm flow closed");
    Ok(())
}

/// Reads bytes off `stream` until a complete TLS handshake record (the ClientHello) has been
/// buffered, without consuming them from the caller's point of view — `PeekedStream` replays
/// the prefix before resuming reads from the live socket.
async fn sniff_client_hello(mut stream: TcpStream) -> std::io::Result<(Vec<u8>, TcpStream)> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if record_is_complete(&buf) {
            return Ok((buf, stream));
        }
        if buf.len() >= SNI_SNIFF_MAX_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "client hello too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed before tls hello"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn record_is_complete(buf: &[u8]) -> bool {
    if buf.len() < 5 || buf[0] != 0x16 {
        return buf.len() >= 5 && buf[0] != 0x16; // not a handshake record at all; stop buffering
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    buf.len() >= 5 + record_len
}

/// Extracts the `server_name` extension from a buffered TLS ClientHello (§4.I). Hand-parsed:
/// the fabric only needs the one extension, not a general TLS parser, matching the house
/// precedent of `ntp.rs`/`icmp.rs` for narrow fixed-layout wire formats.
fn parse_sni(record: &[u8]) -> Option<String> {
    if record.len() < 5 || record[0] != 0x16 {
        return None;
    }
    let body = &record[5..];
    if body.is_empty() || body[0] != 0x01 {
        return None; // not a ClientHello
    }
    let mut pos = 4; // handshake header: type(1) + length(3)
    pos += 2; // client_version
    pos += 32; // random
    let session_id_len = *body.get(pos)? as usize;
    pos += 1 + session_id_len;
    let cipher_suites_len = u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;
    let compression_len = *body.get(pos)? as usize;
    pos += 1 + compression_len;
    if pos + 2 > body.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(body.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        let ext_start = pos + 4;
        let ext_end = ext_start + ext_len;
        if ext_end > extensions_end {
            return None;
        }
        if ext_type == 0x0000 {
            return parse_server_name_extension(&body[ext_start..ext_end]);
        }
        pos = ext_end;
    }
    None
}

fn parse_server_name_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let list = data.get(2..2 + list_len)?;
    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        let name_start = pos + 3;
        let name_end = name_start + name_len;
        if name_end > list.len() {
            return None;
        }
        if name_type == 0x00 {
            return std::str::from_utf8(&list[name_start..name_end]).ok().map(|s| s.to_ascii_lowercase());
        }
        pos = name_end;
    }
    None
}

/// Replays the bytes buffered by `sniff_client_hello` before resuming reads from the live
/// socket; writes always go straight to the socket.
struct PeekedStream {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: TcpStream,
}

impl PeekedStream {
    fn new(prefix: Vec<u8>, inner: TcpStream) -> Self {
        PeekedStream { prefix, prefix_pos: 0, inner }
    }
}

impl AsyncRead for PeekedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut sni_entry = vec![0x00];
        sni_entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(hostname.as_bytes());

        let mut sni_list = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_list.extend_from_slice(&sni_entry);

        let mut sni_ext = vec![0x00, 0x00]; // extension type: server_name
        sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_list);

        let mut extensions = (sni_ext.len() as u16).to_be_bytes().to_vec();
        extensions.extend_from_slice(&sni_ext);

        let mut hello_body = vec![0x03, 0x03]; // client_version
        hello_body.extend_from_slice(&[0u8; 32]); // random
        hello_body.push(0); // session id len
        hello_body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello_body.push(1); // compression methods len
        hello_body.push(0); // null compression
        hello_body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // ClientHello
        let body_len = hello_body.len() as u32;
        handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello_body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parses_sni_from_synthetic_client_hello() {
        let record = client_hello_with_sni("app.orb.local");
        assert!(record_is_complete(&record));
        assert_eq!(parse_sni(&record).as_deref(), Some("app.orb.local"));
    }

    #[test]
    fn record_incomplete_when_truncated() {
        let record = client_hello_with_sni("app.orb.local");
        assert!(!record_is_complete(&record[..record.len() - 1]));
    }

    #[test]
    fn non_handshake_record_returns_none() {
        let mut record = client_hello_with_sni("app.orb.local");
        record[0] = 0x17; // application data, not handshake
        assert_eq!(parse_sni(&record), None);
    }
}
