//! Host→guest forwarders (spec §4.F): host-side TCP/UDP/Unix listeners that dial *into* the
//! guest through the virtual stack, spoofing a non-loopback source so the guest sees the real
//! remote peer. A vsock flavor is named in the spec as an "additional class" but vsock dialers
//! belong to the excluded VM-lifecycle collaborator (§1) — see the `Vsock` arm below.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{FabricConfig, HostForward, ListenSpec};
use crate::pump::{pump, AsyncIoDuplex};
use crate::stack::NetStack;

/// Connect timeout for host→guest TCP dials through the stack (§5).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle reclaim for a host-forward UDP client mapping, matching the forwarder default (§4.D).
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawns one task per configured host-forward entry (§6 table); each runs for the lifetime of
/// the fabric.
pub fn spawn_all(cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    for fwd in cfg.host_forwards.clone() {
        let cfg = cfg.clone();
        let stack = stack.clone();
        tokio::spawn(async move { run_one(fwd, cfg, stack).await });
    }
}

async fn run_one(fwd: HostForward, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    match fwd.listen.clone() {
        ListenSpec::Tcp { host, port } => run_tcp(fwd, host, port, cfg, stack).await,
        ListenSpec::Udp { host, port } => run_udp(fwd, host, port, cfg, stack).await,
        ListenSpec::Unix { path } => run_unix(fwd, path, cfg, stack).await,
        ListenSpec::Vsock { port } => {
            warn!(port, "vsock host-forwards require an embedder-supplied vsock dialer (§1 excluded collaborator); not started");
        }
    }
}

async fn run_tcp(fwd: HostForward, host: IpAddr, port: u16, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    let primary = match TcpListener::bind((host, port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%host, port, error = %e, "host-forward tcp listener bind failed");
            return;
        }
    };
    let mut tasks = vec![accept_tcp_loop(primary, false, fwd.clone(), cfg.clone(), stack.clone())];

    // macOS cannot bind loopback on a privileged port directly; the wildcard fallback below
    // works around that while `require_loopback` preserves the security property (§4.F).
    if fwd.listen.is_privileged_loopback() {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(wildcard) => {
                debug!(port, "bound wildcard fallback for privileged loopback forward");
                tasks.push(accept_tcp_loop(wildcard, true, fwd.clone(), cfg.clone(), stack.clone()));
            }
            Err(e) => warn!(port, error = %e, "wildcard fallback bind failed"),
        }
    }
    futures::future::join_all(tasks).await;
}

fn accept_tcp_loop(
    listener: TcpListener,
    require_loopback: bool,
    fwd: HostForward,
    cfg: Arc<FabricConfig>,
    stack: Arc<NetStack>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "host-forward tcp accept failed");
                    continue;
                }
            };
            if require_loopback && !client_addr.ip().is_loopback() {
                debug!(%client_addr, "rejecting non-loopback connection on privileged-port forward");
                drop(stream);
                continue;
            }
            let fwd = fwd.clone();
            let cfg = cfg.clone();
            let stack = stack.clone();
            tokio::spawn(async move {
                handle_tcp(stream, client_addr, fwd, cfg, stack).await;
            });
        }
    })
}

async fn handle_tcp(stream: TcpStream, client_addr: SocketAddr, fwd: HostForward, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    let _ = stream.set_nodelay(true);
    let spoofed_src = spoofed_source(client_addr.ip(), fwd.internal, &cfg).await;
    let connect_ip = match spoofed_src {
        IpAddr::V4(_) => IpAddr::V4(cfg.guest_v4),
        IpAddr::V6(_) => IpAddr::V6(cfg.guest_v6),
    };
    let local = SocketAddr::new(spoofed_src, client_addr.port());
    let remote = SocketAddr::new(connect_ip, fwd.connect_port);

    let virt = match timeout(CONNECT_TIMEOUT, stack.connect_tcp(local, remote)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            debug!(%local, %remote, error = %e, "host-forward dial into guest failed");
            return;
        }
        Err(_) => {
            debug!(%local, %remote, "host-forward dial into guest timed out");
            return;
        }
    };

    let mut host_side = AsyncIoDuplex(stream);
    let mut guest_side = virt;
    match pump(&mut host_side, &mut guest_side).await {
        Ok((up, down)) => debug!(%client_addr, %remote, bytes_up = up, bytes_down = down, "host-forward tcp flow closed"),
        Err(e) => warn!(%client_addr, %remote, error = %e, "host-forward tcp flow failed"),
    }
}

async fn run_udp(fwd: HostForward, host: IpAddr, port: u16, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    let sock = match UdpSocket::bind((host, port)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!(%host, port, error = %e, "host-forward udp bind failed");
            return;
        }
    };

    let mut clients: std::collections::HashMap<SocketAddr, tokio::sync::mpsc::UnboundedSender<Vec<u8>>> =
        std::collections::HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (n, client_addr) = match sock.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "host-forward udp recv failed");
                continue;
            }
        };
        if fwd.listen.is_privileged_loopback() && !client_addr.ip().is_loopback() {
            continue;
        }
        let data = buf[..n].to_vec();
        if let Some(tx) = clients.get(&client_addr) {
            if tx.send(data).is_ok() {
                continue;
            }
            clients.remove(&client_addr);
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx.send(data);
        clients.insert(client_addr, tx);
        tokio::spawn(spawn_udp_client(
            sock.clone(),
            client_addr,
            rx,
            fwd.clone(),
            cfg.clone(),
            stack.clone(),
        ));
    }
}

async fn spawn_udp_client(
    sock: Arc<UdpSocket>,
    client_addr: SocketAddr,
    mut from_client: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    fwd: HostForward,
    cfg: Arc<FabricConfig>,
    stack: Arc<NetStack>,
) {
    let spoofed_src = spoofed_source(client_addr.ip(), fwd.internal, &cfg).await;
    let connect_ip = match spoofed_src {
        IpAddr::V4(_) => IpAddr::V4(cfg.guest_v4),
        IpAddr::V6(_) => IpAddr::V6(cfg.guest_v6),
    };
    let local = SocketAddr::new(spoofed_src, client_addr.port());
    let remote = SocketAddr::new(connect_ip, fwd.connect_port);

    let mut virt = match stack.connect_udp(local, remote).await {
        Ok(v) => v,
        Err(e) => {
            debug!(%local, %remote, error = %e, "host-forward udp dial into guest failed");
            return;
        }
    };

    loop {
        tokio::select! {
            data = from_client.recv() => {
                match data {
                    Some(data) => { let _ = virt.send(&data, remote); }
                    None => break,
                }
            }
            reply = timeout(UDP_IDLE_TIMEOUT, virt.recv()) => {
                match reply {
                    Ok(Some((data, _from))) => {
                        if sock.send_to(&data, client_addr).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(%client_addr, "host-forward udp client idle timeout");
                        break;
                    }
                }
            }
        }
    }
    virt.close();
}

async fn run_unix(fwd: HostForward, path: std::path::PathBuf, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "host-forward unix listener bind failed");
            return;
        }
    };
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "host-forward unix accept failed");
                continue;
            }
        };
        let fwd = fwd.clone();
        let cfg = cfg.clone();
        let stack = stack.clone();
        tokio::spawn(async move {
            handle_unix(stream, fwd, cfg, stack).await;
        });
    }
}

async fn handle_unix(stream: tokio::net::UnixStream, fwd: HostForward, cfg: Arc<FabricConfig>, stack: Arc<NetStack>) {
    // Unix-domain clients carry no IP; unix→tcp bridges (e.g. the docker.sock forward) always
    // spoof as the gateway address rather than trying to fabricate a per-client source.
    let local = SocketAddr::new(IpAddr::V4(cfg.gateway_v4), ephemeral_port());
    let remote = SocketAddr::new(IpAddr::V4(cfg.guest_v4), fwd.connect_port);

    let virt = match timeout(CONNECT_TIMEOUT, stack.connect_tcp(local, remote)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "host-forward unix->tcp dial into guest failed");
            return;
        }
        Err(_) => {
            debug!(%remote, "host-forward unix->tcp dial into guest timed out");
            return;
        }
    };

    let mut host_side = AsyncIoDuplex(stream);
    let mut guest_side = virt;
    match pump(&mut host_side, &mut guest_side).await {
        Ok((up, down)) => debug!(%remote, bytes_up = up, bytes_down = down, "host-forward unix flow closed"),
        Err(e) => warn!(%remote, error = %e, "host-forward unix flow failed"),
    }
}

fn ephemeral_port() -> u16 {
    // Smoltcp allocates the real ephemeral source port when given 0; this is only a
    // distinguishing key within `FlowId` maps, not the wire-visible port.
    0
}

/// Computes the source address a host-forward connection should spoof (§4.F step 2): the
/// client's own address unless it came from loopback, in which case we try the host's default
/// outgoing address, falling back to the gateway address when that is unavailable or the
/// forward is marked internal-only.
async fn spoofed_source(client_ip: IpAddr, internal: bool, cfg: &FabricConfig) -> IpAddr {
    if !client_ip.is_loopback() {
        return client_ip;
    }
    if !internal {
        if let Some(ip) = default_outgoing_ip(client_ip.is_ipv4()).await {
            return ip;
        }
    }
    if client_ip.is_ipv4() { IpAddr::V4(cfg.gateway_v4) } else { IpAddr::V6(cfg.gateway_v6) }
}

/// Opens a UDP socket to a public address purely to read back the local address the kernel
/// picked (§4.F step 2) — no packet is ever sent.
async fn default_outgoing_ip(v4: bool) -> Option<IpAddr> {
    let (bind_addr, probe): (&str, SocketAddr) = if v4 {
        ("0.0.0.0:0", SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53))
    } else {
        ("[::]:0", SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)), 53))
    };
    let sock = UdpSocket::bind(bind_addr).await.ok()?;
    sock.connect(probe).await.ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}
