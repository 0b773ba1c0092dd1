//! ICMP echo forwarder (spec §4.E): proxies guest echo requests through a host
//! datagram-ICMP socket (the one way to send ICMP from an unprivileged userspace process) and
//! correlates replies back onto the guest-visible `(id, seq)` pair.
//!
//! Grounded on the link endpoint's own "owns a raw fd, runs a dedicated blocking read loop"
//! shape (`link::LinkEndpoint`) and on `stack::icmp`'s use of `smoltcp::wire` ICMP
//! representations to build/parse wire bytes without a full packet-sniffing dependency.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, Ipv6Address};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stack::{IcmpEchoReply, NetStack};

/// Pending requests are aged out after this long without a matching reply (§4.E).
pub const PENDING_TTL: Duration = Duration::from_secs(30);

struct Pending {
    /// Guest's original echo identifier, restored onto the reply before handing it back to the
    /// stack — the host socket overwrites the id it actually sends with its own source port
    /// (Linux rewrites `icmph->un.echo.id` to `inet_sport` on a `SOCK_DGRAM`/`IPPROTO_ICMP`
    /// send), so the wire-level id on the reply we read back is useless for correlation.
    id: u16,
    src: IpAddr,
    dst: IpAddr,
    inserted: Instant,
}

/// Keyed on sequence number only: every request sent through one shared host socket carries
/// the same kernel-rewritten id, so `seq` (plus the reply's source address, checked against
/// `dst` at match time) is what actually disambiguates concurrent pending echoes.
type PendingMap = Arc<Mutex<HashMap<u16, Vec<Pending>>>>;

/// Drives the ICMP echo forwarder for the lifetime of the fabric. Absence of ICMP sysctl
/// permission on the host (DESIGN open question) surfaces here as a socket-creation failure;
/// we log once and simply never forward echoes rather than taking the whole fabric down.
pub async fn run(stack: Arc<NetStack>) {
    let sock_v4 = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to open dgram-icmpv4 socket, icmp forwarding disabled for ipv4");
            None
        }
    };
    let sock_v6 = match Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6)) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to open dgram-icmpv6 socket, icmp forwarding disabled for ipv6");
            None
        }
    };

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let send_v4 = sock_v4.map(|s| {
        let std_sock: std::net::UdpSocket = s.into();
        let std_sock = Arc::new(std_sock);
        spawn_reply_reader(std_sock.clone(), pending.clone(), reply_tx.clone(), false);
        std_sock
    });
    let send_v6 = sock_v6.map(|s| {
        let std_sock: std::net::UdpSocket = s.into();
        let std_sock = Arc::new(std_sock);
        spawn_reply_reader(std_sock.clone(), pending.clone(), reply_tx.clone(), true);
        std_sock
    });

    tokio::spawn(age_out(pending.clone()));

    let forward_stack = stack.clone();
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            forward_stack.reply_icmp(reply);
        }
    });

    loop {
        let Some(req) = stack.next_icmp().await else {
            debug!("icmp forwarder request channel closed, stopping");
            return;
        };

        let sock = match req.dst {
            IpAddr::V4(_) => send_v4.clone(),
            IpAddr::V6(_) => send_v6.clone(),
        };
        let Some(sock) = sock else {
            debug!(?req.dst, "no host icmp socket available for this address family, dropping echo");
            continue;
        };

        pending
            .lock()
            .unwrap()
            .entry(req.seq)
            .or_default()
            .push(Pending { id: req.id, src: req.src, dst: req.dst, inserted: Instant::now() });

        let id = req.id;
        let seq = req.seq;
        let dst = req.dst;
        let payload = req.payload;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = send_echo(&sock, dst, id, seq, &payload) {
                debug!(%dst, error = %e, "failed to send host icmp echo");
            }
        });
    }
}

fn send_echo(sock: &std::net::UdpSocket, dst: IpAddr, id: u16, seq: u16, payload: &[u8]) -> std::io::Result<()> {
    let buf = match dst {
        IpAddr::V4(_) => {
            let repr = Icmpv4Repr::EchoRequest { ident: id, seq_no: seq, data: payload };
            let mut buf = vec![0u8; repr.buffer_len()];
            let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
            repr.emit(&mut packet, &ChecksumCapabilities::default());
            buf
        }
        IpAddr::V6(_) => {
            let repr = Icmpv6Repr::EchoRequest { ident: id, seq_no: seq, data: payload };
            let mut buf = vec![0u8; repr.buffer_len()];
            let mut packet = Icmpv6Packet::new_unchecked(&mut buf);
            // DGRAM ICMPv6 sockets compute the pseudo-header checksum in-kernel; we still need
            // some source/dest pair to satisfy the emit signature, the kernel overwrites it.
            repr.emit(&Ipv6Address::UNSPECIFIED, &Ipv6Address::UNSPECIFIED, &mut packet, &ChecksumCapabilities::default());
            buf
        }
    };
    sock.send_to(&buf, SocketAddr::new(dst, 0))?;
    Ok(())
}

fn spawn_reply_reader(
    sock: Arc<std::net::UdpSocket>,
    pending: PendingMap,
    reply_tx: mpsc::UnboundedSender<IcmpEchoReply>,
    is_v6: bool,
) {
    std::thread::Builder::new()
        .name(if is_v6 { "fabric-icmp6-reply" } else { "fabric-icmp4-reply" }.into())
        .spawn(move || {
            let mut buf = [0u8; 2048];
            loop {
                match sock.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        let parsed = if is_v6 { parse_echo_reply_v6(&buf[..n]) } else { parse_echo_reply_v4(&buf[..n]) };
                        let Some((_rewritten_id, seq, data)) = parsed else { continue };
                        let from_ip = from.ip();
                        let p = {
                            let mut guard = pending.lock().unwrap();
                            let Some(slot) = guard.get_mut(&seq) else { continue };
                            let Some(idx) = slot.iter().position(|p| p.dst == from_ip) else { continue };
                            let p = slot.swap_remove(idx);
                            if slot.is_empty() {
                                guard.remove(&seq);
                            }
                            p
                        };
                        let _ = reply_tx.send(IcmpEchoReply { id: p.id, seq, to: p.src, from: p.dst, payload: data });
                    }
                    Err(e) => {
                        warn!(error = %e, "icmp reply reader socket error, stopping");
                        return;
                    }
                }
            }
        })
        .expect("spawn icmp reply reader thread");
}

fn parse_echo_reply_v4(buf: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    let packet = Icmpv4Packet::new_checked(buf).ok()?;
    match Icmpv4Repr::parse(&packet, &ChecksumCapabilities::ignored()).ok()? {
        Icmpv4Repr::EchoReply { ident, seq_no, data } => Some((ident, seq_no, data.to_vec())),
        _ => None,
    }
}

fn parse_echo_reply_v6(buf: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    let packet = Icmpv6Packet::new_checked(buf).ok()?;
    match Icmpv6Repr::parse(&Ipv6Address::UNSPECIFIED, &Ipv6Address::UNSPECIFIED, &packet, &ChecksumCapabilities::ignored()).ok()? {
        Icmpv6Repr::EchoReply { ident, seq_no, data } => Some((ident, seq_no, data.to_vec())),
        _ => None,
    }
}

async fn age_out(pending: PendingMap) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = Instant::now();
        let mut guard = pending.lock().unwrap();
        guard.retain(|_, slot| {
            slot.retain(|p| now.duration_since(p.inserted) < PENDING_TTL);
            !slot.is_empty()
        });
    }
}
