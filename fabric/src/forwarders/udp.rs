//! UDP forwarder (spec §4.D): one task per guest-originated 5-tuple, dialing a host UDP
//! socket at the NAT-resolved destination and relaying datagrams in both directions until the
//! flow has been idle past the timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::nat::{should_proxy, NatTable, Proto as NatProto, VirtAddr};
use crate::stack::{NetStack, UdpForwarderRequest};

/// Reclaims a session once neither side has sent anything for this long (§3 data model).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(stack: Arc<NetStack>, nat: Arc<NatTable>) {
    loop {
        let Some(req) = stack.next_udp().await else {
            debug!("udp forwarder request channel closed, stopping");
            return;
        };
        let nat = nat.clone();
        tokio::spawn(async move {
            handle(req, nat).await;
        });
    }
}

async fn handle(req: UdpForwarderRequest, nat: Arc<NatTable>) {
    let flow = req.flow;
    let virt = VirtAddr { addr: flow.remote, proto: NatProto::Udp };
    let host = nat.resolve(virt);
    let via_nat = host.0 != virt.addr;

    if !via_nat && !should_proxy(host.0, &[]) {
        debug!(?flow, "udp flow denied by policy");
        req.drop_silently();
        return;
    }

    let bind_addr = if host.0.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let sock = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(?flow, error = %e, "udp local bind failed");
            req.drop_silently();
            return;
        }
    };
    if let Err(e) = sock.connect(host.0).await {
        debug!(?flow, error = %e, "udp dial failed");
        req.drop_silently();
        return;
    }

    let mut guest = req.create_endpoint();
    let mut buf = vec![0u8; 64 * 1024];
    let mut up = 0u64;
    let mut down = 0u64;

    loop {
        tokio::select! {
            guest_pkt = guest.recv() => {
                match guest_pkt {
                    Some((data, _from)) => {
                        if let Err(e) = sock.send(&data).await {
                            debug!(?flow, error = %e, "udp host send failed");
                            break;
                        }
                        up += data.len() as u64;
                    }
                    None => break,
                }
            }
            host_pkt = timeout(IDLE_TIMEOUT, sock.recv(&mut buf)) => {
                match host_pkt {
                    Ok(Ok(n)) => {
                        if guest.send(&buf[..n], flow.local).is_err() {
                            break;
                        }
                        down += n as u64;
                    }
                    Ok(Err(e)) => {
                        debug!(?flow, error = %e, "udp host recv failed");
                        break;
                    }
                    Err(_) => {
                        debug!(?flow, "udp session idle timeout");
                        break;
                    }
                }
            }
        }
    }

    debug!(?flow, bytes_up = up, bytes_down = down, "udp flow closed");
    guest.close();
}
