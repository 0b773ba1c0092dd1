//! In-fabric NTP: answers guest time queries with the host's wall clock in a standard NTPv3
//! response. No NTP crate is in this workspace's dependency tree, so this mirrors the ICMP
//! forwarder's approach of hand-building the fixed-layout wire format directly rather than
//! pulling in a dependency for one 48-byte struct.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::config::FabricConfig;
use crate::stack::{NetStack, VirtUdpListener};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;

/// A client request is the full 48-byte NTP header; anything shorter cannot be a real query.
const PACKET_LEN: usize = 48;

/// Binds NTP (UDP, port 123) on both service addresses, over the virtual stack like the rest
/// of the in-fabric services — `cfg.service_v4`/`service_v6` have no presence on the host's own
/// network stack.
pub async fn run(cfg: Arc<FabricConfig>, stack: Arc<NetStack>) -> std::io::Result<()> {
    let sock4 = stack
        .bind_udp_service(SocketAddr::new(IpAddr::V4(cfg.service_v4), 123))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let sock6 = stack
        .bind_udp_service(SocketAddr::new(IpAddr::V6(cfg.service_v6), 123))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    tokio::spawn(serve(sock4));
    tokio::spawn(serve(sock6));
    std::future::pending().await
}

async fn serve(mut sock: VirtUdpListener) {
    loop {
        let Some((datagram, from)) = sock.recv().await else {
            warn!("ntp listener closed");
            return;
        };
        if datagram.len() < PACKET_LEN {
            continue;
        }
        let mut request = [0u8; PACKET_LEN];
        request.copy_from_slice(&datagram[..PACKET_LEN]);
        let receive_ts = now_as_ntp();
        let reply = build_reply(&request, receive_ts);
        if let Err(e) = sock.send(&reply, from) {
            warn!(%from, error = %e, "ntp reply send failed");
        }
    }
}

fn build_reply(request: &[u8; PACKET_LEN], receive_ts: [u8; 8]) -> [u8; PACKET_LEN] {
    let mut reply = [0u8; PACKET_LEN];
    // LI=0 (no warning), VN=3 (NTPv3), Mode=4 (server).
    reply[0] = (0 << 6) | (3 << 3) | 4;
    reply[1] = 1; // stratum 1: we are the reference clock (the host's own wall clock).
    reply[2] = request[2].max(4); // echo the client's poll interval, floor at the NTP minimum.
    reply[3] = 0xFA; // precision: about 2^-6s, consistent with a syscall-backed clock read.
    // Root delay / root dispersion: zero, we are the primary source for this answer.
    reply[12..16].copy_from_slice(b"LOCL");
    reply[16..24].copy_from_slice(&receive_ts); // reference timestamp
    reply[24..32].copy_from_slice(&request[40..48]); // originate = client's transmit timestamp
    reply[32..40].copy_from_slice(&receive_ts);
    let transmit_ts = now_as_ntp();
    reply[40..48].copy_from_slice(&transmit_ts);
    reply
}

fn now_as_ntp() -> [u8; 8] {
    let since_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs() + NTP_UNIX_EPOCH_DELTA;
    let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&(seconds as u32).to_be_bytes());
    out[4..].copy_from_slice(&(fraction as u32).to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_echoes_originate_timestamp_from_request_transmit_field() {
        let mut request = [0u8; PACKET_LEN];
        request[40..48].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let reply = build_reply(&request, now_as_ntp());
        assert_eq!(&reply[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reply[0], 0b0001_1100);
        assert_eq!(reply[1], 1);
    }
}
