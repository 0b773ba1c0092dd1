//! ICMP echo (component E) handled directly at the frame layer rather than through a smoltcp
//! `icmp::Socket`: echo request/reply is simple enough that hand-building the reply frame with
//! `smoltcp::wire`'s packet representations is clearer than threading another socket type
//! through the poll loop, and keeps the one genuinely raw-frame concern (swapping Ethernet/IP
//! source and destination for a spoofed reply) in one place.

use std::net::IpAddr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Ipv4Address, Ipv4Packet,
    Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr, IpProtocol,
};
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr};

use super::device::LinkDevice;
use crate::config::FabricConfig;

#[derive(Debug, Clone)]
pub struct IcmpEchoRequest {
    pub id: u16,
    pub seq: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IcmpEchoReply {
    pub id: u16,
    pub seq: u16,
    /// Guest address the reply is addressed back to (the original request's source).
    pub to: IpAddr,
    /// Address the reply claims to be from (the original request's destination).
    pub from: IpAddr,
    pub payload: Vec<u8>,
}

/// Parses a frame as an ICMPv4/ICMPv6 echo request; returns `None` for anything else, leaving
/// the frame for the normal smoltcp path (ARP, NDP, TCP, UDP).
pub fn try_parse_echo_request(frame: &[u8]) -> Option<IcmpEchoRequest> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Icmp {
                return None;
            }
            let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
            let repr = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::ignored()).ok()?;
            match repr {
                Icmpv4Repr::EchoRequest { ident, seq_no, data } => Some(IcmpEchoRequest {
                    id: ident,
                    seq: seq_no,
                    src: IpAddr::V4(ip.src_addr().into()),
                    dst: IpAddr::V4(ip.dst_addr().into()),
                    payload: data.to_vec(),
                }),
                _ => None,
            }
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Icmpv6 {
                return None;
            }
            let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
            let repr = Icmpv6Repr::parse(
                &ip.src_addr(),
                &ip.dst_addr(),
                &icmp,
                &ChecksumCapabilities::ignored(),
            )
            .ok()?;
            match repr {
                Icmpv6Repr::EchoRequest { ident, seq_no, data } => Some(IcmpEchoRequest {
                    id: ident,
                    seq: seq_no,
                    src: IpAddr::V6(ip.src_addr().into()),
                    dst: IpAddr::V6(ip.dst_addr().into()),
                    payload: data.to_vec(),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Builds and writes the Ethernet+IP+ICMP echo reply frame for a reply coming back from the
/// host-side ICMP forwarder (component E). The frame is addressed to the guest's own link
/// address: with a single peer on this link there is never an ARP/NDP lookup to perform.
pub fn send_reply(device: &mut LinkDevice, cfg: &FabricConfig, reply: &IcmpEchoReply) {
    match (reply.to, reply.from) {
        (IpAddr::V4(to), IpAddr::V4(from)) => send_reply_v4(device, cfg, reply, to, from),
        (IpAddr::V6(to), IpAddr::V6(from)) => send_reply_v6(device, cfg, reply, to, from),
        _ => tracing::warn!("icmp echo reply address family mismatch, dropping"),
    }
}

fn guest_mac(cfg: &FabricConfig) -> EthernetAddress {
    // The gateway owns the only MAC on this link other than the guest's; the guest's own
    // address is learned from the frame that triggered the flow, but since this link carries
    // exactly one peer we address replies directly rather than tracking a neighbor cache.
    let mut mac = cfg.gateway_mac.0;
    mac[5] ^= 0x01;
    EthernetAddress(mac)
}

fn send_reply_v4(
    device: &mut LinkDevice,
    cfg: &FabricConfig,
    reply: &IcmpEchoReply,
    to: std::net::Ipv4Addr,
    from: std::net::Ipv4Addr,
) {
    let icmp_repr = Icmpv4Repr::EchoReply { ident: reply.id, seq_no: reply.seq, data: &reply.payload };
    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(from),
        dst_addr: Ipv4Address::from(to),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: cfg.gateway_mac,
        dst_addr: guest_mac(cfg),
        ethertype: EthernetProtocol::Ipv4,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buf = vec![0u8; total];

    let mut eth = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    let mut icmp = Icmpv4Packet::new_unchecked(ip.payload_mut());
    icmp_repr.emit(&mut icmp, &ChecksumCapabilities::default());

    if let Err(e) = device.link.write_frame(&buf) {
        tracing::warn!(error = %e, "failed to write icmpv4 echo reply");
    }
}

fn send_reply_v6(
    device: &mut LinkDevice,
    cfg: &FabricConfig,
    reply: &IcmpEchoReply,
    to: std::net::Ipv6Addr,
    from: std::net::Ipv6Addr,
) {
    let icmp_repr = Icmpv6Repr::EchoReply { ident: reply.id, seq_no: reply.seq, data: &reply.payload };
    let src_addr = Ipv6Address::from(from);
    let dst_addr = Ipv6Address::from(to);
    let ip_repr = Ipv6Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: cfg.gateway_mac,
        dst_addr: guest_mac(cfg),
        ethertype: EthernetProtocol::Ipv6,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buf = vec![0u8; total];

    let mut eth = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv6Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip);
    let mut icmp = Icmpv6Packet::new_unchecked(ip.payload_mut());
    icmp_repr.emit(&src_addr, &dst_addr, &mut icmp, &ChecksumCapabilities::default());

    if let Err(e) = device.link.write_frame(&buf) {
        tracing::warn!(error = %e, "failed to write icmpv6 echo reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_echo_request() {
        let icmp_repr = Icmpv4Repr::EchoRequest { ident: 7, seq_no: 1, data: &[1, 2, 3, 4] };
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Address::new(172, 30, 30, 2),
            dst_addr: Ipv4Address::new(93, 184, 216, 34),
            next_header: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x02]),
            dst_addr: EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]),
            ethertype: EthernetProtocol::Ipv4,
        };
        let total = eth_repr.buffer_len() + ip_repr.buffer_len() + icmp_repr.buffer_len();
        let mut buf = vec![0u8; total];
        let mut eth = EthernetFrame::new_unchecked(&mut buf);
        eth_repr.emit(&mut eth);
        let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
        ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
        let mut icmp = Icmpv4Packet::new_unchecked(ip.payload_mut());
        icmp_repr.emit(&mut icmp, &ChecksumCapabilities::default());

        let req = try_parse_echo_request(&buf).expect("should parse as echo request");
        assert_eq!(req.id, 7);
        assert_eq!(req.seq, 1);
        assert_eq!(req.payload, vec![1, 2, 3, 4]);
    }
}
