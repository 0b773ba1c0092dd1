//! In-fabric DNS: `.local` names answered from the container registry, a handful of fixed
//! hostnames served from a static map, everything else recursed via the host's system resolver.
//!
//! Built on `hickory-proto`/`hickory-resolver`, the real-world recursive-resolver crates this
//! workspace depends on for anything DNS-shaped, rather than hand-rolling wire parsing the way
//! the ICMP forwarder has to for lack of a suitable crate.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::config::FabricConfig;
use crate::registry::{NameRegistry, RecordType as RegistryRecordType};
use crate::stack::NetStack;

/// TTL for the fixed host/services/gateway names; 60 matches the registry's own answers for
/// consistency.
const STATIC_TTL: u32 = 60;

/// Binds DNS (UDP and TCP, port 53) on both service addresses. Both legs run over the virtual
/// stack, not a real host socket: `cfg.service_v4`/`service_v6` exist only inside the smoltcp
/// interface this fabric drives, never as a host-routable address.
pub async fn run(cfg: Arc<FabricConfig>, registry: Arc<NameRegistry>, stack: Arc<NetStack>) -> std::io::Result<()> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => Some(Arc::new(r)),
        Err(e) => {
            warn!(error = %e, "failed to load host system resolver config, recursion disabled");
            None
        }
    };

    let svc_v4 = SocketAddr::new(IpAddr::V4(cfg.service_v4), 53);
    let svc_v6 = SocketAddr::new(IpAddr::V6(cfg.service_v6), 53);

    let udp4 = bind_udp(&stack, svc_v4).await?;
    let udp6 = bind_udp(&stack, svc_v6).await?;
    let tcp4 = bind_tcp(&stack, svc_v4).await?;
    let tcp6 = bind_tcp(&stack, svc_v6).await?;

    tokio::spawn(run_udp(udp4, cfg.clone(), registry.clone(), resolver.clone()));
    tokio::spawn(run_udp(udp6, cfg.clone(), registry.clone(), resolver.clone()));
    tokio::spawn(run_tcp(tcp4, cfg.clone(), registry.clone(), resolver.clone()));
    tokio::spawn(run_tcp(tcp6, cfg, registry, resolver));

    std::future::pending().await
}

async fn bind_udp(stack: &NetStack, addr: SocketAddr) -> std::io::Result<crate::stack::VirtUdpListener> {
    stack
        .bind_udp_service(addr)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn bind_tcp(
    stack: &NetStack,
    addr: SocketAddr,
) -> std::io::Result<tokio::sync::mpsc::UnboundedReceiver<crate::stack::VirtTcp>> {
    stack
        .bind_tcp_service(addr)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn run_udp(
    mut sock: crate::stack::VirtUdpListener,
    cfg: Arc<FabricConfig>,
    registry: Arc<NameRegistry>,
    resolver: Option<Arc<TokioAsyncResolver>>,
) {
    loop {
        let Some((datagram, from)) = sock.recv().await else {
            debug!("dns udp listener closed");
            return;
        };
        let Some(reply) = build_reply(&datagram, &cfg, &registry, resolver.as_deref()).await else { continue };
        if let Err(e) = sock.send(&reply, from) {
            debug!(%from, error = %e, "dns udp reply send failed");
        }
    }
}

async fn run_tcp(
    mut listener: tokio::sync::mpsc::UnboundedReceiver<crate::stack::VirtTcp>,
    cfg: Arc<FabricConfig>,
    registry: Arc<NameRegistry>,
    resolver: Option<Arc<TokioAsyncResolver>>,
) {
    while let Some(mut conn) = listener.recv().await {
        let cfg = cfg.clone();
        let registry = registry.clone();
        let resolver = resolver.clone();
        tokio::spawn(async move {
            // DNS-over-TCP prefixes each message with a big-endian u16 length (RFC 1035 §4.2.2).
            let mut len_buf = [0u8; 2];
            if read_exact(&mut conn, &mut len_buf).await.is_err() {
                return;
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut msg_buf = vec![0u8; len];
            if read_exact(&mut conn, &mut msg_buf).await.is_err() {
                return;
            }
            let Some(reply) = build_reply(&msg_buf, &cfg, &registry, resolver.as_deref()).await else { return };
            let reply_len = (reply.len() as u16).to_be_bytes();
            if conn.write(&reply_len).is_err() {
                return;
            }
            let _ = conn.write(&reply);
            conn.close_write();
        });
    }
}

async fn read_exact(conn: &mut crate::stack::VirtTcp, buf: &mut [u8]) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = conn.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "dns tcp connection closed"));
        }
        filled += n;
    }
    Ok(())
}

async fn build_reply(
    query_bytes: &[u8],
    cfg: &FabricConfig,
    registry: &NameRegistry,
    resolver: Option<&TokioAsyncResolver>,
) -> Option<Vec<u8>> {
    let query = Message::from_bytes(query_bytes).ok()?;
    let mut reply = Message::new();
    reply.set_id(query.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_desired(query.recursion_desired());
    reply.set_recursion_available(resolver.is_some());
    reply.set_response_code(ResponseCode::NoError);

    for query_rec in query.queries() {
        reply.add_query(query_rec.clone());
        if query_rec.query_class() != DNSClass::IN {
            continue;
        }
        let name = query_rec.name().clone();
        let qtype = query_rec.query_type();
        for rr in answer_one(&name, qtype, cfg, registry, resolver).await {
            reply.add_answer(rr);
        }
    }

    reply.to_bytes().ok()
}

async fn answer_one(
    name: &Name,
    qtype: RecordType,
    cfg: &FabricConfig,
    registry: &NameRegistry,
    resolver: Option<&TokioAsyncResolver>,
) -> Vec<Record> {
    let lower = name.to_ascii().to_ascii_lowercase();
    let unqualified = lower.trim_end_matches('.');

    if unqualified.ends_with(".local") {
        let reg_qtype = match qtype {
            RecordType::A => RegistryRecordType::A,
            RecordType::AAAA => RegistryRecordType::Aaaa,
            RecordType::ANY => RegistryRecordType::Any,
            _ => return Vec::new(),
        };
        return registry
            .resolve(unqualified, reg_qtype)
            .into_iter()
            .filter_map(|rr| {
                let rdata = match rr.addr {
                    IpAddr::V4(v4) => RData::A(v4.into()),
                    IpAddr::V6(v6) => RData::AAAA(v6.into()),
                };
                Some(Record::from_rdata(name.clone(), rr.ttl, rdata))
            })
            .collect();
    }

    if let Some(rdata) = static_host_answer(unqualified, qtype, cfg) {
        return vec![Record::from_rdata(name.clone(), STATIC_TTL, rdata)];
    }

    let Some(resolver) = resolver else { return Vec::new() };
    let recursed_type = match qtype {
        RecordType::A
        | RecordType::AAAA
        | RecordType::CNAME
        | RecordType::MX
        | RecordType::NS
        | RecordType::PTR
        | RecordType::TXT => qtype,
        _ => return Vec::new(),
    };
    match resolver.lookup(name.clone(), recursed_type).await {
        Ok(lookup) => lookup.record_iter().cloned().collect(),
        Err(e) => {
            debug!(%name, error = %e, "dns recursion failed");
            Vec::new()
        }
    }
}

/// The fixed hostnames every fabric serves. Each resolves to both address families of the relevant
/// fabric address so A and AAAA both work regardless of which the caller asked for.
fn static_host_answer(name: &str, qtype: RecordType, cfg: &FabricConfig) -> Option<RData> {
    let (v4, v6) = match name {
        "host" | "host.internal" => (cfg.host_nat_v4, cfg.host_nat_v6),
        "services" | "services.internal" => (cfg.service_v4, cfg.service_v6),
        "gateway" | "gateway.internal" => (cfg.gateway_v4, cfg.gateway_v6),
        _ => return None,
    };
    match qtype {
        RecordType::A => Some(RData::A(v4.into())),
        RecordType::AAAA => Some(RData::AAAA(v6.into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn query_message(name: &str, qtype: RecordType) -> Message {
        query_message_with_class(name, qtype, DNSClass::IN)
    }

    fn query_message_with_class(name: &str, qtype: RecordType, class: DNSClass) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(qtype);
        q.set_query_class(class);
        msg.add_query(q);
        msg
    }

    #[tokio::test]
    async fn local_suffix_is_answered_from_registry_without_a_resolver() {
        let cfg = FabricConfig::default();
        let registry = NameRegistry::new();
        registry.add(&crate::registry::Container {
            id: "abc123def456789".into(),
            names: vec!["/web".into()],
            labels: Default::default(),
            ips: vec![std::net::IpAddr::V4(std::net::Ipv4Addr::new(172, 17, 0, 2))],
        });

        let query = query_message("web.docker.local.", RecordType::A);
        let reply_bytes = build_reply(&query.to_bytes().unwrap(), &cfg, &registry, None).await.unwrap();
        let reply = Message::from_bytes(&reply_bytes).unwrap();

        assert_eq!(reply.id(), 0x1234);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(std::net::Ipv4Addr::new(172, 17, 0, 2).into())));
    }

    #[tokio::test]
    async fn static_hostnames_resolve_to_fixed_fabric_addresses() {
        let cfg = FabricConfig::default();
        let registry = NameRegistry::new();

        let query = query_message("host.internal.", RecordType::A);
        let reply_bytes = build_reply(&query.to_bytes().unwrap(), &cfg, &registry, None).await.unwrap();
        let reply = Message::from_bytes(&reply_bytes).unwrap();

        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(cfg.host_nat_v4.into())));
    }

    #[tokio::test]
    async fn no_resolver_means_no_recursion_for_unmatched_names() {
        let cfg = FabricConfig::default();
        let registry = NameRegistry::new();

        let query = query_message("example.com.", RecordType::A);
        let reply_bytes = build_reply(&query.to_bytes().unwrap(), &cfg, &registry, None).await.unwrap();
        let reply = Message::from_bytes(&reply_bytes).unwrap();

        assert!(reply.answers().is_empty());
        assert!(!reply.recursion_available());
    }

    #[tokio::test]
    async fn non_in_class_queries_are_silently_ignored() {
        let cfg = FabricConfig::default();
        let registry = NameRegistry::new();
        registry.add(&crate::registry::Container {
            id: "abc123def456789".into(),
            names: vec!["/web".into()],
            labels: Default::default(),
            ips: vec![std::net::IpAddr::V4(std::net::Ipv4Addr::new(172, 17, 0, 2))],
        });

        let query = query_message_with_class("web.docker.local.", RecordType::A, DNSClass::CH);
        let reply_bytes = build_reply(&query.to_bytes().unwrap(), &cfg, &registry, None).await.unwrap();
        let reply = Message::from_bytes(&reply_bytes).unwrap();

        assert!(reply.answers().is_empty());
    }
}
