//! Virtualized network fabric: a userspace L2/L3/L4 stack sitting between one guest VM's
//! virtio-net link and the host, providing NAT'd outbound access, host→guest forwards, a small
//! set of in-fabric services (DNS/NTP/host-control/SFTP), and a transparent TLS MITM proxy for
//! `*.local` container names.
//!
//! `Fabric` is the single entry point: it owns every long-running task for one guest and is
//! constructed once per VM. One struct validates config, spawns the stack thread, then fans out
//! every collaborator as its own tokio task, keyed off `Arc` handles rather than a shared event
//! loop.

pub mod config;
pub mod error;
pub mod forwarders;
pub mod link;
pub mod nat;
pub mod pump;
pub mod registry;
pub mod services;
pub mod stack;
pub mod tlsproxy;

use std::net::IpAddr;
use std::sync::Arc;

use tracing::info;

pub use config::FabricConfig;
pub use error::FabricError;

use link::LinkEndpoint;
use nat::NatTable;
use registry::NameRegistry;
use stack::NetStack;

/// One running fabric instance: the netstack thread, the NAT table, the container name
/// registry, and every forwarder/service/proxy task spawned against them. Dropping this drops
/// the `Arc<NetStack>` (and with it the link and worker thread) once every task holding a clone
/// has also exited.
pub struct Fabric {
    pub stack: Arc<NetStack>,
    pub nat: Arc<NatTable>,
    pub registry: Arc<NameRegistry>,
    pub config: Arc<FabricConfig>,
    /// Bearer token the host-control service requires; handed back to the embedder so it can
    /// reach the fabric's `/ping` endpoint without having to read it back out of a log.
    pub control_token: String,
}

impl Fabric {
    /// Validates `cfg`, brings up the netstack on its own thread, seeds the static NAT
    /// substitutions, and spawns every forwarder, in-fabric service, and the TLS proxy. Returns
    /// once everything is spawned — the tasks themselves keep running in the background for the
    /// lifetime of the returned `Fabric`.
    pub fn start(mut link: LinkEndpoint, cfg: FabricConfig) -> Result<Arc<Fabric>, FabricError> {
        cfg.validate()?;

        if let Some(path) = &cfg.pcap_path {
            if let Err(e) = link.enable_pcap(path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to enable pcap capture, continuing without it");
            }
        }

        let cfg = Arc::new(cfg);
        let stack = Arc::new(NetStack::spawn(link, (*cfg).clone()));
        let nat = Arc::new(NatTable::new());
        let registry = Arc::new(NameRegistry::new());

        // The host-nat anycast addresses resolve to the real loopback on each family so
        // forwarders dialing "the host" from the guest's point of view land on 127.0.0.1 / ::1.
        nat.insert_ip_substitution(IpAddr::V4(cfg.host_nat_v4), IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        nat.insert_ip_substitution(IpAddr::V6(cfg.host_nat_v6), IpAddr::V6(std::net::Ipv6Addr::LOCALHOST));

        let control_token = services::hostcontrol::mint_token();

        let fabric = Arc::new(Fabric {
            stack,
            nat,
            registry,
            config: cfg,
            control_token: control_token.clone(),
        });

        fabric.spawn_forwarders();
        fabric.spawn_services(control_token);
        fabric.spawn_tls_proxy();

        info!("fabric started");
        Ok(fabric)
    }

    fn spawn_forwarders(&self) {
        let tcp_stack = self.stack.clone();
        let tcp_nat = self.nat.clone();
        tokio::spawn(async move { forwarders::tcp::run(tcp_stack, tcp_nat).await });

        let udp_stack = self.stack.clone();
        let udp_nat = self.nat.clone();
        tokio::spawn(async move { forwarders::udp::run(udp_stack, udp_nat).await });

        let icmp_stack = self.stack.clone();
        tokio::spawn(async move { forwarders::icmp::run(icmp_stack).await });

        forwarders::host_forward::spawn_all(self.config.clone(), self.stack.clone());
    }

    fn spawn_services(&self, control_token: String) {
        services::spawn_all(self.config.clone(), self.registry.clone(), self.stack.clone(), control_token);
    }

    fn spawn_tls_proxy(&self) {
        let cfg = self.config.clone();
        let stack = self.stack.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = tlsproxy::run(cfg, stack, registry).await {
                tracing::warn!(error = %e, "tls mitm proxy exited");
            }
        });
    }
}
