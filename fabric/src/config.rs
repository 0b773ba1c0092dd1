//! Static configuration for a `Fabric` instance.
//!
//! Mirrors the addressing plan in spec §6 and the house style of `ross-shim`'s
//! `GuestConfig`/`network.rs`: plain data read once from environment/defaults, validated before
//! anything is bound.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use smoltcp::wire::{EthernetAddress, IpCidr, Ipv4Cidr, Ipv6Cidr};

use crate::error::FabricError;

/// A single `proto:host:port -> proto:port` host-fabric binding (spec §6 table).
#[derive(Debug, Clone)]
pub struct HostForward {
    pub listen: ListenSpec,
    pub connect_port: u16,
    /// Spoofed-source fallback used when the dial is to an internal-only guest service
    /// (§4.F step 2).
    pub internal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Unix,
    Vsock,
}

#[derive(Debug, Clone)]
pub enum ListenSpec {
    Tcp { host: std::net::IpAddr, port: u16 },
    Udp { host: std::net::IpAddr, port: u16 },
    Unix { path: PathBuf },
    Vsock { port: u32 },
}

impl ListenSpec {
    pub fn proto(&self) -> Proto {
        match self {
            ListenSpec::Tcp { .. } => Proto::Tcp,
            ListenSpec::Udp { .. } => Proto::Udp,
            ListenSpec::Unix { .. } => Proto::Unix,
            ListenSpec::Vsock { .. } => Proto::Vsock,
        }
    }

    /// True when a privileged-port forward needs the `0.0.0.0` fallback bind of §4.F.
    pub fn is_privileged_loopback(&self) -> bool {
        matches!(
            self,
            ListenSpec::Tcp { host, port } | ListenSpec::Udp { host, port }
                if host.is_loopback() && *port < 1024
        )
    }
}

/// Everything in spec §6 that is environment-specific rather than protocol-specific.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub ipv4_subnet: Ipv4Cidr,
    pub ipv6_subnet: Ipv6Cidr,

    pub gateway_v4: Ipv4Addr,
    pub guest_v4: Ipv4Addr,
    pub service_v4: Ipv4Addr,
    pub host_nat_v4: Ipv4Addr,

    pub gateway_v6: Ipv6Addr,
    pub guest_v6: Ipv6Addr,
    pub service_v6: Ipv6Addr,
    pub host_nat_v6: Ipv6Addr,

    pub gateway_mac: EthernetAddress,

    /// Fixed at 65520 per §4.A; kept configurable only so tests can shrink it.
    pub mtu: usize,

    pub host_forwards: Vec<HostForward>,

    /// `DEBUG`-style env flag (§6).
    pub debug: bool,
    /// PCap capture flag (§6 / §10.5); when set, frames are appended to this file.
    pub pcap_path: Option<PathBuf>,
    pub enable_sftp: bool,
    /// Root directory the SFTP service (§4.G) serves; relative paths requested by a client
    /// are resolved underneath this directory.
    pub sftp_root: PathBuf,

    /// Real host-bound listeners for the TLS MITM proxy (component I): unlike the in-fabric
    /// services, these are genuine host sockets, because the proxy's clients are host-side
    /// processes whose `:443` traffic is redirected here out-of-band (§4.I), not guest flows
    /// arriving over the virtual link.
    pub tls_proxy_v4: SocketAddr,
    pub tls_proxy_v6: SocketAddr,
}

impl FabricConfig {
    /// Reproduces the literal addressing plan from spec §6.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.debug = std::env::var("DEBUG").map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
        cfg.pcap_path = std::env::var_os("GVNET_PCAP").map(PathBuf::from);
        cfg.enable_sftp = std::env::var("GVNET_SFTP").map(|v| v == "1").unwrap_or(false);
        if let Some(root) = std::env::var_os("GVNET_SFTP_ROOT") {
            cfg.sftp_root = PathBuf::from(root);
        }
        cfg
    }

    /// Enforces invariant 1: every IPv4 subnet is `/24`, every IPv6 subnet is `/64`. Unlike a
    /// single bad *host-forward* entry (which is skipped with a warning, see
    /// `HostForward`/forwarder construction), a malformed *required* subnet is a hard
    /// construction-time error — there is nothing sensible to route without it.
    pub fn validate(&self) -> Result<(), FabricError> {
        if self.ipv4_subnet.prefix_len() != 24 {
            return Err(FabricError::StackConfig(format!(
                "ipv4 subnet {} must be a /24",
                self.ipv4_subnet
            )));
        }
        if self.ipv6_subnet.prefix_len() != 64 {
            return Err(FabricError::StackConfig(format!(
                "ipv6 subnet {} must be a /64",
                self.ipv6_subnet
            )));
        }
        if self.mtu == 0 || self.mtu > 65535 {
            return Err(FabricError::StackConfig(format!("mtu {} out of range", self.mtu)));
        }
        Ok(())
    }

    pub fn ipv4_route(&self) -> IpCidr {
        IpCidr::Ipv4(self.ipv4_subnet)
    }

    pub fn ipv6_route(&self) -> IpCidr {
        IpCidr::Ipv6(self.ipv6_subnet)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        let ipv4_subnet = Ipv4Cidr::new(Ipv4Addr::new(172, 30, 30, 0).into(), 24);
        let ipv6_subnet =
            Ipv6Cidr::new("fc00:96dc:7096:1d21::".parse().unwrap(), 64);

        FabricConfig {
            ipv4_subnet,
            ipv6_subnet,
            gateway_v4: Ipv4Addr::new(172, 30, 30, 1),
            guest_v4: Ipv4Addr::new(172, 30, 30, 2),
            service_v4: Ipv4Addr::new(172, 30, 30, 200),
            host_nat_v4: Ipv4Addr::new(172, 30, 30, 254),
            gateway_v6: "fc00:96dc:7096:1d21::1".parse().unwrap(),
            guest_v6: "fc00:96dc:7096:1d21::2".parse().unwrap(),
            service_v6: "fc00:96dc:7096:1d21::200".parse().unwrap(),
            host_nat_v6: "fc00:96dc:7096:1d21::254".parse().unwrap(),
            gateway_mac: EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]),
            mtu: 65520,
            host_forwards: default_host_forwards(),
            debug: false,
            pcap_path: None,
            enable_sftp: false,
            sftp_root: std::env::temp_dir(),
            tls_proxy_v4: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 10443),
            tls_proxy_v6: SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 10443),
        }
    }
}

/// The literal bindings from spec §6's host-fabric binding table.
fn default_host_forwards() -> Vec<HostForward> {
    use std::net::IpAddr;
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    vec![
        HostForward {
            listen: ListenSpec::Tcp { host: loopback, port: 2222 },
            connect_port: 22,
            internal: false,
        },
        HostForward {
            listen: ListenSpec::Tcp { host: loopback, port: 62429 },
            connect_port: 2049,
            internal: false,
        },
        HostForward {
            listen: ListenSpec::Udp { host: loopback, port: 62429 },
            connect_port: 2049,
            internal: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        FabricConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_24_ipv4_subnet() {
        let mut cfg = FabricConfig::default();
        cfg.ipv4_subnet = Ipv4Cidr::new(Ipv4Addr::new(172, 30, 30, 0).into(), 23);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_64_ipv6_subnet() {
        let mut cfg = FabricConfig::default();
        cfg.ipv6_subnet = Ipv6Cidr::new("fc00:96dc:7096:1d21::".parse().unwrap(), 48);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn privileged_loopback_forward_is_flagged() {
        let fwd = ListenSpec::Tcp { host: std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), port: 443 };
        assert!(fwd.is_privileged_loopback());
        let fwd = ListenSpec::Tcp { host: std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), port: 8443 };
        assert!(!fwd.is_privileged_loopback());
    }
}
