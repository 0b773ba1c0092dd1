//! NAT table and policy: the `VirtAddr -> HostAddr` mapping forwarders consult to turn a
//! guest-visible destination into the host-side dial target, plus the filter that keeps the
//! fabric from ever dialing out to addresses that make no sense to proxy.
//!
//! A `RwLock`-guarded `HashMap` indexed by a 4-tuple, carrying both protocol families and
//! separating the static service/host-forward entries (fixed at construction) from the dynamic
//! substitutions a running fabric discovers.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

/// The guest-visible address a flow was opened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtAddr {
    pub addr: SocketAddr,
    pub proto: Proto,
}

/// Where that flow should actually be dialed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddr(pub SocketAddr);

/// `VirtAddr -> HostAddr` substitutions, keyed by the guest-visible destination. Reads vastly
/// outnumber writes — one lookup per new flow versus one insert per service binding at startup
/// — so a `RwLock` over a plain map is the right tool.
#[derive(Default)]
pub struct NatTable {
    entries: RwLock<HashMap<VirtAddr, HostAddr>>,
    /// IP-only substitutions (`172.30.30.254 -> 127.0.0.1`, `fc00:...:254 -> ::1`): the
    /// port is preserved, unlike `entries` which maps one exact 4-tuple to another. Populated
    /// once at fabric construction from `FabricConfig::host_nat_v4`/`host_nat_v6` and otherwise
    /// immutable, so a plain `RwLock<HashMap<..>>` (read-mostly, same as `entries`) is enough.
    ip_substitutions: RwLock<HashMap<IpAddr, IpAddr>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, virt: VirtAddr, host: HostAddr) {
        self.entries.write().unwrap().insert(virt, host);
    }

    pub fn remove(&self, virt: &VirtAddr) {
        self.entries.write().unwrap().remove(virt);
    }

    /// Registers an IP-level substitution, applied to every port on that address.
    pub fn insert_ip_substitution(&self, virt_ip: IpAddr, host_ip: IpAddr) {
        self.ip_substitutions.write().unwrap().insert(virt_ip, host_ip);
    }

    /// Looks up the substitution for `virt`: an exact 4-tuple entry first, then an IP-level
    /// substitution with the port preserved, then `virt`'s own address unchanged — most flows
    /// are not NATed, they dial straight through.
    pub fn resolve(&self, virt: VirtAddr) -> HostAddr {
        if let Some(host) = self.entries.read().unwrap().get(&virt).copied() {
            return host;
        }
        if let Some(&host_ip) = self.ip_substitutions.read().unwrap().get(&virt.addr.ip()) {
            return HostAddr(SocketAddr::new(host_ip, virt.addr.port()));
        }
        HostAddr(virt.addr)
    }

    /// Re-resolving an already-resolved `HostAddr` must be a no-op — verified directly in the
    /// test below rather than enforced in the type, since `HostAddr` and `VirtAddr` are
    /// deliberately distinct types and nothing calls `resolve` twice on the same value in the
    /// real forwarding path.
    #[cfg(test)]
    fn resolve_virt_again(&self, host: HostAddr, proto: Proto) -> HostAddr {
        self.resolve(VirtAddr { addr: host.0, proto })
    }
}

/// Filters destinations the fabric should never dial on the guest's behalf: unspecified
/// addresses, multicast, link-local, and loopback unless it is one of the explicitly configured
/// host-forward targets the guest is allowed to reach by design.
pub fn should_proxy(addr: SocketAddr, loopback_allowlist: &[SocketAddr]) -> bool {
    let ip = addr.ip();
    if ip.is_unspecified() {
        return false;
    }
    if is_multicast(ip) {
        return false;
    }
    if is_link_local(ip) {
        return false;
    }
    if ip.is_loopback() {
        return loopback_allowlist.iter().any(|a| a.ip() == ip && a.port() == addr.port());
    }
    true
}

fn is_multicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn unregistered_virt_addr_resolves_to_itself() {
        let table = NatTable::new();
        let virt = VirtAddr { addr: "93.184.216.34:443".parse().unwrap(), proto: Proto::Tcp };
        assert_eq!(table.resolve(virt), HostAddr(virt.addr));
    }

    #[test]
    fn ip_substitution_preserves_port() {
        let table = NatTable::new();
        table.insert_ip_substitution(
            IpAddr::V4(Ipv4Addr::new(172, 30, 30, 254)),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let virt = VirtAddr { addr: "172.30.30.254:80".parse().unwrap(), proto: Proto::Tcp };
        assert_eq!(table.resolve(virt), HostAddr("127.0.0.1:80".parse().unwrap()));
    }

    #[test]
    fn registered_entry_overrides() {
        let table = NatTable::new();
        let virt = VirtAddr { addr: "172.30.30.200:53".parse().unwrap(), proto: Proto::Udp };
        let host = HostAddr("127.0.0.1:5353".parse().unwrap());
        table.insert(virt, host);
        assert_eq!(table.resolve(virt), host);
    }

    #[test]
    fn substitution_is_idempotent() {
        let table = NatTable::new();
        let virt = VirtAddr { addr: "172.30.30.200:53".parse().unwrap(), proto: Proto::Udp };
        let host = HostAddr("127.0.0.1:5353".parse().unwrap());
        table.insert(virt, host);
        let resolved = table.resolve(virt);
        let resolved_again = table.resolve_virt_again(resolved, Proto::Udp);
        assert_eq!(resolved, resolved_again);
    }

    #[test]
    fn rejects_unspecified_and_multicast() {
        assert!(!should_proxy("0.0.0.0:80".parse().unwrap(), &[]));
        assert!(!should_proxy("224.0.0.1:80".parse().unwrap(), &[]));
        assert!(!should_proxy("169.254.1.1:80".parse().unwrap(), &[]));
    }

    #[test]
    fn loopback_allowed_only_when_allowlisted() {
        let target: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2222);
        assert!(!should_proxy(target, &[]));
        assert!(should_proxy(target, &[target]));
    }

    #[test]
    fn ordinary_public_address_is_proxied() {
        assert!(should_proxy("93.184.216.34:443".parse().unwrap(), &[]));
    }
}
