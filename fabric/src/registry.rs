//! Container name registry (spec §4.H): a reversed-character trie mapping container-derived
//! names to IPs, so `resolve` can answer the longest *suffix* match of a query name — the
//! property that lets `foo.bar.docker.local` hit a registered `bar.docker.local` wildcard.
//!
//! Grounded on the NAT table's own "mutex/lock-guarded map behind a small typed API" shape
//! (`nat::NatTable`), generalized from a flat map to a trie since suffix matching, not exact
//! lookup, is the operation this component needs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// The two zones every derived container name is registered under (§4.H).
const SUFFIXES: [&str; 2] = [".docker.local", ".orb.local"];

/// mDNS service-discovery probes are never answered by this registry (§4.H invariant).
const RESERVED_SUFFIXES: [&str; 2] = ["._tcp.local.", "._udp.local."];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Any,
}

#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub rtype: RecordType,
    pub addr: IpAddr,
    pub ttl: u32,
}

/// TTL the spec attaches to every registry-sourced answer (§4.G step 1).
const REGISTRY_TTL: u32 = 60;

/// Input to `add`: enough of the container agent's RPC payload (§4.H, §8 scenario 3) to derive
/// every candidate name.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ips: Vec<IpAddr>,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    ips: Option<Vec<IpAddr>>,
}

impl TrieNode {
    fn insert(&mut self, reversed_name: &str, ips: Vec<IpAddr>) {
        let mut node = self;
        for c in reversed_name.chars() {
            node = node.children.entry(c).or_default();
        }
        node.ips = Some(ips);
    }

    fn remove(&mut self, reversed_name: &str) {
        let mut node = self;
        for c in reversed_name.chars() {
            match node.children.get_mut(&c) {
                Some(next) => node = next,
                None => return,
            }
        }
        node.ips = None;
    }
}

/// `mutex-wrapped trie` per the design note (§9): contended from every DNS request and every
/// `add_container`/`remove_container` agent call.
pub struct NameRegistry {
    root: Mutex<TrieNode>,
    /// Tracks which full names belong to which container so `remove` can undo exactly what
    /// `add` registered, without needing to recompute label-derived names later.
    owned_names: Mutex<HashMap<String, Vec<String>>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry { root: Mutex::new(TrieNode::default()), owned_names: Mutex::new(HashMap::new()) }
    }

    /// Registers every derived name for `container` (§4.H). Re-adding the same container id
    /// first removes its previous names so the registry reflects the latest call.
    pub fn add(&self, container: &Container) {
        self.remove(&container.id);

        let candidates = derive_candidate_names(container);
        let mut full_names = Vec::with_capacity(candidates.len() * SUFFIXES.len());
        let mut root = self.root.lock().unwrap();
        for candidate in &candidates {
            for suffix in SUFFIXES {
                let full = format!("{candidate}{suffix}");
                let reversed: String = full.chars().rev().collect();
                root.insert(&reversed, container.ips.clone());
                full_names.push(full);
            }
        }
        drop(root);
        self.owned_names.lock().unwrap().insert(container.id.clone(), full_names);
    }

    /// Un-registers every name previously derived for the container with this id. A no-op if
    /// the id was never added (or was already removed) — §8's round-trip law
    /// `add(c); remove(c)` leaves the registry unchanged relies on this being exact.
    pub fn remove(&self, container_id: &str) {
        let Some(names) = self.owned_names.lock().unwrap().remove(container_id) else { return };
        let mut root = self.root.lock().unwrap();
        for name in names {
            let reversed: String = name.chars().rev().collect();
            root.remove(&reversed);
        }
    }

    /// Longest-suffix lookup (§4.H). Returns an empty vec for reserved mDNS probe suffixes,
    /// non-IN-class callers (enforced by the DNS service before calling this), or no match.
    pub fn resolve(&self, name: &str, qtype: RecordType) -> Vec<ResourceRecord> {
        let lower = name.trim_end_matches('.').to_ascii_lowercase();
        let probe = format!("{lower}.");
        if RESERVED_SUFFIXES.iter().any(|s| probe.ends_with(s)) {
            return Vec::new();
        }

        let reversed_query: Vec<char> = lower.chars().rev().collect();
        let root = self.root.lock().unwrap();
        let mut node = &*root;
        let mut best: Option<(usize, &Vec<IpAddr>)> = None;

        for (depth, c) in reversed_query.iter().enumerate() {
            match node.children.get(c) {
                Some(next) => {
                    node = next;
                    if let Some(ips) = &node.ips {
                        // A match only counts if it lands on a label boundary in the
                        // original (non-reversed) name: either the whole name, or the byte
                        // just before the match is a '.'.
                        let matched_len = depth + 1;
                        let boundary_ok = matched_len == lower.len()
                            || lower.as_bytes()[lower.len() - matched_len - 1] == b'.';
                        if boundary_ok {
                            best = Some((matched_len, ips));
                        }
                    }
                }
                None => break,
            }
        }

        let Some((_, ips)) = best else { return Vec::new() };
        ips.iter()
            .filter_map(|ip| match (qtype, ip) {
                (RecordType::A, IpAddr::V4(_)) | (RecordType::Any, IpAddr::V4(_)) => {
                    Some(ResourceRecord { rtype: RecordType::A, addr: *ip, ttl: REGISTRY_TTL })
                }
                (RecordType::Aaaa, IpAddr::V6(_)) | (RecordType::Any, IpAddr::V6(_)) => {
                    Some(ResourceRecord { rtype: RecordType::Aaaa, addr: *ip, ttl: REGISTRY_TTL })
                }
                _ => None,
            })
            .collect()
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_candidate_names(container: &Container) -> Vec<String> {
    let mut names = Vec::new();

    if !container.id.is_empty() {
        names.push(container.id.clone());
        let short_len = container.id.len().min(12);
        names.push(container.id[..short_len].to_string());
    }

    for raw in &container.names {
        names.push(raw.trim_start_matches('/').to_string());
    }

    if let (Some(service), Some(project)) = (
        container.labels.get("com.docker.compose.service"),
        container.labels.get("com.docker.compose.project"),
    ) {
        names.push(format!("{service}.{project}"));
    }

    if let Some(domains) = container.labels.get("dev.orbstack.domains") {
        for domain in domains.split(',') {
            let domain = domain.trim();
            if !domain.is_empty() {
                names.push(domain.to_string());
            }
        }
    }

    names.retain(|n| !n.is_empty());
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn web_container() -> Container {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.project".to_string(), "blog".to_string());
        labels.insert("com.docker.compose.service".to_string(), "api".to_string());
        Container {
            id: "abc123def456789".to_string(),
            names: vec!["/web".to_string()],
            labels,
            ips: vec![IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2))],
        }
    }

    #[test]
    fn resolves_name_and_compose_alias() {
        let reg = NameRegistry::new();
        reg.add(&web_container());

        let a = reg.resolve("web.docker.local", RecordType::A);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].addr, IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)));
        assert_eq!(a[0].ttl, 60);

        let b = reg.resolve("api.blog.docker.local", RecordType::A);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].addr, IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)));
    }

    #[test]
    fn subdomain_wildcard_matches_registered_suffix_on_label_boundary() {
        let reg = NameRegistry::new();
        reg.add(&web_container());

        // "foo.web.docker.local" should match the registered "web.docker.local" suffix.
        let rr = reg.resolve("foo.web.docker.local", RecordType::A);
        assert_eq!(rr.len(), 1);

        // But "xweb.docker.local" must NOT match: "web.docker.local" is not a label-aligned
        // suffix of it ('x' is not a '.').
        let rr = reg.resolve("xweb.docker.local", RecordType::A);
        assert!(rr.is_empty());
    }

    #[test]
    fn add_then_remove_is_a_no_op() {
        let reg = NameRegistry::new();
        let c = web_container();
        reg.add(&c);
        assert!(!reg.resolve("web.docker.local", RecordType::A).is_empty());
        reg.remove(&c.id);
        assert!(reg.resolve("web.docker.local", RecordType::A).is_empty());
    }

    #[test]
    fn reserved_mdns_suffixes_are_never_answered() {
        let reg = NameRegistry::new();
        reg.add(&web_container());
        assert!(reg.resolve("_ssh._tcp.local", RecordType::A).is_empty());
        assert!(reg.resolve("_ssh._udp.local", RecordType::A).is_empty());
    }

    #[test]
    fn any_qtype_returns_both_families() {
        let reg = NameRegistry::new();
        let mut c = web_container();
        c.ips.push(IpAddr::V6("fd00::2".parse().unwrap()));
        reg.add(&c);
        let rr = reg.resolve("web.docker.local", RecordType::Any);
        assert_eq!(rr.len(), 2);
    }
}
