//! Per-SNI certificate minting for the TLS MITM proxy (spec §4.I): a single process-local root
//! CA signs a fresh ECDSA P-256 leaf for every distinct SNI hostname the proxy sees, cached so a
//! repeat connection to the same `*.local` name doesn't re-mint.
//!
//! Grounded on `rcgen`/`rustls`, already in this workspace's dependency tree for the agent-facing
//! TLS surface `ross-shim` terminates elsewhere; this module is the server-facing mirror of that.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ClientHello;

use crate::error::FabricError;

/// Bounds how many distinct `*.local` hostnames stay minted at once (§10.5-adjacent sizing
/// note: one cert per developer-facing container name, not per connection).
const CERT_CACHE_SIZE: usize = 250;

/// The process-local signing authority: one CA keypair and self-signed certificate, generated
/// once at fabric startup and held for the process lifetime.
pub struct RootCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl RootCa {
    /// Generates a fresh root CA (§4.I: "certificate minted from a local root"). This is
    /// per-process, not persisted — a restart mints a new CA and the host must re-trust it
    /// (see `trust_store::import`).
    pub fn generate() -> Result<Self, FabricError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "OrbStack Fabric Local CA");
        dn.push(DnType::OrganizationName, "OrbStack Fabric");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key)?;
        Ok(RootCa { cert, key })
    }

    /// PEM encoding of the CA certificate, for `trust_store::import` to hand to the OS.
    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    fn mint_leaf(&self, hostname: &str) -> Result<Arc<CertifiedKey>, FabricError> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        let leaf_cert = params.signed_by(&leaf_key, &self.cert, &self.key)?;

        let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let signing_key = rustls::crypto::ring::sign::any_ecdsa_type(&key_der.into())
            .map_err(|_| FabricError::TlsHandshake(format!("unsupported leaf key for {hostname}")))?;
        let chain: Vec<CertificateDer<'static>> = vec![leaf_cert.der().clone()];
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

/// A `rustls::server::ResolvesServerCert` backed by `RootCa`, keyed by SNI hostname (§4.I:
/// "per-SNI certificate"). Minting happens synchronously inside `resolve`, which rustls calls
/// from the handshake path; an LRU keeps repeat hostnames from re-minting on every connection.
pub struct SniCertResolver {
    ca: RootCa,
    cache: Mutex<LruCache<String, Arc<CertifiedKey>>>,
}

impl SniCertResolver {
    pub fn new(ca: RootCa) -> Self {
        SniCertResolver {
            ca,
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CERT_CACHE_SIZE).unwrap())),
        }
    }

    pub fn ca_cert_pem(&self) -> String {
        self.ca.cert_pem()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello.server_name()?;
        if !hostname.ends_with(".local") {
            // §4.I invariant: only `.local` SNIs are ever served a certificate; everything else
            // gets a null certificate, which rustls turns into a fatal handshake alert.
            return None;
        }
        if let Some(hit) = self.cache.lock().unwrap().get(hostname) {
            return Some(hit.clone());
        }
        let certified = self.ca.mint_leaf(hostname).ok()?;
        self.cache.lock().unwrap().put(hostname.to_string(), certified.clone());
        Some(certified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_caches_a_leaf_for_each_hostname() {
        let ca = RootCa::generate().unwrap();
        let resolver = SniCertResolver::new(ca);
        let first = resolver.ca.mint_leaf("app.test.local").unwrap();
        let second = resolver.ca.mint_leaf("app.test.local").unwrap();
        // mint_leaf itself always mints fresh; caching happens one layer up in `resolve`, so
        // the two certified keys are independent but both valid for the same name.
        assert_ne!(Arc::as_ptr(&first), Arc::as_ptr(&second));
    }

    #[test]
    fn root_ca_pem_is_nonempty() {
        let ca = RootCa::generate().unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }
}
