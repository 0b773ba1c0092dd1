use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the fabric.
///
/// Session-level variants (`DialRefused`..`PolicyDenied`) stay inside the task that produced
/// them and are logged, never propagated. `LinkIo` and `StackConfig` are fatal: the caller
/// should tear the whole fabric down.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("link I/O failed: {0}")]
    LinkIo(#[from] std::io::Error),

    #[error("invalid fabric configuration: {0}")]
    StackConfig(String),

    #[error("dial to {addr} refused")]
    DialRefused { addr: SocketAddr },

    #[error("dial to {addr} reset")]
    DialReset { addr: SocketAddr },

    #[error("dial to {addr} unreachable")]
    DialUnreachable { addr: SocketAddr },

    #[error("dial to {addr} timed out")]
    DialTimeout { addr: SocketAddr },

    #[error("dial to {addr} failed: {source}")]
    DialOther {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("name resolution failed: {0}")]
    NameResolution(String),

    #[error("tls handshake rejected: {0}")]
    TlsHandshake(String),

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = FabricError> = std::result::Result<T, E>;

/// Classifies a host-socket dial failure the way §4.C/§7 require: refused/reset map to a
/// guest-visible RST, everything else is a silent drop so the guest's own TCP retransmits or
/// backs off.
pub fn classify_dial_error(addr: SocketAddr, err: std::io::Error) -> FabricError {
    use std::io::ErrorKind::*;
    match err.kind() {
        ConnectionRefused => FabricError::DialRefused { addr },
        ConnectionReset => FabricError::DialReset { addr },
        TimedOut => FabricError::DialTimeout { addr },
        HostUnreachable | NetworkUnreachable => FabricError::DialUnreachable { addr },
        _ => {
            if let Some(code) = err.raw_os_error() {
                match code {
                    libc::EHOSTDOWN => return FabricError::DialUnreachable { addr },
                    libc::ETIMEDOUT => return FabricError::DialTimeout { addr },
                    _ => {}
                }
            }
            FabricError::DialOther { addr, source: err }
        }
    }
}

impl FabricError {
    /// True for the dial-error family that should complete the guest's SYN with an RST rather
    /// than dropping it silently (§4.C step 4).
    pub fn should_reset(&self) -> bool {
        matches!(self, FabricError::DialRefused { .. } | FabricError::DialReset { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn connection_refused_resets_and_reset_resets() {
        let refused = classify_dial_error(addr(), std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(refused, FabricError::DialRefused { .. }));
        assert!(refused.should_reset());

        let reset = classify_dial_error(addr(), std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(reset, FabricError::DialReset { .. }));
        assert!(reset.should_reset());
    }

    #[test]
    fn unreachable_and_timeout_drop_silently() {
        let unreachable =
            classify_dial_error(addr(), std::io::Error::from(std::io::ErrorKind::HostUnreachable));
        assert!(matches!(unreachable, FabricError::DialUnreachable { .. }));
        assert!(!unreachable.should_reset());

        let timeout = classify_dial_error(addr(), std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(matches!(timeout, FabricError::DialTimeout { .. }));
        assert!(!timeout.should_reset());
    }

    #[test]
    fn unmatched_errors_fall_back_to_dial_other() {
        let other = classify_dial_error(
            addr(),
            std::io::Error::new(std::io::ErrorKind::Other, "weird failure"),
        );
        assert!(matches!(other, FabricError::DialOther { .. }));
        assert!(!other.should_reset());
    }
}
