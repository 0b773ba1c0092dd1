//! In-fabric services: DNS, NTP, host-control HTTP, and (optionally) SFTP, all bound
//! to the service-anycast address rather than the gateway address so the L3 gateway role stays
//! separate from anything the guest dials as an application service.

pub mod dns;
pub mod hostcontrol;
pub mod ntp;
#[cfg(feature = "sftp")]
pub mod sftp;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::FabricConfig;
use crate::registry::NameRegistry;
use crate::stack::NetStack;

/// Spawns every in-fabric service for the lifetime of the fabric. Each service owns its own
/// bind failure handling — one missing listener should not take the others down. All of them
/// bind through `stack` (the virtual smoltcp interface), not a real host socket: the service
/// address they listen on exists only inside the fabric.
pub fn spawn_all(cfg: Arc<FabricConfig>, registry: Arc<NameRegistry>, stack: Arc<NetStack>, control_token: String) {
    let dns_cfg = cfg.clone();
    let dns_registry = registry.clone();
    let dns_stack = stack.clone();
    tokio::spawn(async move {
        if let Err(e) = dns::run(dns_cfg, dns_registry, dns_stack).await {
            warn!(error = %e, "dns service exited");
        }
    });

    let ntp_cfg = cfg.clone();
    let ntp_stack = stack.clone();
    tokio::spawn(async move {
        if let Err(e) = ntp::run(ntp_cfg, ntp_stack).await {
            warn!(error = %e, "ntp service exited");
        }
    });

    let control_cfg = cfg.clone();
    let control_stack = stack.clone();
    tokio::spawn(async move {
        if let Err(e) = hostcontrol::run(control_cfg, control_stack, control_token).await {
            warn!(error = %e, "host-control service exited");
        }
    });

    #[cfg(feature = "sftp")]
    {
        let sftp_cfg = cfg.clone();
        let sftp_stack = stack.clone();
        if sftp_cfg.enable_sftp {
            tokio::spawn(async move {
                if let Err(e) = sftp::run(sftp_cfg, sftp_stack).await {
                    warn!(error = %e, "sftp service exited");
                }
            });
        } else {
            info!("sftp compiled in but disabled by configuration");
        }
    }
    #[cfg(not(feature = "sftp"))]
    if cfg.enable_sftp {
        warn!("sftp requested but this build was not compiled with the sftp feature");
    }
}
