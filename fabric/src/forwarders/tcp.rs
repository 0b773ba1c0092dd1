//! TCP forwarder (spec §4.C): one task per guest-originated flow the network stack announces,
//! dialing the NAT-resolved host address and pumping bytes until either side closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::classify_dial_error;
use crate::nat::{NatTable, Proto as NatProto, VirtAddr};
use crate::pump::{pump, AsyncIoDuplex};
use crate::stack::{NetStack, TcpForwarderRequest};

/// Connect timeout for guest→host TCP dials (§4.C step 3, §5).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives the TCP forwarder for the lifetime of the fabric: pulls every announced flow off
/// `stack` and spawns a dedicated task per flow (§4.C: "forwarding runs on its own task; a
/// slow or wedged peer on one flow never blocks another").
pub async fn run(stack: Arc<NetStack>, nat: Arc<NatTable>) {
    loop {
        let Some(req) = stack.next_tcp().await else {
            debug!("tcp forwarder request channel closed, stopping");
            return;
        };
        let nat = nat.clone();
        tokio::spawn(async move {
            handle(req, nat).await;
        });
    }
}

async fn handle(req: TcpForwarderRequest, nat: Arc<NatTable>) {
    let flow = req.flow;
    let virt = VirtAddr { addr: flow.remote, proto: NatProto::Tcp };
    let host = nat.resolve(virt);
    let via_nat = host.0 != virt.addr;

    if !via_nat && !crate::nat::should_proxy(host.0, &[]) {
        debug!(?flow, "tcp flow denied by policy");
        req.drop_silently();
        return;
    }

    let stream = match timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(host.0)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = classify_dial_error(host.0, e);
            debug!(?flow, %err, "tcp dial failed");
            if err.should_reset() {
                req.complete_with_reset();
            } else {
                req.drop_silently();
            }
            return;
        }
        Err(_) => {
            debug!(?flow, addr = %host.0, "tcp dial timed out");
            req.drop_silently();
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let mut guest = req.create_endpoint();
    let mut host_side = AsyncIoDuplex(stream);
    match pump(&mut guest, &mut host_side).await {
        Ok((up, down)) => debug!(?flow, bytes_up = up, bytes_down = down, "tcp flow closed"),
        Err(e) => warn!(?flow, error = %e, "tcp flow pump failed"),
    }
}
