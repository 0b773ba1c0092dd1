//! Network stack: a thin adapter around `smoltcp`, the third-party L3/L4 engine this fabric is
//! built on, exposing an accept/refuse `ForwarderRequest` contract (complete with RST, complete
//! with drop, or `create_endpoint`).
//!
//! smoltcp is sans-io and single-threaded by design, so the interface, its `SocketSet`, and the
//! link device all live on one thread (`run_loop`), owning the whole NAT table's worth of live
//! flows without any internal locking. Async
//! forwarder tasks on the tokio runtime talk to that thread over plain channels; sending into
//! and `try_recv`-ing from a `tokio::sync::mpsc` channel needs no runtime context, so the
//! bridge works even though the poll thread is not itself async.
//!
//! New guest-originated flows are recognized by pre-scanning each frame *before* it is queued
//! for smoltcp: a bare SYN to a `(local, remote)` pair we have not seen registers a fresh
//! listening socket in the `SocketSet` first, so that when the same frame is then handed to
//! `Interface::poll` smoltcp completes the handshake against it. ICMP echo (component E) does
//! not need a smoltcp socket at all and is handled entirely at the frame layer — see `icmp`.

mod device;
mod icmp;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, HardwareAddress, IpAddress, IpCidr, IpListenEndpoint,
    IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::link::LinkEndpoint;
use crate::nat::Proto;

use device::LinkDevice;
pub use icmp::{IcmpEchoReply, IcmpEchoRequest};

/// Socket buffer sizes for virtual TCP endpoints; matches the 512 KiB pump scratch size
/// used on the host side of the same flow.
const TCP_BUF: usize = 512 * 1024;
const UDP_BUF_PACKETS: usize = 64;
const UDP_BUF_BYTES: usize = 64 * 1024;

/// Identifies one flow by its guest-visible 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub proto: Proto,
}

enum StackCommand {
    AbortTcp(SocketHandle),
    CloseTcp(SocketHandle),
    CloseUdp(SocketHandle),
    /// Host→guest forwarder request: open an active flow from inside the stack with a
    /// possibly-spoofed `local` address. Spoofing is a property of this virtual-stack call, not
    /// of any host socket — `iface.set_any_ip(true)` is what lets a `local` address the NIC
    /// does not own still source a connection.
    ConnectTcp { local: SocketAddr, remote: SocketAddr, reply: oneshot::Sender<Result<VirtTcp, FabricError>> },
    ConnectUdp { local: SocketAddr, remote: SocketAddr, reply: oneshot::Sender<Result<VirtUdp, FabricError>> },
    /// Registers a permanent in-fabric service: any guest-originated TCP connection to
    /// `addr` is handed to `tx` directly instead of going through the generic forwarder channel.
    BindTcpService { addr: SocketAddr, tx: mpsc::UnboundedSender<VirtTcp>, reply: oneshot::Sender<Result<(), FabricError>> },
    /// Registers a permanent in-fabric UDP service: one shared smoltcp socket serves
    /// every guest sender addressing `addr`, demultiplexed by the returned listener itself.
    BindUdpService { addr: SocketAddr, reply: oneshot::Sender<Result<VirtUdpListener, FabricError>> },
}

/// A completed (from smoltcp's point of view) guest-originated TCP flow, modeled on the
/// accept-or-refuse contract of a gVisor-style `tcpip.ForwarderRequest`: the caller must call
/// exactly one of `create_endpoint`, `complete_with_reset`, or `drop_silently`.
pub struct TcpForwarderRequest {
    pub flow: FlowId,
    handle: SocketHandle,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
    endpoint: Option<VirtTcp>,
}

impl TcpForwarderRequest {
    /// Accepts the flow: returns the full-duplex virtual endpoint to pump against a host dial.
    pub fn create_endpoint(mut self) -> VirtTcp {
        self.endpoint.take().expect("endpoint taken twice")
    }

    /// Rejects the flow with an immediate RST (refused/reset dial outcomes).
    pub fn complete_with_reset(self) {
        let _ = self.cmd_tx.send(StackCommand::AbortTcp(self.handle));
    }

    /// Rejects the flow without a response (unreachable/timeout/other dial outcomes):
    /// since smoltcp already completed the three-way handshake by the time we learn the dial
    /// outcome, "silent" here means a clean FIN rather than the SYN going unanswered — see
    /// the open-question note in DESIGN.md.
    pub fn drop_silently(self) {
        let _ = self.cmd_tx.send(StackCommand::CloseTcp(self.handle));
    }
}

/// A guest-originated UDP flow, one smoltcp socket per unique (local, remote) pair.
pub struct UdpForwarderRequest {
    pub flow: FlowId,
    handle: SocketHandle,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
    endpoint: Option<VirtUdp>,
}

impl UdpForwarderRequest {
    pub fn create_endpoint(mut self) -> VirtUdp {
        self.endpoint.take().expect("endpoint taken twice")
    }

    pub fn drop_silently(self) {
        let _ = self.cmd_tx.send(StackCommand::CloseUdp(self.handle));
    }
}

/// The bridge end of a virtual TCP endpoint: bytes in one direction per channel, since the
/// smoltcp socket itself cannot cross threads.
pub struct VirtTcp {
    pub flow: FlowId,
    handle: SocketHandle,
    from_guest: mpsc::UnboundedReceiver<Vec<u8>>,
    to_guest: mpsc::UnboundedSender<Vec<u8>>,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
    leftover: std::collections::VecDeque<u8>,
}

impl VirtTcp {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.leftover.is_empty() {
            match self.from_guest.recv().await {
                Some(chunk) => self.leftover.extend(chunk),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        for (i, b) in self.leftover.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        self.to_guest
            .send(data.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack gone"))
    }

    /// Half-closes the guest-facing write side (FIN); the `FullDuplex::close_write` leg.
    pub fn close_write(&self) {
        let _ = self.cmd_tx.send(StackCommand::CloseTcp(self.handle));
    }

    pub fn abort(&self) {
        let _ = self.cmd_tx.send(StackCommand::AbortTcp(self.handle));
    }
}

#[async_trait::async_trait]
impl crate::pump::FullDuplex for VirtTcp {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        VirtTcp::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write(buf)
    }

    async fn close_write(&mut self) -> std::io::Result<()> {
        self.close_write();
        Ok(())
    }
}

pub struct VirtUdp {
    pub flow: FlowId,
    handle: SocketHandle,
    from_guest: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    to_guest: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
}

impl VirtUdp {
    pub async fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.from_guest.recv().await
    }

    pub fn send(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.to_guest
            .send((data.to_vec(), to))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack gone"))
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(StackCommand::CloseUdp(self.handle));
    }
}

/// The service-facing end of a persistent in-fabric UDP listener: every guest sender
/// hitting the bound address arrives here as `(data, from)`; replies go back out to the same
/// `from` address over the one shared socket.
pub struct VirtUdpListener {
    from_guest: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    to_guest: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl VirtUdpListener {
    pub async fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.from_guest.recv().await
    }

    pub fn send(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.to_guest
            .send((data.to_vec(), to))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack gone"))
    }
}

/// Owns the smoltcp interface, socket set, and link device on one dedicated thread and
/// fans new flows out to async tasks over channels. Threading a handle through constructors
/// (rather than a process-global stack) lets tests spin up several independent stacks.
pub struct NetStack {
    tcp_rx: Mutex<mpsc::UnboundedReceiver<TcpForwarderRequest>>,
    udp_rx: Mutex<mpsc::UnboundedReceiver<UdpForwarderRequest>>,
    icmp_rx: Mutex<mpsc::UnboundedReceiver<IcmpEchoRequest>>,
    icmp_reply_tx: mpsc::UnboundedSender<IcmpEchoReply>,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
    _worker: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn spawn(link: LinkEndpoint, cfg: FabricConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let (icmp_tx, icmp_rx) = mpsc::unbounded_channel();
        let (icmp_reply_tx, icmp_reply_rx) = mpsc::unbounded_channel();

        let loop_cmd_tx = cmd_tx.clone();
        let worker = thread::Builder::new()
            .name("fabric-netstack".into())
            .spawn(move || {
                run_loop(link, cfg, loop_cmd_tx, cmd_rx, tcp_tx, udp_tx, icmp_tx, icmp_reply_rx)
            })
            .expect("spawn netstack thread");

        NetStack {
            tcp_rx: Mutex::new(tcp_rx),
            udp_rx: Mutex::new(udp_rx),
            icmp_rx: Mutex::new(icmp_rx),
            icmp_reply_tx,
            cmd_tx,
            _worker: worker,
        }
    }

    pub async fn next_tcp(&self) -> Option<TcpForwarderRequest> {
        // One consumer task per fabric instance in practice; holding the lock across the
        // await point is harmless since nothing else contends for it.
        self.tcp_rx.lock().unwrap().recv().await
    }

    pub async fn next_udp(&self) -> Option<UdpForwarderRequest> {
        self.udp_rx.lock().unwrap().recv().await
    }

    pub async fn next_icmp(&self) -> Option<IcmpEchoRequest> {
        self.icmp_rx.lock().unwrap().recv().await
    }

    pub fn reply_icmp(&self, reply: IcmpEchoReply) {
        let _ = self.icmp_reply_tx.send(reply);
    }

    /// Opens an active TCP flow from inside the stack: `local` is the (possibly spoofed)
    /// source the guest will see, `remote` is the guest destination.
    pub async fn connect_tcp(&self, local: SocketAddr, remote: SocketAddr) -> Result<VirtTcp, FabricError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::ConnectTcp { local, remote, reply })
            .map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?;
        rx.await.map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?
    }

    pub async fn connect_udp(&self, local: SocketAddr, remote: SocketAddr) -> Result<VirtUdp, FabricError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::ConnectUdp { local, remote, reply })
            .map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?;
        rx.await.map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?
    }

    /// Registers an in-fabric TCP service at `addr`: returns the stream of accepted
    /// connections, each already past the smoltcp handshake.
    pub async fn bind_tcp_service(&self, addr: SocketAddr) -> Result<mpsc::UnboundedReceiver<VirtTcp>, FabricError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::BindTcpService { addr, tx, reply })
            .map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?;
        reply_rx.await.map_err(|_| FabricError::StackConfig("netstack worker gone".into()))??;
        Ok(rx)
    }

    /// Registers an in-fabric UDP service at `addr`.
    pub async fn bind_udp_service(&self, addr: SocketAddr) -> Result<VirtUdpListener, FabricError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::BindUdpService { addr, reply })
            .map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?;
        rx.await.map_err(|_| FabricError::StackConfig("netstack worker gone".into()))?
    }
}

struct TcpFlowState {
    handle: SocketHandle,
    announced: bool,
    to_guest_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    from_guest_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Set when this flow's destination matches a registered in-fabric TCP service: the
    /// established endpoint is delivered here instead of the generic forwarder channel.
    service: Option<mpsc::UnboundedSender<VirtTcp>>,
}

struct UdpFlowState {
    handle: SocketHandle,
    announced: bool,
    to_guest_rx: Option<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    from_guest_tx: Option<mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>>,
}

/// One smoltcp UDP socket serves every guest sender addressing the same local (destination)
/// endpoint — a service listener, bound once at startup rather than per-flow.
struct UdpListenerState {
    handle: SocketHandle,
    to_service: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    from_service: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    link: LinkEndpoint,
    cfg: FabricConfig,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<StackCommand>,
    tcp_tx: mpsc::UnboundedSender<TcpForwarderRequest>,
    udp_tx: mpsc::UnboundedSender<UdpForwarderRequest>,
    icmp_tx: mpsc::UnboundedSender<IcmpEchoRequest>,
    mut icmp_reply_rx: mpsc::UnboundedReceiver<IcmpEchoReply>,
) {
    let mut device = LinkDevice::new(link);

    let mut config = Config::new(HardwareAddress::Ethernet(cfg.gateway_mac));
    config.random_seed = rand::random();
    let mut iface = Interface::new(config, &mut device, SmolInstant::now());
    iface.set_any_ip(true);
    iface.update_ip_addrs(|addrs| {
        let _ =
            addrs.push(IpCidr::new(IpAddress::Ipv4(cfg.gateway_v4), cfg.ipv4_subnet.prefix_len()));
        let _ =
            addrs.push(IpCidr::new(IpAddress::Ipv6(cfg.gateway_v6), cfg.ipv6_subnet.prefix_len()));
    });

    let mut sockets = SocketSet::new(Vec::new());
    let mut tcp_flows: HashMap<FlowId, TcpFlowState> = HashMap::new();
    let mut udp_flows: HashMap<FlowId, UdpFlowState> = HashMap::new();
    let mut udp_listeners: HashMap<SocketAddr, UdpListenerState> = HashMap::new();
    let mut service_tcp: HashMap<SocketAddr, mpsc::UnboundedSender<VirtTcp>> = HashMap::new();
    let mut idle_iterations: u32 = 0;

    loop {
        let mut did_work = false;

        // Drain commands from forwarder tasks (closes/aborts) before polling so a close
        // requested this tick takes effect in the same pass.
        while let Ok(cmd) = cmd_rx.try_recv() {
            did_work = true;
            match cmd {
                StackCommand::AbortTcp(h) => {
                    if socket_exists(&sockets, h) {
                        sockets.get_mut::<tcp::Socket>(h).abort();
                    }
                }
                StackCommand::CloseTcp(h) => {
                    if socket_exists(&sockets, h) {
                        sockets.get_mut::<tcp::Socket>(h).close();
                    }
                }
                StackCommand::CloseUdp(h) => {
                    if socket_exists(&sockets, h) {
                        sockets.remove(h);
                    }
                }
                StackCommand::ConnectTcp { local, remote, reply } => {
                    let result = connect_tcp_outbound(&mut iface, &mut sockets, &cmd_tx, local, remote);
                    if let Ok((flow, handle)) = &result {
                        tcp_flows.insert(
                            *flow,
                            TcpFlowState { handle: *handle, announced: false, to_guest_rx: None, from_guest_tx: None, service: None },
                        );
                    }
                    let _ = reply.send(result.map(|(flow, handle)| {
                        let (from_guest_tx, from_guest_rx) = mpsc::unbounded_channel();
                        let (to_guest_tx, to_guest_rx) = mpsc::unbounded_channel();
                        if let Some(state) = tcp_flows.get_mut(&flow) {
                            state.announced = true;
                            state.from_guest_tx = Some(from_guest_tx);
                            state.to_guest_rx = Some(to_guest_rx);
                        }
                        VirtTcp {
                            flow,
                            handle,
                            from_guest: from_guest_rx,
                            to_guest: to_guest_tx,
                            cmd_tx: cmd_tx.clone(),
                            leftover: std::collections::VecDeque::new(),
                        }
                    }));
                }
                StackCommand::ConnectUdp { local, remote, reply } => {
                    let result = connect_udp_outbound(&mut sockets, local, remote);
                    let _ = reply.send(result.map(|handle| {
                        let flow =
                            FlowId { local: remote, remote: local, proto: Proto::Udp };
                        let (from_guest_tx, from_guest_rx) = mpsc::unbounded_channel();
                        let (to_guest_tx, to_guest_rx) = mpsc::unbounded_channel();
                        udp_flows.insert(
                            flow,
                            UdpFlowState {
                                handle,
                                announced: true,
                                to_guest_rx: Some(to_guest_rx),
                                from_guest_tx: Some(from_guest_tx),
                            },
                        );
                        VirtUdp { flow, handle, from_guest: from_guest_rx, to_guest: to_guest_tx, cmd_tx: cmd_tx.clone() }
                    }));
                }
                StackCommand::BindTcpService { addr, tx, reply } => {
                    // No persistent smoltcp socket is created here: a fresh per-client
                    // listening socket is created lazily by `pre_scan_transport` for every
                    // new SYN, exactly like a generic forwarder flow (see its `service_tcp`
                    // lookup below). Registering the address here only decides which channel
                    // an established flow to this destination is announced on.
                    service_tcp.insert(addr, tx);
                    let _ = reply.send(Ok(()));
                }
                StackCommand::BindUdpService { addr, reply } => {
                    let result = bind_udp_service(&mut sockets, addr);
                    let _ = reply.send(result.map(|handle| {
                        let (to_service, from_guest) = mpsc::unbounded_channel();
                        let (to_guest, from_service) = mpsc::unbounded_channel();
                        udp_listeners.insert(addr, UdpListenerState { handle, to_service, from_service });
                        VirtUdpListener { from_guest, to_guest }
                    }));
                }
            }
        }
        while let Ok(reply) = icmp_reply_rx.try_recv() {
            did_work = true;
            icmp::send_reply(&mut device, &cfg, &reply);
        }

        match device.link.read_one() {
            Ok(Some(frame)) => {
                did_work = true;
                if let Some(echo) = icmp::try_parse_echo_request(&frame) {
                    let _ = icmp_tx.send(echo);
                } else {
                    pre_scan(&frame, &mut sockets, &mut tcp_flows, &mut udp_flows, &service_tcp, &udp_listeners);
                    device.push_ingress(frame);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "link read failed, tearing down stack");
                return;
            }
        }

        let now = SmolInstant::now();
        let _ = iface.poll(now, &mut device, &mut sockets);
        if let Err(e) = device.flush_egress() {
            tracing::error!(error = %e, "link write failed, tearing down stack");
            return;
        }

        did_work |= announce_and_pump_tcp(&mut sockets, &mut tcp_flows, &cmd_tx, &tcp_tx);
        did_work |= announce_and_pump_udp(&mut sockets, &mut udp_flows, &cmd_tx, &udp_tx);
        did_work |= pump_udp_listeners(&mut sockets, &mut udp_listeners);

        tcp_flows.retain(|_, state| socket_exists(&sockets, state.handle));
        udp_flows.retain(|_, state| socket_exists(&sockets, state.handle));

        if did_work {
            idle_iterations = 0;
        } else {
            idle_iterations = idle_iterations.saturating_add(1);
            if idle_iterations > 10_000 {
                thread::sleep(Duration::from_micros(200));
            }
        }
    }
}

fn socket_exists(sockets: &SocketSet<'static>, handle: SocketHandle) -> bool {
    sockets.iter().any(|(h, _)| h == handle)
}

/// Opens a smoltcp TCP socket actively connecting *into* the guest: `local` is
/// the source address the guest will see (possibly spoofed), `remote` is the guest's listening
/// address. Returns the `FlowId` keyed the same way guest-originated flows are (`local` = the
/// guest's own address) so both flow tables share one convention.
fn connect_tcp_outbound(
    iface: &mut Interface,
    sockets: &mut SocketSet<'static>,
    _cmd_tx: &mpsc::UnboundedSender<StackCommand>,
    local: SocketAddr,
    remote: SocketAddr,
) -> Result<(FlowId, SocketHandle), FabricError> {
    let rx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUF]);
    let tx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUF]);
    let mut socket = tcp::Socket::new(rx_buf, tx_buf);
    let remote_endpoint = IpListenEndpoint { addr: Some(ip_address_of(remote)), port: remote.port() };
    let local_endpoint = IpListenEndpoint { addr: Some(ip_address_of(local)), port: local.port() };
    socket
        .connect(iface.context(), to_ip_endpoint(remote_endpoint), local_endpoint)
        .map_err(|e| FabricError::StackConfig(format!("outbound tcp connect failed: {e:?}")))?;
    let handle = sockets.add(socket);
    let flow = FlowId { local: remote, remote: local, proto: Proto::Tcp };
    Ok((flow, handle))
}

fn connect_udp_outbound(
    sockets: &mut SocketSet<'static>,
    local: SocketAddr,
    _remote: SocketAddr,
) -> Result<SocketHandle, FabricError> {
    let rx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
    let tx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
    let rx_buf = udp::PacketBuffer::new(rx_meta, vec![0u8; UDP_BUF_BYTES]);
    let tx_buf = udp::PacketBuffer::new(tx_meta, vec![0u8; UDP_BUF_BYTES]);
    let mut socket = udp::Socket::new(rx_buf, tx_buf);
    let endpoint = IpListenEndpoint { addr: Some(ip_address_of(local)), port: local.port() };
    socket
        .bind(endpoint)
        .map_err(|e| FabricError::StackConfig(format!("outbound udp bind failed: {e:?}")))?;
    Ok(sockets.add(socket))
}

fn to_ip_endpoint(ep: IpListenEndpoint) -> smoltcp::wire::IpEndpoint {
    smoltcp::wire::IpEndpoint::new(ep.addr.expect("remote endpoint always has an address"), ep.port)
}

/// Binds the one shared smoltcp socket backing a persistent UDP service listener.
fn bind_udp_service(sockets: &mut SocketSet<'static>, addr: SocketAddr) -> Result<SocketHandle, FabricError> {
    let rx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
    let tx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
    let rx_buf = udp::PacketBuffer::new(rx_meta, vec![0u8; UDP_BUF_BYTES]);
    let tx_buf = udp::PacketBuffer::new(tx_meta, vec![0u8; UDP_BUF_BYTES]);
    let mut socket = udp::Socket::new(rx_buf, tx_buf);
    let endpoint = IpListenEndpoint { addr: Some(ip_address_of(addr)), port: addr.port() };
    socket
        .bind(endpoint)
        .map_err(|e| FabricError::StackConfig(format!("service udp bind failed: {e:?}")))?;
    Ok(sockets.add(socket))
}

/// Pumps every bound service listener's shared socket against its `to_service`/`from_service`
/// channels — the counterpart to `announce_and_pump_udp` for per-flow sockets, except
/// here there is exactly one socket for the whole service's lifetime, demultiplexed by the
/// `from`/`to` address carried alongside each datagram.
fn pump_udp_listeners(sockets: &mut SocketSet<'static>, listeners: &mut HashMap<SocketAddr, UdpListenerState>) -> bool {
    let mut did_work = false;
    for state in listeners.values_mut() {
        let socket = sockets.get_mut::<udp::Socket>(state.handle);
        while socket.can_recv() {
            match socket.recv() {
                Ok((data, meta)) => {
                    did_work = true;
                    let from = to_socket_addr(meta.endpoint.addr, meta.endpoint.port);
                    let _ = state.to_service.send((data.to_vec(), from));
                }
                Err(_) => break,
            }
        }
        while socket.can_send() {
            match state.from_service.try_recv() {
                Ok((chunk, to)) => {
                    let endpoint = smoltcp::wire::IpEndpoint::new(ip_address_of(to), to.port());
                    let _ = socket.send_slice(&chunk, endpoint);
                    did_work = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
    }
    did_work
}

#[allow(clippy::too_many_arguments)]
fn pre_scan(
    frame: &[u8],
    sockets: &mut SocketSet<'static>,
    tcp_flows: &mut HashMap<FlowId, TcpFlowState>,
    udp_flows: &mut HashMap<FlowId, UdpFlowState>,
    service_tcp: &HashMap<SocketAddr, mpsc::UnboundedSender<VirtTcp>>,
    udp_listeners: &HashMap<SocketAddr, UdpListenerState>,
) {
    let Ok(eth) = EthernetFrame::new_checked(frame) else { return };
    match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else { return };
            pre_scan_transport(
                IpAddress::Ipv4(ip.src_addr()),
                IpAddress::Ipv4(ip.dst_addr()),
                ip.next_header(),
                ip.payload(),
                sockets,
                tcp_flows,
                udp_flows,
                service_tcp,
                udp_listeners,
            );
        }
        EthernetProtocol::Ipv6 => {
            let Ok(ip) = Ipv6Packet::new_checked(eth.payload()) else { return };
            pre_scan_transport(
                IpAddress::Ipv6(ip.src_addr()),
                IpAddress::Ipv6(ip.dst_addr()),
                ip.next_header(),
                ip.payload(),
                sockets,
                tcp_flows,
                udp_flows,
                service_tcp,
                udp_listeners,
            );
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn pre_scan_transport(
    src_ip: IpAddress,
    dst_ip: IpAddress,
    proto: IpProtocol,
    payload: &[u8],
    sockets: &mut SocketSet<'static>,
    tcp_flows: &mut HashMap<FlowId, TcpFlowState>,
    udp_flows: &mut HashMap<FlowId, UdpFlowState>,
    service_tcp: &HashMap<SocketAddr, mpsc::UnboundedSender<VirtTcp>>,
    udp_listeners: &HashMap<SocketAddr, UdpListenerState>,
) {
    match proto {
        IpProtocol::Tcp => {
            let Ok(tcp) = TcpPacket::new_checked(payload) else { return };
            if !(tcp.syn() && !tcp.ack()) {
                return;
            }
            let local = to_socket_addr(src_ip, tcp.src_port());
            let dst = to_socket_addr(dst_ip, tcp.dst_port());
            let flow = FlowId { local, remote: dst, proto: Proto::Tcp };
            if tcp_flows.contains_key(&flow) {
                return;
            }
            let rx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUF]);
            let tx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUF]);
            let mut socket = tcp::Socket::new(rx_buf, tx_buf);
            let listen_endpoint = IpListenEndpoint { addr: Some(dst_ip), port: tcp.dst_port() };
            if socket.listen(listen_endpoint).is_err() {
                return;
            }
            let handle = sockets.add(socket);
            // A SYN to an address registered via `BindTcpService` is tagged here so the
            // established connection routes straight to that service instead of being
            // announced on the generic forwarder channel.
            let service = service_tcp.get(&dst).cloned();
            tcp_flows.insert(
                flow,
                TcpFlowState { handle, announced: false, to_guest_rx: None, from_guest_tx: None, service },
            );
        }
        IpProtocol::Udp => {
            let Ok(udp) = UdpPacket::new_checked(payload) else { return };
            let dst = to_socket_addr(dst_ip, udp.dst_port());
            // A destination already served by a persistent service listener owns its
            // own shared socket; creating a competing per-flow socket here would steal its
            // traffic, so such flows are left entirely to `pump_udp_listeners`.
            if udp_listeners.contains_key(&dst) {
                return;
            }
            let flow = FlowId {
                local: to_socket_addr(src_ip, udp.src_port()),
                remote: dst,
                proto: Proto::Udp,
            };
            if udp_flows.contains_key(&flow) {
                return;
            }
            let rx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
            let tx_meta = vec![udp::PacketMetadata::EMPTY; UDP_BUF_PACKETS];
            let rx_buf = udp::PacketBuffer::new(rx_meta, vec![0u8; UDP_BUF_BYTES]);
            let tx_buf = udp::PacketBuffer::new(tx_meta, vec![0u8; UDP_BUF_BYTES]);
            let mut socket = udp::Socket::new(rx_buf, tx_buf);
            let endpoint = IpListenEndpoint { addr: Some(dst_ip), port: udp.dst_port() };
            if socket.bind(endpoint).is_err() {
                return;
            }
            let handle = sockets.add(socket);
            udp_flows.insert(
                flow,
                UdpFlowState { handle, announced: false, to_guest_rx: None, from_guest_tx: None },
            );
        }
        _ => {}
    }
}

fn to_socket_addr(ip: IpAddress, port: u16) -> SocketAddr {
    match ip {
        IpAddress::Ipv4(v4) => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(v4)), port),
        IpAddress::Ipv6(v6) => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(v6)), port),
    }
}

fn announce_and_pump_tcp(
    sockets: &mut SocketSet<'static>,
    flows: &mut HashMap<FlowId, TcpFlowState>,
    cmd_tx: &mpsc::UnboundedSender<StackCommand>,
    tcp_tx: &mpsc::UnboundedSender<TcpForwarderRequest>,
) -> bool {
    let mut did_work = false;
    for (&flow, state) in flows.iter_mut() {
        let socket = sockets.get_mut::<tcp::Socket>(state.handle);

        if !state.announced {
            if socket.state() == tcp::State::Established {
                state.announced = true;
                did_work = true;
                let (from_guest_tx, from_guest_rx) = mpsc::unbounded_channel();
                let (to_guest_tx, to_guest_rx) = mpsc::unbounded_channel();
                state.from_guest_tx = Some(from_guest_tx);
                state.to_guest_rx = Some(to_guest_rx);
                let endpoint = VirtTcp {
                    flow,
                    handle: state.handle,
                    from_guest: from_guest_rx,
                    to_guest: to_guest_tx,
                    cmd_tx: cmd_tx.clone(),
                    leftover: std::collections::VecDeque::new(),
                };
                // A service-tagged flow bypasses the generic forwarder entirely:
                // its endpoint goes straight to the service that bound this address.
                if let Some(service) = &state.service {
                    let _ = service.send(endpoint);
                } else {
                    let req = TcpForwarderRequest {
                        flow,
                        handle: state.handle,
                        cmd_tx: cmd_tx.clone(),
                        endpoint: Some(endpoint),
                    };
                    let _ = tcp_tx.send(req);
                }
            }
            continue;
        }

        if socket.can_recv() {
            let from_guest_tx = state.from_guest_tx.clone();
            let _ = socket.recv(|data| {
                if !data.is_empty() {
                    if let Some(tx) = &from_guest_tx {
                        let _ = tx.send(data.to_vec());
                    }
                }
                (data.len(), ())
            });
            did_work = true;
        }
        if let Some(rx) = &mut state.to_guest_rx {
            while socket.can_send() {
                match rx.try_recv() {
                    Ok(chunk) => {
                        let _ = socket.send_slice(&chunk);
                        did_work = true;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        socket.close();
                        break;
                    }
                }
            }
        }
    }
    did_work
}

fn announce_and_pump_udp(
    sockets: &mut SocketSet<'static>,
    flows: &mut HashMap<FlowId, UdpFlowState>,
    cmd_tx: &mpsc::UnboundedSender<StackCommand>,
    udp_tx: &mpsc::UnboundedSender<UdpForwarderRequest>,
) -> bool {
    let mut did_work = false;
    for (&flow, state) in flows.iter_mut() {
        let socket = sockets.get_mut::<udp::Socket>(state.handle);

        if !state.announced {
            state.announced = true;
            did_work = true;
            let (from_guest_tx, from_guest_rx) = mpsc::unbounded_channel();
            let (to_guest_tx, to_guest_rx) = mpsc::unbounded_channel();
            state.from_guest_tx = Some(from_guest_tx);
            state.to_guest_rx = Some(to_guest_rx);
            let endpoint = VirtUdp {
                flow,
                handle: state.handle,
                from_guest: from_guest_rx,
                to_guest: to_guest_tx,
                cmd_tx: cmd_tx.clone(),
            };
            let req = UdpForwarderRequest {
                flow,
                handle: state.handle,
                cmd_tx: cmd_tx.clone(),
                endpoint: Some(endpoint),
            };
            let _ = udp_tx.send(req);
        }

        while socket.can_recv() {
            match socket.recv() {
                Ok((data, meta)) => {
                    did_work = true;
                    let from = to_socket_addr(meta.endpoint.addr, meta.endpoint.port);
                    if let Some(tx) = &state.from_guest_tx {
                        let _ = tx.send((data.to_vec(), from));
                    }
                }
                Err(_) => break,
            }
        }
        if let Some(rx) = &mut state.to_guest_rx {
            while let Ok((chunk, to)) = rx.try_recv() {
                let endpoint = smoltcp::wire::IpEndpoint::new(ip_address_of(to), to.port());
                let _ = socket.send_slice(&chunk, endpoint);
                did_work = true;
            }
        }
    }
    did_work
}

fn ip_address_of(addr: SocketAddr) -> IpAddress {
    match addr.ip() {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4.into()),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{
        EthernetAddress, EthernetRepr, Ipv4Address, Ipv4Repr, TcpControl, TcpRepr, TcpSeqNumber,
    };

    #[test]
    fn socket_addr_ip_address_round_trip_v4_and_v6() {
        let v4: SocketAddr = "172.30.30.2:1234".parse().unwrap();
        assert_eq!(to_socket_addr(ip_address_of(v4), v4.port()), v4);

        let v6: SocketAddr = "[fc00:96dc:7096:1d21::2]:53".parse().unwrap();
        assert_eq!(to_socket_addr(ip_address_of(v6), v6.port()), v6);
    }

    /// Builds a raw Ethernet+IPv4+TCP SYN frame the way a guest's virtio-net queue would emit
    /// one, so `pre_scan` can be exercised without a running `Interface`.
    fn build_syn_frame(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
        let (SocketAddr::V4(src4), SocketAddr::V4(dst4)) = (src, dst) else {
            panic!("test helper only builds v4 frames");
        };
        let tcp_repr = TcpRepr {
            src_port: src4.port(),
            dst_port: dst4.port(),
            control: TcpControl::Syn,
            seq_number: TcpSeqNumber(0),
            ack_number: None,
            window_len: 65535,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            payload: &[],
        };
        let src_addr = Ipv4Address::from(*src4.ip());
        let dst_addr = Ipv4Address::from(*dst4.ip());
        let ip_repr = Ipv4Repr {
            src_addr,
            dst_addr,
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.header_len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x02]),
            dst_addr: EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]),
            ethertype: EthernetProtocol::Ipv4,
        };
        let checksums = smoltcp::phy::ChecksumCapabilities::default();
        let total = eth_repr.buffer_len() + ip_repr.buffer_len() + tcp_repr.header_len();
        let mut buf = vec![0u8; total];
        let mut eth = EthernetFrame::new_unchecked(&mut buf);
        eth_repr.emit(&mut eth);
        let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
        ip_repr.emit(&mut ip, &checksums);
        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp_repr.emit(&mut tcp, &IpAddress::Ipv4(src_addr), &IpAddress::Ipv4(dst_addr), &checksums);
        buf
    }

    #[test]
    fn pre_scan_registers_a_fresh_tcp_flow_on_syn() {
        let src: SocketAddr = "172.30.30.2:54321".parse().unwrap();
        let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let frame = build_syn_frame(src, dst);

        let mut sockets = SocketSet::new(Vec::new());
        let mut tcp_flows: HashMap<FlowId, TcpFlowState> = HashMap::new();
        let mut udp_flows: HashMap<FlowId, UdpFlowState> = HashMap::new();
        let service_tcp = HashMap::new();
        let udp_listeners = HashMap::new();

        pre_scan(&frame, &mut sockets, &mut tcp_flows, &mut udp_flows, &service_tcp, &udp_listeners);

        let flow = FlowId { local: src, remote: dst, proto: Proto::Tcp };
        assert!(tcp_flows.contains_key(&flow));
        assert!(udp_flows.is_empty());

        // A repeated SYN for the same flow must not register a second socket.
        let sockets_before = sockets.iter().count();
        pre_scan(&frame, &mut sockets, &mut tcp_flows, &mut udp_flows, &service_tcp, &udp_listeners);
        assert_eq!(sockets.iter().count(), sockets_before);
    }
}
