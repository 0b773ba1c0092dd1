//! `smoltcp::phy::Device` adapter over [`LinkEndpoint`].
//!
//! The poll loop (see `stack::run_loop`) pre-scans every frame coming off the link before
//! handing it to smoltcp, so new connections can be registered (a fresh listening socket
//! added to the `SocketSet`) *before* smoltcp's interface processing sees the SYN that
//! completes them. That pre-scan needs a place to stash a frame it has already read off the
//! real fd; `LinkDevice` is that place — an ingress queue of depth one, filled by the poll
//! loop and drained by `smoltcp::iface::Interface::poll`.

use std::collections::VecDeque;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

use crate::link::{LinkEndpoint, MTU};

pub struct LinkDevice {
    pub link: LinkEndpoint,
    /// Frames pulled off the real socket and pre-scanned by the poll loop, waiting for
    /// smoltcp to consume them via `receive`.
    ingress: VecDeque<Vec<u8>>,
    egress: VecDeque<Vec<u8>>,
}

impl LinkDevice {
    pub fn new(link: LinkEndpoint) -> Self {
        LinkDevice { link, ingress: VecDeque::with_capacity(4), egress: VecDeque::with_capacity(4) }
    }

    /// Queues a frame already read (and pre-scanned) by the poll loop for smoltcp to consume.
    pub fn push_ingress(&mut self, frame: Vec<u8>) {
        self.ingress.push_back(frame);
    }

    pub fn has_ingress(&self) -> bool {
        !self.ingress.is_empty()
    }

    /// Flushes frames smoltcp queued for transmission out to the real link. Called once per
    /// poll-loop iteration after `Interface::poll` returns.
    pub fn flush_egress(&mut self) -> std::io::Result<()> {
        while let Some(frame) = self.egress.pop_front() {
            self.link.write_frame(&frame)?;
        }
        Ok(())
    }
}

pub struct RxTok(Vec<u8>);
pub struct TxTok<'a>(&'a mut VecDeque<Vec<u8>>);

impl RxToken for RxTok {
    fn consume<R, F: FnOnce(&mut [u8]) -> R>(mut self, f: F) -> R {
        f(&mut self.0)
    }
}

impl<'a> TxToken for TxTok<'a> {
    fn consume<R, F: FnOnce(&mut [u8]) -> R>(self, len: usize, f: F) -> R {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        self.0.push_back(buf);
        r
    }
}

impl Device for LinkDevice {
    type RxToken<'a> = RxTok;
    type TxToken<'a> = TxTok<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.ingress.pop_front()?;
        Some((RxTok(frame), TxTok(&mut self.egress)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxTok(&mut self.egress))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = MTU.min(self.link.mtu());
        // TX/RX checksum offload declared: the guest negotiated virtio-net checksum offload,
        // so smoltcp should neither validate inbound checksums nor spend cycles computing
        // outbound ones.
        let mut checksum = ChecksumCapabilities::default();
        checksum.ipv4 = Checksum::None;
        checksum.tcp = Checksum::None;
        checksum.udp = Checksum::None;
        checksum.icmpv4 = Checksum::None;
        checksum.icmpv6 = Checksum::None;
        caps.checksum = checksum;
        caps
    }
}
