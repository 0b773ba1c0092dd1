//! Link endpoint: frames the guest's virtio-net queue over the `AF_UNIX` `SOCK_DGRAM` pair
//! shared with the VMM, one Ethernet frame per datagram.
//!
//! Reads with scatter-gather `readv` into a pre-sized iovec list rather than one big buffer
//! per packet, matching how real virtio-net passt/gvproxy backends avoid an oversized
//! allocation for the common case of a small packet.

use std::io;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::uio::{readv, writev};
use std::io::{IoSlice, IoSliceMut};

/// Just under the virtio queue limit; also the configured fabric MTU.
pub const MTU: usize = 65520;

/// vnet (virtio-net) header length when GSO framing is negotiated (a 10-12 byte header).
/// We negotiate the 10-byte legacy header; the field is kept as a constant rather than a
/// runtime-detected value because the fabric always requests it from the VMM side.
pub const VNET_HEADER_LEN: usize = 10;

/// Geometric buffer-size progression: typical packets land in the first one or two
/// buffers, jumbo frames span at most two.
const BUFFER_SIZES: &[usize] =
    &[128, 256, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];

const SNDBUF: i32 = 512 * 1024;
const RCVBUF: i32 = 2 * 1024 * 1024;

/// Owns one half of the guest's datagram link. Immutable after construction; dropping it
/// closes the socket, which is what unwinds the read loop on the other side.
pub struct LinkEndpoint {
    fd: OwnedFd,
    mtu: usize,
    vnet_header: bool,
    scratch: Vec<Vec<u8>>,
    pcap: Option<PcapWriter>,
}

impl LinkEndpoint {
    /// Wraps an already-connected `SOCK_DGRAM` `AF_UNIX` fd handed to us by the VMM side.
    /// `vnet_header` indicates GSO framing was negotiated and the first `VNET_HEADER_LEN`
    /// bytes of every datagram must be stripped on read / reserved on write.
    pub fn from_fd(fd: OwnedFd, vnet_header: bool) -> io::Result<Self> {
        set_buffer_sizes(fd.as_raw_fd())?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(LinkEndpoint {
            fd,
            mtu: MTU,
            vnet_header,
            scratch: BUFFER_SIZES.iter().map(|&n| vec![0u8; n]).collect(),
            pcap: None,
        })
    }

    /// Enables inline frame capture: every frame read from or written to the link,
    /// in both directions, is appended to `path` as a classic pcap file. No background thread —
    /// this link endpoint already has exactly one reader and one writer, so the capture write
    /// is just one more synchronous `write_all` alongside the real syscall.
    pub fn enable_pcap(&mut self, path: &Path) -> io::Result<()> {
        self.pcap = Some(PcapWriter::create(path)?);
        Ok(())
    }

    /// Creates a connected `socketpair` for tests: returns our endpoint and the fd a test can
    /// use to stand in for the VMM side.
    pub fn test_pair() -> io::Result<(Self, OwnedFd)> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )?;
        Ok((Self::from_fd(a, false)?, b))
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Reads exactly one Ethernet frame (one datagram), scatter-gathered across the
    /// pre-sized buffer list and assembled into a single contiguous `Vec<u8>` with any vnet
    /// header stripped. Returns `Ok(None)` when the socket would block (non-blocking fd).
    pub fn read_one(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut iov: Vec<IoSliceMut<'_>> =
            self.scratch.iter_mut().map(|b| IoSliceMut::new(b.as_mut_slice())).collect();

        let n = match readv(&self.fd, &mut iov) {
            Ok(n) => n,
            Err(nix::errno::Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "link closed"));
        }

        let mut frame = Vec::with_capacity(n);
        let mut remaining = n;
        for buf in &self.scratch {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(buf.len());
            frame.extend_from_slice(&buf[..take]);
            remaining -= take;
        }

        if self.vnet_header {
            if frame.len() < VNET_HEADER_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "short vnet header"));
            }
            frame.drain(..VNET_HEADER_LEN);
        }
        if let Some(pcap) = &mut self.pcap {
            let _ = pcap.write_record(&frame);
        }
        Ok(Some(frame))
    }

    /// Writes one Ethernet frame as a single datagram: one `sendmsg` per frame, and a short
    /// write is treated as an error rather than silently truncating the frame.
    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let header = [0u8; VNET_HEADER_LEN];
        let iov: &[IoSlice<'_>] = if self.vnet_header {
            &[IoSlice::new(&header), IoSlice::new(frame)]
        } else {
            &[IoSlice::new(frame)]
        };
        let expected: usize = iov.iter().map(|s| s.len()).sum();
        let n = writev(&self.fd, iov)?;
        if n != expected {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram write"));
        }
        if let Some(pcap) = &mut self.pcap {
            let _ = pcap.write_record(frame);
        }
        Ok(())
    }
}

/// Classic (libpcap, not pcap-ng) capture file writer: a 24-byte global header followed by one
/// `{ts_sec, ts_usec, incl_len, orig_len}` record header per frame. Hand-rolled rather than
/// pulled in as a dependency — this is a rarely-enabled diagnostic path writing a format simple
/// enough that a small dependency would outweigh what it saves.
struct PcapWriter {
    file: std::fs::File,
}

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_LINKTYPE_ETHERNET: u32 = 1;

impl PcapWriter {
    fn create(path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::create(path)?;
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&(MTU as u32).to_le_bytes()); // snaplen
        header.extend_from_slice(&PCAP_LINKTYPE_ETHERNET.to_le_bytes());
        file.write_all(&header)?;
        Ok(PcapWriter { file })
    }

    fn write_record(&mut self, frame: &[u8]) -> io::Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&(now.subsec_micros()).to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(frame);
        self.file.write_all(&record)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_buffer_sizes(fd: RawFd) -> io::Result<()> {
    set_sockopt_int(fd, libc::SO_SNDBUF, SNDBUF)?;
    set_sockopt_int(fd, libc::SO_RCVBUF, RCVBUF)?;
    Ok(())
}

fn set_sockopt_int(fd: RawFd, name: libc::c_int, value: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn round_trips_a_small_frame() {
        let (mut ep, peer_fd) = LinkEndpoint::test_pair().unwrap();
        let peer = UnixDatagram::from(peer_fd);

        let frame = vec![0xaa; 64];
        peer.send(&frame).unwrap();

        // Non-blocking read may need a retry in the single-threaded test process.
        let mut got = None;
        for _ in 0..100 {
            if let Some(f) = ep.read_one().unwrap() {
                got = Some(f);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got.unwrap(), frame);
    }

    #[test]
    fn jumbo_frame_spans_multiple_scratch_buffers() {
        let (mut ep, peer_fd) = LinkEndpoint::test_pair().unwrap();
        let peer = UnixDatagram::from(peer_fd);

        let frame: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        peer.send(&frame).unwrap();

        let mut got = None;
        for _ in 0..100 {
            if let Some(f) = ep.read_one().unwrap() {
                got = Some(f);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got.unwrap(), frame);
    }

    #[test]
    fn write_then_peer_reads_it() {
        let (mut ep, peer_fd) = LinkEndpoint::test_pair().unwrap();
        let mut peer = UnixDatagram::from(peer_fd);
        peer.set_nonblocking(false).unwrap();

        ep.write_frame(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);
        let _ = peer.flush();
    }

    #[test]
    fn pcap_capture_writes_global_header_and_one_record_per_direction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");

        let (mut ep, peer_fd) = LinkEndpoint::test_pair().unwrap();
        ep.enable_pcap(&path).unwrap();
        let peer = UnixDatagram::from(peer_fd);

        peer.send(&[0xaa; 32]).unwrap();
        let mut got = None;
        for _ in 0..100 {
            if let Some(f) = ep.read_one().unwrap() {
                got = Some(f);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(got.is_some());
        ep.write_frame(&[1, 2, 3, 4]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &PCAP_MAGIC.to_le_bytes());
        // global header (24) + record header (16) + 32-byte frame + record header (16) + 4-byte frame
        assert_eq!(bytes.len(), 24 + 16 + 32 + 16 + 4);
    }
}
