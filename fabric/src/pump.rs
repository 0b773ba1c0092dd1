//! Bidirectional byte pump (§9 design note): one `FullDuplex` abstraction shared by the TCP
//! forwarder, the host-forward listeners, and the TLS MITM proxy, instead of each writing its
//! own copy loop. Grounded on `ross-shim`'s `net::forward::pipe` pair-of-tasks pattern, lifted
//! one level to a single function plus a small trait so it also covers the virtual (smoltcp)
//! side of a flow, not just two real sockets.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 512 KiB per direction (§4.C), matching the TCP socket buffers sized into the virtual
/// endpoints in `stack::mod`.
pub const PUMP_BUFFER_SIZE: usize = 512 * 1024;

/// A full-duplex byte stream with independent half-close of each direction. Implemented by
/// `stack::VirtTcp` (the guest side) and by anything `AsyncRead + AsyncWrite` (the host side,
/// via the blanket impl below) so `pump` can move bytes between either combination.
#[async_trait::async_trait]
pub trait FullDuplex: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Signals no more data will be written in this direction (TCP FIN / shutdown(SHUT_WR)).
    async fn close_write(&mut self) -> io::Result<()>;
}

/// Any real async socket (host-side `TcpStream`, `UnixStream`, ...) is full-duplex for free.
pub struct AsyncIoDuplex<T>(pub T);

#[async_trait::async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> FullDuplex for AsyncIoDuplex<T> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn close_write(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// Copies bytes in both directions between `a` and `b` until both sides have gone quiet, then
/// propagates the corresponding half-close: an EOF read from `a` triggers `b.close_write()`
/// once `a`'s remaining buffered bytes reach `b`, and vice versa. Returns once both directions
/// are fully drained and closed.
pub async fn pump<A: FullDuplex + ?Sized, B: FullDuplex + ?Sized>(
    a: &mut A,
    b: &mut B,
) -> io::Result<(u64, u64)> {
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;
    let mut a_buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut b_buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut a_open = true;
    let mut b_open = true;

    while a_open || b_open {
        if !a_open && !b_open {
            break;
        }
        tokio::select! {
            res = a.read(&mut a_buf), if a_open => {
                match res {
                    Ok(0) => {
                        a_open = false;
                        let _ = b.close_write().await;
                    }
                    Ok(n) => {
                        b.write_all(&a_buf[..n]).await?;
                        a_to_b += n as u64;
                    }
                    Err(e) => return Err(e),
                }
            }
            res = b.read(&mut b_buf), if b_open => {
                match res {
                    Ok(0) => {
                        b_open = false;
                        let _ = a.close_write().await;
                    }
                    Ok(n) => {
                        a.write_all(&b_buf[..n]).await?;
                        b_to_a += n as u64;
                    }
                    Err(e) => return Err(e),
                }
            }
            else => break,
        }
    }
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn pumps_bytes_until_both_sides_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"world").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut client_duplex = AsyncIoDuplex(client);

        let (mut tx, mut rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            tx.write_all(b"hello").await.unwrap();
            tx.shutdown().await.unwrap();
        });

        struct Wrap(tokio::io::DuplexStream);
        #[async_trait::async_trait]
        impl FullDuplex for Wrap {
            async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                AsyncReadExt::read(&mut self.0, buf).await
            }
            async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
                AsyncWriteExt::write_all(&mut self.0, buf).await
            }
            async fn close_write(&mut self) -> io::Result<()> {
                AsyncWriteExt::shutdown(&mut self.0).await
            }
        }
        let mut side = Wrap(rx);

        let (sent, received) = pump(&mut side, &mut client_duplex).await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(received, 5);

        writer.await.unwrap();
        server.await.unwrap();
    }
}
