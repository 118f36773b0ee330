//! Blocking UDP socket facade (§4.A).
//!
//! The teacher crate's `net::socket::Socket`/`io::udp::run_udp_socket` wrap a non-blocking
//! `mio::net::UdpSocket` behind a single-threaded reactor. `SPEC_FULL.md` records why that shape
//! doesn't fit here: §5 wants one thread blocked in `recv` and a separate thread driving sends off
//! a condvar, sharing link state directly rather than handing packets across a channel boundary.
//! This facade uses a plain `std::net::UdpSocket` with a short read timeout, so the receive
//! thread's blocking `recv` wakes up often enough to notice the socket was closed.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::SocketRecvResult;

/// Bounds how long a single `recv_from` call blocks before the closing flag is rechecked.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `send`/`recv` take `&self`, not `&mut self`: the hub's receive thread calls `recv` while the
/// send thread concurrently calls `send` on the very same socket, matching how
/// `std::net::UdpSocket` itself is safe to share this way.
pub struct Socket {
    inner: UdpSocket,
    closing: Arc<AtomicBool>,
    last_os_error: Mutex<Option<std::io::Error>>,
}

impl Socket {
    /// Binds a local UDP socket. Port `0` lets the OS pick an ephemeral port (the client case in
    /// §4.A).
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let inner = UdpSocket::bind(addr)?;
        inner.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        info!("socket bound to {}", inner.local_addr()?);
        Ok(Self {
            inner,
            closing: Arc::new(AtomicBool::new(false)),
            last_os_error: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.inner.local_addr()?.port())
    }

    pub fn send(&self, endpoint: Endpoint, bytes: &[u8]) -> SocketRecvResult {
        match self.inner.send_to(bytes, endpoint.socket_addr()) {
            Ok(_) => SocketRecvResult::Succes,
            Err(e) => {
                warn!("send to {endpoint} failed: {e}");
                *self.last_os_error.lock() = Some(e);
                SocketRecvResult::Error
            }
        }
    }

    /// Blocks (up to [`RECV_POLL_INTERVAL`] at a time) until a datagram arrives, the socket is
    /// closed, or an OS error occurs.
    pub fn recv(&self, buffer: &mut [u8]) -> (usize, Option<Endpoint>, SocketRecvResult) {
        if self.closing.load(Ordering::Acquire) {
            return (0, None, SocketRecvResult::SocketClosed);
        }

        match self.inner.recv_from(buffer) {
            Ok((len, addr)) => (len, Some(Endpoint::new(addr)), SocketRecvResult::Succes),
            Err(e) if would_block_or_timeout(&e) => {
                if self.closing.load(Ordering::Acquire) {
                    (0, None, SocketRecvResult::SocketClosed)
                } else {
                    (0, None, SocketRecvResult::NoData)
                }
            }
            Err(e) => {
                warn!("recv failed: {e}");
                *self.last_os_error.lock() = Some(e);
                (0, None, SocketRecvResult::Error)
            }
        }
    }

    /// A handle that, when used with `request_close`, interrupts a thread blocked in [`recv`].
    pub fn closing_flag(&self) -> Arc<AtomicBool> {
        self.closing.clone()
    }

    /// Marks the socket closed so the next (or current, within [`RECV_POLL_INTERVAL`]) `recv`
    /// call returns [`SocketRecvResult::SocketClosed`].
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn last_os_error(&self) -> Option<std::io::Error> {
        self.last_os_error.lock().as_ref().map(|e| std::io::Error::new(e.kind(), e.to_string()))
    }
}

fn would_block_or_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_and_recv_round_trip_on_loopback() {
        let a = Socket::bind(0).unwrap();
        let b = Socket::bind(0).unwrap();

        let b_port = b.local_port().unwrap();
        let b_endpoint = Endpoint::new(([127, 0, 0, 1], b_port).into());

        a.send(b_endpoint, b"hello");
        let mut buf = [0_u8; 16];
        let (len, from, result) = b.recv(&mut buf);

        assert_eq!(result, SocketRecvResult::Succes);
        assert_eq!(&buf[..len], b"hello");
        assert!(from.is_some());
    }

    #[test]
    fn recv_times_out_with_no_data() {
        let a = Socket::bind(0).unwrap();
        let mut buf = [0_u8; 16];
        let (_, _, result) = a.recv(&mut buf);
        assert_eq!(result, SocketRecvResult::NoData);
    }

    #[test]
    fn close_interrupts_a_blocked_recv_thread() {
        let socket = Socket::bind(0).unwrap();
        let closing = socket.closing_flag();

        let handle = thread::spawn(move || {
            let mut buf = [0_u8; 16];
            loop {
                let (_, _, result) = socket.recv(&mut buf);
                if result == SocketRecvResult::SocketClosed {
                    return result;
                }
            }
        });

        thread::sleep(Duration::from_millis(50));
        closing.store(true, Ordering::Release);

        let result = handle.join().unwrap();
        assert_eq!(result, SocketRecvResult::SocketClosed);
    }
}
