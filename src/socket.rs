use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::trace;

pub const WAIT_NONE: u32 = 0;
pub const WAIT_SEND: u32 = 1 << 0;
pub const WAIT_RECEIVE: u32 = 1 << 1;
pub const WAIT_INTERRUPT: u32 = 1 << 2;

/// This is an abstraction for the unreliable datagram socket underneath the
///  transport, introduced to facilitate mocking the I/O part away for testing
///  (and to allow in-memory transports).
///
/// All operations are non-blocking except `wait`, which blocks for at most
///  `timeout_ms` milliseconds.
#[cfg_attr(test, mockall::automock)]
pub trait DatagramSocket {
    /// Sends the gather list as one datagram. Returns the number of bytes
    ///  sent, or 0 if the operation would block.
    fn send<'a>(&mut self, to: SocketAddr, buffers: &[&'a [u8]]) -> io::Result<usize>;

    /// Receives one datagram into `buf`. Returns `None` if no datagram is
    ///  available.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>>;

    /// Waits for any of the requested conditions for at most `timeout_ms`
    ///  and returns the conditions that hold (`WAIT_NONE` on timeout,
    ///  `WAIT_INTERRUPT` if the wait was interrupted by a signal).
    fn wait(&mut self, condition: u32, timeout_ms: u32) -> io::Result<u32>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

const RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
const SEND_BUFFER_SIZE: usize = 256 * 1024;

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    send_scratch: Vec<u8>,
}

impl UdpDatagramSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpDatagramSocket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        // std does not expose SO_RCVBUF/SO_SNDBUF, so the socket is built
        //  through socket2; bigger kernel buffers absorb receive bursts
        //  between service ticks
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        socket.set_recv_buffer_size(RECEIVE_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
        socket.bind(&addr.into())?;

        Ok(UdpDatagramSocket {
            socket: socket.into(),
            send_scratch: Vec::with_capacity(crate::protocol::MAXIMUM_MTU as usize),
        })
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send(&mut self, to: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
        // std has no vectored send_to, so gather through a scratch buffer
        self.send_scratch.clear();
        for buffer in buffers {
            self.send_scratch.extend_from_slice(buffer);
        }

        match self.socket.send_to(&self.send_scratch, to) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => {
                trace!("received {} byte datagram from {:?}", len, from);
                Ok(Some((from, len)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, condition: u32, timeout_ms: u32) -> io::Result<u32> {
        if condition & WAIT_RECEIVE == 0 {
            std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            return Ok(WAIT_NONE);
        }

        if timeout_ms == 0 {
            let mut probe = [0u8; 1];
            return match self.socket.peek_from(&mut probe) {
                Ok(_) => Ok(WAIT_RECEIVE),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WAIT_NONE),
                Err(e) => Err(e),
            };
        }

        // poll-style wait without an async runtime: block on a peek with a
        //  read timeout, then restore non-blocking mode
        self.socket.set_nonblocking(false)?;
        self.socket
            .set_read_timeout(Some(Duration::from_millis(timeout_ms as u64)))?;

        let mut probe = [0u8; 1];
        let result = match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(WAIT_RECEIVE),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(WAIT_NONE)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if condition & WAIT_INTERRUPT != 0 {
                    Ok(WAIT_INTERRUPT)
                } else {
                    Ok(WAIT_NONE)
                }
            }
            Err(e) => Err(e),
        };

        self.socket.set_read_timeout(None)?;
        self.socket.set_nonblocking(true)?;

        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_pair() -> (UdpDatagramSocket, UdpDatagramSocket) {
        let a = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        (a, b)
    }

    #[test]
    fn test_send_receive_gather() {
        let (mut a, mut b) = bound_pair();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send(b_addr, &[&[1, 2], &[], &[3, 4, 5]]).unwrap();
        assert_eq!(sent, 5);

        assert_eq!(b.wait(WAIT_RECEIVE, 1000).unwrap(), WAIT_RECEIVE);

        let mut buf = [0u8; 64];
        let (from, len) = b.receive(&mut buf).unwrap().unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(&buf[..len], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_receive_without_data() {
        let (_, mut b) = bound_pair();
        let mut buf = [0u8; 64];
        assert!(b.receive(&mut buf).unwrap().is_none());
        assert_eq!(b.wait(WAIT_RECEIVE | WAIT_INTERRUPT, 10).unwrap(), WAIT_NONE);
    }
}
