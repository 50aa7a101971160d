//! Networking-related helper functions.

use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Sets the receive buffer size for a socket.
///
/// This is the equivalent of setting the `SO_RCVBUF` socket setting directly.
pub fn set_receive_buffer_size<'s, S>(socket: &'s S, size: usize) -> io::Result<()>
where
    SockRef<'s>: From<&'s S>,
{
    SockRef::from(socket).set_recv_buffer_size(size)
}

/// Enables TCP keepalive probes on a socket, with the given probe time or
/// the OS default when `None`.
///
/// This is the equivalent of setting the `SO_KEEPALIVE` and `TCP_KEEPALIVE`
/// socket settings directly.
pub fn set_keepalive(socket: &TcpStream, time: Option<Duration>) -> io::Result<()> {
    let mut keepalive = TcpKeepalive::new();
    if let Some(time) = time {
        keepalive = keepalive.with_time(time);
    }
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}
