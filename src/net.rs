//! Listener construction shared by every engine.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Build the listening socket.
///
/// SO_REUSEADDR allows a quick restart over sockets in TIME_WAIT.
/// SO_REUSEPORT stays off: binding a port another server holds must
/// fail, not silently share the listen queue.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_occupied_port_fails() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = first.local_addr().unwrap();

        let second = bind_listener(addr, 5);
        assert_eq!(second.unwrap_err().kind(), io::ErrorKind::AddrInUse);
    }
}
