//! TcpAcceptor: listening socket (bind + listen), non-blocking

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream};
use tracing::info;

use super::net_addr::NetAddress;
use crate::error::Result;

pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: NetAddress,
}

impl TcpAcceptor {
    /// Bind + listen. Port 0 memilih port ephemeral; lihat `local_addr()`.
    pub fn bind(addr: &NetAddress) -> Result<Self> {
        let listener = TcpListener::bind(addr.socket_addr())?;
        let local_addr = NetAddress::from(listener.local_addr()?);
        info!(addr = %local_addr, "listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept satu connection. `WouldBlock` berarti antrian accept kosong.
    pub fn accept(&self) -> io::Result<(TcpStream, NetAddress)> {
        let (stream, peer) = self.listener.accept()?;
        Ok((stream, NetAddress::from(peer)))
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> NetAddress {
        self.local_addr
    }
}

impl std::fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("fd", &self.fd())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_bind_and_accept() {
        let acceptor = TcpAcceptor::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);

        let err = acceptor.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let client = std::net::TcpStream::connect(acceptor.local_addr().socket_addr()).unwrap();
        // Handshake loopback selesai di kernel, tapi beri waktu sedikit
        let mut accepted = None;
        for _ in 0..100 {
            match acceptor.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (_stream, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer.socket_addr(), client.local_addr().unwrap());
    }
}
