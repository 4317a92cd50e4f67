//! NetAddress: endpoint immutable (family, ip, port)
//!
//! Konversi ke/dari `sockaddr_storage` dipakai untuk `connect(2)` non-blocking
//! di sisi client, yang tidak di-expose oleh std.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress {
    addr: SocketAddr,
}

impl NetAddress {
    /// Host harus berupa literal IPv4/IPv6
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| NetError::InvalidAddress(format!("{host}:{port}")))?;
        Ok(Self {
            addr: SocketAddr::new(ip, port),
        })
    }

    #[inline(always)]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline(always)]
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `AF_INET` atau `AF_INET6`
    pub fn family(&self) -> libc::c_int {
        match self.addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        }
    }

    /// Alamat yang bisa dipakai sebagai peer: port bukan nol
    pub fn is_valid(&self) -> bool {
        self.addr.port() != 0
    }

    /// Struktur alamat level OS beserta panjangnya
    pub fn to_raw(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: sockaddr_storage adalah POD, all-zero valid
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let len = match self.addr {
            SocketAddr::V4(v4) => {
                // SAFETY: sockaddr_storage cukup besar dan ter-align untuk sockaddr_in
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                // SAFETY: sama seperti di atas, untuk sockaddr_in6
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };

        (storage, len as libc::socklen_t)
    }

    /// Kebalikan `to_raw`, misalnya dari hasil `getsockname`/`accept`
    pub fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<Self> {
        let len = len as usize;
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
                // SAFETY: family dan panjang sudah dicek
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                let port = u16::from_be(sin.sin_port);
                Ok(SocketAddrV4::new(ip, port).into())
            }
            libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
                // SAFETY: family dan panjang sudah dicek
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let port = u16::from_be(sin6.sin6_port);
                Ok(SocketAddrV6::new(ip, port, sin6.sin6_flowinfo, sin6.sin6_scope_id).into())
            }
            family => Err(NetError::InvalidAddress(format!(
                "unsupported address family {family} (len {len})"
            ))),
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self { addr: addr.into() }
    }
}

impl From<SocketAddrV6> for NetAddress {
    fn from(addr: SocketAddrV6) -> Self {
        Self { addr: addr.into() }
    }
}

impl FromStr for NetAddress {
    type Err = NetError;

    /// Format `host:port`, atau `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| NetError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: NetAddress = "127.0.0.1:12345".parse().unwrap();
        assert_eq!(addr.port(), 12345);
        assert_eq!(addr.family(), libc::AF_INET);
        assert_eq!(addr.to_string(), "127.0.0.1:12345");
        assert!(addr.is_valid());

        let v6: NetAddress = "[::1]:80".parse().unwrap();
        assert_eq!(v6.family(), libc::AF_INET6);
        assert_eq!(v6.to_string(), "[::1]:80");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            "localhost".parse::<NetAddress>(),
            Err(NetError::InvalidAddress(_))
        ));
        assert!(NetAddress::new("not-an-ip", 80).is_err());
        assert!(!NetAddress::new("0.0.0.0", 0).unwrap().is_valid());
    }

    #[test]
    fn test_raw_conversion_v4() {
        let addr = NetAddress::new("10.1.2.3", 8080).unwrap();
        let (raw, len) = addr.to_raw();
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(NetAddress::from_raw(&raw, len).unwrap(), addr);
    }

    #[test]
    fn test_raw_conversion_v6() {
        let addr: NetAddress = "[fe80::1]:9000".parse().unwrap();
        let (raw, len) = addr.to_raw();
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(NetAddress::from_raw(&raw, len).unwrap(), addr);
    }

    #[test]
    fn test_from_raw_rejects_short_length() {
        let addr = NetAddress::new("10.1.2.3", 8080).unwrap();
        let (raw, _) = addr.to_raw();
        assert!(NetAddress::from_raw(&raw, 4).is_err());
    }
}
