//! Networking helpers: socket binding and local address discovery.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6, SockaddrLike,
};

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn bind_fd(fd: &std::os::fd::OwnedFd, addr: SocketAddr) -> io::Result<()> {
    socket::setsockopt(fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)
        }
    }
}

/// Bind a non-blocking TCP listener (HTTP API)
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    bind_fd(&fd, addr)?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Bind a non-blocking UDP socket (single-port ICE mux)
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(io::Error::from)?;

    bind_fd(&fd, addr)?;

    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Addresses of all interfaces that are up and not loopback
pub fn local_ip_addresses() -> io::Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for ifaddr in getifaddrs().map_err(io::Error::from)? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = match address.family() {
            Some(AddressFamily::Inet) => address.as_sockaddr_in().map(|a| IpAddr::V4(a.ip())),
            Some(AddressFamily::Inet6) => address
                .as_sockaddr_in6()
                .map(|a| IpAddr::V6(a.ip()))
                .filter(|ip| !is_link_local(ip)),
            _ => None,
        };
        if let Some(ip) = ip {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    Ok(ips)
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
