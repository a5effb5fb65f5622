//! UDP multicast socket for discovery
//!
//! Bound to `0.0.0.0:<port>` and joined to the group on the VPN interface.
//! On Linux the destination address of every datagram is read from the
//! `IP_PKTINFO` control message so group traffic can be told apart from
//! unicast and from other groups.

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::debug;

use super::transport::{DiscoveryTransport, InboundPacket, TransportBinder};
use super::DiscoveryGroup;
use crate::config::DiscoveryConfig;
use crate::readiness::NetworkAddress;

/// TTL of unicast datagrams sent from the discovery socket
const UNICAST_TTL: u32 = 16;

/// Outgoing packet options
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub multicast_ttl: u32,
    pub tos: u8,
}

impl From<&DiscoveryConfig> for ProbeOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            multicast_ttl: config.multicast_ttl,
            tos: config.tos,
        }
    }
}

/// Multicast socket owned by the discovery engine
pub struct MulticastSocket {
    socket: UdpSocket,
}

impl MulticastSocket {
    /// Bind the discovery port and join `group` on the interface of `local`.
    ///
    /// Must be called from within the tokio runtime.
    pub fn bind(
        group: &DiscoveryGroup,
        local: &NetworkAddress,
        options: ProbeOptions,
    ) -> io::Result<Self> {
        let socket = sys::bind(group, local.ip())?;

        socket.join_multicast_v4(&group.addr(), &local.ip())?;
        socket.set_multicast_ttl_v4(options.multicast_ttl)?;
        socket.set_ttl(UNICAST_TTL)?;
        sys::configure(&socket, local.ip(), options.tos)?;
        socket.set_nonblocking(true)?;

        debug!(
            group = %group,
            interface = %local.interface().name,
            ttl = options.multicast_ttl,
            "Discovery socket bound"
        );

        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
        })
    }
}

#[async_trait::async_trait]
impl DiscoveryTransport for MulticastSocket {
    async fn recv(&self) -> io::Result<InboundPacket> {
        sys::recv(&self.socket).await
    }

    async fn send(&self, payload: &[u8], target: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(payload, target).await.map(|_| ())
    }
}

/// Binds a [`MulticastSocket`] for every discovery start
pub struct MulticastBinder {
    options: ProbeOptions,
}

impl MulticastBinder {
    pub fn new(options: ProbeOptions) -> Self {
        Self { options }
    }
}

impl TransportBinder for MulticastBinder {
    fn bind(
        &self,
        group: &DiscoveryGroup,
        local: &NetworkAddress,
    ) -> io::Result<Arc<dyn DiscoveryTransport>> {
        Ok(Arc::new(MulticastSocket::bind(group, local, self.options)?))
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::fd::{AsRawFd, RawFd};

    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    use super::super::transport::{InboundPacket, MAX_DATAGRAM};
    use super::super::DiscoveryGroup;

    pub fn bind(group: &DiscoveryGroup, _local: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
        std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()))
    }

    /// Destination metadata, ToS and outgoing multicast interface
    pub fn configure(socket: &std::net::UdpSocket, local: Ipv4Addr, tos: u8) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, &(1 as libc::c_int))?;
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_TOS, &libc::c_int::from(tos))?;
        let interface = libc::in_addr {
            s_addr: u32::from(local).to_be(),
        };
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &interface)
    }

    fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        // SAFETY: `value` points to a live T and the length passed matches its size.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub async fn recv(socket: &UdpSocket) -> io::Result<InboundPacket> {
        let fd = socket.as_raw_fd();
        let mut buf = [0u8; MAX_DATAGRAM];
        socket
            .async_io(Interest::READABLE, || recv_with_destination(fd, &mut buf))
            .await
    }

    fn recv_with_destination(fd: RawFd, buf: &mut [u8]) -> io::Result<InboundPacket> {
        // u64 backing keeps the control buffer aligned for cmsghdr
        let mut control = [0u64; 8];
        // SAFETY: all-zero is a valid sockaddr_in / msghdr.
        let mut source: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut source as *mut libc::sockaddr_in as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        // SAFETY: every pointer in `msg` refers to a buffer that outlives the call.
        let len = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut destination = None;
        // SAFETY: the kernel filled `msg`; the CMSG macros only walk within msg_controllen.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                    let info: libc::in_pktinfo =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                    destination = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(InboundPacket {
            source: SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(source.sin_addr.s_addr)),
                u16::from_be(source.sin_port),
            ),
            destination,
            len: len as usize,
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::net::UdpSocket;

    use super::super::transport::{InboundPacket, MAX_DATAGRAM};
    use super::super::DiscoveryGroup;

    // Without destination metadata the socket is bound to the group itself,
    // so everything it receives was addressed to the group.
    pub fn bind(group: &DiscoveryGroup, _local: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
        std::net::UdpSocket::bind(group.socket_addr())
    }

    pub fn configure(_socket: &std::net::UdpSocket, _local: Ipv4Addr, _tos: u8) -> io::Result<()> {
        Ok(())
    }

    pub async fn recv(socket: &UdpSocket) -> io::Result<InboundPacket> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, source) = socket.recv_from(&mut buf).await?;
        let destination = match socket.local_addr()? {
            SocketAddr::V4(local) => Some(*local.ip()),
            SocketAddr::V6(_) => None,
        };
        let SocketAddr::V4(source) = source else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "IPv6 sender"));
        };
        Ok(InboundPacket {
            source,
            destination,
            len,
        })
    }
}
