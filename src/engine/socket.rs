// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The UDP/IPv6 multicast socket for neighbor discovery.
//!
//! One socket serves every tracked interface: memberships in the
//! link-local group are joined per ifIndex, transmission pins the egress
//! interface and link-local source through IPV6_PKTINFO ancillary data, and
//! reception recovers the ingress ifIndex, hop limit and kernel receive
//! timestamp from control messages. The hop limit is both sent and required
//! as 255 so a packet that crossed a router can be detected and dropped.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use crate::logging::{Facility, Logger};
use crate::wire::MAX_PACKET_SIZE;
use crate::{log_info, log_warning};

/// All-nodes link-local multicast group carrying the protocol.
pub const MCAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Hop limit we transmit with, and the exact value required on receive.
pub const REQUIRED_HOP_LIMIT: i32 = 255;

/// Current wall-clock time in microseconds since the epoch. The wire
/// timestamps use the non-monotonic clock because kernel receive
/// timestamps do.
pub fn current_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Check a libc call result and convert failures into an error carrying
/// the OS error string.
fn check_libc_result(result: i32, what: &str) -> Result<()> {
    if result < 0 {
        Err(anyhow::anyhow!(
            "failed to {}: {}",
            what,
            std::io::Error::last_os_error()
        ))
    } else {
        Ok(())
    }
}

fn set_sockopt_int(fd: RawFd, level: i32, option: i32, value: i32, what: &str) -> Result<()> {
    // SAFETY: fd is a valid socket owned by the caller and the option value
    // is a c_int as every option used here requires.
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    check_libc_result(result, what)
}

/// Metadata recovered for one received packet.
#[derive(Debug, Clone)]
pub struct RecvMeta {
    pub len: usize,
    /// Ingress interface index from IPV6_PKTINFO; 0 if absent.
    pub if_index: u32,
    pub src_addr: Ipv6Addr,
    /// Hop limit from IPV6_HOPLIMIT; -1 if absent.
    pub hop_limit: i32,
    /// Kernel receive timestamp (µs since epoch), falling back to the
    /// system clock when SO_TIMESTAMPNS was unavailable.
    pub recv_time_us: u64,
}

/// The discovery socket. All I/O is non-blocking; the engine drives it
/// through an `AsyncFd`.
pub struct NeighborSocket {
    socket: Socket,
    port: u16,
}

impl NeighborSocket {
    /// Create and fully configure the socket. Every option except kernel
    /// timestamping is required; timestamping failures only degrade RTT
    /// accuracy and are logged instead.
    pub fn open(port: u16, ip_tos: Option<u32>, logger: &Logger) -> Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .context("creating discovery UDP socket")?;
        let fd = socket.as_raw_fd();

        socket.set_only_v6(true).context("setting IPV6_V6ONLY")?;
        socket
            .set_reuse_address(true)
            .context("setting SO_REUSEADDR")?;
        socket.set_nonblocking(true).context("setting O_NONBLOCK")?;

        // Ingress interface index and destination address per packet.
        set_sockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1, "enable IPV6_RECVPKTINFO")?;

        if let Some(tos) = ip_tos {
            socket
                .set_tclass_v6(tos)
                .context("setting IPV6_TCLASS")?;
        }

        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("binding discovery socket to [::]:{port}"))?;

        // Transmit at the maximum hop limit so receivers can verify the
        // packet never crossed a router.
        socket
            .set_multicast_hops_v6(REQUIRED_HOP_LIMIT as u32)
            .context("setting IPV6_MULTICAST_HOPS")?;
        set_sockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1, "enable IPV6_RECVHOPLIMIT")?;

        // Our own multicast must not come back at us.
        socket
            .set_multicast_loop_v6(false)
            .context("disabling IPV6_MULTICAST_LOOP")?;

        if let Err(e) = set_sockopt_int(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1, "enable SO_TIMESTAMPNS") {
            log_warning!(
                logger,
                Facility::Transceiver,
                "Kernel receive timestamping unavailable ({}); RTT samples will be noisier",
                e
            );
        }

        log_info!(
            logger,
            Facility::Transceiver,
            "Discovery socket bound to [::]:{} (fd {})",
            port,
            fd
        );

        Ok(Self { socket, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Join the discovery group on one interface.
    pub fn join_group(&self, if_index: u32) -> Result<()> {
        self.socket
            .join_multicast_v6(&MCAST_GROUP, if_index)
            .with_context(|| format!("joining {} on ifIndex {}", MCAST_GROUP, if_index))
    }

    /// Leave the discovery group on one interface.
    pub fn leave_group(&self, if_index: u32) -> Result<()> {
        self.socket
            .leave_multicast_v6(&MCAST_GROUP, if_index)
            .with_context(|| format!("leaving {} on ifIndex {}", MCAST_GROUP, if_index))
    }

    /// Receive one packet with its ancillary metadata. Non-blocking;
    /// returns `WouldBlock` when the queue is empty.
    pub fn recv(&self, buf: &mut [u8]) -> std::io::Result<RecvMeta> {
        let mut src: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut cmsg_buf = [0u8; 128];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        // SAFETY: all pointers in msg reference live stack/heap buffers for
        // the duration of the call.
        let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut if_index = 0u32;
        let mut hop_limit = -1i32;
        let mut recv_time_us = 0u64;

        // SAFETY: the CMSG_* macros walk the control buffer the kernel just
        // filled; lengths come from msg_controllen.
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            match (hdr.cmsg_level, hdr.cmsg_type) {
                (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                    let info = unsafe {
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo)
                    };
                    if_index = info.ipi6_ifindex;
                }
                (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) => {
                    hop_limit = unsafe {
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int)
                    };
                }
                (libc::SOL_SOCKET, libc::SCM_TIMESTAMPNS) => {
                    let ts = unsafe {
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec)
                    };
                    recv_time_us = ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000;
                }
                _ => {}
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        if recv_time_us == 0 {
            recv_time_us = current_time_us();
        }

        Ok(RecvMeta {
            len: n as usize,
            if_index,
            src_addr: Ipv6Addr::from(src.sin6_addr.s6_addr),
            hop_limit,
            recv_time_us,
        })
    }

    /// Send one packet to the discovery group, pinned to `if_index` with
    /// the interface's link-local address as source.
    pub fn send(&self, payload: &[u8], if_index: u32, src_addr: Ipv6Addr) -> std::io::Result<usize> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("packet of {} bytes exceeds {}", payload.len(), MAX_PACKET_SIZE),
            ));
        }

        let mut dst: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        dst.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        dst.sin6_port = self.port.to_be();
        dst.sin6_addr = libc::in6_addr {
            s6_addr: MCAST_GROUP.octets(),
        };
        dst.sin6_scope_id = if_index;

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        let mut cmsg_buf = [0u8; 64];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut dst as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        // SAFETY: CMSG_SPACE/CMSG_LEN are pure size computations.
        msg.msg_controllen =
            unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::in6_pktinfo>() as u32) } as _;

        // SAFETY: CMSG_FIRSTHDR points into cmsg_buf, which is large enough
        // for one in6_pktinfo control message.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
            (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN(std::mem::size_of::<libc::in6_pktinfo>() as u32) as _;
            let info = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: src_addr.octets(),
                },
                ipi6_ifindex: if_index,
            };
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, info);
        }

        // SAFETY: msg references live buffers for the duration of the call.
        let n = unsafe { libc::sendmsg(self.socket.as_raw_fd(), &msg, 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for NeighborSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Severity;

    #[test]
    fn test_open_configures_socket() {
        let logger = Logger::stderr(Severity::Error);
        // Port 0: the kernel picks one, no privileges needed.
        let socket = NeighborSocket::open(0, None, &logger);
        assert!(socket.is_ok(), "open failed: {:?}", socket.err());
    }

    #[test]
    fn test_open_with_tclass() {
        let logger = Logger::stderr(Severity::Error);
        let socket = NeighborSocket::open(0, Some(0xc0), &logger);
        assert!(socket.is_ok(), "open failed: {:?}", socket.err());
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let logger = Logger::stderr(Severity::Error);
        let socket = NeighborSocket::open(0, None, &logger).unwrap();
        let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
        let err = socket.send(&oversized, 1, Ipv6Addr::LOCALHOST).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_recv_would_block_when_empty() {
        let logger = Logger::stderr(Severity::Error);
        let socket = NeighborSocket::open(0, None, &logger).unwrap();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let err = socket.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    #[ignore = "needs a multicast-capable interface (run with: cargo test -- --ignored)"]
    fn test_join_and_leave_group() {
        let logger = Logger::stderr(Severity::Error);
        let socket = NeighborSocket::open(0, None, &logger).unwrap();
        let lo_index = nix::net::if_::if_nametoindex("lo").unwrap_or(1);
        socket.join_group(lo_index).unwrap();
        socket.leave_group(lo_index).unwrap();
    }
}
