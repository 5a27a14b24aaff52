//! UDP transport for PTP event and general messages.
//!
//! Binds the two IPv4 PTP sockets (event 319, general 320), joins the
//! primary multicast group on the configured interface, and captures kernel
//! software timestamps:
//!
//! * RX: `SO_TIMESTAMPING` delivers a `SCM_TIMESTAMPING` cmsg with the
//!   receive timestamp taken in the network stack, ahead of any userspace
//!   scheduling jitter.
//! * TX: event sends read the timestamp back from the socket error queue
//!   (`MSG_ERRQUEUE`), the kernel's echo of when the frame left the stack.
//!
//! Non-Linux builds fall back to userspace monotonic stamps on both paths.

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};

use crate::msg::PtpMessage;
use crate::tmv::Tmv;

/// PTP primary IPv4 multicast group.
pub const PTP_PRIMARY_MCAST: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
pub const EVENT_PORT: u16 = 319;
pub const GENERAL_PORT: u16 = 320;

/// Whether a send goes out the event socket (and wants a TX timestamp) or
/// the general socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    General,
    Event,
}

/// Frame I/O as consumed by the forwarding core. `send` with
/// [`SendKind::Event`] must fill the message's `hwts` with the transmit
/// timestamp when one was captured; `recv` fills `hwts` with the receive
/// timestamp.
pub trait Transport {
    fn send(&mut self, kind: SendKind, msg: &mut PtpMessage) -> Result<usize>;
    fn recv(&mut self, fd: RawFd, msg: &mut PtpMessage) -> Result<usize>;
}

// Linux timestamping constants. The SOF_* flags come from
// <linux/net_tstamp.h> and are not exposed by the libc crate.
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_SOFTWARE: libc::c_uint = 1 << 1;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_uint = 1 << 3;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_SOFTWARE: libc::c_uint = 1 << 4;
/// Error-queue reports carry only the timestamp, not a copy of the frame.
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_OPT_TSONLY: libc::c_uint = 1 << 11;

// cmsg buffer: cmsghdr (16B) + 3 × timespec (48B) + padding. 128B is safe.
#[cfg(target_os = "linux")]
const CMSG_CAP: usize = 128;

// How many 1 ms rounds to wait for the TX timestamp to surface on the
// error queue before declaring it missing.
#[cfg(target_os = "linux")]
const TX_TIMESTAMP_RETRIES: usize = 10;

pub struct UdpTransport {
    event: Socket,
    general: Socket,
    event_dst: SocketAddrV4,
    general_dst: SocketAddrV4,
}

impl UdpTransport {
    /// Opens both PTP sockets on `interface` and joins the primary group.
    pub fn open(interface: &str) -> Result<UdpTransport> {
        let iface_addr = resolve_interface_addr(interface)
            .with_context(|| format!("no IPv4 address on interface {}", interface))?;
        let event = Self::open_socket(EVENT_PORT, iface_addr)?;
        let general = Self::open_socket(GENERAL_PORT, iface_addr)?;

        #[cfg(target_os = "linux")]
        {
            let flags: libc::c_uint = SOF_TIMESTAMPING_TX_SOFTWARE
                | SOF_TIMESTAMPING_RX_SOFTWARE
                | SOF_TIMESTAMPING_SOFTWARE
                | SOF_TIMESTAMPING_OPT_TSONLY;
            let ret = unsafe {
                libc::setsockopt(
                    event.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPING,
                    &flags as *const _ as _,
                    std::mem::size_of::<libc::c_uint>() as _,
                )
            };
            if ret != 0 {
                bail!(
                    "SO_TIMESTAMPING failed on {}: {}",
                    interface,
                    std::io::Error::last_os_error()
                );
            }
        }

        Ok(UdpTransport {
            event,
            general,
            event_dst: SocketAddrV4::new(PTP_PRIMARY_MCAST, EVENT_PORT),
            general_dst: SocketAddrV4::new(PTP_PRIMARY_MCAST, GENERAL_PORT),
        })
    }

    fn open_socket(port: u16, iface_addr: Ipv4Addr) -> Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&PTP_PRIMARY_MCAST, &iface_addr)?;
        socket.set_multicast_if_v4(&iface_addr)?;
        // PTP multicast never leaves the link, and we must not hear our own
        // forwarded frames back.
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    pub fn event_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    pub fn general_fd(&self) -> RawFd {
        self.general.as_raw_fd()
    }

    /// Reads the TX timestamp report back from the error queue.
    #[cfg(target_os = "linux")]
    fn tx_timestamp(&self, fd: RawFd) -> Option<Tmv> {
        for _ in 0..TX_TIMESTAMP_RETRIES {
            let mut cmsg = [0u8; CMSG_CAP];
            let mut iov_buf = [0u8; 64];
            let mut iov = libc::iovec {
                iov_base: iov_buf.as_mut_ptr() as _,
                iov_len: iov_buf.len(),
            };
            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = cmsg.as_mut_ptr() as _;
            hdr.msg_controllen = CMSG_CAP;

            let n = unsafe {
                libc::recvmsg(fd, &mut hdr, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
            };
            if n >= 0 {
                if let Some(ts) = scm_timestamping(&hdr) {
                    return Some(ts);
                }
                continue;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                return None;
            }
            // Not surfaced yet; give the stack a moment.
            let mut pfd = libc::pollfd { fd, events: libc::POLLPRI, revents: 0 };
            unsafe { libc::poll(&mut pfd, 1, 1) };
        }
        None
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, kind: SendKind, msg: &mut PtpMessage) -> Result<usize> {
        let (socket, dst) = match kind {
            SendKind::Event => (&self.event, self.event_dst),
            SendKind::General => (&self.general, self.general_dst),
        };
        let n = socket.send_to(msg.wire(), &dst.into())?;
        if n == 0 {
            bail!("zero-length send");
        }
        if kind == SendKind::Event {
            #[cfg(target_os = "linux")]
            {
                msg.hwts = self.tx_timestamp(socket.as_raw_fd());
            }
            #[cfg(not(target_os = "linux"))]
            {
                msg.hwts = Some(crate::tmv::now());
            }
        }
        Ok(n)
    }

    fn recv(&mut self, fd: RawFd, msg: &mut PtpMessage) -> Result<usize> {
        #[cfg(target_os = "linux")]
        {
            let buf = msg.recv_buffer();
            let mut cmsg = [0u8; CMSG_CAP];
            let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as _, iov_len: buf.len() };
            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = cmsg.as_mut_ptr() as _;
            hdr.msg_controllen = CMSG_CAP;

            let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
            if n <= 0 {
                bail!("recvmsg: {}", std::io::Error::last_os_error());
            }
            msg.hwts = scm_timestamping(&hdr);
            Ok(n as usize)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let buf = msg.recv_buffer();
            let buf_uninit: &mut [std::mem::MaybeUninit<u8>] = unsafe {
                std::slice::from_raw_parts_mut(buf.as_mut_ptr() as _, buf.len())
            };
            let socket = if fd == self.event.as_raw_fd() { &self.event } else { &self.general };
            let n = socket.recv(buf_uninit)?;
            if n == 0 {
                bail!("zero-length recv");
            }
            msg.hwts = Some(crate::tmv::now());
            Ok(n)
        }
    }
}

/// Extracts the kernel timestamp from a `SCM_TIMESTAMPING` control message.
///
/// The payload is `struct scm_timestamping`: three timespecs, of which
/// index 0 carries the software stamp.
#[cfg(target_os = "linux")]
fn scm_timestamping(hdr: &libc::msghdr) -> Option<Tmv> {
    // SAFETY: hdr.msg_control points at our stack cmsg buffer; the CMSG_*
    // macros walk it bounded by msg_controllen.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == libc::SCM_TIMESTAMPING {
            let ts: [libc::timespec; 3] = unsafe {
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const [libc::timespec; 3])
            };
            let sw = &ts[0];
            if sw.tv_sec != 0 || sw.tv_nsec != 0 {
                return Some(Tmv::from_timespec(sw.tv_sec as i64, sw.tv_nsec as i64));
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(hdr, cmsg) };
    }
    None
}

/// First IPv4 address assigned to `interface`.
pub fn resolve_interface_addr(interface: &str) -> Result<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CStr;
        use std::ptr::null_mut;
        unsafe {
            let mut addrs: *mut libc::ifaddrs = null_mut();
            if libc::getifaddrs(&mut addrs) != 0 {
                bail!("getifaddrs failed");
            }
            let mut current = addrs;
            while !current.is_null() {
                let ifa = &*current;
                if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                    let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                    if name == interface
                        && (*ifa.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
                    {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                        libc::freeifaddrs(addrs);
                        return Ok(ip);
                    }
                }
                current = ifa.ifa_next;
            }
            libc::freeifaddrs(addrs);
        }
        bail!("interface {} not found", interface);
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = interface;
        Ok(Ipv4Addr::LOCALHOST)
    }
}

/// MAC address of `interface`, for deriving the clock identity.
pub fn interface_hwaddr(interface: &str) -> Result<[u8; 6]> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CStr;
        use std::ptr::null_mut;
        unsafe {
            let mut addrs: *mut libc::ifaddrs = null_mut();
            if libc::getifaddrs(&mut addrs) != 0 {
                bail!("getifaddrs failed");
            }
            let mut current = addrs;
            while !current.is_null() {
                let ifa = &*current;
                if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                    let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                    if name == interface
                        && (*ifa.ifa_addr).sa_family == libc::AF_PACKET as libc::sa_family_t
                    {
                        let sll = &*(ifa.ifa_addr as *const libc::sockaddr_ll);
                        if sll.sll_halen == 6 {
                            let mut mac = [0u8; 6];
                            mac.copy_from_slice(&sll.sll_addr[..6]);
                            libc::freeifaddrs(addrs);
                            return Ok(mac);
                        }
                    }
                }
                current = ifa.ifa_next;
            }
            libc::freeifaddrs(addrs);
        }
        bail!("no hardware address on interface {}", interface);
    }

    #[cfg(not(target_os = "linux"))]
    {
        bail!("hardware address lookup unsupported on this platform ({})", interface);
    }
}
