//! Netlink link-status monitoring.
//!
//! Each port keeps a small AF_NETLINK socket subscribed to RTNLGRP_LINK.
//! When the kernel announces a link change the poll loop hands the fd to
//! [`link_status`], which drains the socket and reports the most recent
//! carrier state for the port's interface.

use anyhow::Result;
use std::os::fd::RawFd;

/// Opens a route-netlink socket subscribed to link notifications and
/// resolves the interface index. Returns `(fd, ifindex)`.
pub fn open(interface: &str) -> Result<(RawFd, i32)> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;

        let c_name = CString::new(interface)?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            anyhow::bail!("unknown interface {}", interface);
        }

        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            anyhow::bail!("netlink socket: {}", std::io::Error::last_os_error());
        }

        let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sa.nl_groups = libc::RTMGRP_LINK as u32;
        let ret = unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            anyhow::bail!("netlink bind: {}", err);
        }
        Ok((fd, ifindex as i32))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("link monitoring unsupported on this platform ({})", interface);
    }
}

/// Drains pending notifications from `fd` and returns the latest carrier
/// state seen for `ifindex`, or `None` when no relevant message arrived.
pub fn link_status(fd: RawFd, ifindex: i32) -> Option<bool> {
    #[cfg(target_os = "linux")]
    {
        // struct nlmsghdr is 16 bytes: len u32, type u16, flags u16,
        // seq u32, pid u32. RTM_NEWLINK carries an ifinfomsg right after:
        // family u8, pad u8, type u16, index i32, flags u32, change u32.
        const NLMSG_HDR_LEN: usize = 16;
        const IFINFO_LEN: usize = 16;

        let mut latest = None;
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as _, buf.len(), 0) };
            if n <= 0 {
                break;
            }
            let n = n as usize;
            let mut off = 0usize;
            while off + NLMSG_HDR_LEN <= n {
                let nlen =
                    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
                if nlen < NLMSG_HDR_LEN || off + nlen > n {
                    break;
                }
                let ntype = u16::from_ne_bytes(buf[off + 4..off + 6].try_into().unwrap());
                if (ntype == libc::RTM_NEWLINK || ntype == libc::RTM_DELLINK)
                    && nlen >= NLMSG_HDR_LEN + IFINFO_LEN
                {
                    let body = off + NLMSG_HDR_LEN;
                    let index =
                        i32::from_ne_bytes(buf[body + 4..body + 8].try_into().unwrap());
                    if index == ifindex {
                        if ntype == libc::RTM_DELLINK {
                            latest = Some(false);
                        } else {
                            let flags = u32::from_ne_bytes(
                                buf[body + 8..body + 12].try_into().unwrap(),
                            );
                            latest = Some(flags & libc::IFF_RUNNING as u32 != 0);
                        }
                    }
                }
                // Messages are 4-byte aligned.
                off += (nlen + 3) & !3;
            }
        }
        latest
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, ifindex);
        None
    }
}
