//! Datagram ancillary engine (C6): building and parsing `IP_PKTINFO` /
//! `IPV6_PKTINFO` control messages for [`crate::socket::Socket::send_to_from`]
//! and [`crate::socket::Socket::recv_from_to`].
//!
//! This is deliberately the only place in the crate that touches a raw
//! `msghdr`/`WSAMSG`. Everything above this module works in terms of
//! [`crate::addr::Addr`] and [`crate::addr::IpHint`]; this module's only job
//! is stamping the source-selection IP into (or reading it back out of) the
//! ancillary record, per spec.md §4.6 and the design note in spec.md §9 about
//! hiding the `ipi_spec_dst` vs `ipi_addr` field-name divergence behind one
//! helper.

use crate::{
    addr::{Addr, IpHint},
    error::{ErrorKind, OpFamily, SockResult, SocketError},
};

/// Best-effort enables receipt of PKTINFO ancillary data on a freshly-opened
/// datagram socket. Returns whether it succeeded; failure here is non-fatal
/// per spec.md §4.5 (`open`) and only degrades `recv_from_to` to the
/// `recv_from` fallback.
pub(crate) fn try_enable(socket: &socket2::Socket, v6: bool) -> bool {
    match platform::enable_recv_pktinfo(socket, v6) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, v6, "failed to enable PKTINFO receipt; recv_from_to will degrade to recv_from");
            false
        }
    }
}

/// `send_to_from` (spec.md §4.6). Degrades to a plain `send_to` by returning
/// `Ok(None)` when `have_pktinfo` is false or the hint is `IpHint::None`
/// (control length 0 per spec: "no ancillary records" is a valid, cheap
/// fast path, not a degradation).
pub(crate) fn send_to_from(
    socket: &socket2::Socket,
    remote: Addr,
    local_hint: IpHint,
    buf: &[u8],
) -> SockResult<usize> {
    platform::send_msg(socket, remote, local_hint, buf)
}

/// `recv_from_to` (spec.md §4.6). On success returns `(n, remote, local_ip)`;
/// `local_ip` is `IpHint::None` if no matching control record was present.
pub(crate) fn recv_from_to(socket: &socket2::Socket, buf: &mut [u8]) -> SockResult<(usize, Addr, IpHint)> {
    platform::recv_msg(socket, buf)
}

fn map_io(e: std::io::Error) -> SocketError {
    crate::error::map_error(OpFamily::Io { dgram: true }, e)
}

#[cfg(unix)]
mod platform {
    use std::{io, mem, os::fd::AsRawFd};

    use super::*;

    pub(super) fn enable_recv_pktinfo(socket: &socket2::Socket, v6: bool) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        let (level, name): (libc::c_int, libc::c_int) = if v6 {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
        } else {
            (libc::IPPROTO_IP, libc::IP_PKTINFO)
        };
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "linux")]
    const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    const SEND_FLAGS: libc::c_int = 0;

    /// One control buffer sized for the larger of the two PKTINFO records,
    /// via the platform's `CMSG_SPACE` macro (spec.md §4.6: "the buffer must
    /// be sized using the platform's CMSG alignment macros").
    fn cmsg_space_v4() -> usize {
        unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32) as usize }
    }
    fn cmsg_space_v6() -> usize {
        unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) as usize }
    }

    pub(super) fn send_msg(
        socket: &socket2::Socket,
        remote: Addr,
        local_hint: IpHint,
        buf: &[u8],
    ) -> SockResult<usize> {
        let fd = socket.as_raw_fd();
        let dest = remote.to_os();

        let mut cmsg_buf = match local_hint {
            IpHint::None => Vec::new(),
            IpHint::V4(_) => vec![0u8; cmsg_space_v4()],
            IpHint::V6(_) => vec![0u8; cmsg_space_v6()],
        };

        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
        mhdr.msg_name = dest.as_ptr() as *mut libc::c_void;
        mhdr.msg_namelen = dest.len();
        mhdr.msg_iov = &mut iov;
        mhdr.msg_iovlen = 1;

        if !cmsg_buf.is_empty() {
            mhdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            mhdr.msg_controllen = cmsg_buf.len() as _;

            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&mhdr);
                debug_assert!(!cmsg.is_null());
                match local_hint {
                    IpHint::V4(ip) => {
                        (*cmsg).cmsg_level = libc::IPPROTO_IP;
                        (*cmsg).cmsg_type = libc::IP_PKTINFO;
                        (*cmsg).cmsg_len =
                            libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;
                        let info = libc::in_pktinfo {
                            ipi_ifindex: 0,
                            ipi_spec_dst: libc::in_addr { s_addr: ip.to_be() },
                            ipi_addr: libc::in_addr { s_addr: 0 },
                        };
                        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, info);
                    }
                    IpHint::V6(ip) => {
                        (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
                        (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
                        (*cmsg).cmsg_len =
                            libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
                        let info = libc::in6_pktinfo {
                            ipi6_addr: libc::in6_addr { s6_addr: ip },
                            ipi6_ifindex: 0,
                        };
                        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, info);
                    }
                    IpHint::None => unreachable!("empty cmsg_buf handled above"),
                }
            }
        }

        let rc = unsafe { libc::sendmsg(fd, &mhdr, SEND_FLAGS) };
        if rc < 0 {
            Err(map_io(io::Error::last_os_error()))
        } else {
            Ok(rc as usize)
        }
    }

    /// A control buffer large enough for one IPv4 *or* IPv6 PKTINFO record
    /// (spec.md §4.6: "a control buffer large enough for one IPv4 or IPv6
    /// PKTINFO record").
    fn recv_cmsg_capacity() -> usize {
        cmsg_space_v4().max(cmsg_space_v6())
    }

    pub(super) fn recv_msg(socket: &socket2::Socket, buf: &mut [u8]) -> SockResult<(usize, Addr, IpHint)> {
        let fd = socket.as_raw_fd();
        let mut src_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut cmsg_buf = vec![0u8; recv_cmsg_capacity()];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
        mhdr.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
        mhdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
        mhdr.msg_iov = &mut iov;
        mhdr.msg_iovlen = 1;
        mhdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        mhdr.msg_controllen = cmsg_buf.len() as _;

        let rc = unsafe { libc::recvmsg(fd, &mut mhdr, 0) };
        if rc < 0 {
            return Err(map_io(io::Error::last_os_error()));
        }

        let remote = unsafe { sockaddr_storage_to_addr(&src_storage, mhdr.msg_namelen as usize)? };

        let mut local_ip = IpHint::None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&mhdr);
            while !cmsg.is_null() {
                match ((*cmsg).cmsg_level, (*cmsg).cmsg_type) {
                    (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                        let info = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                        local_ip = IpHint::V4(u32::from_be(info.ipi_addr.s_addr));
                    }
                    (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                        let info = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                        local_ip = IpHint::V6(info.ipi6_addr.s6_addr);
                    }
                    // All other control records are ignored (spec.md §4.6).
                    _ => {}
                }
                cmsg = libc::CMSG_NXTHDR(&mhdr, cmsg);
            }
        }

        Ok((rc as usize, remote, local_ip))
    }

    unsafe fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage, len: usize) -> SockResult<Addr> {
        let sockaddr = socket2::SockAddr::new(*(storage as *const _ as *const _), len as libc::socklen_t);
        Addr::from_os(&sockaddr)
    }
}

#[cfg(windows)]
mod platform {
    use std::{io, mem, os::windows::io::AsRawSocket, ptr, sync::OnceLock};

    use windows_sys::Win32::Networking::WinSock::{
        self, IN6_PKTINFO, IN_PKTINFO, LPFN_WSARECVMSG, SOCKET, SOCKET_ERROR, WSABUF, WSAID_WSARECVMSG, WSAMSG,
    };

    use super::*;

    pub(super) fn enable_recv_pktinfo(socket: &socket2::Socket, v6: bool) -> io::Result<()> {
        let sock = socket.as_raw_socket() as SOCKET;
        let (level, name): (i32, i32) = if v6 {
            (WinSock::IPPROTO_IPV6.0 as i32, WinSock::IPV6_PKTINFO as i32)
        } else {
            (WinSock::IPPROTO_IP.0 as i32, WinSock::IP_PKTINFO as i32)
        };
        let one: i32 = 1;
        let rc = unsafe {
            WinSock::setsockopt(
                sock,
                level,
                name,
                &one as *const _ as *const u8,
                mem::size_of::<i32>() as i32,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// `WSARecvMsg` is not exported directly; it must be looked up per-socket
    /// via `WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER)`. Cached once per
    /// process: in practice every socket on a given address family resolves
    /// to the same provider function (spec.md §4.6's "extension function
    /// pointer" note).
    fn wsa_recvmsg_fn(sock: SOCKET) -> Option<LPFN_WSARECVMSG> {
        static CACHE: OnceLock<Option<usize>> = OnceLock::new();
        let cached = *CACHE.get_or_init(|| {
            let mut fn_ptr: usize = 0;
            let mut bytes_returned: u32 = 0;
            let rc = unsafe {
                WinSock::WSAIoctl(
                    sock,
                    WinSock::SIO_GET_EXTENSION_FUNCTION_POINTER,
                    &WSAID_WSARECVMSG as *const _ as *const std::ffi::c_void,
                    mem::size_of_val(&WSAID_WSARECVMSG) as u32,
                    &mut fn_ptr as *mut _ as *mut std::ffi::c_void,
                    mem::size_of::<usize>() as u32,
                    &mut bytes_returned,
                    ptr::null_mut(),
                    None,
                )
            };
            if rc == SOCKET_ERROR || fn_ptr == 0 {
                None
            } else {
                Some(fn_ptr)
            }
        });
        cached.map(|ptr| unsafe { mem::transmute::<usize, LPFN_WSARECVMSG>(ptr) })
    }

    fn cmsg_space(payload_len: usize) -> usize {
        let hdr = mem::size_of::<WinSock::CMSGHDR>();
        let align = mem::size_of::<usize>();
        let data_end = hdr + payload_len;
        (data_end + align - 1) & !(align - 1)
    }

    pub(super) fn send_msg(
        socket: &socket2::Socket,
        remote: Addr,
        local_hint: IpHint,
        buf: &[u8],
    ) -> SockResult<usize> {
        let sock = socket.as_raw_socket() as SOCKET;
        let dest = remote.to_os();

        let mut cmsg_buf = match local_hint {
            IpHint::None => Vec::new(),
            IpHint::V4(_) => vec![0u8; cmsg_space(mem::size_of::<IN_PKTINFO>())],
            IpHint::V6(_) => vec![0u8; cmsg_space(mem::size_of::<IN6_PKTINFO>())],
        };

        if !cmsg_buf.is_empty() {
            unsafe {
                let hdr = cmsg_buf.as_mut_ptr() as *mut WinSock::CMSGHDR;
                let data_ptr = cmsg_buf.as_mut_ptr().add(mem::size_of::<WinSock::CMSGHDR>());
                match local_hint {
                    IpHint::V4(ip) => {
                        (*hdr).cmsg_len = cmsg_space(mem::size_of::<IN_PKTINFO>());
                        (*hdr).cmsg_level = WinSock::IPPROTO_IP.0 as i32;
                        (*hdr).cmsg_type = WinSock::IP_PKTINFO as i32;
                        let info = IN_PKTINFO {
                            ipi_addr: WinSock::IN_ADDR {
                                S_un: WinSock::IN_ADDR_0 { S_addr: ip.to_be() },
                            },
                            ipi_ifindex: 0,
                        };
                        ptr::write_unaligned(data_ptr as *mut IN_PKTINFO, info);
                    }
                    IpHint::V6(ip) => {
                        (*hdr).cmsg_len = cmsg_space(mem::size_of::<IN6_PKTINFO>());
                        (*hdr).cmsg_level = WinSock::IPPROTO_IPV6.0 as i32;
                        (*hdr).cmsg_type = WinSock::IPV6_PKTINFO as i32;
                        let info = IN6_PKTINFO {
                            ipi6_addr: WinSock::IN6_ADDR {
                                u: WinSock::IN6_ADDR_0 { Byte: ip },
                            },
                            ipi6_ifindex: 0,
                        };
                        ptr::write_unaligned(data_ptr as *mut IN6_PKTINFO, info);
                    }
                    IpHint::None => unreachable!("empty cmsg_buf handled above"),
                }
            }
        }

        let mut data_buf = WSABUF {
            len: buf.len() as u32,
            buf: buf.as_ptr() as *mut u8,
        };
        let mut msg = WSAMSG {
            name: dest.as_ptr() as *mut _,
            namelen: dest.len(),
            lpBuffers: &mut data_buf,
            dwBufferCount: 1,
            Control: WSABUF {
                len: cmsg_buf.len() as u32,
                buf: if cmsg_buf.is_empty() { ptr::null_mut() } else { cmsg_buf.as_mut_ptr() },
            },
            dwFlags: 0,
        };

        let mut sent: u32 = 0;
        // `WSASendMsg` is exported directly (unlike `WSARecvMsg`); no
        // extension lookup needed for the send path.
        let rc = unsafe { WinSock::WSASendMsg(sock, &mut msg, 0, &mut sent, ptr::null_mut(), None) };
        if rc == SOCKET_ERROR {
            Err(map_io(io::Error::last_os_error()))
        } else {
            Ok(sent as usize)
        }
    }

    pub(super) fn recv_msg(socket: &socket2::Socket, buf: &mut [u8]) -> SockResult<(usize, Addr, IpHint)> {
        let sock = socket.as_raw_socket() as SOCKET;
        let recvmsg = match wsa_recvmsg_fn(sock) {
            Some(f) => f,
            None => {
                tracing::warn!("WSARecvMsg extension function unavailable; recv_from_to degrading");
                return Err(SocketError::new(ErrorKind::Unknown));
            }
        };

        let cap = cmsg_space(mem::size_of::<IN_PKTINFO>()).max(cmsg_space(mem::size_of::<IN6_PKTINFO>()));
        let mut cmsg_buf = vec![0u8; cap];
        let mut src_storage: WinSock::SOCKADDR_STORAGE = unsafe { mem::zeroed() };

        let mut data_buf = WSABUF {
            len: buf.len() as u32,
            buf: buf.as_mut_ptr(),
        };
        let mut msg = WSAMSG {
            name: &mut src_storage as *mut _ as *mut _,
            namelen: mem::size_of::<WinSock::SOCKADDR_STORAGE>() as i32,
            lpBuffers: &mut data_buf,
            dwBufferCount: 1,
            Control: WSABUF {
                len: cmsg_buf.len() as u32,
                buf: cmsg_buf.as_mut_ptr(),
            },
            dwFlags: 0,
        };

        let mut received: u32 = 0;
        let rc = unsafe { recvmsg(sock, &mut msg, &mut received, ptr::null_mut(), None) };
        if rc == SOCKET_ERROR {
            return Err(map_io(io::Error::last_os_error()));
        }

        let remote = unsafe {
            let sockaddr = socket2::SockAddr::new(
                *(&src_storage as *const _ as *const _),
                msg.namelen,
            );
            Addr::from_os(&sockaddr)?
        };

        let mut local_ip = IpHint::None;
        unsafe {
            let mut offset = 0usize;
            while offset + mem::size_of::<WinSock::CMSGHDR>() <= msg.Control.len as usize {
                let hdr = cmsg_buf.as_ptr().add(offset) as *const WinSock::CMSGHDR;
                let cmsg_len = (*hdr).cmsg_len;
                if cmsg_len < mem::size_of::<WinSock::CMSGHDR>() {
                    break;
                }
                let data_ptr = cmsg_buf.as_ptr().add(offset + mem::size_of::<WinSock::CMSGHDR>());
                match ((*hdr).cmsg_level, (*hdr).cmsg_type) {
                    (lvl, ty) if lvl == WinSock::IPPROTO_IP.0 as i32 && ty == WinSock::IP_PKTINFO as i32 => {
                        let info = ptr::read_unaligned(data_ptr as *const IN_PKTINFO);
                        local_ip = IpHint::V4(u32::from_be(info.ipi_addr.S_un.S_addr));
                    }
                    (lvl, ty) if lvl == WinSock::IPPROTO_IPV6.0 as i32 && ty == WinSock::IPV6_PKTINFO as i32 => {
                        let info = ptr::read_unaligned(data_ptr as *const IN6_PKTINFO);
                        local_ip = IpHint::V6(info.ipi6_addr.u.Byte);
                    }
                    _ => {}
                }
                let align = mem::size_of::<usize>();
                let advance = (cmsg_len + align - 1) & !(align - 1);
                if advance == 0 {
                    break;
                }
                offset += advance;
            }
        }

        Ok((received as usize, remote, local_ip))
    }
}
