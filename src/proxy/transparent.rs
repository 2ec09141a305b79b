//! Original-destination recovery for transparent mode. On Linux, a
//! connection redirected by an iptables `REDIRECT`/TPROXY rule still
//! exposes the client's original destination via the `SO_ORIGINAL_DST`
//! socket option; the original proxy relied on the same mechanism
//! (documented in `read_request_transparent`'s reliance on the platform
//! resolver passed into the handler).

use std::net::SocketAddr;
use tokio::net::TcpStream;

pub trait OriginalDestinationResolver: Send + Sync {
    fn resolve(&self, stream: &TcpStream) -> std::io::Result<SocketAddr>;
}

/// Linux implementation using `getsockopt(SO_ORIGINAL_DST)`. Netfilter
/// defines `SO_ORIGINAL_DST` as 80 under `SOL_IP`; neither `libc` nor
/// `socket2` expose it as a typed option since it's Linux/netfilter
/// specific rather than POSIX, so this reaches the raw syscall directly.
#[cfg(target_os = "linux")]
pub struct LinuxOriginalDst;

#[cfg(target_os = "linux")]
impl OriginalDestinationResolver for LinuxOriginalDst {
    fn resolve(&self, stream: &TcpStream) -> std::io::Result<SocketAddr> {
        use std::os::fd::AsRawFd;

        const SO_ORIGINAL_DST: libc::c_int = 80;

        let fd = stream.as_raw_fd();
        unsafe {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let ret = libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::from((ip, port)))
        }
    }
}

/// No-op resolver for non-Linux targets. Transparent mode is a
/// Linux-only feature, matching the original implementation's reliance
/// on netfilter; on other platforms it fails startup validation rather
/// than silently misbehaving.
pub struct UnsupportedResolver;

impl OriginalDestinationResolver for UnsupportedResolver {
    fn resolve(&self, _stream: &TcpStream) -> std::io::Result<SocketAddr> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "transparent mode original-destination recovery is only supported on Linux",
        ))
    }
}

/// Build the resolver for the current platform.
pub fn platform_resolver() -> Box<dyn OriginalDestinationResolver> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxOriginalDst)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedResolver)
    }
}
