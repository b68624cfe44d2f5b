//! Linux client-side RFCOMM connect: a raw `AF_BLUETOOTH`/`BTPROTO_RFCOMM`
//! socket, wired into tokio via [`AsyncFd`] rather than BlueZ's D-Bus
//! API. SPEC_FULL.md §6 calls for the exact wire-level connect sequence
//! (address byte order, channel probing) that only a direct syscall
//! path can express; `btlink-server`'s Linux listen side uses `bluer`'s
//! D-Bus profile API instead, since registering a listening SPP service
//! is naturally a BlueZ-managed operation.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use btlink_core::{LinkConnector, LinkError};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

/// Channels probed, in order, when the target device's exact SPP
/// channel is unknown (SPEC_FULL.md §6).
const CHANNEL_PROBE_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

#[repr(C)]
#[derive(Clone, Copy)]
struct BdAddr {
    b: [u8; 6],
}

#[repr(C)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

/// Connects to a fixed peer MAC over RFCOMM, probing channels 1..=5.
pub struct LinuxRfcommConnector {
    mac: [u8; 6],
}

impl LinuxRfcommConnector {
    pub fn new(mac: [u8; 6]) -> Self {
        Self { mac }
    }
}

#[async_trait]
impl LinkConnector for LinuxRfcommConnector {
    type Stream = LinuxBtStream;

    async fn connect(&self) -> Result<Self::Stream, LinkError> {
        let mac = self.mac;
        let fd = tokio::task::spawn_blocking(move || connect_blocking(mac))
            .await
            .map_err(|_| LinkError::Closed)??;

        set_write_timeout(fd);
        set_nonblocking(fd)?;
        let async_fd = AsyncFd::new(RawFdGuard(fd)).map_err(LinkError::Io)?;
        Ok(LinuxBtStream { inner: async_fd })
    }
}

/// SPEC_FULL.md §9: advisory 5s write deadline on the underlying
/// socket, best-effort (failure to set `SO_SNDTIMEO` is not fatal —
/// it just means writes can block indefinitely on a wedged peer).
/// `socket2` owns the setsockopt call; the fd itself stays owned by the
/// caller (`into_raw_fd` on the wrapper prevents a double-close).
fn set_write_timeout(fd: RawFd) {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
    if let Err(e) = sock.set_write_timeout(Some(std::time::Duration::from_secs(5))) {
        debug!(error = %e, "failed to set SO_SNDTIMEO, continuing without a write deadline");
    }
    let _ = sock.into_raw_fd(); // give the fd back; do not close it here
}

/// BlueZ addresses a peer little-endian-reversed relative to the
/// conventional display order (`AA:BB:CC:DD:EE:FF` on the wire is
/// `FF:EE:DD:CC:BB:AA`).
fn reversed(mac: [u8; 6]) -> [u8; 6] {
    let mut out = mac;
    out.reverse();
    out
}

/// A failed `connect()` on a `SOCK_STREAM` socket leaves it unusable for
/// a subsequent attempt (`EALREADY`/`EISCONN`/`EINVAL`), so each channel
/// probed below needs its own fresh socket — reusing one fd across the
/// loop would only ever really try channel 1.
fn connect_blocking(mac: [u8; 6]) -> Result<RawFd, LinkError> {
    let mut last_err = None;
    for channel in CHANNEL_PROBE_RANGE {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if fd < 0 {
            return Err(LinkError::Io(io::Error::last_os_error()));
        }

        let addr = SockaddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: BdAddr { b: reversed(mac) },
            rc_channel: channel,
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &addr as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        debug!(channel, error = %err, "rfcomm connect attempt failed, trying next channel");
        unsafe { libc::close(fd) };
        last_err = Some(err);
    }

    Err(LinkError::Io(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no channel accepted"))))
}

fn set_nonblocking(fd: RawFd) -> Result<(), LinkError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(LinkError::Io(io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(LinkError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

struct RawFdGuard(RawFd);

impl AsRawFd for RawFdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for RawFdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// An async `AF_BLUETOOTH` RFCOMM stream, driven by epoll readiness via
/// [`AsyncFd`] (the same pattern tokio uses internally for its own
/// socket types, applied here to a socket family mio doesn't know
/// about).
pub struct LinuxBtStream {
    inner: AsyncFd<RawFdGuard>,
}

impl AsyncRead for LinuxBtStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let fd = this.inner.get_ref().0;
            let unfilled = buf.initialize_unfilled();
            let n = unsafe { libc::recv(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len(), 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                return Poll::Ready(Err(err));
            }
            buf.advance(n as usize);
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for LinuxBtStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let fd = this.inner.get_ref().0;
            let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                return Poll::Ready(Err(err));
            }
            return Poll::Ready(Ok(n as usize));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let fd = self.inner.get_ref().0;
        unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_reversal_round_trips() {
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        assert_eq!(reversed(mac), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(reversed(reversed(mac)), mac);
    }
}
