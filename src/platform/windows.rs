//! Windows client-side RFCOMM connect via raw Winsock.
//!
//! Windows has no portable, stable way to register an arbitrary
//! `SOCKET` with tokio's reactor (mio only understands the handle
//! kinds it creates itself), so unlike the Linux connector this one
//! bridges the blocking socket into async code with two dedicated
//! OS threads pumping length-delimited `Bytes` chunks through bounded
//! channels — the same bridging idiom used for any blocking/foreign
//! I/O resource that must present an `AsyncRead + AsyncWrite` face.

use std::io;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use btlink_core::{LinkConnector, LinkError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::warn;
use windows_sys::Win32::Networking::WinSock::{
    closesocket, connect, socket, WSAGetLastError, WSAStartup, INVALID_SOCKET, SOCKET, SOCKET_ERROR,
    WSADATA,
};

/// Microsoft's `AF_BTH` / `BTHPROTO_RFCOMM` are not exposed by the
/// `windows-sys` WinSock module (they live in the Bluetooth-specific
/// headers); the numeric values are stable ABI constants.
const AF_BTH: i32 = 32;
const BTHPROTO_RFCOMM: i32 = 0x0003;

/// Serial Port Profile UUID, `00001101-0000-1000-8000-00805F9B34FB`, as
/// a Windows `GUID`.
#[repr(C)]
#[derive(Clone, Copy)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

const SPP_UUID: Guid = Guid {
    data1: 0x0000_1101,
    data2: 0x0000,
    data3: 0x1000,
    data4: [0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB],
};

/// Must be packed: a natural `#[repr(C)]` layout aligns `bt_addr: u64`
/// to an 8-byte boundary, pushing every field after `addr_family` off
/// spec §6's wire offsets (`bt_addr` at 2, `service_class_id` at 10,
/// `port` at 26, total size 30) and inflating `size_of` to 40. Windows'
/// real `SOCKADDR_BTH` has no such padding.
#[repr(C, packed)]
struct SockaddrBth {
    addr_family: u16,
    bt_addr: u64,
    service_class_id: Guid,
    port: u32,
}

/// `SOCKADDR_BTH`'s wire size (spec §6): `family:u16` + `bt_addr:u64` +
/// `service_class_guid:16` + `port:u32` = 30 bytes, packed.
const SOCKADDR_BTH_LEN: i32 = 30;

fn ensure_winsock() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        let mut data: WSADATA = std::mem::zeroed();
        WSAStartup(0x0202, &mut data);
    });
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

/// Connects to a fixed peer MAC over RFCOMM by SDP-resolved SPP service
/// (`port: 0` plus `service_class_id` — the standard Windows pattern,
/// in place of the channel probing the Linux raw-socket path needs).
pub struct WindowsRfcommConnector {
    mac: [u8; 6],
}

impl WindowsRfcommConnector {
    pub fn new(mac: [u8; 6]) -> Self {
        Self { mac }
    }
}

#[async_trait]
impl LinkConnector for WindowsRfcommConnector {
    type Stream = WindowsBtStream;

    async fn connect(&self) -> Result<Self::Stream, LinkError> {
        let mac = self.mac;
        let sock = tokio::task::spawn_blocking(move || connect_blocking(mac))
            .await
            .map_err(|_| LinkError::Closed)??;
        Ok(WindowsBtStream::spawn(sock))
    }
}

fn mac_to_bt_addr(mac: [u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn connect_blocking(mac: [u8; 6]) -> Result<OwnedSocket, LinkError> {
    ensure_winsock();

    let sock = unsafe { socket(AF_BTH, windows_sys::Win32::Networking::WinSock::SOCK_STREAM as i32, BTHPROTO_RFCOMM) };
    if sock == INVALID_SOCKET {
        return Err(LinkError::Io(last_error()));
    }

    let addr = SockaddrBth {
        addr_family: AF_BTH as u16,
        bt_addr: mac_to_bt_addr(mac),
        service_class_id: SPP_UUID,
        port: 0,
    };

    let ret = unsafe {
        connect(
            sock,
            &addr as *const SockaddrBth as *const windows_sys::Win32::Networking::WinSock::SOCKADDR,
            SOCKADDR_BTH_LEN,
        )
    };
    if ret == SOCKET_ERROR {
        let err = last_error();
        unsafe { closesocket(sock) };
        return Err(LinkError::Io(err));
    }

    set_write_timeout(sock);
    Ok(OwnedSocket(sock))
}

/// SPEC_FULL.md §9 / spec.md §9: advisory 5s write deadline, applied
/// the same way the Linux connector does it — via `socket2`'s
/// `SO_SNDTIMEO` setter rather than a hand-rolled `setsockopt` call —
/// ignored if the platform rejects it.
fn set_write_timeout(sock: SOCKET) {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    let s = unsafe { socket2::Socket::from_raw_socket(sock as _) };
    if let Err(e) = s.set_write_timeout(Some(std::time::Duration::from_secs(5))) {
        warn!(error = %e, "failed to set SO_SNDTIMEO, continuing without a write deadline");
    }
    let _ = s.into_raw_socket();
}

struct OwnedSocket(SOCKET);

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        unsafe {
            closesocket(self.0);
        }
    }
}

// SOCKET is an opaque handle; Windows has no thread-affinity
// requirement for socket I/O.
unsafe impl Send for OwnedSocket {}

const READ_CHUNK: usize = 4096;

/// An async face over a blocking Winsock RFCOMM socket, pumped by two
/// background threads. Dropping this stops both pumps (the socket
/// closes, unblocking whichever pump is mid-syscall).
pub struct WindowsBtStream {
    to_socket: mpsc::Sender<Bytes>,
    from_socket: mpsc::Receiver<Bytes>,
    leftover: Option<Bytes>,
}

impl WindowsBtStream {
    fn spawn(sock: OwnedSocket) -> Self {
        let sock = std::sync::Arc::new(sock);

        let (to_socket_tx, mut to_socket_rx) = mpsc::channel::<Bytes>(64);
        let (from_socket_tx, from_socket_rx) = mpsc::channel::<Bytes>(64);

        let writer_sock = sock.clone();
        std::thread::spawn(move || {
            while let Some(chunk) = to_socket_rx.blocking_recv() {
                let ret = unsafe {
                    windows_sys::Win32::Networking::WinSock::send(
                        writer_sock.0,
                        chunk.as_ptr() as *const u8,
                        chunk.len() as i32,
                        0,
                    )
                };
                if ret == SOCKET_ERROR {
                    warn!("rfcomm socket write failed, stopping writer pump");
                    break;
                }
            }
        });

        let reader_sock = sock;
        std::thread::spawn(move || loop {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = unsafe {
                windows_sys::Win32::Networking::WinSock::recv(reader_sock.0, buf.as_mut_ptr(), buf.len() as i32, 0)
            };
            if n <= 0 {
                break;
            }
            buf.truncate(n as usize);
            if from_socket_tx.blocking_send(Bytes::from(buf)).is_err() {
                break;
            }
        });

        Self {
            to_socket: to_socket_tx,
            from_socket: from_socket_rx,
            leftover: None,
        }
    }
}

impl AsyncRead for WindowsBtStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let chunk = if let Some(pending) = this.leftover.take() {
            pending
        } else {
            match this.from_socket.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF: leave buf unfilled
                Poll::Pending => return Poll::Pending,
            }
        };

        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..n]);
        if n < chunk.len() {
            this.leftover = Some(chunk.slice(n..));
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for WindowsBtStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.to_socket.poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len();
                if this.to_socket.try_send(Bytes::copy_from_slice(buf)).is_err() {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "rfcomm writer pump stopped")));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "rfcomm writer pump stopped"))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_to_bt_addr_packs_big_endian() {
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        assert_eq!(mac_to_bt_addr(mac), 0x0000_AABB_CCDD_EEFF);
    }

    #[test]
    fn spp_uuid_matches_serial_port_profile() {
        assert_eq!(SPP_UUID.data1, 0x1101);
        assert_eq!(SPP_UUID.data4, [0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB]);
    }

    #[test]
    fn sockaddr_bth_is_packed_to_spec_offsets() {
        assert_eq!(std::mem::size_of::<SockaddrBth>(), 30);
        assert_eq!(SOCKADDR_BTH_LEN, 30);

        let addr = SockaddrBth {
            addr_family: AF_BTH as u16,
            bt_addr: mac_to_bt_addr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            service_class_id: SPP_UUID,
            port: 0,
        };
        let base = &addr as *const SockaddrBth as usize;
        let bt_addr_off = std::ptr::addr_of!(addr.bt_addr) as usize - base;
        let guid_off = std::ptr::addr_of!(addr.service_class_id) as usize - base;
        let port_off = std::ptr::addr_of!(addr.port) as usize - base;
        assert_eq!(bt_addr_off, 2);
        assert_eq!(guid_off, 10);
        assert_eq!(port_off, 26);
    }
}
