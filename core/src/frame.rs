//! Length-prefixed framing over the Physical Link.
//!
//! Every frame on the wire is:
//! ```text
//! [ id:u16 BE ][ length:u16 BE ][ payload: length bytes ]
//! ```
//! `id == 0` is the reserved control channel (see [`control`]); any other
//! id identifies one multiplexed logical stream. There is a single
//! serialized writer per link so header and payload bytes of one frame
//! are never interleaved with another frame's bytes.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FrameError;

/// Stream id reserved for control frames.
pub const CONTROL_STREAM_ID: u16 = 0;

/// Maximum payload length accepted on the wire. A declared length above
/// this is a framing violation that forces the caller to resynchronize
/// by tearing down and reconnecting the Physical Link.
pub const MAX_PAYLOAD: u16 = 2048;

const HEADER_LEN: usize = 4;

/// Write one frame (`header` + `payload`) to `writer`. Returns the total
/// number of bytes written on success. Callers must serialize calls to
/// this function per link (the Mux Manager's write mutex does this) so
/// that no two frames' bytes interleave.
pub async fn write_frame<W>(writer: &mut W, id: u16, payload: &[u8]) -> Result<usize, FrameError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= MAX_PAYLOAD as usize, "caller must chunk payloads to MAX_PAYLOAD");

    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&id.to_be_bytes());
    header[2..4].copy_from_slice(&(payload.len() as u16).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    Ok(HEADER_LEN + payload.len())
}

/// Read exactly one frame from `reader`. A declared length over
/// [`MAX_PAYLOAD`] is reported as [`FrameError::PayloadTooLarge`]; the
/// caller (the Mux Manager's reader task) must treat that, and any
/// short read mid-frame, as unrecoverable without a link reconnect.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u16, Bytes), FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let id = u16::from_be_bytes([header[0], header[1]]);
    let len = u16::from_be_bytes([header[2], header[3]]);

    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut payload = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut payload).await?;

    Ok((id, payload.freeze()))
}

/// Control-frame (`id == 0`) payload: a request to open a new stream to
/// an IP target. Two wire shapes, distinguished by payload length.
pub mod control {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    /// `new_id:u16 BE + ipv4:4 + port:u16 BE`.
    pub const IPV4_PAYLOAD_LEN: usize = 8;
    /// `new_id:u16 BE + ipv6:16 + port:u16 BE`.
    pub const IPV6_PAYLOAD_LEN: usize = 20;

    /// Encode an open-stream control payload for `target` under `new_id`.
    pub fn encode(new_id: u16, target: SocketAddr) -> Vec<u8> {
        match target.ip() {
            IpAddr::V4(ip) => {
                let mut buf = Vec::with_capacity(IPV4_PAYLOAD_LEN);
                buf.extend_from_slice(&new_id.to_be_bytes());
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&target.port().to_be_bytes());
                buf
            }
            IpAddr::V6(ip) => {
                let mut buf = Vec::with_capacity(IPV6_PAYLOAD_LEN);
                buf.extend_from_slice(&new_id.to_be_bytes());
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&target.port().to_be_bytes());
                buf
            }
        }
    }

    /// Decode an open-stream control payload. Any length other than
    /// [`IPV4_PAYLOAD_LEN`] or [`IPV6_PAYLOAD_LEN`] is not a valid
    /// control frame and must be discarded by the caller (and may be
    /// logged); this function reflects that with `None`.
    pub fn decode(payload: &[u8]) -> Option<(u16, SocketAddr)> {
        match payload.len() {
            IPV4_PAYLOAD_LEN => {
                let new_id = u16::from_be_bytes([payload[0], payload[1]]);
                let ip = Ipv4Addr::new(payload[2], payload[3], payload[4], payload[5]);
                let port = u16::from_be_bytes([payload[6], payload[7]]);
                Some((new_id, SocketAddr::new(IpAddr::V4(ip), port)))
            }
            IPV6_PAYLOAD_LEN => {
                let new_id = u16::from_be_bytes([payload[0], payload[1]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[2..18]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([payload[18], payload[19]]);
                Some((new_id, SocketAddr::new(IpAddr::V6(ip), port)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

    #[tokio::test]
    async fn write_then_read_data_frame_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 0x1234, b"hello").await.unwrap();
        // S3: `12 34 00 05 68 65 6C 6C 6F`
        assert_eq!(buf, vec![0x12, 0x34, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

        let mut cursor = std::io::Cursor::new(buf);
        let (id, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(id, 0x1234);
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&(MAX_PAYLOAD + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(l) if l == MAX_PAYLOAD + 1));
    }

    #[test]
    fn control_encode_ipv4_matches_s1() {
        // S1: client opens a stream to 10.0.0.1:22
        let target: SocketAddr = "10.0.0.1:22".parse().unwrap();
        let payload = control::encode(0x0000, target);
        assert_eq!(payload, vec![0x00, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x00, 0x16]);
        assert_eq!(payload.len(), control::IPV4_PAYLOAD_LEN);
    }

    #[test]
    fn control_encode_ipv6_matches_s2() {
        // S2: client opens a stream to 2001:db8::1:80
        let target = SocketAddr::new(
            Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 1).into(),
            0x50,
        );
        let payload = control::encode(0x0000, target);
        assert_eq!(
            payload,
            vec![
                0x00, 0x00, 0x20, 0x01, 0x0D, 0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x01, 0x00, 0x50,
            ]
        );
    }

    #[test]
    fn control_roundtrip() {
        let target: SocketAddr = SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 8080);
        let payload = control::encode(42, target);
        let (id, decoded) = control::decode(&payload).unwrap();
        assert_eq!(id, 42);
        assert_eq!(decoded, target);
    }

    #[test]
    fn control_decode_rejects_bad_length() {
        assert!(control::decode(&[0u8; 7]).is_none());
        assert!(control::decode(&[0u8; 9]).is_none());
        assert!(control::decode(&[0u8; 19]).is_none());
        assert!(control::decode(&[0u8; 21]).is_none());
    }
}
