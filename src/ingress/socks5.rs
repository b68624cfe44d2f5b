//! SOCKS5 CONNECT-only listener: spec.md §4.5 "SOCKS5 listener" / §8 S4.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use btlink_core::{LinkConnector, MuxManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::bridge;
use crate::error::Socks5Error;

const VERSION: u8 = 5;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// All-zero bound-address reply fields, as spec.md §6 requires.
const REPLY_SUCCESS: [u8; 10] = [VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
const REPLY_FAILURE: [u8; 10] = [VERSION, 0x01, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Bind `bind_addr` and run the SOCKS5 CONNECT listener until `shutdown`
/// fires or the listener socket errors out.
pub async fn run<C: LinkConnector>(
    manager: Arc<MuxManager<C>>,
    bind_addr: SocketAddr,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%bind_addr, error = %e, "failed to bind socks5 listener");
            return;
        }
    };
    info!(%bind_addr, "socks5 listener started");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(%bind_addr, "socks5 listener stopping");
                return;
            }
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%bind_addr, error = %e, "accept failed");
                        continue;
                    }
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(manager, tcp).await {
                        warn!(%peer, error = %e, "socks5 handshake failed");
                    }
                });
            }
        }
    }
}

async fn handle<C: LinkConnector>(manager: Arc<MuxManager<C>>, mut tcp: TcpStream) -> Result<(), Socks5Error> {
    greeting(&mut tcp).await?;
    let target = match request(&mut tcp).await {
        Ok(target) => target,
        Err(e) => {
            tcp.write_all(&REPLY_FAILURE).await?;
            return Err(e);
        }
    };

    match manager.open_stream(target).await {
        Ok(vc) => {
            tcp.write_all(&REPLY_SUCCESS).await?;
            bridge(tcp, vc).await;
            Ok(())
        }
        Err(e) => {
            tcp.write_all(&REPLY_FAILURE).await?;
            warn!(%target, error = %e, "open_stream failed for socks5 target");
            Ok(())
        }
    }
}

/// `[ver=5, nmethods, methods[nmethods]]` -> `[5, 0]` (no-auth, always).
async fn greeting(tcp: &mut TcpStream) -> Result<(), Socks5Error> {
    let mut header = [0u8; 2];
    tcp.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    tcp.read_exact(&mut methods).await?;
    tcp.write_all(&[VERSION, NO_AUTH]).await?;
    Ok(())
}

/// `[ver=5, cmd, rsv, atyp]` + address + port -> resolved target.
async fn request(tcp: &mut TcpStream) -> Result<SocketAddr, Socks5Error> {
    let mut header = [0u8; 4];
    tcp.read_exact(&mut header).await?;
    let (ver, cmd, _rsv, atyp) = (header[0], header[1], header[2], header[3]);
    if ver != VERSION {
        return Err(Socks5Error::UnsupportedVersion(ver));
    }
    if cmd != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let ip_or_host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            tcp.read_exact(&mut octets).await?;
            HostOrIp::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            tcp.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            tcp.read_exact(&mut domain).await?;
            HostOrIp::Host(String::from_utf8_lossy(&domain).into_owned())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            tcp.read_exact(&mut octets).await?;
            HostOrIp::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port_bytes = [0u8; 2];
    tcp.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    match ip_or_host {
        HostOrIp::Ip(ip) => Ok(SocketAddr::new(ip, port)),
        HostOrIp::Host(host) => resolve(&host, port).await,
    }
}

enum HostOrIp {
    Ip(IpAddr),
    Host(String),
}

/// The control-frame dialect only carries IP addresses (spec.md §3), so
/// a domain-name target is resolved locally before `open_stream` — the
/// same resolve-then-dial step the server side would otherwise have to
/// perform remotely, done here instead since the client already has a
/// working network path for DNS.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, Socks5Error> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Socks5Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "dns resolution returned no addresses")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn greeting_replies_no_auth() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[VERSION, 1, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });
        let (mut server, _) = listener.accept().await.unwrap();
        greeting(&mut server).await.unwrap();
        let reply = client_task.await.unwrap();
        assert_eq!(reply, [VERSION, NO_AUTH]);
    }

    #[tokio::test]
    async fn request_parses_ipv4_connect() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // S4: `05 01 00 01 7F 00 00 01 00 50`
            stream.write_all(&[5, 1, 0, 1, 0x7F, 0, 0, 1, 0, 0x50]).await.unwrap();
            stream
        });
        let (mut server, _) = listener.accept().await.unwrap();
        let target = request(&mut server).await.unwrap();
        assert_eq!(target, "127.0.0.1:80".parse().unwrap());
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn request_rejects_unsupported_command() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[5, 0x02, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        let (mut server, _) = listener.accept().await.unwrap();
        let err = request(&mut server).await.unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedCommand(0x02)));
    }
}
