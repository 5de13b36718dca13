//! SOCKS5 client (RFC 1928) with optional username/password auth (RFC 1929).
//!
//! One TCP CONNECT per TCP flow and one UDP ASSOCIATE per UDP flow. Errors
//! carry the server's reply so a refused CONNECT can be distinguished from a
//! dead server.

use crate::config::Credentials;
use crate::error::{reply_message, Error, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Clone)]
pub struct Socks5Client {
    server: SocketAddr,
    credentials: Option<Credentials>,
}

/// A live UDP ASSOCIATE binding. The control stream must stay open for the
/// association's lifetime; the server tears it down when the stream closes.
pub struct UdpAssociation {
    _control: TcpStream,
    pub socket: UdpSocket,
    pub relay_addr: SocketAddr,
}

impl UdpAssociation {
    #[cfg(test)]
    pub(crate) fn from_parts(control: TcpStream, socket: UdpSocket, relay_addr: SocketAddr) -> Self {
        Self { _control: control, socket, relay_addr }
    }
}

impl Socks5Client {
    pub fn new(server: SocketAddr, credentials: Option<Credentials>) -> Self {
        Self { server, credentials }
    }

    /// Open a proxied TCP stream to `target`.
    pub async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server).await?;
        stream.set_nodelay(true)?;
        self.handshake(&mut stream).await?;
        self.request(&mut stream, CMD_CONNECT, target).await?;
        debug!(%target, "CONNECT established");
        Ok(stream)
    }

    /// Open a UDP association and a local socket aimed at its relay address.
    pub async fn udp_associate(&self) -> Result<UdpAssociation> {
        let mut control = TcpStream::connect(self.server).await?;
        self.handshake(&mut control).await?;

        // DST.ADDR/PORT may be zero when the client does not know its
        // outgoing address yet.
        let unspecified = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        let mut relay_addr = self.request(&mut control, CMD_UDP_ASSOCIATE, unspecified).await?;
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(self.server.ip());
        }

        let bind_addr: SocketAddr = if relay_addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| Error::ProxyProtocol("bind address".to_string()))?
        } else {
            "[::]:0".parse().map_err(|_| Error::ProxyProtocol("bind address".to_string()))?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(relay_addr).await?;
        debug!(%relay_addr, "UDP association established");

        Ok(UdpAssociation { _control: control, socket, relay_addr })
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        let greeting: &[u8] = if self.credentials.is_some() {
            &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
        } else {
            &[SOCKS_VERSION, 1, METHOD_NONE]
        };
        stream.write_all(greeting).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[0] != SOCKS_VERSION {
            return Err(Error::ProxyProtocol(format!(
                "unexpected version {:#04x} in method selection",
                response[0]
            )));
        }

        match response[1] {
            METHOD_NONE => Ok(()),
            METHOD_USERPASS => match &self.credentials {
                Some(creds) => self.authenticate(stream, creds).await,
                None => Err(Error::ProxyProtocol(
                    "server requires credentials but none are configured".to_string(),
                )),
            },
            METHOD_UNACCEPTABLE => {
                Err(Error::ProxyProtocol("no acceptable auth method".to_string()))
            }
            m => Err(Error::ProxyProtocol(format!("unsupported auth method {:#04x}", m))),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream, creds: &Credentials) -> Result<()> {
        let mut request = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
        request.push(AUTH_VERSION);
        request.push(creds.username.len() as u8);
        request.extend_from_slice(creds.username.as_bytes());
        request.push(creds.password.len() as u8);
        request.extend_from_slice(creds.password.as_bytes());
        stream.write_all(&request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[1] != 0x00 {
            return Err(Error::ProxyAuthFailed);
        }
        Ok(())
    }

    /// Send one request and read the reply, returning the bound address.
    async fn request(
        &self,
        stream: &mut TcpStream,
        command: u8,
        target: SocketAddr,
    ) -> Result<SocketAddr> {
        let mut request = vec![SOCKS_VERSION, command, 0x00];
        match target.ip() {
            IpAddr::V4(v4) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&v6.octets());
            }
        }
        request.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::ProxyProtocol(format!(
                "unexpected version {:#04x} in reply",
                header[0]
            )));
        }
        if header[1] != 0x00 {
            return Err(Error::ProxyRefused(reply_message(header[1])));
        }

        let ip: IpAddr = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                IpAddr::from(octets)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                IpAddr::from(octets)
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
                // A domain in BND.ADDR is unusual; fall back to the server IP.
                self.server.ip()
            }
            a => {
                return Err(Error::ProxyProtocol(format!("unsupported address type {:#04x}", a)))
            }
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
    }
}

/// Encapsulate one datagram for the UDP relay (RFC 1928 section 7).
pub fn encode_udp_packet(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + payload.len());
    buf.extend_from_slice(&[0, 0, 0]); // RSV, FRAG=0
    match target.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&target.port().to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Strip the relay header, returning the remote address and payload offset.
/// Fragmented datagrams (FRAG != 0) are not supported and are rejected.
pub fn decode_udp_packet(buf: &[u8]) -> Result<(SocketAddr, usize)> {
    if buf.len() < 10 {
        return Err(Error::ProxyProtocol("short UDP relay datagram".to_string()));
    }
    if buf[2] != 0 {
        return Err(Error::ProxyProtocol("fragmented UDP relay datagram".to_string()));
    }
    let (ip, addr_end): (IpAddr, usize) = match buf[3] {
        ATYP_IPV4 => (IpAddr::from([buf[4], buf[5], buf[6], buf[7]]), 8),
        ATYP_IPV6 => {
            if buf.len() < 22 {
                return Err(Error::ProxyProtocol("short UDP relay datagram".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            (IpAddr::from(octets), 20)
        }
        a => {
            return Err(Error::ProxyProtocol(format!(
                "unsupported address type {:#04x} in UDP relay",
                a
            )))
        }
    };
    let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);
    Ok((SocketAddr::new(ip, port), addr_end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn mock_server<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        });
        addr
    }

    async fn read_greeting(stream: &mut TcpStream) {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
    }

    async fn read_request(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            _ => panic!("unexpected atyp"),
        };
        let mut rest = vec![0u8; addr_len + 2];
        stream.read_exact(&mut rest).await.unwrap();
        (head[1], rest)
    }

    fn success_reply() -> Vec<u8> {
        vec![0x05, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }

    #[tokio::test]
    async fn connect_without_auth() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_NONE]).await.unwrap();
            let (cmd, _) = read_request(&mut stream).await;
            assert_eq!(cmd, CMD_CONNECT);
            stream.write_all(&success_reply()).await.unwrap();
        })
        .await;

        let client = Socks5Client::new(addr, None);
        client.connect("1.2.3.4:80".parse().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_maps_reply_code() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_NONE]).await.unwrap();
            read_request(&mut stream).await;
            stream
                .write_all(&[0x05, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let client = Socks5Client::new(addr, None);
        let err = client.connect("1.2.3.4:80".parse().unwrap()).await.unwrap_err();
        match err {
            Error::ProxyRefused(msg) => assert_eq!(msg, "connection refused"),
            other => panic!("expected ProxyRefused, got {other}"),
        }
    }

    #[tokio::test]
    async fn username_password_auth_succeeds() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_USERPASS]).await.unwrap();

            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await.unwrap();
            assert_eq!(ver_ulen[0], AUTH_VERSION);
            let mut user = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            assert_eq!(user, b"alice");
            assert_eq!(pass, b"secret");
            stream.write_all(&[AUTH_VERSION, 0x00]).await.unwrap();

            read_request(&mut stream).await;
            stream.write_all(&success_reply()).await.unwrap();
        })
        .await;

        let creds = Credentials { username: "alice".to_string(), password: "secret".to_string() };
        let client = Socks5Client::new(addr, Some(creds));
        client.connect("1.2.3.4:80".parse().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_fail_cleanly() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_USERPASS]).await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(&[AUTH_VERSION, 0x01]).await.unwrap();
        })
        .await;

        let creds = Credentials { username: "alice".to_string(), password: "wrong".to_string() };
        let client = Socks5Client::new(addr, Some(creds));
        let err = client.connect("1.2.3.4:80".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::ProxyAuthFailed));
    }

    #[tokio::test]
    async fn server_demanding_auth_without_creds_is_refused() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_USERPASS]).await.unwrap();
        })
        .await;

        let client = Socks5Client::new(addr, None);
        let err = client.connect("1.2.3.4:80".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::ProxyProtocol(_)));
    }

    #[tokio::test]
    async fn udp_associate_yields_relay_address() {
        let addr = mock_server(|mut stream| async move {
            read_greeting(&mut stream).await;
            stream.write_all(&[0x05, METHOD_NONE]).await.unwrap();
            let (cmd, _) = read_request(&mut stream).await;
            assert_eq!(cmd, CMD_UDP_ASSOCIATE);
            // BND.ADDR 127.0.0.1:4500
            stream
                .write_all(&[0x05, 0x00, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0x11, 0x94])
                .await
                .unwrap();
            // Hold the control stream open.
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        })
        .await;

        let client = Socks5Client::new(addr, None);
        let assoc = client.udp_associate().await.unwrap();
        assert_eq!(assoc.relay_addr, "127.0.0.1:4500".parse().unwrap());
    }

    #[test]
    fn udp_encapsulation_round_trips() {
        let target: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let buf = encode_udp_packet(target, b"query");
        let (addr, offset) = decode_udp_packet(&buf).unwrap();
        assert_eq!(addr, target);
        assert_eq!(&buf[offset..], b"query");
    }

    #[test]
    fn fragmented_udp_datagram_rejected() {
        let mut buf = encode_udp_packet("8.8.8.8:53".parse().unwrap(), b"q");
        buf[2] = 1;
        assert!(decode_udp_packet(&buf).is_err());
    }
}
