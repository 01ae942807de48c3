//! Upstream address parsing and socket dialing.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::warn;

use super::transport::{ConnReader, ConnWriter};
use crate::error::SetupError;

pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Udp,
    Tcp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Udp => f.write_str("udp"),
            Network::Tcp => f.write_str("tcp"),
        }
    }
}

/// Parsed `scheme://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub network: Network,
    pub host: String,
    pub port: u16,
}

impl UpstreamAddr {
    pub fn parse(addr: &str) -> Result<Self, SetupError> {
        let invalid = || SetupError::InvalidArgs {
            what: "upstream addr",
            value: addr.to_string(),
        };
        let (network, rest) = match addr.split_once("://") {
            Some(("udp", rest)) | Some(("", rest)) => (Network::Udp, rest),
            Some(("tcp", rest)) => (Network::Tcp, rest),
            Some(_) => return Err(invalid()),
            None => (Network::Udp, addr),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = split_host_port(rest).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            network,
            host,
            port: port.unwrap_or(DEFAULT_DNS_PORT),
        })
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl std::fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.network, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.network, self.host, self.port)
        }
    }
}

/// Splits `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
fn split_host_port(s: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail {
            "" => None,
            t => Some(t.strip_prefix(':')?.parse().ok()?),
        };
        return Some((host.to_string(), port));
    }
    if s.parse::<std::net::Ipv6Addr>().is_ok() {
        return Some((s.to_string(), None));
    }
    match s.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((s.to_string(), None)),
    }
}

/// 拨号选项，构造时一次性解析 / Dial options resolved once at construction.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Overrides the address actually dialed, `ip` or `ip:port`.
    pub dial_addr: Option<String>,
    /// SOCKS5 proxy `host:port`. TCP only.
    pub socks5: Option<String>,
    pub so_mark: Option<u32>,
    pub bind_to_device: Option<String>,
}

#[derive(Debug)]
pub struct Dialer {
    addr: UpstreamAddr,
    /// Resolved dial target when known at setup (`dial_addr` or an IP host).
    target: Option<SocketAddr>,
    socks5: Option<String>,
    so_mark: Option<u32>,
    bind_to_device: Option<String>,
}

impl Dialer {
    pub fn new(addr: UpstreamAddr, opts: DialOptions) -> Result<Arc<Self>, SetupError> {
        let target = match opts.dial_addr.as_deref() {
            Some(dial) => {
                let (host, port) = split_host_port(dial).ok_or_else(|| SetupError::InvalidArgs {
                    what: "dial_addr",
                    value: dial.to_string(),
                })?;
                let ip: IpAddr = host.parse().map_err(|_| SetupError::InvalidArgs {
                    what: "dial_addr",
                    value: dial.to_string(),
                })?;
                Some(SocketAddr::new(ip, port.unwrap_or(addr.port)))
            }
            None => addr.ip().map(|ip| SocketAddr::new(ip, addr.port)),
        };
        if addr.network == Network::Udp && target.is_none() {
            return Err(SetupError::InvalidArgs {
                what: "udp upstream addr (ip required)",
                value: addr.to_string(),
            });
        }
        Ok(Arc::new(Self {
            addr,
            target,
            socks5: opts.socks5,
            so_mark: opts.so_mark,
            bind_to_device: opts.bind_to_device,
        }))
    }

    pub fn addr(&self) -> &UpstreamAddr {
        &self.addr
    }

    /// Same dial options, different network. Used for the TCP fallback of UDP upstreams.
    pub fn with_network(&self, network: Network) -> Arc<Self> {
        Arc::new(Self {
            addr: UpstreamAddr {
                network,
                ..self.addr.clone()
            },
            target: self.target,
            socks5: self.socks5.clone(),
            so_mark: self.so_mark,
            bind_to_device: self.bind_to_device.clone(),
        })
    }

    pub async fn connect(&self) -> anyhow::Result<(ConnReader, ConnWriter)> {
        match self.addr.network {
            Network::Udp => {
                let sock = Arc::new(self.dial_udp().await?);
                Ok((ConnReader::Udp(Arc::clone(&sock)), ConnWriter::Udp(sock)))
            }
            Network::Tcp => {
                let stream = self.dial_tcp().await?;
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();
                Ok((ConnReader::Tcp(r), ConnWriter::Tcp(w)))
            }
        }
    }

    async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        if let Some(target) = self.target {
            return Ok(target);
        }
        tokio::net::lookup_host((self.addr.host.as_str(), self.addr.port))
            .await
            .with_context(|| format!("resolve {}", self.addr.host))?
            .next()
            .with_context(|| format!("no address for {}", self.addr.host))
    }

    fn apply_sock_opts(&self, sock: SockRef<'_>) {
        #[cfg(target_os = "linux")]
        {
            if let Some(mark) = self.so_mark {
                if let Err(err) = sock.set_mark(mark) {
                    warn!(upstream = %self.addr, error = %err, "failed to set so_mark");
                }
            }
            if let Some(dev) = self.bind_to_device.as_deref() {
                if let Err(err) = sock.bind_device(Some(dev.as_bytes())) {
                    warn!(upstream = %self.addr, error = %err, "failed to bind device");
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = sock;
            if self.so_mark.is_some() || self.bind_to_device.is_some() {
                warn!(upstream = %self.addr, "so_mark / bind_to_device are only supported on linux");
            }
        }
    }

    async fn dial_udp(&self) -> anyhow::Result<UdpSocket> {
        let target = self.resolve().await?;
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
            .context("create udp socket")?;
        self.apply_sock_opts(SockRef::from(&socket));
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket.bind(&bind.into()).context("bind udp socket")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        let sock = UdpSocket::from_std(socket.into()).context("from_std")?;
        sock.connect(target).await.context("udp connect")?;
        Ok(sock)
    }

    async fn dial_tcp(&self) -> anyhow::Result<TcpStream> {
        if let Some(proxy) = self.socks5.as_deref() {
            let proxy_addr = tokio::net::lookup_host(proxy)
                .await
                .with_context(|| format!("resolve socks5 proxy {}", proxy))?
                .next()
                .with_context(|| format!("no address for socks5 proxy {}", proxy))?;
            let mut stream = self.tcp_connect(proxy_addr).await?;
            let dest = match self.target {
                Some(t) => Socks5Dest::Ip(t),
                None => Socks5Dest::Domain(self.addr.host.clone(), self.addr.port),
            };
            socks5_connect(&mut stream, &dest)
                .await
                .with_context(|| format!("socks5 handshake via {}", proxy))?;
            return Ok(stream);
        }
        let target = self.resolve().await?;
        self.tcp_connect(target).await
    }

    async fn tcp_connect(&self, target: SocketAddr) -> anyhow::Result<TcpStream> {
        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .context("create tcp socket")?;
        self.apply_sock_opts(SockRef::from(&socket));
        socket
            .connect(target)
            .await
            .with_context(|| format!("tcp connect {}", target))
    }
}

enum Socks5Dest {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// Minimal SOCKS5 CONNECT without authentication (RFC 1928).
async fn socks5_connect(stream: &mut TcpStream, dest: &Socks5Dest) -> io::Result<()> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x00] {
        return Err(io::Error::other("socks5 proxy refused no-auth method"));
    }

    let mut req = vec![0x05, 0x01, 0x00];
    match dest {
        Socks5Dest::Ip(SocketAddr::V4(a)) => {
            req.push(0x01);
            req.extend_from_slice(&a.ip().octets());
            req.extend_from_slice(&a.port().to_be_bytes());
        }
        Socks5Dest::Ip(SocketAddr::V6(a)) => {
            req.push(0x04);
            req.extend_from_slice(&a.ip().octets());
            req.extend_from_slice(&a.port().to_be_bytes());
        }
        Socks5Dest::Domain(host, port) => {
            let len = u8::try_from(host.len())
                .map_err(|_| io::Error::other("socks5 domain too long"))?;
            req.push(0x03);
            req.push(len);
            req.extend_from_slice(host.as_bytes());
            req.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 || head[1] != 0x00 {
        return Err(io::Error::other(format!("socks5 connect failed, reply {}", head[1])));
    }
    let skip = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(io::Error::other(format!("socks5 bad address type {}", other))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn parse_upstream_addr_defaults() {
        let a = UpstreamAddr::parse("8.8.8.8").unwrap();
        assert_eq!(a.network, Network::Udp);
        assert_eq!(a.port, 53);

        let a = UpstreamAddr::parse("tcp://dns.example:5353").unwrap();
        assert_eq!(a.network, Network::Tcp);
        assert_eq!(a.host, "dns.example");
        assert_eq!(a.port, 5353);

        let a = UpstreamAddr::parse("udp://[2001:db8::1]:5300").unwrap();
        assert_eq!(a.host, "2001:db8::1");
        assert_eq!(a.port, 5300);

        let a = UpstreamAddr::parse("2001:db8::1").unwrap();
        assert_eq!(a.port, 53);

        assert!(UpstreamAddr::parse("https://x").is_err());
        assert!(UpstreamAddr::parse("udp://1.1.1.1:notaport").is_err());
    }

    #[test]
    fn udp_requires_ip_unless_dial_addr() {
        let addr = UpstreamAddr::parse("udp://dns.example").unwrap();
        assert!(Dialer::new(addr.clone(), DialOptions::default()).is_err());

        let opts = DialOptions {
            dial_addr: Some("9.9.9.9".to_string()),
            ..Default::default()
        };
        let d = Dialer::new(addr, opts).unwrap();
        assert_eq!(d.target, Some("9.9.9.9:53".parse().unwrap()));
    }

    #[tokio::test]
    async fn socks5_connect_by_domain() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = proxy.accept().await.unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            s.read_exact(&mut rest).await.unwrap();
            s.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            String::from_utf8_lossy(&rest[..head[4] as usize]).to_string()
        });

        let addr = UpstreamAddr::parse("tcp://dns.example:853").unwrap();
        let opts = DialOptions {
            socks5: Some(proxy_addr.to_string()),
            ..Default::default()
        };
        let dialer = Dialer::new(addr, opts).unwrap();
        dialer.dial_tcp().await.expect("socks5 dial");
        assert_eq!(server.await.unwrap(), "dns.example");
    }
}
