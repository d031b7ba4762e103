use crate::config::{OutboundConfig, OutboundType};
use crate::error::{Error, Result};
use crate::proto::TargetAddr;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// How the server reaches real targets: directly or through an outbound
/// SOCKS5 proxy.
pub enum Dialer {
    Direct,
    Socks5 {
        addr: SocketAddr,
        username: String,
        password: String,
    },
}

impl Dialer {
    pub fn from_config(cfg: &OutboundConfig) -> Result<Self> {
        match cfg.outbound_type {
            OutboundType::Direct => Ok(Self::Direct),
            OutboundType::Socks5 => {
                let addr = cfg
                    .addr
                    .parse()
                    .map_err(|_| Error::config(format!("invalid outbound addr '{}'", cfg.addr)))?;
                Ok(Self::Socks5 {
                    addr,
                    username: cfg.username.clone(),
                    password: cfg.password.clone(),
                })
            }
        }
    }

    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream> {
        match self {
            Self::Direct => dial_direct(target).await,
            Self::Socks5 {
                addr,
                username,
                password,
            } => dial_socks5(*addr, username, password, target).await,
        }
    }
}

async fn dial_direct(target: &TargetAddr) -> Result<TcpStream> {
    let dial = async {
        match target {
            TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(domain, port) => {
                TcpStream::connect((domain.as_str(), *port)).await
            }
        }
    };
    match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::target_dial(target.to_string(), e.to_string())),
        Err(_) => Err(Error::target_dial(target.to_string(), "dial timeout")),
    }
}

async fn dial_socks5(
    proxy: SocketAddr,
    username: &str,
    password: &str,
    target: &TargetAddr,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(proxy))
        .await
        .map_err(|_| Error::target_dial(proxy.to_string(), "SOCKS5 proxy dial timeout"))?
        .map_err(|e| Error::target_dial(proxy.to_string(), e.to_string()))?;

    handshake(&mut stream, username, password).await?;
    connect(&mut stream, target).await?;
    Ok(stream)
}

async fn handshake(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    let with_auth = !username.is_empty() || !password.is_empty();
    let greeting: &[u8] = if with_auth {
        &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol("SOCKS5 proxy spoke a different version"));
    }
    match reply[1] {
        METHOD_NONE => Ok(()),
        METHOD_USERPASS => authenticate(stream, username, password).await,
        0xFF => Err(Error::protocol("SOCKS5 proxy refused our auth methods")),
        m => Err(Error::protocol(format!("SOCKS5 proxy chose unknown method {}", m))),
    }
}

async fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::config("SOCKS5 credentials too long"));
    }
    let mut req = Vec::with_capacity(3 + username.len() + password.len());
    req.push(0x01);
    req.push(username.len() as u8);
    req.extend_from_slice(username.as_bytes());
    req.push(password.len() as u8);
    req.extend_from_slice(password.as_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::protocol("SOCKS5 authentication failed"));
    }
    Ok(())
}

async fn connect(stream: &mut TcpStream, target: &TargetAddr) -> Result<()> {
    let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match target {
        TargetAddr::Ip(SocketAddr::V4(v4)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&v4.ip().octets());
            req.extend_from_slice(&v4.port().to_be_bytes());
        }
        TargetAddr::Ip(SocketAddr::V6(v6)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&v6.ip().octets());
            req.extend_from_slice(&v6.port().to_be_bytes());
        }
        TargetAddr::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(Error::protocol("domain name too long"));
            }
            req.push(ATYP_DOMAIN);
            req.push(domain.len() as u8);
            req.extend_from_slice(domain.as_bytes());
            req.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&req).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::target_dial(
            target.to_string(),
            format!("SOCKS5 connect rejected (code {})", reply[1]),
        ));
    }
    // Drain the bound address.
    match reply[3] {
        ATYP_IPV4 => {
            let mut skip = [0u8; 6];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_IPV6 => {
            let mut skip = [0u8; 18];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut skip = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut skip).await?;
        }
        t => return Err(Error::protocol(format!("unknown bound address type {}", t))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboundConfig;
    use tokio::net::TcpListener;

    #[test]
    fn test_from_config() {
        let cfg = OutboundConfig::default();
        assert!(matches!(Dialer::from_config(&cfg).unwrap(), Dialer::Direct));

        let cfg = OutboundConfig {
            outbound_type: OutboundType::Socks5,
            addr: "127.0.0.1:1080".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert!(matches!(
            Dialer::from_config(&cfg).unwrap(),
            Dialer::Socks5 { .. }
        ));

        let cfg = OutboundConfig {
            outbound_type: OutboundType::Socks5,
            addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(Dialer::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let dialer = Dialer::Direct;
        let stream = dialer.dial(&TargetAddr::Ip(addr)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_socks5_dial_through_mock_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Greeting: no-auth selected.
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();
            // CONNECT to a domain target.
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            // Reply: success, bound to 0.0.0.0:0.
            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let dialer = Dialer::Socks5 {
            addr: proxy_addr,
            username: String::new(),
            password: String::new(),
        };
        let target = TargetAddr::Domain("example.com".to_string(), 80);
        dialer.dial(&target).await.unwrap();
    }
}
