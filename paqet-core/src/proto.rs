use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const PROTO_VERSION: u8 = 1;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;
const CMD_FLAGS: u8 = 0x03;

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x03;
const ADDR_TYPE_IPV6: u8 = 0x04;

/// Target of a tunneled stream: a literal socket address or a hostname the
/// server resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl TargetAddr {
    /// Parse "host:port", preferring the literal address form.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::protocol(format!("target '{}' has no port", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::protocol(format!("invalid port in target '{}'", s)))?;
        if host.is_empty() || host.len() > 255 {
            return Err(Error::protocol(format!("invalid host in target '{}'", s)));
        }
        Ok(TargetAddr::Domain(host.to_string(), port))
    }
}

/// The tagged preamble written at the head of every tunnel stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// Pipe the stream to a TCP connection to the target.
    Tcp(TargetAddr),
    /// Relay length-prefixed datagrams to the target over UDP.
    Udp(TargetAddr),
    /// Install the given flag profiles for segments sent back to this peer.
    Flags(Vec<String>),
}

impl Preamble {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(PROTO_VERSION);
        match self {
            Preamble::Tcp(target) => {
                buf.put_u8(CMD_TCP);
                encode_target(&mut buf, target);
            }
            Preamble::Udp(target) => {
                buf.put_u8(CMD_UDP);
                encode_target(&mut buf, target);
            }
            Preamble::Flags(profiles) => {
                buf.put_u8(CMD_FLAGS);
                buf.put_u8(profiles.len() as u8);
                for p in profiles {
                    buf.put_u8(p.len() as u8);
                    buf.put_slice(p.as_bytes());
                }
            }
        }
        buf.to_vec()
    }

    /// Read a preamble from the head of a stream.
    pub async fn read_from<S>(stream: &S) -> Result<Self>
    where
        S: crate::transport::Stream + ?Sized,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != PROTO_VERSION {
            return Err(Error::protocol(format!(
                "unsupported preamble version {}",
                header[0]
            )));
        }
        match header[1] {
            CMD_TCP => Ok(Preamble::Tcp(read_target(stream).await?)),
            CMD_UDP => Ok(Preamble::Udp(read_target(stream).await?)),
            CMD_FLAGS => {
                let mut count = [0u8; 1];
                stream.read_exact(&mut count).await?;
                let mut profiles = Vec::with_capacity(count[0] as usize);
                for _ in 0..count[0] {
                    let mut len = [0u8; 1];
                    stream.read_exact(&mut len).await?;
                    let mut s = vec![0u8; len[0] as usize];
                    stream.read_exact(&mut s).await?;
                    profiles.push(
                        String::from_utf8(s)
                            .map_err(|_| Error::protocol("invalid flag profile encoding"))?,
                    );
                }
                Ok(Preamble::Flags(profiles))
            }
            cmd => Err(Error::protocol(format!("unknown preamble command {}", cmd))),
        }
    }

    /// Decode from a byte slice, returning the consumed length.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(Error::protocol("preamble too short"));
        }
        let version = buf.get_u8();
        if version != PROTO_VERSION {
            return Err(Error::protocol(format!(
                "unsupported preamble version {}",
                version
            )));
        }
        let cmd = buf.get_u8();
        match cmd {
            CMD_TCP | CMD_UDP => {
                let (target, consumed) = decode_target(buf)?;
                let total = 2 + consumed;
                if cmd == CMD_TCP {
                    Ok((Preamble::Tcp(target), total))
                } else {
                    Ok((Preamble::Udp(target), total))
                }
            }
            CMD_FLAGS => {
                if buf.remaining() < 1 {
                    return Err(Error::protocol("preamble too short"));
                }
                let count = buf.get_u8() as usize;
                let mut profiles = Vec::with_capacity(count);
                let mut consumed = 3;
                for _ in 0..count {
                    if buf.remaining() < 1 {
                        return Err(Error::protocol("preamble too short"));
                    }
                    let len = buf.get_u8() as usize;
                    if buf.remaining() < len {
                        return Err(Error::protocol("preamble too short"));
                    }
                    let mut s = vec![0u8; len];
                    buf.copy_to_slice(&mut s);
                    consumed += 1 + len;
                    profiles.push(
                        String::from_utf8(s)
                            .map_err(|_| Error::protocol("invalid flag profile encoding"))?,
                    );
                }
                Ok((Preamble::Flags(profiles), consumed))
            }
            cmd => Err(Error::protocol(format!("unknown preamble command {}", cmd))),
        }
    }
}

fn encode_target(buf: &mut BytesMut, target: &TargetAddr) {
    match target {
        TargetAddr::Ip(SocketAddr::V4(v4)) => {
            buf.put_u8(ADDR_TYPE_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        TargetAddr::Ip(SocketAddr::V6(v6)) => {
            buf.put_u8(ADDR_TYPE_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        TargetAddr::Domain(domain, port) => {
            buf.put_u8(ADDR_TYPE_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
            buf.put_u16(*port);
        }
    }
}

async fn read_target<S>(stream: &S) -> Result<TargetAddr>
where
    S: crate::transport::Stream + ?Sized,
{
    let mut addr_type = [0u8; 1];
    stream.read_exact(&mut addr_type).await?;
    match addr_type[0] {
        ADDR_TYPE_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        ADDR_TYPE_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(TargetAddr::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut raw = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut raw).await?;
            let domain = String::from_utf8(raw[..len[0] as usize].to_vec())
                .map_err(|_| Error::protocol("invalid domain encoding"))?;
            let port = u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
            Ok(TargetAddr::Domain(domain, port))
        }
        t => Err(Error::protocol(format!("unknown address type {}", t))),
    }
}

fn decode_target(mut buf: &[u8]) -> Result<(TargetAddr, usize)> {
    if buf.remaining() < 1 {
        return Err(Error::protocol("address too short"));
    }
    let addr_type = buf.get_u8();
    match addr_type {
        ADDR_TYPE_IPV4 => {
            if buf.remaining() < 6 {
                return Err(Error::protocol("IPv4 address too short"));
            }
            let ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
            let port = buf.get_u16();
            Ok((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
        }
        ADDR_TYPE_IPV6 => {
            if buf.remaining() < 18 {
                return Err(Error::protocol("IPv6 address too short"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok((
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                19,
            ))
        }
        ADDR_TYPE_DOMAIN => {
            if buf.remaining() < 1 {
                return Err(Error::protocol("domain length missing"));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len + 2 {
                return Err(Error::protocol("domain data too short"));
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            let domain =
                String::from_utf8(raw).map_err(|_| Error::protocol("invalid domain encoding"))?;
            let port = buf.get_u16();
            Ok((TargetAddr::Domain(domain, port), 1 + 1 + len + 2))
        }
        t => Err(Error::protocol(format!("unknown address type {}", t))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(
            TargetAddr::parse("10.0.0.1:80").unwrap(),
            TargetAddr::Ip("10.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse("example.com:443").unwrap(),
            TargetAddr::Domain("example.com".to_string(), 443)
        );
        assert_eq!(
            TargetAddr::parse("[::1]:8080").unwrap(),
            TargetAddr::Ip("[::1]:8080".parse().unwrap())
        );
        assert!(TargetAddr::parse("no-port").is_err());
        assert!(TargetAddr::parse("host:notaport").is_err());
    }

    #[test]
    fn test_preamble_tcp_round_trip() {
        let p = Preamble::Tcp(TargetAddr::Domain("example.com".to_string(), 443));
        let encoded = p.encode();
        let (decoded, consumed) = Preamble::decode(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_preamble_udp_ipv4_round_trip() {
        let p = Preamble::Udp(TargetAddr::Ip("192.168.1.1:53".parse().unwrap()));
        let encoded = p.encode();
        let (decoded, consumed) = Preamble::decode(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_preamble_ipv6_round_trip() {
        let p = Preamble::Tcp(TargetAddr::Ip("[2001:db8::1]:443".parse().unwrap()));
        let encoded = p.encode();
        let (decoded, _) = Preamble::decode(&encoded).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_preamble_flags_round_trip() {
        let p = Preamble::Flags(vec!["PA".to_string(), "A".to_string()]);
        let encoded = p.encode();
        let (decoded, consumed) = Preamble::decode(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_preamble_rejects_bad_input() {
        assert!(Preamble::decode(&[]).is_err());
        assert!(Preamble::decode(&[9, CMD_TCP]).is_err());
        assert!(Preamble::decode(&[PROTO_VERSION, 0x77]).is_err());
        assert!(Preamble::decode(&[PROTO_VERSION, CMD_TCP, ADDR_TYPE_IPV4, 1, 2]).is_err());
    }
}
