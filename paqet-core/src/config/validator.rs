use super::{AddrConfig, Config, Role, TcpFlags, TransportProtocol};
use crate::error::{Error, Result};

/// Validate the whole configuration, collecting every failure into one
/// message. Resolves derived fields (router MACs, local MAC, shared port)
/// along the way.
pub fn validate(cfg: &mut Config) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    validate_network(cfg, &mut errors);
    validate_transport(cfg, &mut errors);
    validate_performance(cfg, &mut errors);
    validate_obfs(cfg, &mut errors);

    match cfg.role {
        Role::Server => {
            if cfg.listen.port().is_none() {
                errors.push(format!("listen.addr '{}' must carry a port", cfg.listen.addr));
            }
        }
        Role::Client => {
            if cfg.server.addr.is_empty() {
                errors.push("server.addr is required for the client role".to_string());
            } else if let Err(e) = cfg.server.socket_addr() {
                errors.push(e.to_string());
            }
            if cfg.socks5.is_empty() && cfg.forward.is_empty() && cfg.http.is_empty() {
                tracing::warn!("client configured but no SOCKS5, HTTP or forward rules found");
            }
            for (i, f) in cfg.forward.iter().enumerate() {
                if f.protocol != "tcp" && f.protocol != "udp" {
                    errors.push(format!(
                        "forward[{}].protocol must be 'tcp' or 'udp', got '{}'",
                        i, f.protocol
                    ));
                }
                if f.listen.parse::<std::net::SocketAddr>().is_err() {
                    errors.push(format!("forward[{}].listen '{}' is not an address", i, f.listen));
                }
                if f.target.is_empty() {
                    errors.push(format!("forward[{}].target is required", i));
                }
            }
            if let Ok(peer) = cfg.server.socket_addr() {
                if peer.is_ipv4() && !cfg.network.ipv4.is_configured() {
                    errors.push("server address is IPv4, but the IPv4 interface is not configured".to_string());
                }
                if peer.is_ipv6() && !cfg.network.ipv6.is_configured() {
                    errors.push("server address is IPv6, but the IPv6 interface is not configured".to_string());
                }
            }
            if cfg.transport.conn > 1 && explicit_client_port(cfg) {
                errors.push("only one connection is allowed when a client port is explicitly set".to_string());
            }
        }
    }

    validate_outbound(cfg, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn explicit_client_port(cfg: &Config) -> bool {
    cfg.network
        .local_addr()
        .map(|a| a.port() != 0)
        .unwrap_or(false)
}

fn validate_network(cfg: &mut Config, errors: &mut Vec<String>) {
    let n = &mut cfg.network;

    if n.interface.is_empty() {
        errors.push("network.interface is required".to_string());
    }
    if n.interface.len() > 15 {
        errors.push(format!(
            "network.interface name too long (max 15 characters): '{}'",
            n.interface
        ));
    }
    if cfg!(windows) && n.guid.is_empty() {
        errors.push("network.guid is required on windows".to_string());
    }

    let ipv4_configured = n.ipv4.is_configured();
    let ipv6_configured = n.ipv6.is_configured();
    if !ipv4_configured && !ipv6_configured {
        errors.push("at least one address family (IPv4 or IPv6) must be configured".to_string());
        return;
    }
    if ipv4_configured {
        validate_addr(&mut n.ipv4, &n.interface, false, errors);
    }
    if ipv6_configured {
        validate_addr(&mut n.ipv6, &n.interface, true, errors);
    }
    if ipv4_configured && ipv6_configured {
        let p4 = n.ipv4.socket_addr().map(|a| a.port());
        let p6 = n.ipv6.socket_addr().map(|a| a.port());
        if let (Some(p4), Some(p6)) = (p4, p6) {
            if p4 != p6 {
                errors.push(format!(
                    "IPv4 port ({}) and IPv6 port ({}) must match when both are configured",
                    p4, p6
                ));
            }
        }
    }
    // Zero stays zero: an ephemeral port is picked at channel construction.
    if let Some(addr) = n.local_addr() {
        n.port = addr.port();
    }

    if !n.interface.is_empty() {
        match local_mac(&n.interface) {
            Ok(mac) => n.local_mac = mac,
            Err(e) => errors.push(format!(
                "failed to resolve MAC of interface {}: {}",
                n.interface, e
            )),
        }
    }

    let p = &n.pcap;
    if p.sockbuf < 1024 {
        errors.push("pcap.sockbuf must be >= 1024 bytes".to_string());
    }
    if p.sockbuf > 100 * 1024 * 1024 {
        errors.push("pcap.sockbuf too large (max 100MB)".to_string());
    }
    if p.send_queue_size < 1 || p.send_queue_size > 100_000 {
        errors.push("pcap.send_queue_size must be between 1 and 100000".to_string());
    }
    if p.max_retries > 10 {
        errors.push("pcap.max_retries must be between 0 and 10".to_string());
    }
    if p.initial_backoff_ms < 1 || p.initial_backoff_ms > 1000 {
        errors.push("pcap.initial_backoff_ms must be between 1 and 1000".to_string());
    }
    if p.max_backoff_ms < p.initial_backoff_ms || p.max_backoff_ms > 60_000 {
        errors.push("pcap.max_backoff_ms must be between initial_backoff_ms and 60000".to_string());
    }

    if !n.tcp.preset.is_empty() && n.tcp.preset != "restrictive" {
        errors.push("tcp.preset must be one of: restrictive".to_string());
    }
    for f in n.tcp.local_flag.iter().chain(n.tcp.remote_flag.iter()) {
        if let Err(e) = TcpFlags::parse(f) {
            errors.push(e.to_string());
        }
    }
    if n.tcp.local_flag.is_empty() || n.tcp.remote_flag.is_empty() {
        errors.push("at least one TCP flag combination required".to_string());
    }
}

fn validate_addr(addr: &mut AddrConfig, iface: &str, ipv6: bool, errors: &mut Vec<String>) {
    match addr.socket_addr() {
        Some(sa) => {
            if ipv6 && !sa.is_ipv6() {
                errors.push(format!("'{}' is not an IPv6 address", addr.addr));
            }
            if !ipv6 && !sa.is_ipv4() {
                errors.push(format!("'{}' is not an IPv4 address", addr.addr));
            }
        }
        None => errors.push(format!("invalid address '{}'", addr.addr)),
    }

    let mac_str = if addr.router_mac.is_empty() {
        match gateway_mac(iface, ipv6) {
            Ok(mac) => {
                tracing::info!("auto-discovered router MAC {} on {}", mac, iface);
                mac
            }
            Err(e) => {
                errors.push(format!("router_mac is required ({})", e));
                return;
            }
        }
    } else {
        addr.router_mac.clone()
    };

    match parse_mac(&mac_str) {
        Ok(mac) => addr.router = mac,
        Err(_) => errors.push(format!("invalid router MAC address '{}'", mac_str)),
    }
}

pub(crate) fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::config(format!("invalid MAC address '{}'", s)));
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::config(format!("invalid MAC address '{}'", s)))?;
    }
    Ok(mac)
}

#[cfg(target_os = "linux")]
fn local_mac(iface: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", iface);
    let s = std::fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("interface {} not found: {}", iface, e)))?;
    parse_mac(s.trim())
}

#[cfg(not(target_os = "linux"))]
fn local_mac(_iface: &str) -> Result<[u8; 6]> {
    Err(Error::config(
        "local MAC auto-discovery is only supported on Linux; configure the interface manually",
    ))
}

/// Resolve the next-hop MAC of the default route on `iface` from the
/// kernel's route and neighbor tables.
#[cfg(target_os = "linux")]
fn gateway_mac(iface: &str, ipv6: bool) -> Result<String> {
    if ipv6 {
        return Err(Error::config(
            "IPv6 gateway auto-discovery is not yet implemented",
        ));
    }
    let gateway = default_gateway_v4(iface)?;
    arp_lookup(&gateway)
}

#[cfg(not(target_os = "linux"))]
fn gateway_mac(_iface: &str, _ipv6: bool) -> Result<String> {
    Err(Error::config(
        "gateway auto-discovery is only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
fn default_gateway_v4(iface: &str) -> Result<String> {
    let table = std::fs::read_to_string("/proc/net/route")
        .map_err(|e| Error::config_with_source("cannot read route table", e))?;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[0] != iface || fields[1] != "00000000" {
            continue;
        }
        if let Ok(raw) = u32::from_str_radix(fields[2], 16) {
            let octets = raw.to_le_bytes();
            return Ok(format!(
                "{}.{}.{}.{}",
                octets[0], octets[1], octets[2], octets[3]
            ));
        }
    }
    Err(Error::config(format!(
        "no default route found for interface {}",
        iface
    )))
}

#[cfg(target_os = "linux")]
fn arp_lookup(ip: &str) -> Result<String> {
    let table = std::fs::read_to_string("/proc/net/arp")
        .map_err(|e| Error::config_with_source("cannot read ARP table", e))?;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[0] == ip {
            if fields[3] == "00:00:00:00:00:00" {
                return Err(Error::config("incomplete ARP entry"));
            }
            return Ok(fields[3].to_string());
        }
    }
    Err(Error::config(format!(
        "gateway IP {} found, but MAC not in ARP cache",
        ip
    )))
}

fn validate_transport(cfg: &mut Config, errors: &mut Vec<String>) {
    let t = &cfg.transport;
    if t.conn < 1 || t.conn > 64 {
        errors.push("transport.conn must be between 1 and 64".to_string());
    }
    match t.protocol {
        TransportProtocol::Kcp => {
            let k = &t.kcp;
            if k.mtu < 50 || k.mtu > 1500 {
                errors.push("kcp.mtu must be between 50 and 1500".to_string());
            }
            if k.block != "none" {
                if k.key.is_empty() {
                    errors.push(format!("kcp.key is required for block cipher '{}'", k.block));
                } else if let Err(e) = super::validate_secret(&k.key) {
                    errors.push(e.to_string());
                }
                if crate::transport::crypto::BlockCipherKind::parse(&k.block).is_none() {
                    errors.push(format!("unknown kcp.block '{}'", k.block));
                }
            }
        }
        TransportProtocol::Quic => {
            let q = &t.quic;
            if q.max_idle_timeout < 1 || q.max_idle_timeout > 600 {
                errors.push("quic.max_idle_timeout must be between 1-600 seconds".to_string());
            }
            if q.max_incoming_streams < 1 || q.max_incoming_streams > 100_000 {
                errors.push("quic.max_incoming_streams must be between 1-100000".to_string());
            }
            if q.max_incoming_uni_streams < 1 || q.max_incoming_uni_streams > 100_000 {
                errors.push("quic.max_incoming_uni_streams must be between 1-100000".to_string());
            }
            if q.initial_stream_receive_window < 1024 * 1024 {
                errors.push("quic.initial_stream_receive_window must be >= 1 MB".to_string());
            }
            if q.max_stream_receive_window < q.initial_stream_receive_window {
                errors.push(
                    "quic.max_stream_receive_window must be >= initial_stream_receive_window"
                        .to_string(),
                );
            }
            if q.initial_connection_receive_window < 1024 * 1024 {
                errors.push("quic.initial_connection_receive_window must be >= 1 MB".to_string());
            }
            if q.max_connection_receive_window < q.initial_connection_receive_window {
                errors.push(
                    "quic.max_connection_receive_window must be >= initial_connection_receive_window"
                        .to_string(),
                );
            }
            if q.keep_alive_period < 1 || q.keep_alive_period > 60 {
                errors.push("quic.keep_alive_period must be between 1-60 seconds".to_string());
            }
        }
    }
}

fn validate_performance(cfg: &mut Config, errors: &mut Vec<String>) {
    let p = &cfg.performance;
    if p.max_concurrent_streams > 100_000 {
        tracing::warn!(
            "max_concurrent_streams is very high ({}) - this may cause resource exhaustion",
            p.max_concurrent_streams
        );
    }
    if p.packet_workers < 1 || p.packet_workers > 64 {
        errors.push("performance.packet_workers must be between 1 and 64".to_string());
    }
    if p.stream_worker_pool_size < 10 || p.stream_worker_pool_size > 100_000 {
        errors.push("performance.stream_worker_pool_size must be between 10 and 100000".to_string());
    }
    if p.tcp_connection_pool_size > 10_000 {
        errors.push("performance.tcp_connection_pool_size must be between 0 and 10000".to_string());
    }
    if p.tcp_connection_idle_timeout < 10 || p.tcp_connection_idle_timeout > 3600 {
        errors.push(
            "performance.tcp_connection_idle_timeout must be between 10 and 3600 seconds"
                .to_string(),
        );
    }
    if p.max_retry_attempts > 20 {
        errors.push("performance.max_retry_attempts must be between 0 and 20".to_string());
    }
    if p.retry_initial_backoff_ms < 10 || p.retry_initial_backoff_ms > 10_000 {
        errors.push("performance.retry_initial_backoff_ms must be between 10 and 10000".to_string());
    }
    if p.retry_max_backoff_ms < p.retry_initial_backoff_ms || p.retry_max_backoff_ms > 60_000 {
        errors.push(
            "performance.retry_max_backoff_ms must be between retry_initial_backoff_ms and 60000"
                .to_string(),
        );
    }
}

fn validate_obfs(cfg: &mut Config, errors: &mut Vec<String>) {
    let o = &cfg.obfs;
    if o.padding.max_pad < o.padding.min_pad || o.padding.max_pad > 255 {
        errors.push("obfs.padding.max_pad must be between min_pad and 255".to_string());
    }
    if o.mode != super::ObfsMode::None && cfg.transport.kcp.key.is_empty() {
        errors.push("obfs requires transport.kcp.key as keying material".to_string());
    }
}

fn validate_outbound(cfg: &mut Config, errors: &mut Vec<String>) {
    let o = &mut cfg.outbound;
    if o.outbound_type == super::OutboundType::Socks5 {
        let addr = o.addr.trim().trim_start_matches("socks5://").to_string();
        if addr.is_empty() {
            errors.push("outbound.addr is required when type is socks5".to_string());
        } else if addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("outbound.addr '{}' is not an address", addr));
        } else {
            o.addr = addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert_eq!(parse_mac("00:00:00:00:00:01").unwrap(), [0, 0, 0, 0, 0, 1]);
        assert!(parse_mac("aa:bb:cc:dd:ee").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:gg").is_err());
        assert!(parse_mac("aabbccddeeff").is_err());
    }

    #[test]
    fn test_role_validation_requires_server_addr() {
        let yaml = r#"
role: client
network:
  interface: lo
  ipv4:
    addr: "127.0.0.1:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
"#;
        let mut cfg: crate::config::Config = serde_yaml::from_str(yaml).unwrap();
        cfg.set_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.addr is required"));
    }

    #[test]
    fn test_transport_conn_bounds() {
        let yaml = r#"
role: server
listen:
  addr: ":9000"
network:
  interface: lo
  ipv4:
    addr: "127.0.0.1:9000"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  conn: 99
"#;
        let mut cfg: crate::config::Config = serde_yaml::from_str(yaml).unwrap();
        cfg.set_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("transport.conn"));
    }

    #[test]
    fn test_kcp_block_requires_key() {
        let yaml = r#"
role: server
listen:
  addr: ":9000"
network:
  interface: lo
  ipv4:
    addr: "127.0.0.1:9000"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  kcp:
    block: aes
"#;
        let mut cfg: crate::config::Config = serde_yaml::from_str(yaml).unwrap();
        cfg.set_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("kcp.key is required"));
    }
}
