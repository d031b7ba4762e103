pub mod validator;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Top-level configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub role: Role,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub socks5: Vec<Socks5Config>,
    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
    #[serde(default)]
    pub http: Vec<HttpConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub obfs: ObfsConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config_with_source(format!("failed to read {}", path), e))?;
        let mut config: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::config_with_source("failed to parse YAML", e))?;
        config.set_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn set_defaults(&mut self) {
        self.network.set_defaults(self.role);
        self.transport.set_defaults(self.role);
        self.performance.set_defaults(self.role);
    }

    pub fn validate(&mut self) -> Result<()> {
        validator::validate(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListenConfig {
    /// Listen address in the form ":<port>" or "<ip>:<port>".
    #[serde(default)]
    pub addr: String,
}

impl ListenConfig {
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.addr.rsplit_once(':')?;
        port.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Peer address "<ip>:<port>" (client role).
    #[serde(default)]
    pub addr: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|_| Error::config(format!("invalid server.addr '{}'", self.addr)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Socks5Config {
    pub listen: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpConfig {
    pub listen: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForwardConfig {
    pub listen: String,
    pub target: String,
    #[serde(default = "default_forward_protocol")]
    pub protocol: String,
}

fn default_forward_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub interface: String,
    /// Adapter GUID, required on Windows.
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub ipv4: AddrConfig,
    #[serde(default)]
    pub ipv6: AddrConfig,
    #[serde(default)]
    pub pcap: PcapConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub ipv4_tos: u8,
    #[serde(default)]
    pub ipv4_df: bool,
    #[serde(default)]
    pub ipv4_ttl: u8,
    #[serde(default)]
    pub ipv6_tc: u8,
    #[serde(default)]
    pub ipv6_hoplimit: u8,
    /// Local MAC address of `interface`, resolved at validation.
    #[serde(skip)]
    pub local_mac: [u8; 6],
    /// Shared local port, derived from the configured address families.
    #[serde(skip)]
    pub port: u16,
}

impl NetworkConfig {
    pub fn set_defaults(&mut self, _role: Role) {
        self.pcap.set_defaults(_role);
        self.tcp.set_defaults();
        if self.ipv4_ttl == 0 {
            self.ipv4_ttl = 64;
        }
        if self.ipv6_hoplimit == 0 {
            self.ipv6_hoplimit = 64;
        }
    }

    /// Preferred local address: IPv4 when configured, otherwise IPv6.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ipv4
            .socket_addr()
            .or_else(|| self.ipv6.socket_addr())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddrConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub router_mac: String,
    #[serde(skip)]
    pub router: [u8; 6],
}

impl AddrConfig {
    pub fn is_configured(&self) -> bool {
        !self.addr.is_empty()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.addr.is_empty() {
            return None;
        }
        self.addr.parse().ok()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.socket_addr().map(|a| a.ip())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PcapConfig {
    #[serde(default)]
    pub sockbuf: usize,
    #[serde(default)]
    pub send_queue_size: usize,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub initial_backoff_ms: u64,
    #[serde(default)]
    pub max_backoff_ms: u64,
}

impl PcapConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.sockbuf == 0 {
            self.sockbuf = match role {
                Role::Server => 8 * 1024 * 1024,
                Role::Client => 4 * 1024 * 1024,
            };
        }
        if self.send_queue_size == 0 {
            self.send_queue_size = 1000;
        }
        if self.max_retries == 0 {
            self.max_retries = 3;
        }
        if self.initial_backoff_ms == 0 {
            self.initial_backoff_ms = 10;
        }
        if self.max_backoff_ms == 0 {
            self.max_backoff_ms = 1000;
        }
    }
}

/// TCP flag bitset applied to an outgoing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    /// Parse a flag combination from a letter string over {F,S,R,P,A,U,E,C,N}.
    pub fn parse(s: &str) -> Result<Self> {
        let mut f = TcpFlags::default();
        for ch in s.chars() {
            match ch {
                'F' => f.fin = true,
                'S' => f.syn = true,
                'R' => f.rst = true,
                'P' => f.psh = true,
                'A' => f.ack = true,
                'U' => f.urg = true,
                'E' => f.ece = true,
                'C' => f.cwr = true,
                'N' => f.ns = true,
                _ => {
                    return Err(Error::config(format!(
                        "invalid TCP flag '{}' in combination '{}'",
                        ch, s
                    )))
                }
            }
        }
        Ok(f)
    }

    pub fn parse_all(strs: &[String]) -> Result<Vec<Self>> {
        strs.iter().map(|s| Self::parse(s)).collect()
    }

    /// Sequence-space consumption beyond the payload: SYN and FIN occupy one.
    pub fn seq_increment(&self) -> u32 {
        if self.syn || self.fin {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TcpConfig {
    #[serde(default)]
    pub local_flag: Vec<String>,
    #[serde(default)]
    pub remote_flag: Vec<String>,
    #[serde(default)]
    pub preset: String,
}

impl TcpConfig {
    pub fn set_defaults(&mut self) {
        match self.preset.as_str() {
            "restrictive" => {
                self.local_flag = vec!["PA".to_string(), "A".to_string()];
                self.remote_flag = vec!["PA".to_string(), "A".to_string()];
                return;
            }
            "default" => self.preset.clear(),
            _ => {}
        }
        if self.local_flag.is_empty() {
            self.local_flag = vec!["PA".to_string()];
        }
        if self.remote_flag.is_empty() {
            self.remote_flag = vec!["PA".to_string()];
        }
    }

    pub fn local_profiles(&self) -> Result<Vec<TcpFlags>> {
        TcpFlags::parse_all(&self.local_flag)
    }

    pub fn remote_profiles(&self) -> Result<Vec<TcpFlags>> {
        TcpFlags::parse_all(&self.remote_flag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportConfig {
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Number of parallel underlying connections on the client.
    #[serde(default)]
    pub conn: usize,
    #[serde(default)]
    pub kcp: KcpConfig,
    #[serde(default)]
    pub quic: QuicConfig,
}

impl TransportConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.conn == 0 {
            self.conn = 1;
        }
        self.kcp.set_defaults();
        self.quic.set_defaults(role);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Kcp,
    Quic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KcpConfig {
    #[serde(default)]
    pub mode: KcpMode,
    #[serde(default)]
    pub mtu: usize,
    #[serde(default)]
    pub rcvwnd: u32,
    #[serde(default)]
    pub sndwnd: u32,
    #[serde(default)]
    pub block: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub smuxbuf: usize,
    #[serde(default)]
    pub streambuf: usize,
    #[serde(default)]
    pub ping_sec: u64,
}

impl KcpConfig {
    pub fn set_defaults(&mut self) {
        if self.mtu == 0 {
            self.mtu = 1350;
        }
        if self.rcvwnd == 0 {
            self.rcvwnd = 1024;
        }
        if self.sndwnd == 0 {
            self.sndwnd = 1024;
        }
        if self.block.is_empty() {
            self.block = "none".to_string();
        }
        if self.smuxbuf == 0 {
            self.smuxbuf = 4 * 1024 * 1024;
        }
        if self.streambuf == 0 {
            self.streambuf = 2 * 1024 * 1024;
        }
        if self.ping_sec == 0 {
            self.ping_sec = 30;
        }
    }
}

/// KCP latency/throughput preset mapped to (nodelay, interval, resend, nc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KcpMode {
    Normal,
    #[default]
    Fast,
    Fast2,
    Fast3,
}

impl KcpMode {
    pub fn tuning(&self) -> (bool, u32, i32, bool) {
        match self {
            KcpMode::Normal => (false, 40, 2, true),
            KcpMode::Fast => (false, 30, 2, true),
            KcpMode::Fast2 => (true, 20, 2, true),
            KcpMode::Fast3 => (true, 10, 2, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuicConfig {
    #[serde(default)]
    pub max_idle_timeout: u64,
    #[serde(default)]
    pub max_incoming_streams: u32,
    #[serde(default)]
    pub max_incoming_uni_streams: u32,
    #[serde(default)]
    pub initial_stream_receive_window: u64,
    #[serde(default)]
    pub max_stream_receive_window: u64,
    #[serde(default)]
    pub initial_connection_receive_window: u64,
    #[serde(default)]
    pub max_connection_receive_window: u64,
    #[serde(default)]
    pub enable_datagrams: bool,
    #[serde(default)]
    pub enable_0rtt: bool,
    #[serde(default)]
    pub keep_alive_period: u64,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub server_name: String,
}

impl QuicConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.max_idle_timeout == 0 {
            self.max_idle_timeout = 30;
        }
        if self.max_incoming_streams == 0 {
            self.max_incoming_streams = match role {
                Role::Server => 10000,
                Role::Client => 1000,
            };
        }
        if self.max_incoming_uni_streams == 0 {
            self.max_incoming_uni_streams = match role {
                Role::Server => 10000,
                Role::Client => 1000,
            };
        }
        if self.initial_stream_receive_window == 0 {
            self.initial_stream_receive_window = 6 * 1024 * 1024;
        }
        if self.max_stream_receive_window == 0 {
            self.max_stream_receive_window = 24 * 1024 * 1024;
        }
        if self.initial_connection_receive_window == 0 {
            self.initial_connection_receive_window = 15 * 1024 * 1024;
        }
        if self.max_connection_receive_window == 0 {
            self.max_connection_receive_window = 60 * 1024 * 1024;
        }
        if self.keep_alive_period == 0 {
            self.keep_alive_period = 10;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub max_concurrent_streams: usize,
    #[serde(default)]
    pub packet_workers: usize,
    #[serde(default)]
    pub stream_worker_pool_size: usize,
    #[serde(default)]
    pub tcp_connection_pool_size: usize,
    #[serde(default)]
    pub tcp_connection_idle_timeout: u64,
    #[serde(default)]
    pub enable_connection_pooling: bool,
    #[serde(default)]
    pub max_retry_attempts: usize,
    #[serde(default)]
    pub retry_initial_backoff_ms: u64,
    #[serde(default)]
    pub retry_max_backoff_ms: u64,
}

impl PerformanceConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.max_concurrent_streams == 0 {
            self.max_concurrent_streams = match role {
                Role::Server => 10000,
                Role::Client => 5000,
            };
        }
        if self.packet_workers == 0 {
            self.packet_workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2);
        }
        if self.stream_worker_pool_size == 0 {
            self.stream_worker_pool_size = 1000;
        }
        if self.tcp_connection_pool_size == 0 {
            self.tcp_connection_pool_size = 100;
        }
        if self.tcp_connection_idle_timeout == 0 {
            self.tcp_connection_idle_timeout = 90;
        }
        if self.max_retry_attempts == 0 {
            self.max_retry_attempts = 5;
        }
        if self.retry_initial_backoff_ms == 0 {
            self.retry_initial_backoff_ms = 100;
        }
        if self.retry_max_backoff_ms == 0 {
            self.retry_max_backoff_ms = 10000;
        }
    }
}

/// Server-side outbound dialer selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutboundConfig {
    #[serde(rename = "type", default)]
    pub outbound_type: OutboundType,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboundType {
    #[default]
    Direct,
    Socks5,
}

/// Datagram obfuscation layered under the embedded transport.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObfsConfig {
    #[serde(default)]
    pub mode: ObfsMode,
    #[serde(default)]
    pub padding: PaddingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObfsMode {
    #[default]
    None,
    Padding,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaddingConfig {
    #[serde(default = "default_min_pad")]
    pub min_pad: usize,
    #[serde(default = "default_max_pad")]
    pub max_pad: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            min_pad: default_min_pad(),
            max_pad: default_max_pad(),
        }
    }
}

fn default_min_pad() -> usize {
    16
}

fn default_max_pad() -> usize {
    128
}

/// Validate a shared secret: exactly 64 hexadecimal characters (32 bytes).
pub fn validate_secret(key: &str) -> Result<[u8; 32]> {
    if key.len() != 64 {
        return Err(Error::config(format!(
            "secret key must be 64 hex characters, got {}",
            key.len()
        )));
    }
    let bytes = hex::decode(key)
        .map_err(|_| Error::config("secret key must be hexadecimal"))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags_parse() {
        let f = TcpFlags::parse("PA").unwrap();
        assert!(f.psh && f.ack);
        assert!(!f.syn && !f.fin && !f.rst);

        let f = TcpFlags::parse("SFRPAUECN").unwrap();
        assert!(f.syn && f.fin && f.rst && f.psh && f.ack && f.urg && f.ece && f.cwr && f.ns);

        assert!(TcpFlags::parse("PX").is_err());
        assert!(TcpFlags::parse("p").is_err());
    }

    #[test]
    fn test_seq_increment() {
        assert_eq!(TcpFlags::parse("S").unwrap().seq_increment(), 1);
        assert_eq!(TcpFlags::parse("F").unwrap().seq_increment(), 1);
        assert_eq!(TcpFlags::parse("SA").unwrap().seq_increment(), 1);
        assert_eq!(TcpFlags::parse("PA").unwrap().seq_increment(), 0);
    }

    #[test]
    fn test_tcp_preset_restrictive() {
        let mut tcp = TcpConfig {
            preset: "restrictive".to_string(),
            ..Default::default()
        };
        tcp.set_defaults();
        assert_eq!(tcp.local_flag, vec!["PA", "A"]);
        assert_eq!(tcp.remote_flag, vec!["PA", "A"]);
    }

    #[test]
    fn test_tcp_default_flags() {
        let mut tcp = TcpConfig::default();
        tcp.set_defaults();
        assert_eq!(tcp.local_flag, vec!["PA"]);
        assert_eq!(tcp.remote_flag, vec!["PA"]);
    }

    #[test]
    fn test_validate_secret() {
        let key = "a".repeat(64);
        assert!(validate_secret(&key).is_ok());
        let key = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert!(validate_secret(key).is_ok());

        assert!(validate_secret("deadbeef").is_err());
        assert!(validate_secret(&"a".repeat(63)).is_err());
        assert!(validate_secret(&"a".repeat(65)).is_err());
        let mut bad = "a".repeat(63);
        bad.push('g');
        assert!(validate_secret(&bad).is_err());
    }

    #[test]
    fn test_kcp_mode_tuning() {
        assert_eq!(KcpMode::Normal.tuning(), (false, 40, 2, true));
        assert_eq!(KcpMode::Fast3.tuning(), (true, 10, 2, true));
    }

    #[test]
    fn test_pcap_defaults_per_role() {
        let mut p = PcapConfig::default();
        p.set_defaults(Role::Server);
        assert_eq!(p.sockbuf, 8 * 1024 * 1024);
        assert_eq!(p.send_queue_size, 1000);
        assert_eq!(p.max_retries, 3);

        let mut p = PcapConfig::default();
        p.set_defaults(Role::Client);
        assert_eq!(p.sockbuf, 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_minimal_client_yaml() {
        let yaml = r#"
role: client
server:
  addr: "203.0.113.7:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.10:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  conn: 2
  kcp:
    key: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
socks5:
  - listen: "127.0.0.1:1080"
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.set_defaults();
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.transport.conn, 2);
        assert_eq!(cfg.transport.protocol, TransportProtocol::Kcp);
        assert_eq!(cfg.socks5.len(), 1);
        assert_eq!(cfg.network.ipv4_ttl, 64);
        assert_eq!(cfg.transport.kcp.mtu, 1350);
    }

    #[test]
    fn test_listen_port() {
        let l = ListenConfig {
            addr: ":9000".to_string(),
        };
        assert_eq!(l.port(), Some(9000));
        let l = ListenConfig {
            addr: "0.0.0.0:443".to_string(),
        };
        assert_eq!(l.port(), Some(443));
        let l = ListenConfig::default();
        assert_eq!(l.port(), None);
    }
}
