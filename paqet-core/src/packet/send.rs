use crate::config::{NetworkConfig, PcapConfig, TcpFlags};
use crate::error::{Error, Result};
use crate::flow::{FlowKey, FlowTable};
use crate::util::iterator::RoundRobin;
use etherparse::{EtherType, Ethernet2Header, IpNumber, Ipv4Header, Ipv6Header, TcpHeader};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Process-wide TCP timestamp clock: one tick per built segment, the
/// emitted TSval advances every 8 segments on top of the boot epoch.
static TS_COUNTER: AtomicU32 = AtomicU32::new(0);

static BOOT_MS: Lazy<u32> = Lazy::new(|| {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
});

/// Injects a serialized Ethernet frame into the wire.
pub trait Inject: Send + Sync {
    fn inject(&self, frame: &[u8]) -> Result<()>;
}

/// libpcap-backed injector.
pub struct PcapInjector {
    handle: parking_lot::Mutex<pcap::Capture<pcap::Active>>,
}

impl PcapInjector {
    pub fn new(handle: pcap::Capture<pcap::Active>) -> Self {
        Self {
            handle: parking_lot::Mutex::new(handle),
        }
    }
}

impl Inject for PcapInjector {
    fn inject(&self, frame: &[u8]) -> Result<()> {
        self.handle
            .lock()
            .sendpacket(frame)
            .map_err(|e| Error::injection(e.to_string()))
    }
}

/// Builds wire-correct Ethernet+IP+TCP frames carrying tunnel datagrams,
/// maintaining per-flow sequence/ack/timestamp state.
pub struct FrameBuilder {
    local_mac: [u8; 6],
    src_port: u16,
    ipv4: Option<(std::net::Ipv4Addr, [u8; 6])>,
    ipv6: Option<(std::net::Ipv6Addr, [u8; 6])>,
    ipv4_tos: u8,
    ipv4_df: bool,
    ipv4_ttl: u8,
    ipv6_tc: u8,
    ipv6_hoplimit: u8,
    flows: Arc<FlowTable>,
    local_profiles: RoundRobin<TcpFlags>,
    remote_overrides: RwLock<HashMap<FlowKey, Arc<RoundRobin<TcpFlags>>>>,
}

impl FrameBuilder {
    pub fn new(cfg: &NetworkConfig, port: u16, flows: Arc<FlowTable>) -> Result<Self> {
        let profiles = cfg.tcp.local_profiles()?;
        let ipv4 = cfg.ipv4.socket_addr().and_then(|a| match a.ip() {
            IpAddr::V4(ip) => Some((ip, cfg.ipv4.router)),
            _ => None,
        });
        let ipv6 = cfg.ipv6.socket_addr().and_then(|a| match a.ip() {
            IpAddr::V6(ip) => Some((ip, cfg.ipv6.router)),
            _ => None,
        });
        Ok(Self {
            local_mac: cfg.local_mac,
            src_port: port,
            ipv4,
            ipv6,
            ipv4_tos: cfg.ipv4_tos,
            ipv4_df: cfg.ipv4_df,
            ipv4_ttl: cfg.ipv4_ttl,
            ipv6_tc: cfg.ipv6_tc,
            ipv6_hoplimit: cfg.ipv6_hoplimit,
            flows,
            local_profiles: RoundRobin::new(profiles),
            remote_overrides: RwLock::new(HashMap::new()),
        })
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    /// Install a per-destination flag profile override.
    pub fn set_remote_profile(&self, addr: SocketAddr, profiles: Vec<TcpFlags>) {
        if profiles.is_empty() {
            return;
        }
        self.remote_overrides
            .write()
            .insert(addr.into(), Arc::new(RoundRobin::new(profiles)));
    }

    fn select_flags(&self, key: FlowKey) -> TcpFlags {
        if let Some(it) = self.remote_overrides.read().get(&key) {
            if let Some(f) = it.next() {
                return *f;
            }
        }
        self.local_profiles.next().copied().unwrap_or_default()
    }

    /// Build one Ethernet frame for `payload` towards `dst`. Advances the
    /// flow's sequence state and the global timestamp counter exactly once.
    pub fn build(&self, payload: &[u8], dst: SocketAddr) -> Result<Vec<u8>> {
        let key: FlowKey = dst.into();
        let flags = self.select_flags(key);

        let counter = TS_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let ts_val = BOOT_MS.wrapping_add(counter >> 3);

        let state = self.flows.entry(key);
        let (seq, ack, ts_ecr) = {
            let mut state = state.lock();
            let ack = state.ack_value();
            let ts_ecr = state.last_remote_tsval;
            let seq = state.claim_seq(payload.len() as u32, flags.seq_increment());
            (seq, ack, ts_ecr)
        };

        let mut tcp = TcpHeader::new(self.src_port, dst.port(), seq, 65535);
        tcp.acknowledgment_number = ack;
        tcp.fin = flags.fin;
        tcp.syn = flags.syn;
        tcp.rst = flags.rst;
        tcp.psh = flags.psh;
        tcp.ack = flags.ack;
        tcp.urg = flags.urg;
        tcp.ece = flags.ece;
        tcp.cwr = flags.cwr;
        tcp.ns = flags.ns;
        tcp.set_options_raw(&tcp_options(flags.syn, ts_val, ts_ecr))
            .map_err(|e| Error::injection(format!("failed to set TCP options: {:?}", e)))?;

        let ip_payload_len = tcp.header_len() as usize + payload.len();

        let mut frame = Vec::with_capacity(14 + 40 + ip_payload_len);
        match dst.ip() {
            IpAddr::V4(dst_ip) => {
                let (src_ip, router_mac) = self
                    .ipv4
                    .ok_or_else(|| Error::injection("destination is IPv4 but no IPv4 interface is configured"))?;
                let mut ip = Ipv4Header::new(
                    ip_payload_len as u16,
                    self.ipv4_ttl,
                    IpNumber::TCP,
                    src_ip.octets(),
                    dst_ip.octets(),
                )
                .map_err(|e| Error::injection(format!("IPv4 header: {}", e)))?;
                ip.dscp = etherparse::Ipv4Dscp::try_new(self.ipv4_tos >> 2)
                    .map_err(|e| Error::injection(format!("IPv4 DSCP: {}", e)))?;
                ip.ecn = etherparse::Ipv4Ecn::try_new(self.ipv4_tos & 0x3)
                    .map_err(|e| Error::injection(format!("IPv4 ECN: {}", e)))?;
                ip.dont_fragment = self.ipv4_df;
                tcp.checksum = tcp
                    .calc_checksum_ipv4(&ip, payload)
                    .map_err(|e| Error::injection(format!("TCP checksum: {}", e)))?;

                let eth = Ethernet2Header {
                    source: self.local_mac,
                    destination: router_mac,
                    ether_type: EtherType::IPV4,
                };
                eth.write(&mut frame)
                    .map_err(|e| Error::injection(format!("Ethernet header: {}", e)))?;
                ip.write(&mut frame)
                    .map_err(|e| Error::injection(format!("IPv4 header: {}", e)))?;
            }
            IpAddr::V6(dst_ip) => {
                let (src_ip, router_mac) = self
                    .ipv6
                    .ok_or_else(|| Error::injection("destination is IPv6 but no IPv6 interface is configured"))?;
                let ip = Ipv6Header {
                    traffic_class: self.ipv6_tc,
                    flow_label: etherparse::Ipv6FlowLabel::ZERO,
                    payload_length: ip_payload_len as u16,
                    next_header: IpNumber::TCP,
                    hop_limit: self.ipv6_hoplimit,
                    source: src_ip.octets(),
                    destination: dst_ip.octets(),
                };
                tcp.checksum = tcp
                    .calc_checksum_ipv6(&ip, payload)
                    .map_err(|e| Error::injection(format!("TCP checksum: {}", e)))?;

                let eth = Ethernet2Header {
                    source: self.local_mac,
                    destination: router_mac,
                    ether_type: EtherType::IPV6,
                };
                eth.write(&mut frame)
                    .map_err(|e| Error::injection(format!("Ethernet header: {}", e)))?;
                ip.write(&mut frame)
                    .map_err(|e| Error::injection(format!("IPv6 header: {}", e)))?;
            }
        }
        tcp.write(&mut frame)
            .map_err(|e| Error::injection(format!("TCP header: {}", e)))?;
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

/// TCP option bytes. SYN segments advertise MSS 1460, SACK, timestamps and
/// window scale 8; everything else carries NOP-padded timestamps only.
fn tcp_options(syn: bool, ts_val: u32, ts_ecr: u32) -> Vec<u8> {
    let mut opts = Vec::with_capacity(20);
    if syn {
        // MSS 1460
        opts.extend_from_slice(&[2, 4, 0x05, 0xb4]);
        // SACK permitted
        opts.extend_from_slice(&[4, 2]);
        push_timestamps(&mut opts, ts_val, ts_ecr);
        // NOP + window scale 8
        opts.push(1);
        opts.extend_from_slice(&[3, 3, 8]);
    } else {
        opts.extend_from_slice(&[1, 1]);
        push_timestamps(&mut opts, ts_val, ts_ecr);
    }
    opts
}

fn push_timestamps(opts: &mut Vec<u8>, ts_val: u32, ts_ecr: u32) {
    opts.extend_from_slice(&[8, 10]);
    opts.extend_from_slice(&ts_val.to_be_bytes());
    opts.extend_from_slice(&ts_ecr.to_be_bytes());
}

struct SendRequest {
    payload: Vec<u8>,
    dst: SocketAddr,
    retries: u32,
    done: oneshot::Sender<Result<()>>,
}

/// The send pipeline: a bounded queue drained by worker tasks into the
/// injector, with bounded exponential-backoff retries and drop-on-overflow
/// backpressure.
pub struct SendHandle {
    builder: Arc<FrameBuilder>,
    queue_tx: mpsc::Sender<SendRequest>,
    // Keeps the queue open even when no worker is running.
    _queue_rx: Arc<Mutex<mpsc::Receiver<SendRequest>>>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl SendHandle {
    pub fn new(
        builder: Arc<FrameBuilder>,
        injector: Arc<dyn Inject>,
        pcap_cfg: PcapConfig,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(pcap_cfg.send_queue_size.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = SendWorker {
            builder: builder.clone(),
            injector,
            queue_tx: queue_tx.clone(),
            queue_rx: queue_rx.clone(),
            dropped: dropped.clone(),
            cancel: cancel.clone(),
            max_retries: pcap_cfg.max_retries,
            initial_backoff: Duration::from_millis(pcap_cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(pcap_cfg.max_backoff_ms),
        };
        for _ in 0..workers {
            let w = worker.clone();
            tokio::spawn(async move { w.run().await });
        }

        Self {
            builder,
            queue_tx,
            _queue_rx: queue_rx,
            dropped,
            cancel,
        }
    }

    pub fn builder(&self) -> &Arc<FrameBuilder> {
        &self.builder
    }

    /// Enqueue a payload for injection and await its outcome. A full queue
    /// rejects immediately with `QueueFull`.
    pub async fn write(&self, payload: &[u8], dst: SocketAddr) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let req = SendRequest {
            payload: payload.to_vec(),
            dst,
            retries: 0,
            done: done_tx,
        };
        match self.queue_tx.try_send(req) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(Error::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::Cancelled),
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = done_rx => result.map_err(|_| Error::Cancelled)?,
        }
    }

    /// Enqueue without awaiting completion; losses are counted and the
    /// embedded transport retransmits.
    pub fn write_detached(&self, payload: &[u8], dst: SocketAddr) {
        let (done_tx, _) = oneshot::channel();
        let req = SendRequest {
            payload: payload.to_vec(),
            dst,
            retries: 0,
            done: done_tx,
        };
        if self.queue_tx.try_send(req).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
struct SendWorker {
    builder: Arc<FrameBuilder>,
    injector: Arc<dyn Inject>,
    queue_tx: mpsc::Sender<SendRequest>,
    queue_rx: Arc<Mutex<mpsc::Receiver<SendRequest>>>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl SendWorker {
    async fn run(self) {
        loop {
            let req = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => return,
                    },
                }
            };
            self.process(req).await;
        }
    }

    async fn process(&self, mut req: SendRequest) {
        let result = self
            .builder
            .build(&req.payload, req.dst)
            .and_then(|frame| self.injector.inject(&frame));

        match result {
            Ok(()) => {
                let _ = req.done.send(Ok(()));
            }
            Err(err) if req.retries < self.max_retries => {
                req.retries += 1;
                let backoff = calculate_backoff(self.initial_backoff, self.max_backoff, req.retries);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        let _ = req.done.send(Err(Error::Cancelled));
                    }
                    _ = tokio::time::sleep(backoff) => {
                        if let Err(mpsc::error::TrySendError::Full(rejected)) = self.queue_tx.try_send(req) {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            let _ = rejected.done.send(Err(err));
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!("packet send to {} failed after {} retries: {}", req.dst, req.retries, err);
                let _ = req.done.send(Err(err));
            }
        }
    }
}

/// Exponential backoff capped at `max`, with up to +20% jitter.
pub fn calculate_backoff(initial: Duration, max: Duration, retries: u32) -> Duration {
    let exp = retries.saturating_sub(1).min(32);
    let base = initial
        .as_millis()
        .saturating_mul(1u128 << exp)
        .min(max.as_millis()) as f64;
    let jitter = base * 0.2 * rand::thread_rng().gen::<f64>();
    Duration::from_millis((base + jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddrConfig, TcpConfig};
    use etherparse::{SlicedPacket, TransportSlice};
    use std::sync::atomic::AtomicUsize;

    fn test_network(local_flags: Vec<&str>) -> NetworkConfig {
        let mut cfg = NetworkConfig {
            interface: "eth0".to_string(),
            ipv4: AddrConfig {
                addr: "192.0.2.10:9000".to_string(),
                router_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                router: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            },
            local_mac: [2, 0, 0, 0, 0, 1],
            tcp: TcpConfig {
                local_flag: local_flags.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.ipv4_ttl = 64;
        cfg.ipv6_hoplimit = 64;
        cfg.port = 9000;
        cfg
    }

    fn builder(local_flags: Vec<&str>) -> FrameBuilder {
        FrameBuilder::new(&test_network(local_flags), 9000, Arc::new(FlowTable::new())).unwrap()
    }

    fn parse_tcp(frame: &[u8]) -> (u32, u32, TcpHeader, Vec<u8>) {
        let sliced = SlicedPacket::from_ethernet(frame).unwrap();
        match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                let header = tcp.to_header();
                (
                    header.sequence_number,
                    header.acknowledgment_number,
                    header,
                    tcp.payload().to_vec(),
                )
            }
            _ => panic!("expected a TCP frame"),
        }
    }

    #[test]
    fn test_sequence_advance_across_segments() {
        let b = builder(vec!["S", "PA"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        // First segment is SYN with empty payload.
        let f1 = b.build(&[], dst).unwrap();
        let (seq0, _, h1, _) = parse_tcp(&f1);
        assert!(h1.syn);

        // Second is PSH+ACK with a 100-byte payload.
        let payload = vec![0u8; 100];
        let f2 = b.build(&payload, dst).unwrap();
        let (seq1, _, h2, body) = parse_tcp(&f2);
        assert!(h2.psh && h2.ack);
        assert_eq!(seq1, seq0.wrapping_add(1));
        assert_eq!(body.len(), 100);

        // Third starts 100 past the second.
        let f3 = b.build(&[1, 2, 3], dst).unwrap();
        let (seq2, _, _, _) = parse_tcp(&f3);
        assert_eq!(seq2, seq0.wrapping_add(101));
    }

    #[test]
    fn test_ack_echoes_observed_remote() {
        let b = builder(vec!["PA"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        let f = b.build(b"x", dst).unwrap();
        let (_, ack, _, _) = parse_tcp(&f);
        assert_eq!(ack, 0);

        b.flows().observe(dst, 1000, 50, None);
        let f = b.build(b"x", dst).unwrap();
        let (_, ack, _, _) = parse_tcp(&f);
        assert_eq!(ack, 1050);

        b.flows().observe(dst, 2000, 1, None);
        let f = b.build(b"x", dst).unwrap();
        let (_, ack, _, _) = parse_tcp(&f);
        assert_eq!(ack, 2001);
    }

    #[test]
    fn test_flag_profile_rotation() {
        let b = builder(vec!["PA", "A"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        let flags: Vec<(bool, bool)> = (0..3)
            .map(|_| {
                let f = b.build(b"x", dst).unwrap();
                let (_, _, h, _) = parse_tcp(&f);
                (h.psh, h.ack)
            })
            .collect();
        assert_eq!(flags, vec![(true, true), (false, true), (true, true)]);
    }

    #[test]
    fn test_remote_profile_override() {
        let b = builder(vec!["PA"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();
        let other: SocketAddr = "198.51.100.2:443".parse().unwrap();
        b.set_remote_profile(dst, vec![TcpFlags::parse("A").unwrap()]);

        let f = b.build(b"x", dst).unwrap();
        let (_, _, h, _) = parse_tcp(&f);
        assert!(h.ack && !h.psh);

        // Other destinations keep the default rotation.
        let f = b.build(b"x", other).unwrap();
        let (_, _, h, _) = parse_tcp(&f);
        assert!(h.ack && h.psh);
    }

    #[test]
    fn test_timestamp_option_present_and_echoed() {
        let b = builder(vec!["PA"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();
        b.flows().observe(dst, 1, 1, Some(0xDEAD_BEEF));

        let f = b.build(b"x", dst).unwrap();
        let (_, _, h, _) = parse_tcp(&f);
        let opts: Vec<u8> = h.options.as_slice().to_vec();
        // NOP, NOP, then the timestamps option.
        assert_eq!(&opts[..4], &[1, 1, 8, 10]);
        let ts_ecr = u32::from_be_bytes([opts[8], opts[9], opts[10], opts[11]]);
        assert_eq!(ts_ecr, 0xDEAD_BEEF);
    }

    #[test]
    fn test_syn_options_layout() {
        let b = builder(vec!["S"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();
        let f = b.build(&[], dst).unwrap();
        let (_, _, h, _) = parse_tcp(&f);
        let opts: Vec<u8> = h.options.as_slice().to_vec();
        assert_eq!(opts.len(), 20);
        // MSS 1460
        assert_eq!(&opts[..4], &[2, 4, 0x05, 0xb4]);
        // SACK permitted
        assert_eq!(&opts[4..6], &[4, 2]);
        // Timestamps
        assert_eq!(&opts[6..8], &[8, 10]);
        // NOP + window scale 8
        assert_eq!(opts[16], 1);
        assert_eq!(&opts[17..20], &[3, 3, 8]);
    }

    #[test]
    fn test_window_and_checksum() {
        let b = builder(vec!["PA"]);
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();
        let f = b.build(b"hello", dst).unwrap();
        let sliced = SlicedPacket::from_ethernet(&f).unwrap();
        let tcp = match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => tcp,
            _ => panic!("expected TCP"),
        };
        assert_eq!(tcp.window_size(), 65535);

        // Recomputing the checksum over the parsed headers must agree.
        let net = match sliced.net {
            Some(etherparse::NetSlice::Ipv4(v4)) => v4,
            _ => panic!("expected IPv4"),
        };
        let header = tcp.to_header();
        let expected = header
            .calc_checksum_ipv4(&net.header().to_header(), tcp.payload())
            .unwrap();
        assert_eq!(header.checksum, expected);
    }

    struct MockInjector {
        sent: AtomicUsize,
        fail_first: usize,
    }

    impl MockInjector {
        fn new(fail_first: usize) -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    impl Inject for MockInjector {
        fn inject(&self, _frame: &[u8]) -> Result<()> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::injection("mock failure"))
            } else {
                Ok(())
            }
        }
    }

    fn pcap_cfg(queue: usize, retries: u32) -> PcapConfig {
        PcapConfig {
            sockbuf: 1024 * 1024,
            send_queue_size: queue,
            max_retries: retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_backpressure() {
        let builder = Arc::new(builder(vec!["PA"]));
        let injector = Arc::new(MockInjector::new(0));
        // 0 workers: nothing drains the queue.
        let handle = SendHandle::new(builder, injector, pcap_cfg(2, 0), 0, CancellationToken::new());
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        let h = Arc::new(handle);
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move { h.write(b"x", dst).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The third submit is rejected immediately.
        let err = h.write(b"x", dst).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert_eq!(h.dropped_packets(), 1);
        assert_eq!(h.queue_depth(), 2);

        h.close();
        for t in tasks {
            let res = t.await.unwrap();
            assert!(matches!(res, Err(Error::Cancelled)));
        }
    }

    #[tokio::test]
    async fn test_worker_retries_then_succeeds() {
        let builder = Arc::new(builder(vec!["PA"]));
        let injector = Arc::new(MockInjector::new(2));
        let handle = SendHandle::new(
            builder,
            injector.clone(),
            pcap_cfg(16, 3),
            2,
            CancellationToken::new(),
        );
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        handle.write(b"retry me", dst).await.unwrap();
        assert_eq!(injector.sent.load(Ordering::SeqCst), 3);
        handle.close();
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let builder = Arc::new(builder(vec!["PA"]));
        let injector = Arc::new(MockInjector::new(usize::MAX));
        let handle = SendHandle::new(
            builder,
            injector.clone(),
            pcap_cfg(16, 2),
            1,
            CancellationToken::new(),
        );
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();

        let err = handle.write(b"doomed", dst).await.unwrap_err();
        assert!(matches!(err, Error::Injection { .. }));
        // max_retries + 1 total attempts.
        assert_eq!(injector.sent.load(Ordering::SeqCst), 3);
        handle.close();
    }

    #[test]
    fn test_backoff_table() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(10_000);
        let expected = [100u64, 200, 400, 800, 1600, 3200];
        for (i, base) in expected.iter().enumerate() {
            let d = calculate_backoff(initial, max, (i + 1) as u32).as_millis() as u64;
            assert!(d >= *base, "attempt {}: {} < {}", i + 1, d, base);
            assert!(d <= base + base / 5, "attempt {}: {} > {}", i + 1, d, base + base / 5);
        }
        // Attempt 10 is capped at the maximum.
        let d = calculate_backoff(initial, max, 10).as_millis() as u64;
        assert!((10_000..=12_000).contains(&d));
    }
}
