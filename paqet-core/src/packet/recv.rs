use crate::error::{Error, Result};
use crate::flow::FlowTable;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// TCP metadata of a captured inbound segment.
#[derive(Debug, Clone, Default)]
pub struct TcpMeta {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack_flag: bool,
    pub payload_len: usize,
    pub tsval: Option<u32>,
}

impl TcpMeta {
    /// Sequence space consumed by this segment.
    pub fn seq_increment(&self) -> u32 {
        let flag_inc = if self.syn || self.fin { 1 } else { 0 };
        (self.payload_len as u32).wrapping_add(flag_inc)
    }
}

/// A captured datagram surfaced to the packet channel.
#[derive(Debug)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub src: SocketAddr,
    pub meta: TcpMeta,
}

/// Parse a captured Ethernet frame into payload, source endpoint and TCP
/// metadata. Frames without an IP/TCP layer or without a source endpoint
/// yield `None`.
pub fn parse_frame(data: &[u8]) -> Option<Inbound> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let mut meta = TcpMeta::default();
    match sliced.net? {
        NetSlice::Ipv4(v4) => {
            meta.src_ip = Some(IpAddr::V4(v4.header().source_addr()));
            meta.dst_ip = Some(IpAddr::V4(v4.header().destination_addr()));
        }
        NetSlice::Ipv6(v6) => {
            meta.src_ip = Some(IpAddr::V6(v6.header().source_addr()));
            meta.dst_ip = Some(IpAddr::V6(v6.header().destination_addr()));
        }
    }

    let tcp = match sliced.transport? {
        TransportSlice::Tcp(tcp) => tcp,
        _ => return None,
    };
    meta.src_port = tcp.source_port();
    meta.dst_port = tcp.destination_port();
    meta.seq = tcp.sequence_number();
    meta.ack = tcp.acknowledgment_number();
    meta.syn = tcp.syn();
    meta.fin = tcp.fin();
    meta.rst = tcp.rst();
    meta.psh = tcp.psh();
    meta.ack_flag = tcp.ack();
    meta.tsval = parse_tsval(tcp.options());

    let payload = tcp.payload().to_vec();
    meta.payload_len = payload.len();

    let src_ip = meta.src_ip?;
    if meta.src_port == 0 {
        return None;
    }
    Some(Inbound {
        payload,
        src: SocketAddr::new(src_ip, meta.src_port),
        meta,
    })
}

/// Scan raw TCP option bytes for the timestamps option (kind 8, length 10)
/// and extract TSval.
fn parse_tsval(mut opts: &[u8]) -> Option<u32> {
    while !opts.is_empty() {
        match opts[0] {
            0 => return None,
            1 => opts = &opts[1..],
            kind => {
                if opts.len() < 2 {
                    return None;
                }
                let len = opts[1] as usize;
                if len < 2 || opts.len() < len {
                    return None;
                }
                if kind == 8 && len == 10 {
                    return Some(u32::from_be_bytes([opts[2], opts[3], opts[4], opts[5]]));
                }
                opts = &opts[len..];
            }
        }
    }
    None
}

/// Pulls frames matching the BPF filter off the wire and surfaces them as
/// datagrams. A dedicated capture thread feeds a bounded channel; observed
/// segments update the flow table on the way through.
pub struct RecvHandle {
    rx: Mutex<mpsc::Receiver<Inbound>>,
    cancel: CancellationToken,
}

impl RecvHandle {
    pub fn new(
        mut capture: pcap::Capture<pcap::Active>,
        flows: Arc<FlowTable>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let thread_cancel = cancel.clone();

        std::thread::Builder::new()
            .name("paqet-capture".to_string())
            .spawn(move || {
                loop {
                    if thread_cancel.is_cancelled() {
                        return;
                    }
                    match capture.next_packet() {
                        Ok(packet) => {
                            let Some(inbound) = parse_frame(packet.data) else {
                                continue;
                            };
                            flows.observe(
                                inbound.src,
                                inbound.meta.seq,
                                inbound.meta.seq_increment(),
                                inbound.meta.tsval,
                            );
                            if tx.blocking_send(inbound).is_err() {
                                return;
                            }
                        }
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(e) => {
                            tracing::debug!("capture read failed: {}", e);
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn capture thread");

        Self {
            rx: Mutex::new(rx),
            cancel,
        }
    }

    /// Await the next inbound datagram.
    pub async fn read(&self) -> Result<Inbound> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            inbound = rx.recv() => inbound.ok_or_else(|| Error::capture("capture channel closed")),
        }
    }

    /// Poll-based receive, for the QUIC socket glue.
    pub fn poll_read(
        &self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Inbound>> {
        let mut rx = match self.rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => {
                cx.waker().wake_by_ref();
                return std::task::Poll::Pending;
            }
        };
        rx.poll_recv(cx)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddrConfig, NetworkConfig, TcpConfig};
    use crate::packet::send::FrameBuilder;

    fn frame_builder() -> FrameBuilder {
        let cfg = NetworkConfig {
            interface: "eth0".to_string(),
            ipv4: AddrConfig {
                addr: "192.0.2.10:9000".to_string(),
                router_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                router: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            },
            local_mac: [2, 0, 0, 0, 0, 1],
            tcp: TcpConfig {
                local_flag: vec!["PA".to_string()],
                remote_flag: vec!["PA".to_string()],
                preset: String::new(),
            },
            ipv4_ttl: 64,
            ipv6_hoplimit: 64,
            port: 9000,
            ..Default::default()
        };
        FrameBuilder::new(&cfg, 9000, Arc::new(FlowTable::new())).unwrap()
    }

    #[test]
    fn test_parse_round_trip() {
        let b = frame_builder();
        let dst: SocketAddr = "198.51.100.1:443".parse().unwrap();
        b.flows().observe(dst, 500, 10, Some(42));

        let frame = b.build(b"tunnel payload", dst).unwrap();
        let inbound = parse_frame(&frame).unwrap();

        assert_eq!(inbound.payload, b"tunnel payload");
        assert_eq!(inbound.src, "192.0.2.10:9000".parse().unwrap());
        assert_eq!(inbound.meta.dst_port, 443);
        assert_eq!(inbound.meta.ack, 510);
        assert!(inbound.meta.psh && inbound.meta.ack_flag);
        assert!(inbound.meta.tsval.is_some());
        assert_eq!(inbound.meta.payload_len, 14);
    }

    #[test]
    fn test_parse_rejects_non_ethernet_garbage() {
        assert!(parse_frame(&[0u8; 4]).is_none());
        assert!(parse_frame(&[]).is_none());
    }

    #[test]
    fn test_parse_tsval() {
        // NOP, NOP, TS(0x01020304, 0)
        let mut opts = vec![1u8, 1, 8, 10];
        opts.extend_from_slice(&0x0102_0304u32.to_be_bytes());
        opts.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(parse_tsval(&opts), Some(0x0102_0304));

        // MSS only
        assert_eq!(parse_tsval(&[2, 4, 0x05, 0xb4]), None);
        // End of options
        assert_eq!(parse_tsval(&[0, 8, 10]), None);
        // Truncated option
        assert_eq!(parse_tsval(&[8, 10, 1]), None);
    }

    #[test]
    fn test_seq_increment() {
        let meta = TcpMeta {
            payload_len: 50,
            ..Default::default()
        };
        assert_eq!(meta.seq_increment(), 50);

        let meta = TcpMeta {
            syn: true,
            ..Default::default()
        };
        assert_eq!(meta.seq_increment(), 1);

        let meta = TcpMeta {
            fin: true,
            payload_len: 3,
            ..Default::default()
        };
        assert_eq!(meta.seq_increment(), 4);
    }
}
