use crate::config::{Config, KcpConfig};
use crate::error::{Error, Result};
use crate::packet::PacketChannel;
use crate::transport::crypto::DatagramCipher;
use crate::transport::mux::{FramePipe, MuxSession, MuxStream};
use crate::transport::{Connection, Listener, Stream};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

const KCP_RTO_NDL: u32 = 30;
const KCP_RTO_MIN: u32 = 100;
const KCP_RTO_DEF: u32 = 200;
const KCP_RTO_MAX: u32 = 60000;
const KCP_CMD_PUSH: u8 = 81;
const KCP_CMD_ACK: u8 = 82;
const KCP_CMD_WASK: u8 = 83;
const KCP_CMD_WINS: u8 = 84;
const KCP_ASK_SEND: u32 = 1;
const KCP_ASK_TELL: u32 = 2;
const KCP_WND_RCV_MIN: u32 = 128;
const KCP_OVERHEAD: usize = 24;
const KCP_DEADLINK: u32 = 20;
const KCP_THRESH_INIT: u32 = 2;
const KCP_THRESH_MIN: u32 = 2;

#[derive(Debug, Clone)]
struct Segment {
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    resendts: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: Vec<u8>,
}

impl Segment {
    fn new(conv: u32) -> Self {
        Self {
            conv,
            cmd: KCP_CMD_PUSH,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
            data: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KCP_OVERHEAD + self.data.len());
        buf.extend_from_slice(&self.conv.to_le_bytes());
        buf.push(self.cmd);
        buf.push(self.frg);
        buf.extend_from_slice(&self.wnd.to_le_bytes());
        buf.extend_from_slice(&self.ts.to_le_bytes());
        buf.extend_from_slice(&self.sn.to_le_bytes());
        buf.extend_from_slice(&self.una.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < KCP_OVERHEAD {
            return None;
        }
        let conv = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let cmd = data[4];
        let frg = data[5];
        let wnd = u16::from_le_bytes([data[6], data[7]]);
        let ts = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let sn = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        let una = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        let len = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;
        if data.len() < KCP_OVERHEAD + len {
            return None;
        }
        Some((
            Self {
                conv,
                cmd,
                frg,
                wnd,
                ts,
                sn,
                una,
                resendts: 0,
                rto: 0,
                fastack: 0,
                xmit: 0,
                data: data[KCP_OVERHEAD..KCP_OVERHEAD + len].to_vec(),
            },
            KCP_OVERHEAD + len,
        ))
    }
}

/// Read the conversation id off the front of a raw KCP datagram.
pub fn peek_conv(data: &[u8]) -> Option<u32> {
    if data.len() < KCP_OVERHEAD {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Structural sanity check before a datagram may create a listener
/// session: the first segment must decode and carry a known command.
fn plausible_datagram(data: &[u8]) -> bool {
    match Segment::decode(data) {
        Some((seg, _)) => (KCP_CMD_PUSH..=KCP_CMD_WINS).contains(&seg.cmd),
        None => false,
    }
}

/// The KCP ARQ engine: retransmission, windows and congestion state for one
/// conversation. Pure state machine; `flush` emits raw datagrams.
struct Kcp {
    conv: u32,
    mtu: usize,
    mss: usize,
    state: i32,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    ssthresh: u32,
    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,
    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    probe: u32,
    current: u32,
    interval: u32,
    ts_flush: u32,
    nodelay: bool,
    updated: bool,
    incr: u32,
    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,
    fastresend: i32,
    fastlimit: i32,
    nocwnd: bool,
}

impl Kcp {
    fn new(conv: u32, cfg: &KcpConfig) -> Self {
        let (nodelay, interval, resend, nc) = cfg.mode.tuning();
        let mut kcp = Self {
            conv,
            mtu: cfg.mtu,
            mss: cfg.mtu.saturating_sub(KCP_OVERHEAD).max(1),
            state: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: KCP_THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: KCP_RTO_DEF,
            rx_minrto: KCP_RTO_MIN,
            snd_wnd: cfg.sndwnd,
            rcv_wnd: cfg.rcvwnd.max(KCP_WND_RCV_MIN),
            rmt_wnd: KCP_WND_RCV_MIN,
            cwnd: 0,
            probe: 0,
            current: 0,
            interval: 100,
            ts_flush: 100,
            nodelay: false,
            updated: false,
            incr: 0,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            fastresend: 0,
            fastlimit: 5,
            nocwnd: false,
        };
        kcp.set_nodelay(nodelay, interval, resend, nc);
        kcp
    }

    fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: i32, nc: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { KCP_RTO_NDL } else { KCP_RTO_MIN };
        if interval > 0 {
            self.interval = interval.clamp(10, 5000);
        }
        self.fastresend = resend;
        self.nocwnd = nc;
    }

    fn is_dead(&self) -> bool {
        self.state < 0
    }

    /// Queue one application message for transmission, fragmenting to MSS.
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::protocol("empty KCP message"));
        }
        let count = if data.len() <= self.mss {
            1
        } else {
            data.len().div_ceil(self.mss)
        };
        if count > 255 {
            return Err(Error::protocol("KCP message exceeds fragment limit"));
        }
        let mut offset = 0;
        for i in 0..count {
            let size = std::cmp::min(self.mss, data.len() - offset);
            let mut seg = Segment::new(self.conv);
            seg.data = data[offset..offset + size].to_vec();
            seg.frg = (count - i - 1) as u8;
            self.snd_queue.push_back(seg);
            offset += size;
        }
        Ok(data.len())
    }

    /// Pop the next whole reassembled message, if any.
    fn recv(&mut self) -> Option<Vec<u8>> {
        if self.rcv_queue.is_empty() {
            return None;
        }
        let mut peeksize = 0;
        let mut complete = false;
        for seg in &self.rcv_queue {
            peeksize += seg.data.len();
            if seg.frg == 0 {
                complete = true;
                break;
            }
        }
        if !complete || peeksize == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(peeksize);
        while let Some(seg) = self.rcv_queue.pop_front() {
            let last = seg.frg == 0;
            data.extend_from_slice(&seg.data);
            if last {
                break;
            }
        }
        self.move_rcv_buf();
        Some(data)
    }

    fn move_rcv_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front().unwrap();
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.rcv_queue.push_back(seg);
            } else {
                break;
            }
        }
    }

    /// Feed one raw datagram into the engine.
    fn input(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < KCP_OVERHEAD {
            return Err(Error::protocol("KCP datagram too short"));
        }
        let mut offset = 0;
        let mut acked = false;
        let mut maxack: u32 = 0;
        let mut latest_ts: u32 = 0;
        while offset + KCP_OVERHEAD <= data.len() {
            let (seg, consumed) = match Segment::decode(&data[offset..]) {
                Some(s) => s,
                None => break,
            };
            if seg.conv != self.conv {
                return Err(Error::protocol("KCP conversation id mismatch"));
            }
            offset += consumed;
            self.rmt_wnd = seg.wnd as u32;
            self.parse_una(seg.una);
            self.shrink_buf();
            match seg.cmd {
                KCP_CMD_ACK => {
                    if self.current >= seg.ts {
                        self.update_ack(self.current - seg.ts);
                    }
                    self.parse_ack(seg.sn);
                    self.shrink_buf();
                    if !acked {
                        acked = true;
                        maxack = seg.sn;
                        latest_ts = seg.ts;
                    } else if seg.sn > maxack {
                        maxack = seg.sn;
                        latest_ts = seg.ts;
                    }
                }
                KCP_CMD_PUSH => {
                    if seg.sn < self.rcv_nxt.wrapping_add(self.rcv_wnd) {
                        self.acklist.push((seg.sn, seg.ts));
                        if seg.sn >= self.rcv_nxt {
                            self.parse_data(seg);
                        }
                    }
                }
                KCP_CMD_WASK => {
                    self.probe |= KCP_ASK_TELL;
                }
                KCP_CMD_WINS => {}
                _ => return Err(Error::protocol("unknown KCP command")),
            }
        }
        if acked {
            self.parse_fastack(maxack, latest_ts);
        }
        self.grow_cwnd();
        Ok(())
    }

    fn grow_cwnd(&mut self) {
        if self.snd_una <= self.cwnd {
            return;
        }
        let mss = self.mss as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + (mss / 16);
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd = if mss > 0 {
                    self.incr.div_ceil(mss)
                } else {
                    self.incr
                };
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd * mss;
        }
    }

    /// Emit pending acks, probes, new data and retransmissions as raw
    /// datagrams.
    fn flush(&mut self) -> Vec<Vec<u8>> {
        if !self.updated {
            return Vec::new();
        }
        let mut output = Vec::new();
        let wnd_unused = self.wnd_unused() as u16;
        let mut seg = Segment::new(self.conv);
        seg.wnd = wnd_unused;
        seg.una = self.rcv_nxt;

        for (sn, ts) in self.acklist.drain(..) {
            seg.cmd = KCP_CMD_ACK;
            seg.sn = sn;
            seg.ts = ts;
            output.push(seg.encode());
        }
        if self.probe & KCP_ASK_SEND != 0 {
            seg.cmd = KCP_CMD_WASK;
            output.push(seg.encode());
        }
        if self.probe & KCP_ASK_TELL != 0 {
            seg.cmd = KCP_CMD_WINS;
            output.push(seg.encode());
        }
        self.probe = 0;

        let cwnd = std::cmp::min(self.snd_wnd, self.rmt_wnd);
        let cwnd = if self.nocwnd {
            cwnd
        } else {
            std::cmp::min(cwnd, self.cwnd)
        };
        while self.snd_nxt < self.snd_una.wrapping_add(cwnd) {
            if let Some(mut newseg) = self.snd_queue.pop_front() {
                newseg.conv = self.conv;
                newseg.cmd = KCP_CMD_PUSH;
                newseg.wnd = wnd_unused;
                newseg.ts = self.current;
                newseg.sn = self.snd_nxt;
                newseg.una = self.rcv_nxt;
                newseg.resendts = self.current;
                newseg.rto = self.rx_rto;
                newseg.fastack = 0;
                newseg.xmit = 0;
                self.snd_buf.push_back(newseg);
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
            } else {
                break;
            }
        }

        let resent = if self.fastresend > 0 {
            self.fastresend as u32
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };
        let mut change = 0u32;
        let mut lost = 0u32;
        for seg in &mut self.snd_buf {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = self.current.wrapping_add(seg.rto).wrapping_add(rtomin);
            } else if self.current >= seg.resendts {
                needsend = true;
                seg.xmit += 1;
                if !self.nodelay {
                    seg.rto += std::cmp::max(seg.rto, self.rx_rto);
                } else {
                    seg.rto += seg.rto / 2;
                }
                seg.resendts = self.current.wrapping_add(seg.rto);
                lost += 1;
            } else if seg.fastack >= resent && (seg.xmit <= self.fastlimit as u32 || self.fastlimit <= 0)
            {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = self.current.wrapping_add(seg.rto);
                change += 1;
            }
            if needsend {
                seg.ts = self.current;
                seg.wnd = wnd_unused;
                seg.una = self.rcv_nxt;
                output.push(seg.encode());
                if seg.xmit >= KCP_DEADLINK {
                    self.state = -1;
                }
            }
        }

        if change > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = std::cmp::max(inflight / 2, KCP_THRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost > 0 {
            self.ssthresh = std::cmp::max(cwnd / 2, KCP_THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        output
    }

    fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = self.current;
        }
        let mut slap = self.current as i64 - self.ts_flush as i64;
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = self.current;
            slap = 0;
        }
        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if self.current >= self.ts_flush {
                self.ts_flush = self.current.wrapping_add(self.interval);
            }
        }
    }

    fn wnd_unused(&self) -> u32 {
        if self.rcv_queue.len() < self.rcv_wnd as usize {
            self.rcv_wnd - self.rcv_queue.len() as u32
        } else {
            0
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if una > seg.sn {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = if let Some(seg) = self.snd_buf.front() {
            seg.sn
        } else {
            self.snd_nxt
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if sn < self.snd_una || sn >= self.snd_nxt {
            return;
        }
        self.snd_buf.retain(|seg| seg.sn != sn);
    }

    fn parse_fastack(&mut self, sn: u32, _ts: u32) {
        if sn < self.snd_una || sn >= self.snd_nxt {
            return;
        }
        for seg in &mut self.snd_buf {
            if sn < seg.sn {
                break;
            } else if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, newseg: Segment) {
        let sn = newseg.sn;
        if sn >= self.rcv_nxt.wrapping_add(self.rcv_wnd) || sn < self.rcv_nxt {
            return;
        }
        let mut repeat = false;
        let mut insert_idx = self.rcv_buf.len();
        for (i, seg) in self.rcv_buf.iter().enumerate().rev() {
            if seg.sn == sn {
                repeat = true;
                break;
            }
            if seg.sn < sn {
                insert_idx = i + 1;
                break;
            }
            insert_idx = i;
        }
        if !repeat {
            self.rcv_buf.insert(insert_idx, newseg);
        }
        self.move_rcv_buf();
    }

    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt + std::cmp::max(self.interval, 4 * self.rx_rttval);
        self.rx_rto = rto.clamp(self.rx_minrto, KCP_RTO_MAX);
    }
}

/// One KCP conversation bound to a remote endpoint over the Packet Channel.
/// Datagrams out of `flush` are sealed with the configured cipher before
/// injection; inbound datagrams are fed in by the owning dialer/listener.
pub struct KcpSession {
    kcp: SyncMutex<Kcp>,
    channel: Arc<PacketChannel>,
    cipher: DatagramCipher,
    peer: SocketAddr,
    conv: u32,
    start: Instant,
    readable: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl KcpSession {
    fn new(
        conv: u32,
        peer: SocketAddr,
        cfg: &KcpConfig,
        channel: Arc<PacketChannel>,
        cipher: DatagramCipher,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            kcp: SyncMutex::new(Kcp::new(conv, cfg)),
            channel,
            cipher,
            peer,
            conv,
            start: Instant::now(),
            readable: Notify::new(),
            closed: AtomicBool::new(false),
            cancel,
        });
        session.clone().spawn_update_loop();
        session
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn spawn_update_loop(self: Arc<Self>) {
        let session = self;
        tokio::spawn(async move {
            let interval = {
                let kcp = session.kcp.lock();
                Duration::from_millis(kcp.interval as u64)
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if session.is_session_closed() {
                    break;
                }
                let (datagrams, dead) = {
                    let mut kcp = session.kcp.lock();
                    let now = session.now_ms();
                    kcp.update(now);
                    (kcp.flush(), kcp.is_dead())
                };
                for datagram in datagrams {
                    let sealed = session.cipher.seal(&datagram);
                    session.channel.write_detached(&sealed, session.peer);
                }
                if dead {
                    tracing::warn!("KCP conversation {} to {} is dead", session.conv, session.peer);
                    session.mark_closed();
                    break;
                }
            }
        });
    }

    /// Feed a decrypted inbound datagram into the engine.
    pub fn input(&self, data: &[u8]) {
        let had_message = {
            let mut kcp = self.kcp.lock();
            if let Err(e) = kcp.input(data) {
                tracing::debug!("KCP input from {} rejected: {}", self.peer, e);
                false
            } else {
                !kcp.rcv_queue.is_empty()
            }
        };
        if had_message {
            self.readable.notify_waiters();
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        self.readable.notify_waiters();
    }

    fn is_session_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
            || self.cancel.is_cancelled()
            || self.channel.is_closed()
    }
}

#[async_trait]
impl FramePipe for KcpSession {
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_session_closed() {
            return Err(Error::ConnectionLost);
        }
        self.kcp.lock().send(frame)?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Vec<u8>> {
        loop {
            let notified = self.readable.notified();
            {
                let mut kcp = self.kcp.lock();
                if let Some(message) = kcp.recv() {
                    return Ok(message);
                }
            }
            if self.is_session_closed() {
                return Err(Error::ConnectionLost);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::ConnectionLost),
                _ = notified => {}
            }
        }
    }

    fn close_pipe(&self) {
        self.mark_closed();
    }

    fn is_pipe_closed(&self) -> bool {
        self.is_session_closed()
    }
}

/// A KCP connection: one conversation with an smux-style stream layer.
pub struct KcpConnection {
    session: Arc<KcpSession>,
    mux: Arc<MuxSession>,
}

impl KcpConnection {
    fn new(session: Arc<KcpSession>, dialer: bool, stream_buf: usize) -> Self {
        let mux = MuxSession::new(session.clone(), dialer, stream_buf);
        Self { session, mux }
    }

    fn wrap_stream(stream: MuxStream) -> Box<dyn Stream> {
        Box::new(stream)
    }
}

#[async_trait]
impl Connection for KcpConnection {
    async fn open_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Self::wrap_stream(self.mux.open_stream().await?))
    }

    async fn accept_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Self::wrap_stream(self.mux.accept_stream().await?))
    }

    async fn ping(&self, wait: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        if wait {
            self.mux.ping().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.mux.shutdown();
        self.session.mark_closed();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.session.channel.local_addr())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.session.peer())
    }

    fn is_closed(&self) -> bool {
        self.session.is_session_closed() || self.mux.is_closed()
    }
}

/// Dial a KCP connection to `dst` with a fresh random conversation id.
pub async fn dial(
    dst: SocketAddr,
    cfg: &Config,
    channel: Arc<PacketChannel>,
) -> Result<Arc<dyn Connection>> {
    let cipher = DatagramCipher::from_config(&cfg.transport.kcp.block, &cfg.transport.kcp.key)?;
    let conv: u32 = rand::random();
    let cancel = CancellationToken::new();
    let session = KcpSession::new(
        conv,
        dst,
        &cfg.transport.kcp,
        channel.clone(),
        cipher.clone(),
        cancel.clone(),
    );

    // Demultiplex inbound datagrams for this single conversation.
    let recv_session = session.clone();
    let recv_cipher = cipher;
    let recv_cancel = cancel;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, src) = tokio::select! {
                _ = recv_cancel.cancelled() => break,
                result = channel.read_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(Error::DeadlineExceeded) => continue,
                    Err(_) => break,
                },
            };
            if src != recv_session.peer() {
                continue;
            }
            let Ok(datagram) = recv_cipher.open(&buf[..n]) else {
                continue;
            };
            if peek_conv(&datagram) != Some(recv_session.conv()) {
                continue;
            }
            recv_session.input(&datagram);
        }
        recv_session.mark_closed();
    });

    tracing::debug!("KCP dialing {} (conv {})", dst, conv);
    Ok(Arc::new(KcpConnection::new(
        session,
        true,
        cfg.transport.kcp.streambuf,
    )))
}

/// KCP listener: demultiplexes inbound datagrams into per-(endpoint, conv)
/// sessions and surfaces new conversations through `accept`.
pub struct KcpListener {
    channel: Arc<PacketChannel>,
    accept_rx: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
    cancel: CancellationToken,
}

pub async fn listen(cfg: &Config, channel: Arc<PacketChannel>) -> Result<Arc<dyn Listener>> {
    let cipher = DatagramCipher::from_config(&cfg.transport.kcp.block, &cfg.transport.kcp.key)?;
    let cancel = CancellationToken::new();
    let (accept_tx, accept_rx) = mpsc::channel::<Arc<dyn Connection>>(256);

    let kcp_cfg = cfg.transport.kcp.clone();
    let loop_channel = channel.clone();
    let loop_cancel = cancel.clone();
    tokio::spawn(async move {
        let sessions: DashMap<(SocketAddr, u32), Arc<KcpSession>> = DashMap::new();
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, src) = tokio::select! {
                _ = loop_cancel.cancelled() => break,
                result = loop_channel.read_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(Error::DeadlineExceeded) => continue,
                    Err(_) => break,
                },
            };
            let Ok(datagram) = cipher.open(&buf[..n]) else {
                continue;
            };
            let Some(conv) = peek_conv(&datagram) else {
                continue;
            };

            let key = (src, conv);
            if let Some(session) = sessions.get(&key) {
                if session.is_session_closed() {
                    drop(session);
                    sessions.remove(&key);
                } else {
                    session.input(&datagram);
                    continue;
                }
            }

            if !plausible_datagram(&datagram) {
                continue;
            }
            tracing::info!("accepted new KCP conversation {} from {}", conv, src);
            let session = KcpSession::new(
                conv,
                src,
                &kcp_cfg,
                loop_channel.clone(),
                cipher.clone(),
                loop_cancel.child_token(),
            );
            session.input(&datagram);
            sessions.insert(key, session.clone());
            let conn: Arc<dyn Connection> =
                Arc::new(KcpConnection::new(session, false, kcp_cfg.streambuf));
            if accept_tx.send(conn).await.is_err() {
                break;
            }
        }
    });

    Ok(Arc::new(KcpListener {
        channel,
        accept_rx: Mutex::new(accept_rx),
        cancel,
    }))
}

#[async_trait]
impl Listener for KcpListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            conn = rx.recv() => conn.ok_or(Error::Cancelled),
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.channel.close();
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KcpMode;

    fn test_cfg() -> KcpConfig {
        let mut cfg = KcpConfig {
            mode: KcpMode::Fast3,
            ..Default::default()
        };
        cfg.set_defaults();
        cfg
    }

    #[test]
    fn test_segment_round_trip() {
        let mut seg = Segment::new(0x11223344);
        seg.cmd = KCP_CMD_PUSH;
        seg.frg = 2;
        seg.wnd = 128;
        seg.ts = 1000;
        seg.sn = 7;
        seg.una = 3;
        seg.data = b"fragment".to_vec();

        let encoded = seg.encode();
        let (decoded, consumed) = Segment::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.conv, 0x11223344);
        assert_eq!(decoded.cmd, KCP_CMD_PUSH);
        assert_eq!(decoded.frg, 2);
        assert_eq!(decoded.wnd, 128);
        assert_eq!(decoded.sn, 7);
        assert_eq!(decoded.una, 3);
        assert_eq!(decoded.data, b"fragment");
    }

    #[test]
    fn test_segment_decode_short() {
        assert!(Segment::decode(&[0u8; 10]).is_none());
        // Header claims more data than present.
        let mut seg = Segment::new(1);
        seg.data = b"abc".to_vec();
        let mut encoded = seg.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(Segment::decode(&encoded).is_none());
    }

    #[test]
    fn test_peek_conv() {
        let seg = Segment::new(0xCAFEBABE);
        assert_eq!(peek_conv(&seg.encode()), Some(0xCAFEBABE));
        assert_eq!(peek_conv(&[0u8; 3]), None);
    }

    /// Run two engines back to back, shuttling flushed datagrams directly.
    fn pump(a: &mut Kcp, b: &mut Kcp, now: &mut u32, rounds: usize) {
        for _ in 0..rounds {
            *now += 10;
            a.update(*now);
            for dg in a.flush() {
                b.input(&dg).unwrap();
            }
            b.update(*now);
            for dg in b.flush() {
                a.input(&dg).unwrap();
            }
        }
    }

    #[test]
    fn test_engine_transfers_message() {
        let cfg = test_cfg();
        let mut a = Kcp::new(99, &cfg);
        let mut b = Kcp::new(99, &cfg);
        let mut now = 0u32;

        a.send(b"hello kcp").unwrap();
        pump(&mut a, &mut b, &mut now, 10);
        assert_eq!(b.recv().unwrap(), b"hello kcp");
        assert!(b.recv().is_none());
    }

    #[test]
    fn test_engine_fragments_large_message() {
        let cfg = test_cfg();
        let mut a = Kcp::new(5, &cfg);
        let mut b = Kcp::new(5, &cfg);
        let mut now = 0u32;

        let message: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        a.send(&message).unwrap();
        pump(&mut a, &mut b, &mut now, 50);
        assert_eq!(b.recv().unwrap(), message);
    }

    #[test]
    fn test_engine_preserves_message_order() {
        let cfg = test_cfg();
        let mut a = Kcp::new(5, &cfg);
        let mut b = Kcp::new(5, &cfg);
        let mut now = 0u32;

        a.send(b"first").unwrap();
        a.send(b"second").unwrap();
        a.send(b"third").unwrap();
        pump(&mut a, &mut b, &mut now, 20);

        assert_eq!(b.recv().unwrap(), b"first");
        assert_eq!(b.recv().unwrap(), b"second");
        assert_eq!(b.recv().unwrap(), b"third");
    }

    #[test]
    fn test_engine_retransmits_after_loss() {
        let cfg = test_cfg();
        let mut a = Kcp::new(5, &cfg);
        let mut b = Kcp::new(5, &cfg);
        let mut now = 0u32;

        a.send(b"lossy").unwrap();
        // First flush is dropped on the floor.
        now += 10;
        a.update(now);
        let _ = a.flush();

        // Enough later rounds for the RTO to fire.
        pump(&mut a, &mut b, &mut now, 60);
        assert_eq!(b.recv().unwrap(), b"lossy");
    }

    #[test]
    fn test_engine_rejects_foreign_conv() {
        let cfg = test_cfg();
        let mut a = Kcp::new(5, &cfg);
        let mut b = Kcp::new(6, &cfg);
        let mut now = 0u32;

        a.send(b"x").unwrap();
        now += 10;
        a.update(now);
        for dg in a.flush() {
            assert!(b.input(&dg).is_err());
        }
    }

    #[test]
    fn test_send_limits() {
        let cfg = test_cfg();
        let mut a = Kcp::new(5, &cfg);
        assert!(a.send(&[]).is_err());
        let too_big = vec![0u8; (cfg.mtu - KCP_OVERHEAD) * 256];
        assert!(a.send(&too_big).is_err());
    }
}
