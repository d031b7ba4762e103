pub mod handle;
pub mod obfs;
pub mod recv;
pub mod send;

use crate::config::{Config, TcpFlags};
use crate::error::{Error, Result};
use crate::flow::FlowTable;
use obfs::Obfuscator;
use parking_lot::Mutex;
use rand::Rng;
use recv::{Inbound, RecvHandle};
use send::{FrameBuilder, PcapInjector, SendHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The datagram façade over the raw capture/inject pair. This is the
/// substrate the embedded reliable transport dials and listens on; it looks
/// like a connectionless packet socket with deadlines.
pub struct PacketChannel {
    flows: Arc<FlowTable>,
    send: Arc<SendHandle>,
    recv: Arc<RecvHandle>,
    obfuscator: Obfuscator,
    local_addr: SocketAddr,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl PacketChannel {
    /// Open capture handles on the configured interface and start the send
    /// pipeline. A zero local port picks a random ephemeral one.
    pub fn new(cfg: &Config, parent: &CancellationToken) -> Result<Self> {
        let mut port = cfg.network.port;
        if port == 0 {
            port = 32768 + rand::thread_rng().gen_range(0..32768);
        }

        let cancel = parent.child_token();
        let flows = Arc::new(FlowTable::new());
        let builder = Arc::new(FrameBuilder::new(&cfg.network, port, flows.clone())?);

        let send_capture = handle::open_send_handle(&cfg.network)?;
        let injector = Arc::new(PcapInjector::new(send_capture));
        let send = Arc::new(SendHandle::new(
            builder,
            injector,
            cfg.network.pcap.clone(),
            cfg.performance.packet_workers,
            cancel.clone(),
        ));

        let recv_capture = handle::open_recv_handle(&cfg.network, port)?;
        let recv = Arc::new(RecvHandle::new(recv_capture, flows.clone(), cancel.clone()));

        let local_ip = cfg
            .network
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let obfuscator = Obfuscator::from_config(&cfg.obfs, &cfg.transport.kcp.key)?;
        if !matches!(obfuscator, Obfuscator::None) {
            tracing::info!("datagram obfuscation enabled: {}", obfuscator.name());
        }

        Ok(Self {
            flows,
            send,
            recv,
            obfuscator,
            local_addr: SocketAddr::new(local_ip, port),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            cancel,
        })
    }

    /// Receive the next datagram into `buf`, honoring the read deadline.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            let inbound = self.next_datagram().await?;
            match self.obfuscator.unwrap(&inbound.payload) {
                Ok(payload) => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok((n, inbound.src));
                }
                Err(e) => {
                    tracing::debug!("dropping undecodable datagram from {}: {}", inbound.src, e);
                }
            }
        }
    }

    async fn next_datagram(&self) -> Result<Inbound> {
        let deadline = *self.read_deadline.lock();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => Err(Error::DeadlineExceeded),
                    inbound = self.recv.read() => inbound,
                }
            }
            None => self.recv.read().await,
        }
    }

    /// Send a datagram to `dst`, honoring the write deadline.
    pub async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize> {
        let wrapped = self.obfuscator.wrap(buf)?;
        let deadline = *self.write_deadline.lock();
        let write = self.send.write(&wrapped, dst);
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => Err(Error::DeadlineExceeded),
                    result = write => result.map(|_| buf.len()),
                }
            }
            None => write.await.map(|_| buf.len()),
        }
    }

    /// Fire-and-forget send; losses are counted, never awaited.
    pub fn write_detached(&self, buf: &[u8], dst: SocketAddr) {
        match self.obfuscator.wrap(buf) {
            Ok(wrapped) => self.send.write_detached(&wrapped, dst),
            Err(e) => tracing::debug!("failed to wrap outbound datagram: {}", e),
        }
    }

    /// Poll-based receive for the QUIC socket glue. Undecodable datagrams
    /// are skipped by reporting them as empty reads upstream.
    pub fn poll_read_from(
        &self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            match self.recv.poll_read(cx) {
                std::task::Poll::Ready(Some(inbound)) => {
                    match self.obfuscator.unwrap(&inbound.payload) {
                        Ok(payload) => return std::task::Poll::Ready(Some((payload, inbound.src))),
                        Err(_) => continue,
                    }
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_deadline(&self, t: Option<Instant>) {
        *self.read_deadline.lock() = t;
        *self.write_deadline.lock() = t;
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        *self.read_deadline.lock() = t;
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        *self.write_deadline.lock() = t;
    }

    /// Buffer sizing is a no-op: the capture handles manage their own
    /// buffers via `pcap.sockbuf`.
    pub fn set_read_buffer(&self, _size: usize) -> Result<()> {
        Ok(())
    }

    pub fn set_write_buffer(&self, _size: usize) -> Result<()> {
        Ok(())
    }

    /// Install a per-destination TCP flag profile override.
    pub fn set_remote_profile(&self, addr: SocketAddr, profiles: Vec<TcpFlags>) {
        self.send.builder().set_remote_profile(addr, profiles);
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    pub fn dropped_packets(&self) -> u64 {
        self.send.dropped_packets()
    }

    pub fn queue_depth(&self) -> usize {
        self.send.queue_depth()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel all pipeline tasks and tear down both capture handles.
    pub fn close(&self) {
        self.cancel.cancel();
        self.send.close();
        self.recv.close();
    }
}

impl Drop for PacketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketChannel")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
