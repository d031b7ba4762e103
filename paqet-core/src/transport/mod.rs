pub mod crypto;
pub mod kcp;
pub mod mux;
pub mod quic;

use crate::config::{Config, TransportProtocol};
use crate::error::{Error, Result};
use crate::packet::PacketChannel;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// A full-duplex byte pipe with half-close and deadline controls.
///
/// Methods take `&self` so both directions can be driven concurrently from
/// a single handle.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&self, buf: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn close_read(&self);
    async fn close_write(&self);
    fn set_read_deadline(&self, t: Option<Instant>);
    fn set_write_deadline(&self, t: Option<Instant>);

    fn set_deadline(&self, t: Option<Instant>) {
        self.set_read_deadline(t);
        self.set_write_deadline(t);
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::protocol("unexpected end of stream"));
            }
            filled += n;
        }
        Ok(())
    }
}

/// A multiplexed transport connection over one Packet Channel.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn Stream>>;
    async fn accept_stream(&self) -> Result<Box<dyn Stream>>;
    /// Liveness probe. `wait = true` exercises the peer; `wait = false`
    /// only checks local connection health.
    async fn ping(&self, wait: bool) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn is_closed(&self) -> bool;
}

/// Produces Connections from inbound peers.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Arc<dyn Connection>>;
    async fn close(&self) -> Result<()>;
    fn local_addr(&self) -> SocketAddr;
}

/// Start a listener for the configured transport protocol on `channel`.
pub async fn listen(cfg: &Config, channel: Arc<PacketChannel>) -> Result<Arc<dyn Listener>> {
    match cfg.transport.protocol {
        TransportProtocol::Kcp => kcp::listen(cfg, channel).await,
        TransportProtocol::Quic => quic::listen(cfg, channel).await,
    }
}

/// Establish an active connection to `dst` over `channel`.
pub async fn dial(
    dst: SocketAddr,
    cfg: &Config,
    channel: Arc<PacketChannel>,
) -> Result<Arc<dyn Connection>> {
    match cfg.transport.protocol {
        TransportProtocol::Kcp => kcp::dial(dst, cfg, channel).await,
        TransportProtocol::Quic => quic::dial(dst, cfg, channel).await,
    }
}

/// Copy bytes from `src` to `dst` using a pooled buffer until EOF or error.
pub async fn copy_stream_to_stream(src: &dyn Stream, dst: &dyn Stream) -> Result<u64> {
    let mut buf = crate::buffer::tcp_buffer();
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
