pub mod dialer;

use crate::config::{Config, TcpFlags};
use crate::error::{Error, Result};
use crate::packet::PacketChannel;
use crate::pool::ConnPool;
use crate::proto::{Preamble, TargetAddr};
use crate::transport::{self, Connection, Listener, Stream};
use dashmap::DashMap;
use dialer::Dialer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// The server: accepts transport connections off the raw listener and
/// forwards their streams to real targets.
pub struct Server {
    cfg: Config,
    channel: Arc<PacketChannel>,
    dialer: Arc<Dialer>,
    stream_semaphore: Arc<Semaphore>,
    pools: DashMap<String, Arc<ConnPool>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(cfg: Config, cancel: CancellationToken) -> Result<Arc<Self>> {
        let channel = Arc::new(PacketChannel::new(&cfg, &cancel)?);
        let dialer = Arc::new(Dialer::from_config(&cfg.outbound)?);
        let permits = cfg.performance.max_concurrent_streams.max(1);
        Ok(Arc::new(Self {
            cfg,
            channel,
            dialer,
            stream_semaphore: Arc::new(Semaphore::new(permits)),
            pools: DashMap::new(),
            cancel,
        }))
    }

    /// Run the accept loop until cancellation.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = transport::listen(&self.cfg, self.channel.clone()).await?;
        let pooling = if self.cfg.performance.enable_connection_pooling {
            format!(
                "enabled (pool size: {}, idle timeout: {}s)",
                self.cfg.performance.tcp_connection_pool_size,
                self.cfg.performance.tcp_connection_idle_timeout
            )
        } else {
            "disabled".to_string()
        };
        tracing::info!(
            "server started - listening for packets on :{} (max concurrent streams: {}, connection pooling: {})",
            self.channel.local_addr().port(),
            self.cfg.performance.max_concurrent_streams,
            pooling
        );

        loop {
            let conn = tokio::select! {
                _ = self.cancel.cancelled() => break,
                conn = listener.accept() => conn,
            };
            match conn {
                Ok(conn) => {
                    tracing::info!(
                        "accepted new connection from {:?} (local: {:?})",
                        conn.remote_addr(),
                        conn.local_addr()
                    );
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.supervise_connection(conn).await;
                    });
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    tracing::error!("failed to accept connection: {}", e);
                    continue;
                }
            }
        }

        listener.close().await?;
        for pool in self.pools.iter() {
            pool.close();
        }
        tracing::info!("server shutdown completed");
        Ok(())
    }

    /// Accept streams off one connection until it dies.
    async fn supervise_connection(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                stream = conn.accept_stream() => stream,
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("connection {:?} stopped accepting: {}", conn.remote_addr(), e);
                    break;
                }
            };
            let server = self.clone();
            let peer = conn.remote_addr();
            tokio::spawn(async move {
                if let Err(e) = server.handle_stream(stream, peer).await {
                    if e.is_recoverable() {
                        tracing::debug!("stream handler finished with: {}", e);
                    } else {
                        tracing::warn!("stream handler failed: {}", e);
                    }
                }
            });
        }
        let _ = conn.close().await;
    }

    async fn handle_stream(
        self: &Arc<Self>,
        stream: Box<dyn Stream>,
        peer: Option<std::net::SocketAddr>,
    ) -> Result<()> {
        let _permit = match self.stream_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("stream rejected: concurrency limit saturated");
                let _ = stream.close().await;
                return Ok(());
            }
        };

        let preamble = match Preamble::read_from(stream.as_ref()).await {
            Ok(preamble) => preamble,
            Err(e) => {
                // Liveness probes surface as zero-length streams; drop quietly.
                tracing::debug!("stream without usable preamble: {}", e);
                let _ = stream.close().await;
                return Ok(());
            }
        };

        match preamble {
            Preamble::Tcp(target) => self.handle_tcp(stream, target).await,
            Preamble::Udp(target) => self.handle_udp(stream, target).await,
            Preamble::Flags(profiles) => {
                if let Some(peer) = peer {
                    match TcpFlags::parse_all(&profiles) {
                        Ok(parsed) => {
                            tracing::debug!("installing {} flag profiles for {}", parsed.len(), peer);
                            self.channel.set_remote_profile(peer, parsed);
                        }
                        Err(e) => tracing::debug!("rejecting flag announcement from {}: {}", peer, e),
                    }
                }
                let _ = stream.close().await;
                Ok(())
            }
        }
    }

    async fn handle_tcp(self: &Arc<Self>, stream: Box<dyn Stream>, target: TargetAddr) -> Result<()> {
        tracing::debug!("TCP stream to {}", target);
        if self.cfg.performance.enable_connection_pooling {
            let pool = self.pool_for(&target);
            match pool.get().await {
                Ok(mut conn) => {
                    let result = pipe_stream_tcp(stream.as_ref(), &mut conn).await;
                    if let Err(e) = &result {
                        conn.mark_unusable();
                        tracing::debug!("pooled connection to {} marked unusable: {}", target, e);
                    }
                    return result;
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to get pooled connection for {}: {}, falling back to direct dial",
                        target,
                        e
                    );
                }
            }
        }

        let mut conn = self.dialer.dial(&target).await?;
        tracing::debug!("TCP connection established to {}", target);
        pipe_stream_tcp(stream.as_ref(), &mut conn).await
    }

    fn pool_for(self: &Arc<Self>, target: &TargetAddr) -> Arc<ConnPool> {
        let key = target.to_string();
        self.pools
            .entry(key)
            .or_insert_with(|| {
                ConnPool::new(
                    target.clone(),
                    self.dialer.clone(),
                    self.cfg.performance.tcp_connection_pool_size,
                    Duration::from_secs(self.cfg.performance.tcp_connection_idle_timeout),
                    &self.cancel,
                )
            })
            .clone()
    }

    async fn handle_udp(self: &Arc<Self>, stream: Box<dyn Stream>, target: TargetAddr) -> Result<()> {
        tracing::debug!("UDP relay to {}", target);
        let target_addr = match &target {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await
                .map_err(|e| Error::target_dial(target.to_string(), e.to_string()))?
                .next()
                .ok_or_else(|| Error::target_dial(target.to_string(), "no addresses resolved"))?,
        };

        let bind_addr = if target_addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::target_dial(target.to_string(), e.to_string()))?;
        socket
            .connect(target_addr)
            .await
            .map_err(|e| Error::target_dial(target.to_string(), e.to_string()))?;

        pipe_stream_udp(stream.as_ref(), &socket).await
    }
}

/// Pipe a tunnel stream and a TCP connection into each other. Either
/// direction terminating closes both.
pub async fn pipe_stream_tcp(stream: &dyn Stream, tcp: &mut TcpStream) -> Result<()> {
    let (mut tcp_rd, mut tcp_wr) = tcp.split();

    let upstream = async {
        let mut buf = crate::buffer::tcp_buffer();
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, Error>(());
            }
            tcp_wr.write_all(&buf[..n]).await?;
        }
    };
    let downstream = async {
        let mut buf = crate::buffer::tcp_buffer();
        loop {
            let n = tcp_rd.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, Error>(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    };

    let result = tokio::select! {
        r = upstream => r,
        r = downstream => r,
    };
    let _ = stream.close().await;
    result
}

/// Relay u16-length-prefixed datagrams between a tunnel stream and a
/// connected UDP socket.
pub async fn pipe_stream_udp(stream: &dyn Stream, socket: &UdpSocket) -> Result<()> {
    let outbound = async {
        let mut buf = crate::buffer::udp_buffer();
        loop {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await?;
            let len = u16::from_be_bytes(len) as usize;
            if len > buf.len() {
                return Err(Error::protocol("UDP datagram exceeds buffer"));
            }
            stream.read_exact(&mut buf[..len]).await?;
            socket
                .send(&buf[..len])
                .await
                .map_err(|e| Error::network_with_source("UDP send failed", e))?;
        }
        #[allow(unreachable_code)]
        Ok::<_, Error>(())
    };
    let inbound = async {
        let mut buf = crate::buffer::udp_buffer();
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| Error::network_with_source("UDP recv failed", e))?;
            let mut framed = Vec::with_capacity(2 + n);
            framed.extend_from_slice(&(n as u16).to_be_bytes());
            framed.extend_from_slice(&buf[..n]);
            stream.write_all(&framed).await?;
        }
        #[allow(unreachable_code)]
        Ok::<_, Error>(())
    };

    let result = tokio::select! {
        r = outbound => r,
        r = inbound => r,
    };
    let _ = stream.close().await;
    result
}
