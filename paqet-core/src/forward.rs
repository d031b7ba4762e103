use crate::client::Client;
use crate::config::ForwardConfig;
use crate::error::{Error, Result};
use crate::server::pipe_stream_tcp;
use crate::transport::Stream;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Idle UDP forwarding sessions expire after this long without traffic.
const UDP_SESSION_IDLE: Duration = Duration::from_secs(120);

/// Port forwarder: relays a fixed local listen address to one fixed target
/// through the tunnel, over TCP or UDP.
pub struct Forwarder {
    client: Arc<Client>,
    cfg: ForwardConfig,
}

impl Forwarder {
    pub fn new(client: Arc<Client>, cfg: ForwardConfig) -> Self {
        Self { client, cfg }
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        tracing::debug!(
            "starting {} forwarder: {} -> {}",
            self.cfg.protocol,
            self.cfg.listen,
            self.cfg.target
        );
        match self.cfg.protocol.as_str() {
            "tcp" => self.start_tcp(cancel).await,
            "udp" => self.start_udp(cancel).await,
            p => Err(Error::config(format!("unsupported forward protocol '{}'", p))),
        }
    }

    async fn start_tcp(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .cfg
            .listen
            .parse()
            .map_err(|_| Error::config(format!("invalid forward listen address '{}'", self.cfg.listen)))?;
        let listener = crate::socks::bind_reuse(addr)?;
        tracing::info!("TCP forwarder listening on {} -> {}", addr, self.cfg.target);

        let forwarder = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((mut stream, peer)) => {
                        let forwarder = forwarder.clone();
                        tokio::spawn(async move {
                            let tunnel = match forwarder.client.tcp(&forwarder.cfg.target).await {
                                Ok(tunnel) => tunnel,
                                Err(e) => {
                                    tracing::error!(
                                        "forwarder failed to open stream for {}: {}",
                                        peer,
                                        e
                                    );
                                    return;
                                }
                            };
                            if let Err(e) = pipe_stream_tcp(tunnel.as_ref(), &mut stream).await {
                                tracing::debug!("forwarded connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("forwarder accept error: {}", e);
                    }
                }
            }
        });
        Ok(())
    }

    async fn start_udp(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .cfg
            .listen
            .parse()
            .map_err(|_| Error::config(format!("invalid forward listen address '{}'", self.cfg.listen)))?;
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| Error::bind_with_source(format!("failed to bind {}", addr), e))?,
        );
        tracing::info!("UDP forwarder listening on {} -> {}", addr, self.cfg.target);

        let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
        let forwarder = Arc::new(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::buffer::UDP_BUF_SIZE];
            loop {
                let (n, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::error!("UDP forwarder recv error: {}", e);
                            continue;
                        }
                    },
                };
                let datagram = buf[..n].to_vec();

                if let Some(tx) = sessions.get(&peer).map(|e| e.value().clone()) {
                    if tx.send(datagram).await.is_ok() {
                        continue;
                    }
                    sessions.remove(&peer);
                    continue;
                }

                // First datagram from this peer: open a tunnel session.
                let (tx, rx) = mpsc::channel(256);
                if tx.send(datagram).await.is_err() {
                    continue;
                }
                sessions.insert(peer, tx);
                let forwarder = forwarder.clone();
                let socket = socket.clone();
                let sessions = sessions.clone();
                let session_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = forwarder
                        .run_udp_session(peer, rx, socket, session_cancel)
                        .await
                    {
                        tracing::debug!("UDP session for {} ended: {}", peer, e);
                    }
                    sessions.remove(&peer);
                });
            }
        });
        Ok(())
    }

    /// One tunnel stream per local peer: client datagrams go up
    /// length-prefixed, replies come back down to the peer's address.
    async fn run_udp_session(
        &self,
        peer: SocketAddr,
        mut rx: mpsc::Receiver<Vec<u8>>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let tunnel = self.client.udp(&self.cfg.target).await?;
        tracing::debug!("UDP session opened for {} -> {}", peer, self.cfg.target);

        let upstream = async {
            loop {
                let datagram = tokio::time::timeout(UDP_SESSION_IDLE, rx.recv())
                    .await
                    .map_err(|_| Error::DeadlineExceeded)?
                    .ok_or(Error::Cancelled)?;
                let mut framed = Vec::with_capacity(2 + datagram.len());
                framed.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
                framed.extend_from_slice(&datagram);
                tunnel.write_all(&framed).await?;
            }
            #[allow(unreachable_code)]
            Ok::<_, Error>(())
        };
        let downstream = async {
            let mut buf = crate::buffer::udp_buffer();
            loop {
                let mut len = [0u8; 2];
                tunnel.read_exact(&mut len).await?;
                let len = u16::from_be_bytes(len) as usize;
                if len > buf.len() {
                    return Err(Error::protocol("UDP datagram exceeds buffer"));
                }
                tunnel.read_exact(&mut buf[..len]).await?;
                socket
                    .send_to(&buf[..len], peer)
                    .await
                    .map_err(|e| Error::network_with_source("UDP reply send failed", e))?;
            }
            #[allow(unreachable_code)]
            Ok::<_, Error>(())
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = upstream => r,
            r = downstream => r,
        };
        let _ = tunnel.close().await;
        result
    }
}
