use crate::config::{Config, QuicConfig};
use crate::error::{Error, Result};
use crate::packet::PacketChannel;
use crate::transport::{Connection, Listener, Stream};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use quinn::{Endpoint, EndpointConfig, TokioRuntime, VarInt};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const ALPN: &[u8] = b"paqet-quic";

/// Adapter presenting the Packet Channel to quinn as a UDP socket.
struct ChannelSocket {
    channel: Arc<PacketChannel>,
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("local_addr", &self.channel.local_addr())
            .finish()
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl quinn::UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl quinn::AsyncUdpSocket for ChannelSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn quinn::UdpPoller>> {
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &quinn::udp::Transmit) -> std::io::Result<()> {
        // Fire and forget: a full send queue counts a drop and QUIC
        // retransmits, exactly as it would on a lossy UDP socket.
        self.channel
            .write_detached(transmit.contents, transmit.destination);
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [std::io::IoSliceMut<'_>],
        meta: &mut [quinn::udp::RecvMeta],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            match self.channel.poll_read_from(cx) {
                Poll::Ready(Some((payload, src))) => {
                    if payload.is_empty() || bufs.is_empty() {
                        continue;
                    }
                    let n = payload.len().min(bufs[0].len());
                    bufs[0][..n].copy_from_slice(&payload[..n]);
                    meta[0] = quinn::udp::RecvMeta {
                        addr: src,
                        len: n,
                        stride: n,
                        ecn: None,
                        dst_ip: None,
                    };
                    return Poll::Ready(Ok(1));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "packet channel closed",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.channel.local_addr())
    }
}

/// A certificate verifier that skips all verification. Only installed when
/// `insecure_skip_verify` is explicitly enabled.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn transport_config(cfg: &QuicConfig) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        Duration::from_secs(cfg.max_idle_timeout)
            .try_into()
            .map_err(|_| Error::config("quic.max_idle_timeout out of range"))?,
    ));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(cfg.max_incoming_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(cfg.max_incoming_uni_streams));
    transport.stream_receive_window(
        VarInt::from_u64(cfg.initial_stream_receive_window)
            .map_err(|_| Error::config("quic.initial_stream_receive_window out of range"))?,
    );
    transport.receive_window(
        VarInt::from_u64(cfg.initial_connection_receive_window)
            .map_err(|_| Error::config("quic.initial_connection_receive_window out of range"))?,
    );
    transport.send_window(cfg.max_connection_receive_window);
    transport.keep_alive_interval(Some(Duration::from_secs(cfg.keep_alive_period)));
    if !cfg.enable_datagrams {
        transport.datagram_receive_buffer_size(None);
    }
    Ok(transport)
}

fn server_crypto(cfg: &QuicConfig) -> Result<quinn::ServerConfig> {
    // Fresh self-signed certificate on every startup; the client either
    // skips verification or pins a server name out of band.
    let cert = rcgen::generate_simple_self_signed(vec!["paqet".to_string()])
        .map_err(|e| Error::bind_with_source("failed to generate self-signed certificate", e))?;
    let cert_der: CertificateDer<'static> = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| Error::bind_with_source("invalid self-signed certificate", e))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    if cfg.enable_0rtt {
        tls.max_early_data_size = u32::MAX;
    }

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| Error::bind_with_source("failed to build QUIC server crypto", e))?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(Arc::new(transport_config(cfg)?));
    Ok(server)
}

fn client_crypto(cfg: &QuicConfig) -> Result<quinn::ClientConfig> {
    let mut tls = if cfg.insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth()
    };
    tls.alpn_protocols = vec![ALPN.to_vec()];
    tls.enable_early_data = cfg.enable_0rtt;

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| Error::config_with_source("failed to build QUIC client crypto", e))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.transport_config(Arc::new(transport_config(cfg)?));
    Ok(client)
}

fn new_endpoint(
    channel: Arc<PacketChannel>,
    server_config: Option<quinn::ServerConfig>,
) -> Result<Endpoint> {
    let socket = Arc::new(ChannelSocket { channel });
    Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        server_config,
        socket,
        Arc::new(TokioRuntime),
    )
    .map_err(|e| Error::bind_with_source("failed to create QUIC endpoint", e))
}

/// A QUIC connection; streams are multiplexed natively.
pub struct QuicConnection {
    connection: quinn::Connection,
    local_addr: SocketAddr,
}

impl QuicConnection {
    fn new(connection: quinn::Connection, local_addr: SocketAddr) -> Self {
        Self {
            connection,
            local_addr,
        }
    }
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_stream(&self) -> Result<Box<dyn Stream>> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::network_with_source("failed to open QUIC stream", e))?;
        Ok(Box::new(QuicStream::new(send, recv)))
    }

    async fn accept_stream(&self) -> Result<Box<dyn Stream>> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| Error::network_with_source("failed to accept QUIC stream", e))?;
        Ok(Box::new(QuicStream::new(send, recv)))
    }

    async fn ping(&self, wait: bool) -> Result<()> {
        if wait {
            // Exercised end to end by opening and immediately finishing a
            // stream; the peer sees a zero-length stream.
            let (mut send, _recv) = self
                .connection
                .open_bi()
                .await
                .map_err(|_| Error::ConnectionLost)?;
            let _ = send.finish();
            Ok(())
        } else if self.connection.close_reason().is_some() {
            Err(Error::ConnectionLost)
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(0u32.into(), b"connection closed");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }
}

/// One bidirectional QUIC stream.
pub struct QuicStream {
    send: Mutex<quinn::SendStream>,
    recv: Mutex<quinn::RecvStream>,
    read_deadline: SyncMutex<Option<Instant>>,
    write_deadline: SyncMutex<Option<Instant>>,
}

impl QuicStream {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            read_deadline: SyncMutex::new(None),
            write_deadline: SyncMutex::new(None),
        }
    }
}

async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.into()) => Err(Error::DeadlineExceeded),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}

#[async_trait]
impl Stream for QuicStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = *self.read_deadline.lock();
        with_deadline(deadline, async {
            let mut recv = self.recv.lock().await;
            match recv.read(buf).await {
                Ok(Some(n)) => Ok(n),
                Ok(None) => Ok(0),
                Err(e) => Err(Error::network_with_source("QUIC stream read failed", e)),
            }
        })
        .await
    }

    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let deadline = *self.write_deadline.lock();
        with_deadline(deadline, async {
            let mut send = self.send.lock().await;
            send.write_all(buf)
                .await
                .map_err(|e| Error::network_with_source("QUIC stream write failed", e))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let _ = self.send.lock().await.finish();
        let _ = self.recv.lock().await.stop(0u32.into());
        Ok(())
    }

    async fn close_read(&self) {
        let _ = self.recv.lock().await.stop(0u32.into());
    }

    async fn close_write(&self) {
        let _ = self.send.lock().await.finish();
    }

    fn set_read_deadline(&self, t: Option<Instant>) {
        *self.read_deadline.lock() = t;
    }

    fn set_write_deadline(&self, t: Option<Instant>) {
        *self.write_deadline.lock() = t;
    }
}

/// Establish a QUIC connection to `dst` over the Packet Channel.
pub async fn dial(
    dst: SocketAddr,
    cfg: &Config,
    channel: Arc<PacketChannel>,
) -> Result<Arc<dyn Connection>> {
    let local_addr = channel.local_addr();
    let mut endpoint = new_endpoint(channel, None)?;
    endpoint.set_default_client_config(client_crypto(&cfg.transport.quic)?);

    let server_name = if cfg.transport.quic.server_name.is_empty() {
        dst.ip().to_string()
    } else {
        cfg.transport.quic.server_name.clone()
    };

    tracing::debug!("QUIC dialing {} (server name {})", dst, server_name);
    let connection = endpoint
        .connect(dst, &server_name)
        .map_err(|e| Error::network_with_source("QUIC connect failed", e))?
        .await
        .map_err(|e| Error::network_with_source("QUIC connection attempt failed", e))?;
    tracing::debug!("QUIC connection established to {}", dst);

    Ok(Arc::new(QuicConnection::new(connection, local_addr)))
}

/// Listen for QUIC connections on the Packet Channel.
pub struct QuicListener {
    endpoint: Endpoint,
    channel: Arc<PacketChannel>,
    cancel: CancellationToken,
}

pub async fn listen(cfg: &Config, channel: Arc<PacketChannel>) -> Result<Arc<dyn Listener>> {
    let server_config = server_crypto(&cfg.transport.quic)?;
    let endpoint = new_endpoint(channel.clone(), Some(server_config))?;
    Ok(Arc::new(QuicListener {
        endpoint,
        channel,
        cancel: CancellationToken::new(),
    }))
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        // Iterate on transient timeouts rather than recursing, so a long
        // quiet period cannot grow the stack.
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                incoming = tokio::time::timeout(Duration::from_secs(5), self.endpoint.accept()) => {
                    match incoming {
                        Err(_) => continue,
                        Ok(None) => return Err(Error::Cancelled),
                        Ok(Some(incoming)) => incoming,
                    }
                }
            };
            let connection = incoming
                .await
                .map_err(|e| Error::network_with_source("QUIC handshake failed", e))?;
            return Ok(Arc::new(QuicConnection::new(
                connection,
                self.channel.local_addr(),
            )));
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.endpoint.close(0u32.into(), b"listener closed");
        self.channel.close();
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }
}
