use crate::client::Client;
use crate::config::Socks5Config;
use crate::error::{Error, Result};
use crate::server::pipe_stream_tcp;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 front-end: accepts local CONNECT requests and tunnels them to
/// the server.
pub struct Socks5Server {
    client: Arc<Client>,
    cfg: Socks5Config,
}

impl Socks5Server {
    pub fn new(client: Arc<Client>, cfg: Socks5Config) -> Self {
        Self { client, cfg }
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .cfg
            .listen
            .parse()
            .map_err(|_| Error::config(format!("invalid SOCKS5 listen address '{}'", self.cfg.listen)))?;
        let listener = bind_reuse(addr)?;
        tracing::info!("SOCKS5 server listening on {}", addr);

        let server = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                tracing::debug!("SOCKS5 connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("SOCKS5 accept error: {}", e);
                    }
                }
            }
            tracing::info!("SOCKS5 server on {} stopped", addr);
        });
        Ok(())
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let target = match self.negotiate(&mut stream).await {
            Ok(target) => target,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        let tunnel = match self.client.tcp(&target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::error!("SOCKS5 failed to establish stream for {}: {}", target, e);
                reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                return Err(e);
            }
        };
        reply(&mut stream, REP_SUCCESS).await?;
        pipe_stream_tcp(tunnel.as_ref(), &mut stream).await
    }

    /// Greeting, optional username/password subnegotiation, CONNECT.
    async fn negotiate(&self, stream: &mut TcpStream) -> Result<String> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(Error::protocol("not a SOCKS5 client"));
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        let auth_required = !self.cfg.username.is_empty() || !self.cfg.password.is_empty();
        let method = if auth_required {
            METHOD_USERPASS
        } else {
            METHOD_NONE
        };
        if !methods.contains(&method) {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                .await?;
            return Err(Error::protocol("no acceptable SOCKS5 auth method"));
        }
        stream.write_all(&[SOCKS_VERSION, method]).await?;

        if auth_required {
            self.authenticate(stream).await?;
        }

        let mut req = [0u8; 4];
        stream.read_exact(&mut req).await?;
        if req[1] != CMD_CONNECT {
            reply(stream, REP_CMD_NOT_SUPPORTED).await?;
            return Err(Error::protocol(format!(
                "unsupported SOCKS5 command {}",
                req[1]
            )));
        }

        match req[3] {
            ATYP_IPV4 => {
                let mut raw = [0u8; 6];
                stream.read_exact(&mut raw).await?;
                let port = u16::from_be_bytes([raw[4], raw[5]]);
                Ok(format!("{}.{}.{}.{}:{}", raw[0], raw[1], raw[2], raw[3], port))
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 18];
                stream.read_exact(&mut raw).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                let port = u16::from_be_bytes([raw[16], raw[17]]);
                Ok(format!("[{}]:{}", std::net::Ipv6Addr::from(octets), port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut raw = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut raw).await?;
                let domain = String::from_utf8(raw[..len[0] as usize].to_vec())
                    .map_err(|_| Error::protocol("invalid domain in SOCKS5 request"))?;
                let port =
                    u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
                Ok(format!("{}:{}", domain, port))
            }
            t => {
                reply(stream, REP_GENERAL_FAILURE).await?;
                Err(Error::protocol(format!("unknown SOCKS5 address type {}", t)))
            }
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x01 {
            return Err(Error::protocol("bad auth subnegotiation version"));
        }
        let mut username = vec![0u8; head[1] as usize];
        stream.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let ok = username == self.cfg.username.as_bytes()
            && password == self.cfg.password.as_bytes();
        stream
            .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
            .await?;
        if !ok {
            return Err(Error::protocol("SOCKS5 authentication failed"));
        }
        Ok(())
    }
}

async fn reply(stream: &mut TcpStream, code: u8) -> Result<()> {
    // Bound address is not meaningful here; zeros are conventional.
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Bind a listener with SO_REUSEADDR so restarts do not trip over
/// lingering sockets.
pub(crate) fn bind_reuse(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| Error::bind_with_source("failed to create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::bind_with_source("failed to set SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::bind_with_source("failed to set non-blocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::bind_with_source(format!("failed to bind {}", addr), e))?;
    socket
        .listen(1024)
        .map_err(|e| Error::bind_with_source(format!("failed to listen on {}", addr), e))?;
    TcpListener::from_std(socket.into())
        .map_err(|e| Error::bind_with_source("failed to create TcpListener", e))
}
