use crate::client::Client;
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::server::pipe_stream_tcp;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// HTTP CONNECT front-end. Plain-HTTP proxying is not offered; anything
/// but CONNECT gets a 405.
pub struct HttpProxy {
    client: Arc<Client>,
    cfg: HttpConfig,
}

impl HttpProxy {
    pub fn new(client: Arc<Client>, cfg: HttpConfig) -> Self {
        Self { client, cfg }
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .cfg
            .listen
            .parse()
            .map_err(|_| Error::config(format!("invalid HTTP listen address '{}'", self.cfg.listen)))?;
        let listener = crate::socks::bind_reuse(addr)?;
        tracing::info!("HTTP proxy listening on {}", addr);

        let proxy = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let proxy = proxy.clone();
                        tokio::spawn(async move {
                            if let Err(e) = proxy.handle(stream, peer).await {
                                tracing::debug!("HTTP proxy connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("HTTP proxy accept error: {}", e);
                    }
                }
            }
            tracing::info!("HTTP proxy on {} stopped", addr);
        });
        Ok(())
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        let mut proxy_auth = None;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some(value) = line
                .strip_prefix("Proxy-Authorization:")
                .or_else(|| line.strip_prefix("proxy-authorization:"))
            {
                proxy_auth = Some(value.trim().to_string());
            }
        }

        let mut stream = reader.into_inner();

        if !self.authenticate(proxy_auth.as_deref()) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n",
                )
                .await?;
            return Err(Error::protocol("proxy authentication required"));
        }

        if method != "CONNECT" {
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(Error::protocol(format!("unsupported method {}", method)));
        }

        let target = if target.contains(':') {
            target
        } else {
            format!("{}:443", target)
        };
        tracing::info!("HTTP proxy accepted CONNECT {} -> {}", peer, target);

        let tunnel = match self.client.tcp(&target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::error!(
                    "HTTP proxy failed to establish stream for {} -> {}: {}",
                    peer,
                    target,
                    e
                );
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                return Err(e);
            }
        };
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        pipe_stream_tcp(tunnel.as_ref(), &mut stream).await
    }

    fn authenticate(&self, header: Option<&str>) -> bool {
        check_basic_auth(&self.cfg.username, &self.cfg.password, header)
    }
}

/// Validate a `Proxy-Authorization: Basic` header against the configured
/// credentials. Empty configuration means no auth required.
fn check_basic_auth(username: &str, password: &str, header: Option<&str>) -> bool {
    if username.is_empty() && password.is_empty() {
        return true;
    }
    let Some(header) = header else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(creds) = String::from_utf8(decoded) else {
        return false;
    };
    match creds.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(creds: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(creds)
        )
    }

    #[test]
    fn test_no_credentials_configured_allows_all() {
        assert!(check_basic_auth("", "", None));
        assert!(check_basic_auth("", "", Some("Basic garbage")));
    }

    #[test]
    fn test_valid_credentials() {
        let header = basic("user:pass");
        assert!(check_basic_auth("user", "pass", Some(&header)));
    }

    #[test]
    fn test_invalid_credentials() {
        let header = basic("user:wrong");
        assert!(!check_basic_auth("user", "pass", Some(&header)));
        assert!(!check_basic_auth("user", "pass", None));
        assert!(!check_basic_auth("user", "pass", Some("Bearer token")));
        assert!(!check_basic_auth("user", "pass", Some("Basic ***notb64***")));
        let no_colon = basic("userpass");
        assert!(!check_basic_auth("user", "pass", Some(&no_colon)));
    }
}
