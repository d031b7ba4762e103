use crate::error::{Error, Result};
use crate::proto::TargetAddr;
use crate::server::dialer::Dialer;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

struct IdleConn {
    stream: TcpStream,
    returned_at: Instant,
}

/// Bounded pool of idle TCP connections to one target. A background
/// sweeper evicts entries idle past the timeout; borrowed connections
/// return on drop unless marked unusable.
pub struct ConnPool {
    target: TargetAddr,
    dialer: Arc<Dialer>,
    idle_tx: mpsc::Sender<IdleConn>,
    idle_rx: Mutex<mpsc::Receiver<IdleConn>>,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl ConnPool {
    pub fn new(
        target: TargetAddr,
        dialer: Arc<Dialer>,
        max_size: usize,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(max_size.max(1));
        let pool = Arc::new(Self {
            target,
            dialer,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            idle_timeout,
            closed: AtomicBool::new(false),
        });
        pool.clone().spawn_sweeper(cancel.clone());
        pool
    }

    fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.close();
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if self.closed.load(Ordering::Relaxed) {
                    return;
                }
                self.sweep().await;
            }
        });
    }

    /// Drop idle entries past the timeout, keep the rest.
    async fn sweep(&self) {
        let mut keep = Vec::new();
        {
            let mut rx = self.idle_rx.lock().await;
            while let Ok(idle) = rx.try_recv() {
                if idle.returned_at.elapsed() < self.idle_timeout {
                    keep.push(idle);
                }
            }
        }
        for idle in keep {
            let _ = self.idle_tx.try_send(idle);
        }
    }

    /// Borrow an idle connection or dial a fresh one.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::network("connection pool is closed"));
        }
        loop {
            let idle = {
                let mut rx = self.idle_rx.lock().await;
                rx.try_recv().ok()
            };
            match idle {
                Some(idle) if idle.returned_at.elapsed() < self.idle_timeout => {
                    return Ok(PooledConn {
                        stream: Some(idle.stream),
                        pool: self.clone(),
                        unusable: false,
                    });
                }
                Some(_) => continue,
                None => break,
            }
        }
        let stream = self.dialer.dial(&self.target).await?;
        Ok(PooledConn {
            stream: Some(stream),
            pool: self.clone(),
            unusable: false,
        })
    }

    fn give_back(&self, stream: TcpStream) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.idle_tx.try_send(IdleConn {
            stream,
            returned_at: Instant::now(),
        });
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub async fn idle_len(&self) -> usize {
        self.idle_rx.lock().await.len()
    }
}

/// A TCP connection borrowed from a pool. Returns to the pool on drop;
/// `mark_unusable` makes the pool discard it instead.
pub struct PooledConn {
    stream: Option<TcpStream>,
    pool: Arc<ConnPool>,
    unusable: bool,
}

impl PooledConn {
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }
}

impl Deref for PooledConn {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().unwrap()
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().unwrap()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if !self.unusable {
                self.pool.give_back(stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn pool_for(addr: std::net::SocketAddr, cancel: &CancellationToken) -> Arc<ConnPool> {
        ConnPool::new(
            TargetAddr::Ip(addr),
            Arc::new(Dialer::Direct),
            4,
            Duration::from_secs(60),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_get_and_reuse() {
        let addr = echo_server().await;
        let cancel = CancellationToken::new();
        let pool = pool_for(addr, &cancel);

        let mut conn = pool.get().await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(conn);

        assert_eq!(pool.idle_len().await, 1);
        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn test_unusable_not_returned() {
        let addr = echo_server().await;
        let cancel = CancellationToken::new();
        let pool = pool_for(addr, &cancel);

        let mut conn = pool.get().await.unwrap();
        conn.mark_unusable();
        drop(conn);
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let addr = echo_server().await;
        let cancel = CancellationToken::new();
        let pool = pool_for(addr, &cancel);
        pool.close();
        assert!(pool.get().await.is_err());
    }
}
