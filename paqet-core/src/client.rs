use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::PacketChannel;
use crate::proto::{Preamble, TargetAddr};
use crate::transport::{self, Connection, Stream};
use crate::util::iterator::RoundRobin;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Lifetime stamped on a rebuilt ring slot, for observability.
const SLOT_EXPIRE_SECS: u64 = 300;

struct Slot {
    conn: Arc<dyn Connection>,
    expire: Instant,
}

/// Client session manager: a fixed ring of transport connections to the
/// server, each over its own Packet Channel, with stream-open retry and a
/// liveness ticker.
pub struct Client {
    cfg: Config,
    server_addr: SocketAddr,
    ring: RoundRobin<RwLock<Slot>>,
    rebuild_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Client {
    /// Build `transport.conn` connections and start the ping ticker.
    pub async fn connect(cfg: Config, cancel: CancellationToken) -> Result<Arc<Self>> {
        let server_addr = cfg.server.socket_addr()?;
        let mut slots = Vec::with_capacity(cfg.transport.conn);
        for i in 0..cfg.transport.conn {
            let conn = build_connection(&cfg, server_addr, &cancel).await?;
            tracing::info!(
                "connection {}/{} established to {}",
                i + 1,
                cfg.transport.conn,
                server_addr
            );
            slots.push(RwLock::new(Slot {
                conn,
                expire: Instant::now() + Duration::from_secs(SLOT_EXPIRE_SECS),
            }));
        }

        let client = Arc::new(Self {
            cfg,
            server_addr,
            ring: RoundRobin::new(slots),
            rebuild_lock: Mutex::new(()),
            cancel,
        });
        client.clone().send_flag_profiles().await;
        client.clone().spawn_ticker();
        Ok(client)
    }

    /// Announce our remote flag profile preference so the server shapes its
    /// answers to this client accordingly.
    async fn send_flag_profiles(self: Arc<Self>) {
        let profiles = self.cfg.network.tcp.remote_flag.clone();
        if profiles.is_empty() {
            return;
        }
        match self.open_stream().await {
            Ok(stream) => {
                let preamble = Preamble::Flags(profiles).encode();
                if let Err(e) = stream.write_all(&preamble).await {
                    tracing::debug!("failed to announce flag profiles: {}", e);
                }
                let _ = stream.close().await;
            }
            Err(e) => tracing::debug!("failed to open flag announcement stream: {}", e),
        }
    }

    fn spawn_ticker(self: Arc<Self>) {
        let period = Duration::from_secs(self.cfg.transport.kcp.ping_sec);
        let client = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = client.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for slot in client.ring.items() {
                    let conn = slot.read().await.conn.clone();
                    if let Err(e) = conn.ping(true).await {
                        tracing::debug!("keepalive ping failed: {}", e);
                    }
                }
            }
        });
    }

    /// Pick the next ring slot, rebuilding its connection if the liveness
    /// probe fails.
    async fn next_conn(&self) -> Result<Arc<dyn Connection>> {
        let _guard = self.rebuild_lock.lock().await;
        let idx = self
            .ring
            .next_index()
            .ok_or_else(|| Error::config("no connections configured"))?;
        let slot = &self.ring.items()[idx];

        let conn = slot.read().await.conn.clone();
        if conn.ping(false).await.is_ok() {
            return Ok(conn);
        }

        tracing::info!("connection lost, rebuilding ring slot {}", idx);
        let _ = conn.close().await;
        let fresh = build_connection(&self.cfg, self.server_addr, &self.cancel).await?;
        let mut slot = slot.write().await;
        slot.conn = fresh.clone();
        slot.expire = Instant::now() + Duration::from_secs(SLOT_EXPIRE_SECS);
        tracing::debug!("ring slot {} rebuilt, expires at {:?}", idx, slot.expire);
        Ok(fresh)
    }

    /// Open a stream over the ring with bounded exponential-backoff retry.
    pub async fn open_stream(&self) -> Result<Box<dyn Stream>> {
        let max_attempts = self.cfg.performance.max_retry_attempts.max(1);
        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let conn = match self.next_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(
                        "session creation failed (attempt {}/{}), retrying after backoff: {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    self.retry_sleep(attempt).await?;
                    continue;
                }
            };
            match conn.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(
                        "failed to open stream (attempt {}/{}), retrying: {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    self.retry_sleep(attempt).await?;
                }
            }
        }
        Err(Error::StreamUnavailable {
            attempts: max_attempts,
        })
    }

    async fn retry_sleep(&self, attempt: usize) -> Result<()> {
        let backoff = retry_backoff(
            Duration::from_millis(self.cfg.performance.retry_initial_backoff_ms),
            Duration::from_millis(self.cfg.performance.retry_max_backoff_ms),
            attempt,
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(backoff) => Ok(()),
        }
    }

    /// Open a tunnel stream piping to a TCP connection at `target`.
    pub async fn tcp(&self, target: &str) -> Result<Box<dyn Stream>> {
        let target = TargetAddr::parse(target)?;
        let stream = self.open_stream().await?;
        stream.write_all(&Preamble::Tcp(target).encode()).await?;
        Ok(stream)
    }

    /// Open a tunnel stream relaying UDP datagrams to `target`.
    pub async fn udp(&self, target: &str) -> Result<Box<dyn Stream>> {
        let target = TargetAddr::parse(target)?;
        let stream = self.open_stream().await?;
        stream.write_all(&Preamble::Udp(target).encode()).await?;
        Ok(stream)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        for slot in self.ring.items() {
            let conn = slot.read().await.conn.clone();
            let _ = conn.close().await;
        }
    }
}

/// Dial one transport connection over a freshly-constructed Packet Channel.
async fn build_connection(
    cfg: &Config,
    server_addr: SocketAddr,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Connection>> {
    let channel = Arc::new(PacketChannel::new(cfg, cancel)?);
    transport::dial(server_addr, cfg, channel).await
}

/// Stream-open retry backoff: `initial * 2^attempt`, capped.
pub fn retry_backoff(initial: Duration, max: Duration, attempt: usize) -> Duration {
    let exp = attempt.min(32) as u32;
    let ms = initial.as_millis().saturating_mul(1u128 << exp);
    Duration::from_millis(ms.min(max.as_millis()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(10_000);
        assert_eq!(retry_backoff(initial, max, 0), Duration::from_millis(100));
        assert_eq!(retry_backoff(initial, max, 1), Duration::from_millis(200));
        assert_eq!(retry_backoff(initial, max, 2), Duration::from_millis(400));
        assert_eq!(retry_backoff(initial, max, 5), Duration::from_millis(3200));
        assert_eq!(retry_backoff(initial, max, 9), Duration::from_millis(10_000));
        assert_eq!(retry_backoff(initial, max, 31), Duration::from_millis(10_000));
    }

    #[test]
    fn test_retry_backoff_huge_attempt_does_not_overflow() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(10_000);
        assert_eq!(retry_backoff(initial, max, 1000), Duration::from_millis(10_000));
    }
}
