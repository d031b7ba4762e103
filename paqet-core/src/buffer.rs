use crossbeam_queue::ArrayQueue;
use once_cell::sync::Lazy;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub const TCP_BUF_SIZE: usize = 64 * 1024;
pub const UDP_BUF_SIZE: usize = 16 * 1024;

static TCP_POOL: Lazy<Arc<BufferPool>> = Lazy::new(|| Arc::new(BufferPool::new(TCP_BUF_SIZE, 256)));
static UDP_POOL: Lazy<Arc<BufferPool>> = Lazy::new(|| Arc::new(BufferPool::new(UDP_BUF_SIZE, 256)));

/// Lease a 64 KiB buffer for TCP piping.
pub fn tcp_buffer() -> Lease {
    TCP_POOL.clone().lease()
}

/// Lease a 16 KiB buffer for UDP datagrams.
pub fn udp_buffer() -> Lease {
    UDP_POOL.clone().lease()
}

/// Fixed-size byte buffer pool. Buffers are recycled on lease drop; the
/// backing queue is bounded, excess returns are simply freed.
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            buf_size,
        }
    }

    pub fn lease(self: Arc<Self>) -> Lease {
        let buf = self
            .queue
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        Lease {
            buf: Some(buf),
            pool: self,
        }
    }

    fn give_back(&self, buf: Vec<u8>) {
        let _ = self.queue.push(buf);
    }

    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

/// A leased buffer; returns itself to its pool on drop.
pub struct Lease {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for Lease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_return() {
        let pool = Arc::new(BufferPool::new(1024, 4));
        assert_eq!(pool.idle(), 0);
        {
            let mut lease = pool.clone().lease();
            assert_eq!(lease.len(), 1024);
            lease[0] = 42;
        }
        assert_eq!(pool.idle(), 1);
        let lease = pool.clone().lease();
        assert_eq!(pool.idle(), 0);
        assert_eq!(lease.len(), 1024);
    }

    #[test]
    fn test_bounded_returns() {
        let pool = Arc::new(BufferPool::new(8, 1));
        let a = pool.clone().lease();
        let b = pool.clone().lease();
        drop(a);
        drop(b);
        // Queue holds one; the second return is freed.
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_global_pools() {
        let t = tcp_buffer();
        assert_eq!(t.len(), TCP_BUF_SIZE);
        let u = udp_buffer();
        assert_eq!(u.len(), UDP_BUF_SIZE);
    }
}
