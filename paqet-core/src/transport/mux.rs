use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const MUX_VERSION: u8 = 0;
const HEADER_LEN: usize = 8;

/// Largest payload carried in one data frame. Frames ride in single
/// reliable-transport messages, so this bounds per-message size.
pub const MAX_FRAME_DATA: usize = 16 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    New = 0x01,
    Data = 0x02,
    End = 0x03,
    KeepAlive = 0x04,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::New),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::End),
            0x04 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// One multiplexer frame: `[version][kind][stream id: u32][len: u16][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: u32, data: Vec<u8>) -> Self {
        Self {
            kind,
            stream_id,
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.push(MUX_VERSION);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::protocol("mux frame too short"));
        }
        if data[0] != MUX_VERSION {
            return Err(Error::protocol(format!("unknown mux version {}", data[0])));
        }
        let kind = FrameKind::from_u8(data[1])
            .ok_or_else(|| Error::protocol(format!("unknown mux frame kind {}", data[1])))?;
        let stream_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let len = u16::from_be_bytes([data[6], data[7]]) as usize;
        if data.len() < HEADER_LEN + len {
            return Err(Error::protocol("mux frame truncated"));
        }
        Ok(Self {
            kind,
            stream_id,
            data: data[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }
}

/// Carries whole mux frames over a reliable message pipe.
#[async_trait]
pub trait FramePipe: Send + Sync {
    async fn send_frame(&self, frame: &[u8]) -> Result<()>;
    /// Receive one whole frame. Blocks until available or the pipe dies.
    async fn recv_frame(&self) -> Result<Vec<u8>>;
    fn close_pipe(&self);
    fn is_pipe_closed(&self) -> bool;
}

struct StreamEntry {
    data_tx: mpsc::Sender<Vec<u8>>,
}

/// Stream multiplexer over a reliable message pipe. The dialing side opens
/// odd stream ids, the accepting side even ones.
pub struct MuxSession {
    pipe: Arc<dyn FramePipe>,
    streams: Arc<DashMap<u32, StreamEntry>>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    next_id: AtomicU32,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    stream_buf_frames: usize,
}

impl MuxSession {
    /// `dialer` selects the id parity. `stream_buf` bounds each stream's
    /// receive backlog in bytes.
    pub fn new(pipe: Arc<dyn FramePipe>, dialer: bool, stream_buf: usize) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(256);
        let session = Arc::new(Self {
            pipe,
            streams: Arc::new(DashMap::new()),
            accept_rx: Mutex::new(accept_rx),
            next_id: AtomicU32::new(if dialer { 1 } else { 2 }),
            closed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            stream_buf_frames: (stream_buf / MAX_FRAME_DATA).max(4),
        });
        session.clone().spawn_read_loop(accept_tx);
        session
    }

    fn spawn_read_loop(self: Arc<Self>, accept_tx: mpsc::Sender<MuxStream>) {
        let session = self;
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    raw = session.pipe.recv_frame() => match raw {
                        Ok(raw) => raw,
                        Err(_) => break,
                    },
                };
                let frame = match Frame::decode(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!("dropping malformed mux frame: {}", e);
                        continue;
                    }
                };
                match frame.kind {
                    FrameKind::New => {
                        let stream = session.register(frame.stream_id);
                        if accept_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    FrameKind::Data => {
                        let tx = session
                            .streams
                            .get(&frame.stream_id)
                            .map(|e| e.data_tx.clone());
                        if let Some(tx) = tx {
                            // Backpressure: a full stream buffer stalls the
                            // session until the reader catches up.
                            let _ = tx.send(frame.data).await;
                        }
                    }
                    FrameKind::End => {
                        session.streams.remove(&frame.stream_id);
                    }
                    FrameKind::KeepAlive => {}
                }
            }
            session.shutdown();
        });
    }

    fn register(self: &Arc<Self>, stream_id: u32) -> MuxStream {
        let (data_tx, data_rx) = mpsc::channel(self.stream_buf_frames);
        self.streams.insert(stream_id, StreamEntry { data_tx });
        MuxStream {
            stream_id,
            session: self.clone(),
            data_rx: Mutex::new(data_rx),
            leftover: Mutex::new(Vec::new()),
            write_closed: AtomicBool::new(false),
            read_deadline: SyncMutex::new(None),
            write_deadline: SyncMutex::new(None),
        }
    }

    /// Open a new outbound stream.
    pub async fn open_stream(self: &Arc<Self>) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        let stream_id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.register(stream_id);
        let frame = Frame::new(FrameKind::New, stream_id, Vec::new());
        if let Err(e) = self.pipe.send_frame(&frame.encode()).await {
            self.streams.remove(&stream_id);
            return Err(e);
        }
        Ok(stream)
    }

    /// Await the next peer-opened stream.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::ConnectionLost),
            stream = rx.recv() => stream.ok_or(Error::ConnectionLost),
        }
    }

    /// Send a keep-alive frame through the pipe.
    pub async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        let frame = Frame::new(FrameKind::KeepAlive, 0, Vec::new());
        self.pipe.send_frame(&frame.encode()).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.pipe.is_pipe_closed()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        self.streams.clear();
        self.pipe.close_pipe();
    }
}

/// One multiplexed stream.
pub struct MuxStream {
    stream_id: u32,
    session: Arc<MuxSession>,
    data_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
    write_closed: AtomicBool,
    read_deadline: SyncMutex<Option<Instant>>,
    write_deadline: SyncMutex<Option<Instant>>,
}

impl MuxStream {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    async fn send_end(&self) {
        if self.write_closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let frame = Frame::new(FrameKind::End, self.stream_id, Vec::new());
        let _ = self.session.pipe.send_frame(&frame.encode()).await;
    }

    async fn with_deadline<F, T>(&self, deadline: Option<Instant>, fut: F) -> Result<T>
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
}

#[async_trait]
impl crate::transport::Stream for MuxStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut leftover = self.leftover.lock().await;
            if !leftover.is_empty() {
                let n = leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&leftover[..n]);
                leftover.drain(..n);
                return Ok(n);
            }
        }

        let deadline = *self.read_deadline.lock();
        let chunk = self
            .with_deadline(deadline, async {
                let mut rx = self.data_rx.lock().await;
                Ok(rx.recv().await)
            })
            .await?;

        match chunk {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.leftover.lock().await.extend_from_slice(&chunk[n..]);
                }
                Ok(n)
            }
            // Sender dropped: the peer ended the stream.
            None => Ok(0),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        if self.write_closed.load(Ordering::Relaxed) {
            return Err(Error::protocol("write on closed stream"));
        }
        if self.session.is_closed() {
            return Err(Error::ConnectionLost);
        }
        let deadline = *self.write_deadline.lock();
        self.with_deadline(deadline, async {
            for chunk in buf.chunks(MAX_FRAME_DATA) {
                let frame = Frame::new(FrameKind::Data, self.stream_id, chunk.to_vec());
                self.session.pipe.send_frame(&frame.encode()).await?;
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.send_end().await;
        self.session.streams.remove(&self.stream_id);
        Ok(())
    }

    async fn close_read(&self) {
        self.session.streams.remove(&self.stream_id);
    }

    async fn close_write(&self) {
        self.send_end().await;
    }

    fn set_read_deadline(&self, t: Option<Instant>) {
        *self.read_deadline.lock() = t;
    }

    fn set_write_deadline(&self, t: Option<Instant>) {
        *self.write_deadline.lock() = t;
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.session.streams.remove(&self.stream_id);
        if !self.write_closed.swap(true, Ordering::Relaxed) && !self.session.is_closed() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pipe = self.session.pipe.clone();
                let frame = Frame::new(FrameKind::End, self.stream_id, Vec::new());
                handle.spawn(async move {
                    let _ = pipe.send_frame(&frame.encode()).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Stream as _;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new(FrameKind::Data, 42, b"hello world".to_vec());
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_empty_data() {
        let frame = Frame::new(FrameKind::KeepAlive, 0, Vec::new());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.kind, FrameKind::KeepAlive);
        assert_eq!(decoded.stream_id, 0);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_frame_rejects_garbage() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[0, 9, 0, 0, 0, 1, 0, 0]).is_err());
        assert!(Frame::decode(&[7, 2, 0, 0, 0, 1, 0, 0]).is_err());
        // Declared length longer than the buffer.
        assert!(Frame::decode(&[0, 2, 0, 0, 0, 1, 0, 9, 1]).is_err());
    }

    /// Two in-memory pipes wired back to back.
    struct TestPipe {
        tx: mpsc::Sender<Vec<u8>>,
        rx: Mutex<mpsc::Receiver<Vec<u8>>>,
        closed: AtomicBool,
    }

    fn pipe_pair() -> (Arc<TestPipe>, Arc<TestPipe>) {
        let (a_tx, b_rx) = mpsc::channel(1024);
        let (b_tx, a_rx) = mpsc::channel(1024);
        (
            Arc::new(TestPipe {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                closed: AtomicBool::new(false),
            }),
            Arc::new(TestPipe {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                closed: AtomicBool::new(false),
            }),
        )
    }

    #[async_trait]
    impl FramePipe for TestPipe {
        async fn send_frame(&self, frame: &[u8]) -> Result<()> {
            self.tx
                .send(frame.to_vec())
                .await
                .map_err(|_| Error::ConnectionLost)
        }

        async fn recv_frame(&self) -> Result<Vec<u8>> {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(Error::ConnectionLost)
        }

        fn close_pipe(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }

        fn is_pipe_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn test_open_accept_and_transfer() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let server = MuxSession::new(b, false, 1024 * 1024);

        let out = client.open_stream().await.unwrap();
        let inc = server.accept_stream().await.unwrap();
        assert_eq!(out.stream_id(), 1);
        assert_eq!(inc.stream_id(), 1);

        out.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 64];
        let n = inc.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request bytes");

        inc.write_all(b"response").await.unwrap();
        let n = out.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");
    }

    #[tokio::test]
    async fn test_multiple_streams_are_independent() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let server = MuxSession::new(b, false, 1024 * 1024);

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.stream_id(), 1);
        assert_eq!(s2.stream_id(), 3);

        let r1 = server.accept_stream().await.unwrap();
        let r2 = server.accept_stream().await.unwrap();

        s2.write_all(b"two").await.unwrap();
        s1.write_all(b"one").await.unwrap();

        let mut buf = [0u8; 8];
        let n = r1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = r2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_end_propagates_as_eof() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let server = MuxSession::new(b, false, 1024 * 1024);

        let out = client.open_stream().await.unwrap();
        let inc = server.accept_stream().await.unwrap();

        out.write_all(b"bye").await.unwrap();
        out.close().await.unwrap();

        let mut buf = [0u8; 8];
        let n = inc.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        let n = inc.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_large_transfer_chunks() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let server = MuxSession::new(b, false, 1024 * 1024);

        let out = client.open_stream().await.unwrap();
        let inc = server.accept_stream().await.unwrap();

        let payload: Vec<u8> = (0..(MAX_FRAME_DATA * 2 + 100)).map(|i| i as u8).collect();
        let expect = payload.clone();
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
            out
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < expect.len() {
            let n = inc.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expect);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let _server = MuxSession::new(b, false, 1024 * 1024);

        let out = client.open_stream().await.unwrap();
        out.set_read_deadline(Some(Instant::now() + std::time::Duration::from_millis(30)));
        let mut buf = [0u8; 8];
        let err = out.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_ping() {
        let (a, b) = pipe_pair();
        let client = MuxSession::new(a, true, 1024 * 1024);
        let _server = MuxSession::new(b, false, 1024 * 1024);
        client.ping().await.unwrap();
    }
}
