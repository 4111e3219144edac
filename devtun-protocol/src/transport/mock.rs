//! Mock duplex streams for testing
//!
//! [`MockDuplex`] simulates one end of a duplex byte stream. It runs in
//! two modes:
//!
//! - **Scripted** ([`MockDuplex::new`]): reads are fed by the test via
//!   [`inject_read`](MockDuplex::inject_read); writes are captured.
//!   Used for protocol-level tests where the peer is a canned byte
//!   sequence.
//! - **Paired** ([`MockDuplex::create_pair`]): two ends wired together,
//!   each write arriving as one read on the other side. Message
//!   boundaries are preserved when the reader's buffer is large
//!   enough, which matches a packet-oriented wire.
//!
//! Both modes capture written bytes and count shutdown calls, so tests
//! can assert on what crossed the stream and that it was closed exactly
//! once.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Shared view of a mock's captured activity.
///
/// Obtained via [`MockDuplex::capture`] before the stream is moved into
/// the code under test.
#[derive(Debug, Clone)]
pub struct MockCapture {
    written: Arc<Mutex<Vec<u8>>>,
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown_count: Arc<AtomicUsize>,
}

impl MockCapture {
    /// All bytes written to the stream, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Each individual write call's payload.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().clone()
    }

    /// How many times the stream has been shut down.
    pub fn shutdown_count(&self) -> usize {
        self.shutdown_count.load(Ordering::SeqCst)
    }
}

/// One end of a mock duplex stream.
pub struct MockDuplex {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Feeds our own read queue; scripted mode only.
    inject_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Delivers writes to the peer; paired mode only.
    peer_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Partially consumed inbound chunk.
    pending: Option<(Vec<u8>, usize)>,
    capture: MockCapture,
    fail_read: Arc<Mutex<Option<io::ErrorKind>>>,
    shutdown_done: bool,
}

impl MockDuplex {
    /// Create a scripted mock: reads come from [`inject_read`], writes
    /// are captured and go nowhere.
    ///
    /// [`inject_read`]: MockDuplex::inject_read
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            inject_tx: Some(tx),
            peer_tx: None,
            pending: None,
            capture: MockCapture {
                written: Arc::new(Mutex::new(Vec::new())),
                messages: Arc::new(Mutex::new(Vec::new())),
                shutdown_count: Arc::new(AtomicUsize::new(0)),
            },
            fail_read: Arc::new(Mutex::new(None)),
            shutdown_done: false,
        }
    }

    /// Create a connected pair: what one end writes, the other reads,
    /// one message per write. Dropping or shutting down an end delivers
    /// end-of-stream to its peer.
    pub fn create_pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let mut a = Self::new();
        a.inject_tx = None;
        a.rx = a_rx;
        a.peer_tx = Some(b_tx);

        let mut b = Self::new();
        b.inject_tx = None;
        b.rx = b_rx;
        b.peer_tx = Some(a_tx);

        (a, b)
    }

    /// Queue a chunk for the next read. Scripted mode only.
    pub fn inject_read(&self, data: Vec<u8>) {
        self.inject_tx
            .as_ref()
            .expect("inject_read requires a scripted mock")
            .send(data)
            .expect("mock read queue closed");
    }

    /// End the read script; subsequent reads return end-of-stream once
    /// the queue drains.
    pub fn finish_reads(&mut self) {
        self.inject_tx = None;
    }

    /// Make the next read fail with the given error kind.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        *self.fail_read.lock().unwrap() = Some(kind);
    }

    /// Capture handle that stays valid after the stream is moved away.
    pub fn capture(&self) -> MockCapture {
        self.capture.clone()
    }

    /// All bytes written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.capture.written()
    }

    /// How many times the stream has been shut down.
    pub fn shutdown_count(&self) -> usize {
        self.capture.shutdown_count()
    }
}

impl Default for MockDuplex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for MockDuplex {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(kind) = this.fail_read.lock().unwrap().take() {
            return Poll::Ready(Err(io::Error::new(kind, "injected read failure")));
        }

        loop {
            // At most one message per read call; a partially consumed
            // chunk carries over to the next call.
            if let Some((chunk, pos)) = this.pending.as_mut() {
                let n = (chunk.len() - *pos).min(buf.remaining());
                buf.put_slice(&chunk[*pos..*pos + n]);
                *pos += n;
                if *pos == chunk.len() {
                    this.pending = None;
                }
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    this.pending = Some((chunk, 0));
                }
                // All senders gone: end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MockDuplex {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shutdown_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }

        this.capture.written.lock().unwrap().extend_from_slice(data);
        this.capture.messages.lock().unwrap().push(data.to_vec());

        if let Some(tx) = &this.peer_tx {
            if tx.send(data.to_vec()).is_err() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer closed",
                )));
            }
        }

        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.shutdown_done {
            this.shutdown_done = true;
            this.capture.shutdown_count.fetch_add(1, Ordering::SeqCst);
            // Dropping the sender delivers EOF to the peer.
            this.peer_tx = None;
        }
        Poll::Ready(Ok(()))
    }
}
