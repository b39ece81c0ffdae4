//! In-memory substitute for the socket layer, used by tests.
//!
//! A [`VirtualSocket`] stands in for a TCP connection at the [`Connector`]
//! seam: the client side reads and writes it like a real socket, while the
//! test side holds the matching [`VirtualPeer`] and plays the hub.  A
//! [`VirtualConnector`] hands out a scripted sequence of sockets, one per
//! transport open, and records the connect target on each — so a test can
//! assert not just the bytes exchanged but which connections were ever made.
//!
//! Nothing here is compiled out in release builds; it is an ordinary module
//! that production code simply never instantiates, so integration tests can
//! use it too.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::{Connection, Connector};

// ── Pipe ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    head: usize,
    closed: bool,
    reader: Option<Waker>,
}

/// A one-directional FIFO byte pipe.
///
/// Reads block (asynchronously) until data arrives or the write side is
/// closed; after close, remaining data drains and then reads signal
/// end-of-stream.  Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct Pipe {
    state: Arc<Mutex<PipeState>>,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and wakes the reader.  Writes after close are dropped.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.chunks.push_back(data.to_vec());
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
    }

    /// Closes the write side.  The pipe stays readable until drained.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
    }

    /// Bytes readable right now without blocking.
    ///
    /// # Errors
    ///
    /// `UnexpectedEof` once the pipe is closed and fully drained.
    pub fn available(&self) -> io::Result<usize> {
        let state = self.state.lock().unwrap();
        let pending: usize = state
            .chunks
            .iter()
            .map(|c| c.len())
            .sum::<usize>()
            .saturating_sub(state.head);
        if pending == 0 && state.closed {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed and drained",
            ));
        }
        Ok(pending)
    }

    fn poll_read_inner(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.chunks.front() {
                Some(front) if state.head >= front.len() => {
                    state.chunks.pop_front();
                    state.head = 0;
                }
                Some(front) => {
                    let take = front.len().saturating_sub(state.head).min(buf.remaining());
                    buf.put_slice(&front[state.head..state.head + take]);
                    state.head += take;
                    return Poll::Ready(Ok(()));
                }
                None => {
                    if state.closed {
                        // End of stream: return with no bytes written.
                        return Poll::Ready(Ok(()));
                    }
                    state.reader = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncRead for Pipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_inner(cx, buf)
    }
}

// ── Virtual socket ────────────────────────────────────────────────────────────

/// Shared metadata both ends of a virtual socket can inspect.
#[derive(Debug, Default)]
struct SocketInfo {
    connected_to: Mutex<Option<(String, u16)>>,
    bound_to: Mutex<Option<String>>,
    closed: AtomicBool,
}

/// The client end: handed out by a [`VirtualConnector`] in place of a TCP
/// stream.
#[derive(Debug)]
pub struct VirtualSocket {
    incoming: Pipe,
    outgoing: Pipe,
    info: Arc<SocketInfo>,
}

/// The test end: writes what the client will read and reads what the client
/// wrote.
#[derive(Debug)]
pub struct VirtualPeer {
    to_client: Pipe,
    from_client: Pipe,
    info: Arc<SocketInfo>,
}

/// Creates a connected socket/peer pair.
pub fn socket_pair() -> (VirtualSocket, VirtualPeer) {
    let a = Pipe::new();
    let b = Pipe::new();
    let info = Arc::new(SocketInfo::default());
    let socket = VirtualSocket {
        incoming: a.clone(),
        outgoing: b.clone(),
        info: Arc::clone(&info),
    };
    let peer = VirtualPeer {
        to_client: a,
        from_client: b,
        info,
    };
    (socket, peer)
}

impl VirtualPeer {
    /// Feeds bytes to the client side.
    pub fn write(&self, data: &[u8]) {
        self.to_client.write(data);
    }

    pub fn write_str(&self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Closes the hub-to-client direction; the client sees end-of-stream.
    pub fn close(&self) {
        self.to_client.close();
    }

    /// Bytes the client has written that the test has not read yet.
    pub fn pending_output(&self) -> io::Result<usize> {
        self.from_client.available()
    }

    /// The `(host, port)` the client connected this socket to, if it ever did.
    pub fn connected_to(&self) -> Option<(String, u16)> {
        self.info.connected_to.lock().unwrap().clone()
    }

    /// The local address recorded at bind time, if any.
    pub fn bound_to(&self) -> Option<String> {
        self.info.bound_to.lock().unwrap().clone()
    }

    /// True once the client shut the socket down (or dropped it).
    pub fn is_closed(&self) -> bool {
        self.info.closed.load(Ordering::SeqCst)
    }
}

impl AsyncRead for VirtualPeer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.from_client.poll_read_inner(cx, buf)
    }
}

impl AsyncRead for VirtualSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.incoming.poll_read_inner(cx, buf)
    }
}

impl AsyncWrite for VirtualSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.outgoing.write(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing.close();
        self.info.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        // A dropped socket behaves like an abruptly closed connection.
        self.outgoing.close();
        self.info.closed.store(true, Ordering::SeqCst);
    }
}

// ── Scripted connector ────────────────────────────────────────────────────────

/// A [`Connector`] that hands out pre-built sockets in order, one per
/// connection attempt.
#[derive(Debug, Default)]
pub struct VirtualConnector {
    queue: Mutex<VecDeque<VirtualSocket>>,
}

impl VirtualConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next socket to hand out.
    pub fn push(&self, socket: VirtualSocket) {
        self.queue.lock().unwrap().push_back(socket);
    }

    /// Sockets queued but not yet handed out.
    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for VirtualConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>> {
        let socket = self.queue.lock().unwrap().pop_front().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no scripted connection available",
            )
        })?;
        *socket.info.connected_to.lock().unwrap() = Some((host.to_string(), port));
        Ok(Box::new(socket))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
