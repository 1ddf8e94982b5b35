//! Connection handles with a one-shot close signal
//!
//! Tunnel connection types implement [`TunnelConn`]: an async byte stream
//! that can also notify a watcher, exactly once, when it is closed. The
//! watcher uses the signal to tear the tunnel down without polling.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::registry::Closeable;

/// A network connection that reports its own closing.
pub trait TunnelConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Register the signal fired when the connection closes.
    ///
    /// Returns false if the connection is already closed; the signal is then
    /// dropped without firing. May race with [`TunnelConn::close`] from
    /// another task.
    fn set_closed_signal(&self, signal: oneshot::Sender<()>) -> bool;

    /// Close the connection. Pending reads observe end-of-stream and pending
    /// writes fail. Closing twice is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

struct CloseState {
    closed: bool,
    closed_signal: Option<oneshot::Sender<()>>,
}

/// Shared close state of one connection.
///
/// The closed flag and the close signal live under one lock so registering
/// a signal and closing cannot interleave to lose or repeat the notification.
/// A handle is what gets registered in a [`crate::ConnRegistry`], both while
/// dialing and after the connection is established.
pub struct CloseHandle {
    state: Mutex<CloseState>,
    token: CancellationToken,
}

impl CloseHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CloseState {
                closed: false,
                closed_signal: None,
            }),
            token: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CloseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_closed_signal(&self, signal: oneshot::Sender<()>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed_signal = Some(signal);
        true
    }

    /// Transition to closed. Returns false if already closed.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.token.cancel();
        if let Some(signal) = state.closed_signal.take() {
            // The watcher may have gone away; nothing to notify then
            let _ = signal.send(());
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    fn closed_owned(&self) -> Pin<Box<WaitForCancellationFutureOwned>> {
        Box::pin(self.token.clone().cancelled_owned())
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Closeable for CloseHandle {
    fn close(&self) -> io::Result<()> {
        self.mark_closed();
        Ok(())
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A direct TCP connection.
///
/// Read and write timeouts bound how long a single operation may wait on
/// the socket; `None` leaves it unbounded.
pub struct DirectConn {
    stream: TcpStream,
    handle: Arc<CloseHandle>,
    read_closed: Pin<Box<WaitForCancellationFutureOwned>>,
    write_closed: Pin<Box<WaitForCancellationFutureOwned>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl DirectConn {
    pub fn new(
        stream: TcpStream,
        handle: Arc<CloseHandle>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream,
            read_closed: handle.closed_owned(),
            write_closed: handle.closed_owned(),
            handle,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Wrap an accepted or externally dialed stream without timeouts.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::new(stream, CloseHandle::new(), None, None)
    }

    /// The handle that closes this connection from another task.
    pub fn close_handle(&self) -> Arc<CloseHandle> {
        self.handle.clone()
    }
}

/// Longest delay between a deadline expiring and the poll that reports it.
///
/// A deadline found expired for longer than this was left behind by an
/// operation that was dropped while pending, not by the current one.
const DEADLINE_REPORT_SLACK: Duration = Duration::from_millis(100);

/// Poll the deadline of a pending operation.
///
/// The deadline restarts on every poll that finds the inner stream not
/// ready, so an operation abandoned mid-wait never shortens the next one.
/// A wait only times out when no poll arrives for a full `timeout`.
fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
    operation: &str,
) -> Poll<io::Error> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };
    let now = Instant::now();

    let expired = deadline.as_ref().is_some_and(|sleep| {
        now >= sleep.deadline() && now < sleep.deadline() + timeout.min(DEADLINE_REPORT_SLACK)
    });
    if !expired {
        let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(now)));
        sleep.as_mut().reset(now + timeout);
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
    }

    *deadline = None;
    Poll::Ready(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out after {:?}", operation, timeout),
    ))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl AsyncRead for DirectConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() || this.read_closed.as_mut().poll(cx).is_ready() {
            // Closed: report end-of-stream
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read").map(Err)
            }
        }
    }
}

impl AsyncWrite for DirectConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() || this.write_closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut this.stream).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write").map(Err)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl TunnelConn for DirectConn {
    fn set_closed_signal(&self, signal: oneshot::Sender<()>) -> bool {
        self.handle.set_closed_signal(signal)
    }

    fn close(&self) {
        self.handle.mark_closed();
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl std::fmt::Debug for DirectConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConn")
            .field("peer_addr", &self.stream.peer_addr().ok())
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}
