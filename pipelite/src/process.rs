//! Public handle for one supervised child process.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use pipelite_shared::{PipeliteError, PipeliteResult};

use crate::controller::io::ReadMode;
use crate::controller::Request;

/// Result of a read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// The requested bytes; for unbuffered reads, whatever one read produced.
    Data(Vec<u8>),
    /// End of stream, carrying the bytes gathered before it.
    Eof(Vec<u8>),
}

impl ReadResult {
    /// The carried bytes, whether or not the stream ended.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ReadResult::Data(bytes) | ReadResult::Eof(bytes) => bytes,
        }
    }

    /// True once the child's stdout reached end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, ReadResult::Eof(_))
    }
}

/// Signals deliverable through [`ChildProcess::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM: ask the child to shut down.
    Term,
    /// SIGKILL: take the child down unconditionally.
    Kill,
}

impl KillSignal {
    pub(crate) fn as_signal(self) -> nix::sys::signal::Signal {
        match self {
            KillSignal::Term => nix::sys::signal::Signal::SIGTERM,
            KillSignal::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

/// Handle to a supervised child process.
///
/// Clones share the same controller; operations from any clone are serialised
/// by it. At most one read and one write may be in flight at a time; a
/// second caller gets [`PipeliteError::PendingRead`] /
/// [`PipeliteError::PendingWrite`] immediately.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn example() -> pipelite::PipeliteResult<()> {
/// use pipelite::{ChildCommand, PipeliteOptions, PipeliteRuntime};
///
/// let runtime = PipeliteRuntime::new(PipeliteOptions::default())?;
/// let child = runtime.spawn(ChildCommand::new("cat")).await?;
///
/// child.write(b"hello").await?;
/// child.close_stdin().await?;
/// let echoed = child.read(5).await?;
/// assert_eq!(echoed.into_bytes(), b"hello");
///
/// let code = child.await_exit().await?;
/// assert_eq!(code, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChildProcess {
    requests: mpsc::Sender<Request>,
}

impl ChildProcess {
    pub(crate) fn new(requests: mpsc::Sender<Request>) -> Self {
        Self { requests }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<PipeliteResult<T>>) -> Request,
    ) -> PipeliteResult<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| PipeliteError::Stopped)?;
        rx.await.map_err(|_| PipeliteError::Stopped)?
    }

    /// Write all bytes to the child's stdin.
    ///
    /// Returns once the kernel pipe has accepted the whole buffer; a full
    /// pipe blocks the caller until the child drains it.
    ///
    /// # Errors
    ///
    /// - [`PipeliteError::PendingWrite`] if another write is in flight
    /// - [`PipeliteError::Closed`] after `close_stdin`
    /// - [`PipeliteError::Exited`] once the child has exited
    /// - [`PipeliteError::Errno`] on pipe I/O failure
    pub async fn write(&self, data: &[u8]) -> PipeliteResult<()> {
        let data = data.to_vec();
        self.call(|reply| Request::Write { data, reply }).await
    }

    /// Read exactly `size` bytes from the child's stdout.
    ///
    /// Blocks until `size` bytes have been gathered
    /// ([`ReadResult::Data`]) or the stream ends first
    /// ([`ReadResult::Eof`] with the shorter tail).
    pub async fn read(&self, size: usize) -> PipeliteResult<ReadResult> {
        if size == 0 {
            return Err(PipeliteError::Validation(
                "read size must be positive".into(),
            ));
        }
        self.call(|reply| Request::Read {
            mode: ReadMode::Exact(size),
            reply,
        })
        .await
    }

    /// Read whatever a single successful read yields, up to 64 KiB.
    ///
    /// An empty read means end of stream: [`ReadResult::Eof`] with no bytes.
    pub async fn read_unbuffered(&self) -> PipeliteResult<ReadResult> {
        self.call(|reply| Request::Read {
            mode: ReadMode::Unbuffered,
            reply,
        })
        .await
    }

    /// Close the child's stdin, signalling EOF.
    ///
    /// Idempotent; returns `Ok` on an already-exited child. A pending write
    /// fails with [`PipeliteError::Closed`].
    pub async fn close_stdin(&self) -> PipeliteResult<()> {
        self.call(|reply| Request::CloseStdin { reply }).await
    }

    /// Deliver a signal to the child's OS process.
    pub async fn kill(&self, signal: KillSignal) -> PipeliteResult<()> {
        self.call(|reply| Request::Kill { signal, reply }).await
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// Any number of waiters may block here concurrently; all of them receive
    /// the exit code.
    pub async fn await_exit(&self) -> PipeliteResult<i32> {
        self.call(|reply| Request::AwaitExit { reply }).await
    }

    /// Like [`await_exit`](Self::await_exit), giving up with
    /// [`PipeliteError::Timeout`] when the deadline fires first. Other
    /// waiters are unaffected.
    pub async fn await_exit_timeout(&self, deadline: Duration) -> PipeliteResult<i32> {
        match tokio::time::timeout(deadline, self.await_exit()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(PipeliteError::Timeout),
        }
    }

    /// OS pid of the child, or `None` once it is no longer known.
    pub async fn os_pid(&self) -> Option<u32> {
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::OsPid { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Release the controller. The watcher thereafter guarantees the child is
    /// signalled and reaped; callers still blocked observe
    /// [`PipeliteError::Stopped`].
    pub async fn stop(&self) {
        let _ = self.requests.send(Request::Stop).await;
    }
}
