//! Non-blocking pipe I/O halves.
//!
//! Each half owns one pipe fd and the single pending slot for its direction.
//! All syscalls are non-blocking; `EAGAIN` only re-arms the readiness
//! notification and is never surfaced to callers.

use std::os::unix::io::{IntoRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use pipelite_shared::constants::io::UNBUFFERED_READ_MAX;
use pipelite_shared::{PipeliteError, PipeliteResult};
use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;

use crate::process::ReadResult;

/// How much a pending read still wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Gather exactly this many bytes (or EOF).
    Exact(usize),
    /// Return after the first successful read.
    Unbuffered,
}

/// The single in-flight write.
struct PendingWrite {
    buf: Vec<u8>,
    written: usize,
    reply: oneshot::Sender<PipeliteResult<()>>,
}

impl PendingWrite {
    fn remaining(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    /// Record `n` written bytes; true when the buffer is fully flushed.
    fn advance(&mut self, n: usize) -> bool {
        self.written += n;
        self.written >= self.buf.len()
    }
}

/// The single in-flight read.
struct PendingRead {
    mode: ReadMode,
    acc: Vec<u8>,
    reply: oneshot::Sender<PipeliteResult<ReadResult>>,
}

impl PendingRead {
    fn chunk_len(&self) -> usize {
        match self.mode {
            ReadMode::Exact(size) => size - self.acc.len(),
            ReadMode::Unbuffered => UNBUFFERED_READ_MAX,
        }
    }

    fn is_complete(&self) -> bool {
        match self.mode {
            ReadMode::Exact(size) => self.acc.len() >= size,
            ReadMode::Unbuffered => !self.acc.is_empty(),
        }
    }
}

/// Write side: the child's stdin pipe.
pub(crate) struct WriteHalf {
    fd: Option<AsyncFd<OwnedFd>>,
    slot: Option<PendingWrite>,
    last_errno: Option<i32>,
}

impl WriteHalf {
    pub(crate) fn new(fd: AsyncFd<OwnedFd>) -> Self {
        Self {
            fd: Some(fd),
            slot: None,
            last_errno: None,
        }
    }

    pub(crate) fn wants_io(&self) -> bool {
        self.fd.is_some() && self.slot.is_some()
    }

    pub(crate) fn last_errno(&self) -> Option<i32> {
        self.last_errno
    }

    /// Install the pending write, or reject it synchronously.
    pub(crate) fn submit(&mut self, data: Vec<u8>, reply: oneshot::Sender<PipeliteResult<()>>) {
        if self.fd.is_none() {
            let _ = reply.send(Err(PipeliteError::Closed));
            return;
        }
        if self.slot.is_some() {
            let _ = reply.send(Err(PipeliteError::PendingWrite));
            return;
        }
        if data.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.slot = Some(PendingWrite {
            buf: data,
            written: 0,
            reply,
        });
    }

    /// Fail the pending writer, if any.
    pub(crate) fn fail_pending(&mut self, err: PipeliteError) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.reply.send(Err(err));
        }
    }

    /// Close the fd, surfacing the close errno.
    pub(crate) fn close(&mut self) -> PipeliteResult<()> {
        match self.fd.take() {
            Some(fd) => close_fd(fd.into_inner()).inspect_err(|e| {
                self.last_errno = e.errno();
            }),
            None => Ok(()),
        }
    }

    /// One readiness-driven write attempt.
    ///
    /// Only called while `wants_io()`; cancellation before the attempt leaves
    /// the slot untouched.
    pub(crate) async fn drive(&mut self) {
        let outcome = {
            let Some(fd) = &self.fd else { return };
            let Some(slot) = self.slot.as_ref() else {
                return;
            };
            match fd.writable().await {
                Err(e) => Some(Err(e)),
                Ok(mut guard) => match guard.try_io(|afd| write_some(afd.get_ref(), slot.remaining())) {
                    Err(_would_block) => None,
                    Ok(result) => Some(result),
                },
            }
        };

        match outcome {
            None => {}
            Some(Ok(n)) => {
                let done = self.slot.as_mut().map(|slot| slot.advance(n)).unwrap_or(false);
                if done {
                    if let Some(slot) = self.slot.take() {
                        let _ = slot.reply.send(Ok(()));
                    }
                }
            }
            Some(Err(e)) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                self.last_errno = Some(errno);
                tracing::warn!(errno, "stdin pipe write failed");
                self.fail_pending(PipeliteError::Errno(errno));
            }
        }
    }

    /// Drop the pending writer and close the fd; errors only get logged.
    pub(crate) fn shutdown(&mut self) {
        self.slot = None;
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close stdin pipe fd");
        }
    }
}

/// Read side: the child's stdout pipe.
pub(crate) struct ReadHalf {
    fd: Option<AsyncFd<OwnedFd>>,
    slot: Option<PendingRead>,
    last_errno: Option<i32>,
}

impl ReadHalf {
    pub(crate) fn new(fd: AsyncFd<OwnedFd>) -> Self {
        Self {
            fd: Some(fd),
            slot: None,
            last_errno: None,
        }
    }

    pub(crate) fn wants_io(&self) -> bool {
        self.fd.is_some() && self.slot.is_some()
    }

    pub(crate) fn last_errno(&self) -> Option<i32> {
        self.last_errno
    }

    /// Install the pending read, or reject it synchronously.
    pub(crate) fn submit(
        &mut self,
        mode: ReadMode,
        reply: oneshot::Sender<PipeliteResult<ReadResult>>,
    ) {
        if self.slot.is_some() {
            let _ = reply.send(Err(PipeliteError::PendingRead));
            return;
        }
        if self.fd.is_none() {
            let _ = reply.send(Err(PipeliteError::Stopped));
            return;
        }
        self.slot = Some(PendingRead {
            mode,
            acc: Vec::new(),
            reply,
        });
    }

    /// One readiness-driven read attempt.
    pub(crate) async fn drive(&mut self) {
        let outcome = {
            let Some(fd) = &self.fd else { return };
            let Some(slot) = self.slot.as_ref() else {
                return;
            };
            let mut buf = vec![0u8; slot.chunk_len()];
            match fd.readable().await {
                Err(e) => Some(Err(e)),
                Ok(mut guard) => match guard.try_io(|afd| read_some(afd.get_ref(), &mut buf)) {
                    Err(_would_block) => None,
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        Some(Ok(buf))
                    }
                    Ok(Err(e)) => Some(Err(e)),
                },
            }
        };

        match outcome {
            None => {}
            Some(Ok(chunk)) if chunk.is_empty() => {
                if let Some(PendingRead { acc, reply, .. }) = self.slot.take() {
                    let _ = reply.send(Ok(ReadResult::Eof(acc)));
                }
            }
            Some(Ok(chunk)) => {
                let done = {
                    let Some(slot) = self.slot.as_mut() else { return };
                    slot.acc.extend_from_slice(&chunk);
                    slot.is_complete()
                };
                if done {
                    if let Some(PendingRead { acc, reply, .. }) = self.slot.take() {
                        let _ = reply.send(Ok(ReadResult::Data(acc)));
                    }
                }
            }
            Some(Err(e)) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                self.last_errno = Some(errno);
                tracing::warn!(errno, "stdout pipe read failed");
                if let Some(slot) = self.slot.take() {
                    let _ = slot.reply.send(Err(PipeliteError::Errno(errno)));
                }
            }
        }
    }

    /// Drop the pending reader and close the fd; errors only get logged.
    pub(crate) fn shutdown(&mut self) {
        self.slot = None;
        if let Some(fd) = self.fd.take() {
            if let Err(e) = close_fd(fd.into_inner()) {
                tracing::warn!(error = %e, "failed to close stdout pipe fd");
            }
        }
    }
}

/// Switch an inherited fd to non-blocking mode.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> PipeliteResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn close_fd(fd: OwnedFd) -> PipeliteResult<()> {
    let raw = fd.into_raw_fd();
    if unsafe { libc::close(raw) } != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        return Err(PipeliteError::Errno(errno));
    }
    Ok(())
}

fn write_some(fd: &OwnedFd, buf: &[u8]) -> std::io::Result<usize> {
    nix::unistd::write(fd, buf).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

fn read_some(fd: &OwnedFd, buf: &mut [u8]) -> std::io::Result<usize> {
    nix::unistd::read(fd, buf).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tokio::io::Interest;

    fn async_writable(fd: OwnedFd) -> AsyncFd<OwnedFd> {
        set_nonblocking(&fd).unwrap();
        AsyncFd::with_interest(fd, Interest::WRITABLE).unwrap()
    }

    fn async_readable(fd: OwnedFd) -> AsyncFd<OwnedFd> {
        set_nonblocking(&fd).unwrap();
        AsyncFd::with_interest(fd, Interest::READABLE).unwrap()
    }

    #[tokio::test]
    async fn write_half_flushes_through_a_real_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = WriteHalf::new(async_writable(write_end));

        let (tx, rx) = oneshot::channel();
        half.submit(b"hello pipe".to_vec(), tx);
        while half.wants_io() {
            half.drive().await;
        }
        rx.await.unwrap().unwrap();
        half.shutdown();

        let mut buf = Vec::new();
        std::fs::File::from(read_end).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello pipe");
    }

    #[tokio::test]
    async fn second_write_is_rejected_while_one_is_pending() {
        let (_read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = WriteHalf::new(async_writable(write_end));

        let (tx1, _rx1) = oneshot::channel();
        half.submit(vec![0u8; 1], tx1);
        let (tx2, rx2) = oneshot::channel();
        half.submit(vec![0u8; 1], tx2);

        assert_eq!(rx2.await.unwrap(), Err(PipeliteError::PendingWrite));
    }

    #[tokio::test]
    async fn closed_half_rejects_writes() {
        let (_read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = WriteHalf::new(async_writable(write_end));
        half.close().unwrap();

        let (tx, rx) = oneshot::channel();
        half.submit(b"late".to_vec(), tx);
        assert_eq!(rx.await.unwrap(), Err(PipeliteError::Closed));
    }

    #[tokio::test]
    async fn read_half_gathers_exact_count() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = ReadHalf::new(async_readable(read_end));

        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"abcdef").unwrap();

        let (tx, rx) = oneshot::channel();
        half.submit(ReadMode::Exact(4), tx);
        while half.wants_io() {
            half.drive().await;
        }
        assert_eq!(rx.await.unwrap().unwrap(), ReadResult::Data(b"abcd".to_vec()));
    }

    #[tokio::test]
    async fn read_half_reports_eof_with_partial_bytes() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = ReadHalf::new(async_readable(read_end));

        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"ab").unwrap();
        drop(writer);

        let (tx, rx) = oneshot::channel();
        half.submit(ReadMode::Exact(4), tx);
        while half.wants_io() {
            half.drive().await;
        }
        assert_eq!(rx.await.unwrap().unwrap(), ReadResult::Eof(b"ab".to_vec()));
    }

    #[tokio::test]
    async fn unbuffered_read_returns_first_chunk() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut half = ReadHalf::new(async_readable(read_end));

        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"xy").unwrap();

        let (tx, rx) = oneshot::channel();
        half.submit(ReadMode::Unbuffered, tx);
        while half.wants_io() {
            half.drive().await;
        }
        assert_eq!(rx.await.unwrap().unwrap(), ReadResult::Data(b"xy".to_vec()));
    }

    #[test]
    fn pending_write_advance_tracks_the_tail() {
        let (reply, _rx) = oneshot::channel();
        let mut slot = PendingWrite {
            buf: b"abcdef".to_vec(),
            written: 0,
            reply,
        };
        assert!(!slot.advance(4));
        assert_eq!(slot.remaining(), b"ef");
        assert!(slot.advance(2));
    }
}
