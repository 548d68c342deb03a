//! Per-child controller: a single task that owns the pipe fds and the child
//! lifecycle, and serialises every operation on them.
//!
//! The controller processes one event at a time from its mailbox: caller
//! requests, pipe readiness, and child exit. Callers block on their oneshot
//! reply; that is how pipe back-pressure reaches them.

pub(crate) mod io;
pub(crate) mod spawn;

use nix::errno::Errno;
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};

use pipelite_shared::{PipeliteError, PipeliteResult};

use self::io::{ReadHalf, ReadMode, WriteHalf};
use self::spawn::LaunchedChild;
use crate::process::{KillSignal, ReadResult};
use crate::watcher::WatcherGuard;

/// One operation on a child, with the caller's reply channel.
pub(crate) enum Request {
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<PipeliteResult<()>>,
    },
    Read {
        mode: ReadMode,
        reply: oneshot::Sender<PipeliteResult<ReadResult>>,
    },
    CloseStdin {
        reply: oneshot::Sender<PipeliteResult<()>>,
    },
    Kill {
        signal: KillSignal,
        reply: oneshot::Sender<PipeliteResult<()>>,
    },
    AwaitExit {
        reply: oneshot::Sender<PipeliteResult<i32>>,
    },
    OsPid {
        reply: oneshot::Sender<Option<u32>>,
    },
    Stop,
}

enum Flow {
    Continue,
    Stop,
}

/// Pid, exit status and the exit-waiter set.
struct Lifecycle {
    helper_pid: u32,
    exit_code: Option<i32>,
    waiters: Vec<oneshot::Sender<PipeliteResult<i32>>>,
}

impl Lifecycle {
    fn handle_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) {
        let code = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::error!(error = %e, "failed to reap spawner");
                1
            }
        };
        tracing::debug!(pid = self.helper_pid, code, "child exited");
        self.exit_code = Some(code);
        // Timed-out waiters dropped their receivers; sends to them just fail.
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(code));
        }
    }

    fn await_exit(&mut self, reply: oneshot::Sender<PipeliteResult<i32>>) {
        match self.exit_code {
            Some(code) => {
                let _ = reply.send(Ok(code));
            }
            None => self.waiters.push(reply),
        }
    }

    fn kill(&self, signal: KillSignal) -> PipeliteResult<()> {
        if self.exit_code.is_some() {
            return Err(PipeliteError::ProcessNotAlive);
        }
        match nix::sys::signal::kill(Pid::from_raw(self.helper_pid as i32), signal.as_signal()) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(PipeliteError::ProcessNotAlive),
            Err(errno) => Err(PipeliteError::Errno(errno as i32)),
        }
    }

    fn os_pid(&self) -> Option<u32> {
        match self.exit_code {
            Some(_) => None,
            None => Some(self.helper_pid),
        }
    }
}

/// Exit code as seen by callers: 128+signo for signal deaths.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

pub(crate) struct Controller {
    requests: mpsc::Receiver<Request>,
    helper: tokio::process::Child,
    writer: WriteHalf,
    reader: ReadHalf,
    lifecycle: Lifecycle,
    watcher: WatcherGuard,
}

impl Controller {
    pub(crate) fn new(
        requests: mpsc::Receiver<Request>,
        launched: LaunchedChild,
        watcher: WatcherGuard,
    ) -> Self {
        Self {
            requests,
            helper: launched.helper,
            writer: WriteHalf::new(launched.stdin),
            reader: ReadHalf::new(launched.stdout),
            lifecycle: Lifecycle {
                helper_pid: launched.helper_pid,
                exit_code: None,
                waiters: Vec::new(),
            },
            watcher,
        }
    }

    /// The controller's event loop. Runs until `stop` or until every handle
    /// is gone.
    pub(crate) async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => Flow::Stop,
                },
                status = self.helper.wait(), if self.lifecycle.exit_code.is_none() => {
                    self.lifecycle.handle_exit(status);
                    Flow::Continue
                }
                _ = self.writer.drive(), if self.writer.wants_io() => Flow::Continue,
                _ = self.reader.drive(), if self.reader.wants_io() => Flow::Continue,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        self.teardown();
    }

    fn handle_request(&mut self, request: Request) -> Flow {
        match request {
            Request::Write { data, reply } => {
                match self.lifecycle.exit_code {
                    Some(code) => {
                        let _ = reply.send(Err(PipeliteError::Exited(code)));
                    }
                    None => self.writer.submit(data, reply),
                }
                Flow::Continue
            }
            Request::Read { mode, reply } => {
                match self.lifecycle.exit_code {
                    Some(code) => {
                        let _ = reply.send(Err(PipeliteError::Exited(code)));
                    }
                    None => self.reader.submit(mode, reply),
                }
                Flow::Continue
            }
            Request::CloseStdin { reply } => {
                if self.lifecycle.exit_code.is_some() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.writer.fail_pending(PipeliteError::Closed);
                    let _ = reply.send(self.writer.close());
                }
                Flow::Continue
            }
            Request::Kill { signal, reply } => {
                let _ = reply.send(self.lifecycle.kill(signal));
                Flow::Continue
            }
            Request::AwaitExit { reply } => {
                self.lifecycle.await_exit(reply);
                Flow::Continue
            }
            Request::OsPid { reply } => {
                let _ = reply.send(self.lifecycle.os_pid());
                Flow::Continue
            }
            Request::Stop => Flow::Stop,
        }
    }

    /// Release everything the controller owns. Callers still waiting observe
    /// their reply channel closing.
    fn teardown(mut self) {
        tracing::debug!(
            pid = self.lifecycle.helper_pid,
            exit_code = ?self.lifecycle.exit_code,
            write_errno = ?self.writer.last_errno(),
            read_errno = ?self.reader.last_errno(),
            "controller shutting down"
        );
        self.writer.shutdown();
        self.reader.shutdown();
        self.lifecycle.waiters.clear();
        if self.lifecycle.exit_code.is_some() {
            // Child already reaped; the watcher has nothing left to guard.
            self.watcher.disarm();
        }
        // Otherwise the guard drops armed and the watcher signals, reaps and
        // unlinks. The helper handle drops here either way; reaping of a
        // still-running helper falls to the runtime's orphan reaper once the
        // watcher has killed it.
    }
}
