//! Spawner launch and fd hand-off handshake.

use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use pipelite_shared::constants::handshake;
use pipelite_shared::{rights, PipeliteError, PipeliteResult, StdioFds};
use rand::Rng as _;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use super::io::set_nonblocking;
use crate::command::ChildCommand;

/// Everything the controller needs after a successful handshake.
pub(crate) struct LaunchedChild {
    pub helper: Child,
    pub helper_pid: u32,
    pub stdin: AsyncFd<OwnedFd>,
    pub stdout: AsyncFd<OwnedFd>,
    pub socket_path: PathBuf,
}

/// Validate the command, launch the spawner helper, and run the handshake.
///
/// Any failure releases everything acquired so far: the helper is killed and
/// the socket path removed. On success the socket path is already unlinked.
pub(crate) async fn launch(
    spawner_path: &Path,
    tmp_dir: &Path,
    cmd: &ChildCommand,
) -> PipeliteResult<LaunchedChild> {
    let program = resolve_program(&cmd.program)?;
    if let Some(dir) = &cmd.working_dir {
        if !dir.is_dir() {
            return Err(PipeliteError::Validation(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
    }

    let socket_path = socket_path_in(tmp_dir);
    if socket_path.exists() {
        tracing::warn!(socket = %socket_path.display(), "removing stale handshake socket");
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        PipeliteError::Handshake(format!(
            "failed to bind {}: {}",
            socket_path.display(),
            e
        ))
    })?;

    let mut helper = spawn_helper(spawner_path, &socket_path, &program, cmd)
        .inspect_err(|_| {
            let _ = std::fs::remove_file(&socket_path);
        })?;
    let helper_pid = match helper.id() {
        Some(pid) => pid,
        None => {
            abort(&mut helper, &socket_path);
            return Err(PipeliteError::Handshake(
                "spawner exited before its pid could be read".into(),
            ));
        }
    };

    let stdio = match handshake(&listener, &mut helper).await {
        Ok(stdio) => stdio,
        Err(e) => {
            abort(&mut helper, &socket_path);
            return Err(e);
        }
    };

    let stdin = match install_fd(stdio.stdin_write, Interest::WRITABLE) {
        Ok(fd) => fd,
        Err(e) => {
            abort(&mut helper, &socket_path);
            return Err(e);
        }
    };
    let stdout = match install_fd(stdio.stdout_read, Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            abort(&mut helper, &socket_path);
            return Err(e);
        }
    };

    // The filesystem entry has served its purpose; it must be gone before
    // anyone can observe the running child.
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(socket = %socket_path.display(), error = %e, "failed to remove handshake socket");
    }
    drop(listener);

    tracing::debug!(pid = helper_pid, program = %program.display(), "child started");

    Ok(LaunchedChild {
        helper,
        helper_pid,
        stdin,
        stdout,
        socket_path,
    })
}

/// Resolve a program name to an absolute executable path.
fn resolve_program(program: &str) -> PipeliteResult<PathBuf> {
    which::which(program)
        .map_err(|_| PipeliteError::Validation(format!("command not found: {}", program)))
}

/// Handshake socket path: 16 random bytes, url-safe, under the temp dir.
fn socket_path_in(tmp_dir: &Path) -> PathBuf {
    let mut name_bytes = [0u8; handshake::SOCKET_NAME_BYTES];
    rand::rng().fill(&mut name_bytes[..]);
    tmp_dir.join(format!("pl-{}.sock", URL_SAFE_NO_PAD.encode(name_bytes)))
}

fn spawn_helper(
    spawner_path: &Path,
    socket_path: &Path,
    program: &Path,
    cmd: &ChildCommand,
) -> PipeliteResult<Child> {
    let mut command = Command::new(spawner_path);
    command.arg(socket_path).arg(program).args(&cmd.args);
    // cwd and env land in the helper's own environment; the child inherits
    // them through exec.
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir);
    }
    for (key, val) in &cmd.env {
        command.env(key, val);
    }
    command.stdin(Stdio::null());

    command.spawn().map_err(|e| {
        PipeliteError::Handshake(format!(
            "failed to spawn {}: {}",
            spawner_path.display(),
            e
        ))
    })
}

/// Accept the helper's connection and receive the stdio fds, both within the
/// handshake deadline.
async fn handshake(listener: &UnixListener, helper: &mut Child) -> PipeliteResult<StdioFds> {
    let (stream, _addr) = match timeout(handshake::TIMEOUT, listener.accept()).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            return Err(PipeliteError::Handshake(format!("socket accept failed: {}", e)));
        }
        Err(_) => return Err(premature_exit_error(helper, "spawner did not connect")),
    };

    match timeout(handshake::TIMEOUT, recv_fds(&stream)).await {
        Ok(result) => result,
        Err(_) => Err(premature_exit_error(helper, "spawner did not send stdio fds")),
    }
}

/// Distinguish "helper died" from a plain timeout in the failure message.
fn premature_exit_error(helper: &mut Child, what: &str) -> PipeliteError {
    if let Ok(Some(status)) = helper.try_wait() {
        return PipeliteError::Handshake(format!(
            "spawner exited prematurely with status {:?} ({})",
            status.code(),
            what
        ));
    }
    PipeliteError::Handshake(format!("{} within {:?}", what, handshake::TIMEOUT))
}

async fn recv_fds(stream: &UnixStream) -> PipeliteResult<StdioFds> {
    stream
        .async_io(Interest::READABLE, || match rights::recv_stdio_fds(stream) {
            Ok(stdio) => Ok(stdio),
            Err(e) if e.errno() == Some(libc::EAGAIN) => {
                Err(std::io::ErrorKind::WouldBlock.into())
            }
            Err(e) => Err(std::io::Error::other(e)),
        })
        .await
        .map_err(|e| match e.downcast::<PipeliteError>() {
            Ok(inner) => inner,
            Err(e) => PipeliteError::Handshake(format!("failed to receive stdio fds: {}", e)),
        })
}

fn install_fd(fd: OwnedFd, interest: Interest) -> PipeliteResult<AsyncFd<OwnedFd>> {
    set_nonblocking(&fd)?;
    AsyncFd::with_interest(fd, interest)
        .map_err(|e| PipeliteError::Internal(format!("failed to register pipe fd: {}", e)))
}

fn abort(helper: &mut Child, socket_path: &Path) {
    let _ = helper.start_kill();
    let _ = std::fs::remove_file(socket_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths_are_unique_and_land_in_the_given_dir() {
        let dir = Path::new("/tmp");
        let a = socket_path_in(dir);
        let b = socket_path_in(dir);
        assert_ne!(a, b);
        assert!(a.starts_with(dir));
        assert!(a.extension().is_some_and(|ext| ext == "sock"));
    }

    #[test]
    fn missing_command_is_a_validation_error() {
        let err = resolve_program("definitely-not-a-real-command-7f3a").unwrap_err();
        assert!(matches!(err, PipeliteError::Validation(msg) if msg.contains("command not found")));
    }

    #[test]
    fn absolute_paths_resolve_to_themselves() {
        let sh = resolve_program("/bin/sh").unwrap();
        assert_eq!(sh, PathBuf::from("/bin/sh"));
    }
}
