//! Spawner helper binary for pipelite.
//!
//! Invoked by the host as `pipelite-spawner <socket-path> <cmd> [args…]`.
//! Connects back to the host over the Unix socket, launches the target
//! command with fresh stdin/stdout pipes, hands the host's pipe ends back in
//! a single SCM_RIGHTS message, forwards termination signals to the child,
//! and finally mirrors the child's exit status as its own.
//!
//! Working directory and environment for the child are whatever the host
//! staged in this process's environment before exec.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use clap::Parser;
use nix::fcntl::OFlag;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use pipelite_shared::{send_stdio_fds, PipeliteError, PipeliteResult};

/// Pipelite spawner - executes a command and hands its stdio pipes to the host
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Pipelite spawner process - executes a command and hands its stdio pipes back to the host"
)]
struct SpawnerArgs {
    /// Unix socket path the host is listening on
    socket_path: PathBuf,

    /// Absolute path of the command to execute
    command: PathBuf,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let args = SpawnerArgs::parse();
    init_logging();
    propagate_parent_death();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "spawner failed");
            std::process::exit(1);
        }
    }
}

/// Logging goes to stderr and stays quiet unless RUST_LOG asks otherwise;
/// stdout belongs to whoever launched us.
fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run(args: SpawnerArgs) -> PipeliteResult<i32> {
    // Catch termination signals early so nothing slips through before the
    // forwarder thread starts; deliveries in between stay queued.
    let signals = Signals::new([SIGTERM, SIGINT]).map_err(|e| {
        PipeliteError::Internal(format!("failed to install signal handlers: {}", e))
    })?;

    let stream = UnixStream::connect(&args.socket_path).map_err(|e| {
        PipeliteError::Handshake(format!(
            "failed to connect to {}: {}",
            args.socket_path.display(),
            e
        ))
    })?;

    let (stdin_read, stdin_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (stdout_read, stdout_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

    let mut command = Command::new(&args.command);
    command
        .args(&args.args)
        .stdin(Stdio::from(stdin_read))
        .stdout(Stdio::from(stdout_write));
    unsafe {
        command.pre_exec(|| {
            // The child must not outlive this process.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|e| {
        PipeliteError::Validation(format!(
            "failed to execute {}: {}",
            args.command.display(),
            e
        ))
    })?;
    // The Command still holds the child-side pipe ends; they must close here
    // or the host never sees EOF when the child closes its stdout.
    drop(command);

    tracing::debug!(pid = child.id(), command = %args.command.display(), "child running");

    if let Err(e) = send_stdio_fds(&stream, stdin_write.as_raw_fd(), stdout_read.as_raw_fd()) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }
    // The host owns the pipe ends now; local copies must go or EOF never
    // propagates.
    drop(stdin_write);
    drop(stdout_read);
    drop(stream);

    forward_signals(signals, child.id());

    let status = child
        .wait()
        .map_err(|e| PipeliteError::Internal(format!("failed to wait for child: {}", e)))?;
    let code = status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
    tracing::debug!(code, "child exited");
    Ok(code)
}

/// Relay termination signals to the child instead of dying with work pending.
fn forward_signals(mut signals: Signals, child_pid: u32) {
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::debug!(signal, "forwarding signal to child");
            unsafe {
                libc::kill(child_pid as i32, signal);
            }
        }
    });
}

/// Ask the kernel for SIGTERM if the host process dies, so an abandoned
/// spawner (and through it, the child) never outlives a crashed host.
#[cfg(target_os = "linux")]
fn propagate_parent_death() {
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
            tracing::info!("failed to set parent death signal");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn propagate_parent_death() {}
