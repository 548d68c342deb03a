//! Cleanup watcher for abandoned children.
//!
//! One watcher task is registered per child at handshake completion. It holds
//! only the child's OS pid and the handshake socket path. If the controller
//! goes away without having reaped the child, the watcher signals the
//! process, waits for it to disappear, and removes the socket path.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;

use pipelite_shared::constants::watcher::{REAP_POLL_INTERVAL, TERM_GRACE};

/// Guard held by the controller. Dropping it without [`disarm`] arms the
/// cleanup path.
///
/// [`disarm`]: WatcherGuard::disarm
pub(crate) struct WatcherGuard {
    disarm: Option<oneshot::Sender<()>>,
}

impl WatcherGuard {
    /// Clean shutdown: the child is reaped; only socket tidying remains.
    pub(crate) fn disarm(mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
    }
}

/// Register a watcher for a freshly started child.
pub(crate) fn register(pid: u32, socket_path: PathBuf) -> WatcherGuard {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(watch(rx, pid, socket_path));
    WatcherGuard { disarm: Some(tx) }
}

async fn watch(disarm: oneshot::Receiver<()>, pid: u32, socket_path: PathBuf) {
    // A dropped sender means the controller went away without reaping.
    let armed = disarm.await.is_err();

    if armed && is_process_alive(pid) {
        tracing::warn!(pid, "controller abandoned a live child, cleaning up");
        send_signal(pid, libc::SIGTERM);
        if !wait_for_exit(pid, TERM_GRACE).await {
            tracing::warn!(pid, "child ignored SIGTERM, escalating to SIGKILL");
            send_signal(pid, libc::SIGKILL);
            if !wait_for_exit(pid, TERM_GRACE).await {
                tracing::error!(pid, "child did not disappear after SIGKILL");
            }
        }
    }

    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            tracing::warn!(
                socket = %socket_path.display(),
                error = %e,
                "failed to remove handshake socket"
            );
        }
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub(crate) fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Poll until the pid is gone; true if it disappeared within `limit`.
async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(REAP_POLL_INTERVAL).await;
    }
    !is_process_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn absurd_pids_are_not_alive() {
        assert!(!is_process_alive(999999999));
    }

    #[tokio::test]
    async fn disarmed_watcher_only_tidies_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("leftover.sock");
        std::fs::write(&socket_path, b"").unwrap();

        let guard = register(std::process::id(), socket_path.clone());
        guard.disarm();

        // The watcher runs concurrently; give it a moment to tidy up.
        for _ in 0..100 {
            if !socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!socket_path.exists());
    }
}
