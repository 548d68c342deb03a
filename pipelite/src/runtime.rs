//! Runtime configuration and the spawn entry point.

use std::path::PathBuf;

use tokio::sync::mpsc;

use pipelite_shared::{PipeliteError, PipeliteResult};

use crate::command::ChildCommand;
use crate::controller::{spawn, Controller};
use crate::process::ChildProcess;
use crate::watcher;

/// Environment variable overriding where handshake sockets are created.
pub const ENV_TMP_DIR: &str = "PIPELITE_TMP_DIR";

/// Environment variable pointing at the spawner helper binary.
pub const ENV_SPAWNER: &str = "PIPELITE_SPAWNER";

const SPAWNER_BIN: &str = "pipelite-spawner";
const REQUEST_QUEUE: usize = 16;

/// Configuration options for [`PipeliteRuntime`].
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug)]
pub struct PipeliteOptions {
    /// Directory where handshake socket files are created.
    pub tmp_dir: PathBuf,
    /// Explicit spawner binary path; discovered when `None`.
    pub spawner_path: Option<PathBuf>,
}

impl Default for PipeliteOptions {
    fn default() -> Self {
        let tmp_dir = std::env::var(ENV_TMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        Self {
            tmp_dir,
            spawner_path: None,
        }
    }
}

/// Factory for supervised child processes.
///
/// Holds the only two pieces of process-wide configuration: the temp
/// directory for handshake sockets and the location of the spawner helper.
#[derive(Debug)]
pub struct PipeliteRuntime {
    tmp_dir: PathBuf,
    spawner_path: PathBuf,
}

impl PipeliteRuntime {
    /// Create a runtime, resolving and validating its configuration.
    pub fn new(options: PipeliteOptions) -> PipeliteResult<Self> {
        let tmp_dir = std::path::absolute(&options.tmp_dir).map_err(|e| {
            PipeliteError::Validation(format!(
                "invalid tmp dir {}: {}",
                options.tmp_dir.display(),
                e
            ))
        })?;
        if !tmp_dir.is_dir() {
            return Err(PipeliteError::Validation(format!(
                "tmp dir does not exist: {}",
                tmp_dir.display()
            )));
        }

        let spawner_path = match options.spawner_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(PipeliteError::Validation(format!(
                        "spawner binary not found: {}",
                        path.display()
                    )));
                }
                path
            }
            None => find_spawner()?,
        };

        tracing::debug!(
            tmp_dir = %tmp_dir.display(),
            spawner = %spawner_path.display(),
            "runtime ready"
        );

        Ok(Self {
            tmp_dir,
            spawner_path,
        })
    }

    /// Spawn a child process under a dedicated controller.
    ///
    /// Returns once the fd hand-off with the spawner helper has completed;
    /// the handshake socket is already gone from the filesystem by then.
    pub async fn spawn(&self, command: ChildCommand) -> PipeliteResult<ChildProcess> {
        let launched = spawn::launch(&self.spawner_path, &self.tmp_dir, &command).await?;

        let (requests, mailbox) = mpsc::channel(REQUEST_QUEUE);
        let guard = watcher::register(launched.helper_pid, launched.socket_path.clone());
        tokio::spawn(Controller::new(mailbox, launched, guard).run());

        Ok(ChildProcess::new(requests))
    }
}

/// Locate the spawner helper: env override, then next to the current
/// executable (and one level up, for test binaries under `deps/`), then PATH.
fn find_spawner() -> PipeliteResult<PathBuf> {
    if let Ok(path) = std::env::var(ENV_SPAWNER) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(PipeliteError::Validation(format!(
            "{} points at a missing file: {}",
            ENV_SPAWNER,
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        for _ in 0..2 {
            if let Some(d) = dir {
                let candidate = d.join(SPAWNER_BIN);
                if candidate.is_file() {
                    return Ok(candidate);
                }
                dir = d.parent();
            }
        }
    }

    which::which(SPAWNER_BIN).map_err(|_| {
        PipeliteError::Validation(format!(
            "{} not found next to the executable or on PATH; set {}",
            SPAWNER_BIN, ENV_SPAWNER
        ))
    })
}
