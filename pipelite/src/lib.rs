//! Pipelite - demand-driven control over an external process's stdio
//!
//! Pipelite spawns an OS process and exposes its stdin/stdout as explicit
//! pull/push endpoints. Nothing is buffered on the host side: reads pull
//! bytes out of the kernel pipe only when asked, writes push bytes in only
//! when there is room, and each side back-pressures the other through the
//! pipe buffers.
//!
//! The pipe fds come back from the `pipelite-spawner` helper over a
//! Unix-domain socket (SCM_RIGHTS). A dedicated controller task per child
//! serialises all operations and drives the fds with non-blocking syscalls; a
//! watcher task guarantees the process is signalled, reaped, and the
//! handshake socket removed even if the controller dies abnormally.
//!
//! ```rust,no_run
//! # async fn example() -> pipelite::PipeliteResult<()> {
//! use pipelite::{ChildCommand, PipeliteOptions, PipeliteRuntime};
//!
//! let runtime = PipeliteRuntime::new(PipeliteOptions::default())?;
//! let child = runtime
//!     .spawn(ChildCommand::new("sort").env("LC_ALL", "C"))
//!     .await?;
//!
//! child.write(b"b\na\n").await?;
//! child.close_stdin().await?;
//! let sorted = child.read(4).await?;
//! assert_eq!(sorted.into_bytes(), b"a\nb\n");
//! child.await_exit().await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod controller;
mod process;
mod runtime;
mod watcher;

pub use command::ChildCommand;
pub use pipelite_shared::{PipeliteError, PipeliteResult};
pub use process::{ChildProcess, KillSignal, ReadResult};
pub use runtime::{PipeliteOptions, PipeliteRuntime, ENV_SPAWNER, ENV_TMP_DIR};
