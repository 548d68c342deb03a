//! Pipelite shared core - code common to host and spawner helper
//!
//! This crate contains the error type, the fd hand-off wire format, and the
//! constants used by both the host-side runtime (pipelite) and the
//! `pipelite-spawner` helper executable.

pub mod constants;
pub mod errors;
pub mod rights;

pub use errors::{PipeliteError, PipeliteResult};
pub use rights::{recv_stdio_fds, send_stdio_fds, StdioFds};
