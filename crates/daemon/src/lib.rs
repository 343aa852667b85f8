//! matrixfs daemon: serves a Matrix room's state as a local filesystem
//!
//! The path-state engine lives in `common`; this crate adds the homeserver
//! client, configuration, logging and the kernel filesystem.

pub mod config;
pub mod daemon;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod matrix;

pub use config::{Config, ConfigError, Credentials};
pub use daemon::{run, run_until, DaemonError, RunSummary};
pub use matrix::{MatrixClient, MatrixError};
