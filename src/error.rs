//! Typed error taxonomy for the runtime.
//!
//! Post-boot, almost nothing in this crate returns an `Err`: a dead destination or an
//! overloaded mailbox are facts of life for an actor system and are reported as sentinel
//! values or log lines (see spec §7), not propagated failures. The types here cover the
//! minority of cases that really are exceptional: module resolution and bootstrap.

use crate::handle::Handle;
use thiserror::Error;

/// Failure to resolve or initialize a named module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module `{0}` has no `_init` symbol")]
    MissingInit(String),
    #[error("module `{0}` not found on search path `{1}`")]
    NotFound(String, String),
    #[error("module `{0}`: dynamic load failed: {1}")]
    LoadFailed(String, #[source] libloading::Error),
}

/// Returned by `Runtime::send` when a message cannot be delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The destination handle or name does not resolve to a live service.
    #[error("no such destination")]
    NoSuchDestination,
    /// The payload exceeds the runtime's configured maximum message size.
    #[error("payload too large")]
    PayloadTooLarge,
}

/// Failure to bring a service up during `Runtime::launch`.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
    #[error("service `{0}` init returned failure for handle {1}")]
    InitFailed(String, Handle),
}

/// Fatal bootstrap errors, surfaced at process exit.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to launch logger service `{0}`: {1}")]
    Logger(String, #[source] LaunchError),
    #[error("failed to launch bootstrap service `{0}`: {1}")]
    Bootstrap(String, #[source] LaunchError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
