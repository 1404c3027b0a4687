//! Error type shared by every framekit crate.
//!
//! Each fallible operation returns [`Result`]. The variants mirror the
//! failure classes a service can report to its caller; the payload string
//! carries the human-readable detail that also ends up in
//! `Service::last_error`.

/// Errors reported by the framework core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An argument was out of range or not valid for the current configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The service (or task) has already been started.
    #[error("already started")]
    AlreadyStarted,

    /// An operation was re-entered while it was still in progress.
    #[error("reentrant call: {0}")]
    Reentry(String),

    /// A registration was attempted after the owning object was initialised.
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),

    /// The operation requires a started service.
    #[error("not started: {0}")]
    NotStarted(String),

    /// A task, session, listener or address does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A slot that accepts a single registration was registered twice.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A configured limit (task count, recursion depth, ...) was reached.
    #[error("resource limit reached: {0}")]
    ResourceLimitReached(String),

    /// The collaborator does not support the requested operation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A pool destruction-order declaration would introduce a cycle.
    #[error("cyclic destruction order: {0}")]
    CyclicOrder(String),

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// An OS thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// A component lifecycle hook reported failure.
    #[error("component hook failed: {0}")]
    HookFailed(String),
}

/// Convenience alias used throughout the framework.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
