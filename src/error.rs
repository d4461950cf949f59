//! Error taxonomy for the object runtime.
//!
//! Every public operation returns `Result<T>`; errors are values, never
//! panics, and never cross native frames as unwinds. Listener handlers that
//! fail have their error logged and swallowed by the signal core.

use crate::types::Type;

/// Error kinds surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A member, module, signal or plugin with the given name does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A member, module, signal or plugin with the given name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A value of one type was supplied where an incompatible type was
    /// expected and no implicit conversion applies.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: Type, actual: Type },

    /// An integer value does not fit the destination type's range.
    #[error("value out of range for {0}")]
    OutOfRange(Type),

    /// A callable was invoked with the wrong number of arguments.
    #[error("arity mismatch: expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// The receiver has no call slot.
    #[error("object is not callable")]
    NotCallable,

    /// The object has been destroyed; calls, emits and mutations fail.
    #[error("object is destroyed")]
    Destroyed,

    /// A weak reference (captured `this` or weak capture) no longer points
    /// at a live object.
    #[error("dangling weak reference")]
    Dangling,

    /// More arguments than the call core supports.
    #[error("too many arguments")]
    TooManyArgs,

    /// An argument was structurally invalid (wrong element type, negative
    /// interval, strong self-capture, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An OS resource limit was hit (watch descriptors, fds, ...).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An error bubbled up from an underlying OS or protocol binding.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Maps an errno-style OS failure, folding resource limits into
    /// `ResourceExhausted`.
    pub fn from_os(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::OutOfMemory | ErrorKind::StorageFull => {
                Error::ResourceExhausted(err.to_string())
            }
            _ => match err.raw_os_error() {
                Some(code) if code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOSPC => {
                    Error::ResourceExhausted(err.to_string())
                }
                _ => Error::Transport(err),
            },
        }
    }
}
