//! Error handling utils.
//!
//! Runtime entry points report misuse through [`Error`]. Operation-local
//! failures (a value that could not be sent, a fiber that panicked) are
//! reported by the error enums living next to the operation, e.g.
//! [`SendError`](crate::fiber::channel::SendError) and
//! [`JoinError`](crate::fiber::JoinError), so that callers can recover the
//! value they tried to hand over.

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents the error cases of the runtime entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A runtime entry point was called outside of an active context, i.e.
    /// not from within [`run`](crate::runtime::run) or a fiber spawned there.
    #[error("runtime entry point called outside of an active context")]
    NoRuntime,

    /// [`Context::activate`](crate::runtime::Context::activate) was called a
    /// second time. Contexts are single-use.
    #[error("context has already been activated")]
    ContextReused,

    /// Every live fiber is blocked and no external event can resume any of
    /// them.
    #[error("deadlock: all live fibers are blocked with no external resumer")]
    Deadlock,
}
