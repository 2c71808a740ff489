//! Error shapes for the egress subsystem. Per spec, none of these ever propagate past the public
//! API — they exist so the internals have a name for "why" a `bool`/`Option` came back negative,
//! and so that name can be logged.

/// Structural failure modes of the egress subsystem. None of these are ever returned to a
/// caller directly; public operations fold them into `bool`/`Option` and log the interesting
/// ones (see `ClientEgress`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EgressError {
    /// `enqueue_outgoing` was called with a `Category` that has no bucket/priority mapping.
    UnknownCategory,
    /// A public operation was called after `shutdown()`.
    ClosedConnection,
    /// The `on_queue_empty` callback panicked or otherwise failed.
    CallbackFailure,
}

pub type EgressResult<T> = Result<T, EgressError>;

/// Mirrors the donor `net::shared::ErrorUtils` shape: lets call sites ask "did this fail in a
/// way worth noticing" without matching on the error by hand every time.
pub trait Recoverable {
    fn has_failed(&self) -> bool;
}

impl<T> Recoverable for EgressResult<T> {
    fn has_failed(&self) -> bool {
        self.is_err()
    }
}
