//! Error types for scoped producers.

use thiserror::Error;

use crate::scope::State;

/// Errors surfaced by a [`ScopedStream`](crate::ScopedStream).
///
/// `E` is the producer's own error type. Producer failures are carried
/// untouched in [`Error::Producer`] and [`Error::Closure`].
#[derive(Error, Debug)]
pub enum Error<E> {
    /// An operation was attempted in a lifecycle state that does not allow it.
    ///
    /// A rejected exit keeps the failure it was asked to unwind in `cause`.
    #[error("cannot {operation} a scoped stream in state {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
        cause: Option<Box<Error<E>>>,
    },

    /// The producer has already signalled completion.
    #[error("producer is exhausted")]
    Exhausted,

    /// Failure raised by the producer while producing a value.
    #[error("{0}")]
    Producer(E),

    /// Failure raised by the producer while it was being closed.
    #[error("closing the producer failed: {0}")]
    Closure(E),

    /// The scope was already failing when closing the producer failed too.
    ///
    /// The original failure is kept in `cause`; see [`Error::cause`].
    #[error("closing the producer failed while unwinding a failed scope: {closure}")]
    Unwound { cause: Box<Error<E>>, closure: E },
}

impl<E> Error<E> {
    pub(crate) fn invalid_state(operation: &'static str, state: State) -> Self {
        Error::InvalidState {
            operation,
            state,
            cause: None,
        }
    }

    /// Attaches the in-flight failure to a rejected operation.
    pub(crate) fn with_cause(self, in_flight: Error<E>) -> Self {
        match self {
            Error::InvalidState {
                operation, state, ..
            } => Error::InvalidState {
                operation,
                state,
                cause: Some(Box::new(in_flight)),
            },
            other => other,
        }
    }

    /// Returns the producer's failure if this error carries one from
    /// production, not from closure.
    pub fn into_producer(self) -> Option<E> {
        match self {
            Error::Producer(error) => Some(error),
            _ => None,
        }
    }

    /// The in-flight failure of an [`Error::Unwound`], or of a rejected exit.
    pub fn cause(&self) -> Option<&Error<E>> {
        match self {
            Error::Unwound { cause, .. } => Some(cause),
            Error::InvalidState { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::Exhausted)
    }
}

/// Result type for scoped stream operations.
pub type Result<T, E> = std::result::Result<T, Error<E>>;
