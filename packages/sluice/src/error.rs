// error types.
//
// user-supplied causes travel as anyhow::Error. everything the crate itself raises is a typed
// thiserror enum so callers can match on it.

use crate::runner::Interrupt;
use std::{
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;


// ==== abort ====


/// Error for using a channel which has been aborted
///
/// Wraps the cause the channel was aborted with. Cheaply clonable, since the same abort is
/// delivered to every reader, writer and linked peer of the channel.
#[derive(Clone)]
pub struct AbortError {
    cause: Arc<anyhow::Error>,
}

impl AbortError {
    /// Construct with the given cause
    pub fn new<E>(cause: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        AbortError { cause: Arc::new(cause.into()) }
    }

    /// The cause the channel was aborted with
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// If the abort was caused by a failing invocation, the invocation error
    pub fn invocation_error(&self) -> Option<&InvocationError> {
        self.cause.downcast_ref()
    }

    /// Whether the abort was caused by [`cancel`](crate::InputChannel::cancel)
    pub fn is_cancelled(&self) -> bool {
        self.cause.downcast_ref::<CancelledError>().is_some()
    }
}

impl Display for AbortError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "aborted: {}", self.cause)
    }
}

impl fmt::Debug for AbortError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("AbortError").field("cause", &self.cause).finish()
    }
}

impl StdError for AbortError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let cause: &(dyn StdError + Send + Sync + 'static) = (*self.cause).as_ref();
        Some(cause)
    }
}

/// Cause used when a channel is cancelled without a more specific reason
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
#[error("cancelled")]
pub struct CancelledError;

/// Cause used when the last input handle of a channel is dropped without closing it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
#[error("input channel dropped without being closed")]
pub struct DroppedError;


// ==== invocation ====


/// Error escaping invocation code
///
/// Anything an [`Invocation`](crate::Invocation) or [`Consumer`](crate::Consumer) callback
/// returns as an error, and any panic unwinding out of one, is wrapped in this type and delivered
/// as the cause of an abort. It is never raised on the scheduling thread.
#[derive(Debug, Error)]
#[error("invocation failed: {source}")]
pub struct InvocationError {
    #[source]
    source: anyhow::Error,
}

impl InvocationError {
    /// Wrap an error returned by invocation code
    pub fn new(source: anyhow::Error) -> Self {
        InvocationError { source }
    }

    // wrap a panic payload caught with catch_unwind.
    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        InvocationError { source: anyhow::anyhow!("panicked: {}", msg) }
    }

    /// The wrapped error
    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}


// ==== interruption ====


/// Error for a blocking wait which was interrupted
///
/// Interrupts are raised by a runner on its own worker threads, for example when a
/// [`ThreadPoolRunner`](crate::runner::ThreadPoolRunner) shuts down while a worker is blocked
/// reading a channel. Detecting the interrupt consumes it, so code which handles this error
/// without terminating should call [`reinterrupt`](Self::reinterrupt) to restore it.
#[derive(Debug, Clone, Error)]
#[error("blocking wait interrupted")]
pub struct InterruptedError {
    interrupt: Interrupt,
}

impl InterruptedError {
    pub(crate) fn new(interrupt: Interrupt) -> Self {
        InterruptedError { interrupt }
    }

    /// Re-raise the interrupt, so the next blocking wait on the same thread fails too
    pub fn reinterrupt(&self) {
        self.interrupt.trigger();
    }
}


// ==== deadlock ====


/// Error for an operation which can provably not complete
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DeadlockError {
    /// No output became available before the read timeout elapsed
    #[error("no output available after {timeout:?}")]
    ReadTimeout {
        /// The read timeout which elapsed
        timeout: Duration,
    },
    /// The read would block a thread of the runner which has to produce the output, and that
    /// runner has no spare capacity
    #[error("blocking read on a thread of the runner producing the output")]
    Runner,
    /// Passing another value would exceed the channel's maximum size
    #[error("{pending} pending values reached the maximum buffer size of {max_size}")]
    BufferFull {
        /// Values pending in the channel
        pending: usize,
        /// The configured maximum size
        max_size: usize,
    },
}


// ==== runner ====


/// Error for work a runner discarded without executing it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum RunnerError {
    /// The runner shut down before the execution ran
    #[error("runner shut down before the execution ran")]
    Shutdown,
}


// ==== channel ====


/// Error for using a channel
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The input side of the channel was already closed
    #[error("channel is closed")]
    Closed,
    /// The channel was aborted
    #[error(transparent)]
    Aborted(#[from] AbortError),
    /// The output side of the channel is bound to a consumer and can not be read directly
    #[error("channel output is bound to a consumer")]
    Bound,
    /// The output side of the channel was already bound to a consumer
    #[error("channel output is already bound")]
    AlreadyBound,
    /// The operation can not complete
    #[error(transparent)]
    Deadlock(#[from] DeadlockError),
    /// A blocking wait was interrupted
    #[error(transparent)]
    Interrupted(#[from] InterruptedError),
    /// The operation could not complete immediately or by the specified deadline
    #[error("operation would block")]
    WouldBlock,
}

impl ChannelError {
    /// If the channel was aborted, the abort
    pub fn abort(&self) -> Option<&AbortError> {
        match self {
            ChannelError::Aborted(abort) => Some(abort),
            _ => None,
        }
    }
}


// ==== queue ====


/// Error for misusing a [`NestedQueue`](crate::queue::NestedQueue)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum QueueError {
    /// The queue was closed to further additions
    #[error("queue is closed")]
    Closed,
    /// The nested queue no longer exists, because it was drained or cleared
    #[error("nested queue was removed")]
    Removed,
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn abort_exposes_cause() {
        let abort = AbortError::new(io::Error::new(io::ErrorKind::InvalidInput, "test"));
        assert_eq!(abort.cause().to_string(), "test");
        assert_eq!(abort.source().unwrap().to_string(), "test");
        assert!(abort.cause().downcast_ref::<io::Error>().is_some());
        assert!(!abort.is_cancelled());
        assert!(AbortError::new(CancelledError).is_cancelled());
    }

    #[test]
    fn invocation_error_in_abort() {
        let abort = AbortError::new(InvocationError::new(anyhow::anyhow!("boom")));
        let inv = abort.invocation_error().unwrap();
        assert_eq!(inv.inner().to_string(), "boom");
        assert_eq!(abort.to_string(), "aborted: invocation failed: boom");
    }

    #[test]
    fn panic_payloads() {
        let err = InvocationError::panicked(Box::new("static"));
        assert_eq!(err.inner().to_string(), "panicked: static");
        let err = InvocationError::panicked(Box::new(String::from("owned")));
        assert_eq!(err.inner().to_string(), "panicked: owned");
        let err = InvocationError::panicked(Box::new(7u8));
        assert_eq!(err.inner().to_string(), "panicked: non-string panic payload");
    }

    #[test]
    fn channel_error_display() {
        let err = ChannelError::from(DeadlockError::BufferFull { pending: 3, max_size: 3 });
        assert_eq!(err.to_string(), "3 pending values reached the maximum buffer size of 3");
        assert!(err.abort().is_none());
        let err = ChannelError::from(AbortError::new(CancelledError));
        assert!(err.abort().unwrap().is_cancelled());
    }
}
