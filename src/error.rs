// src/error.rs
use std::io;
use std::sync::Arc;

/// Crate-wide error type. Cloneable so a single cancellation cause can be
/// shared between a context, the futures cancelled under it, and the tasks
/// observing it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Canonical cancellation sentinel: context cancellation with no explicit
    /// cause, `cancel(None)`, or a task's sub-context firing.
    #[error("cancelled")]
    Cancelled,

    /// A context deadline fired. Used as a cancellation cause.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// `result()` was called on a promise that has not completed.
    #[error("promise is still pending")]
    Pending,

    /// A non-blocking file descriptor could not make progress. Internal
    /// signal: the stream layer converts it into a readiness wait.
    #[error("operation would block")]
    WouldBlock,

    /// Clean end of stream. Lazy iterators terminate on it; single-shot reads
    /// surface it only when no bytes were produced.
    #[error("end of file")]
    Eof,

    /// Poller or syscall failure. Returned from `wait`, it terminates the
    /// event loop.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// Any other error produced by user code, carried as a value.
    #[error("{0}")]
    Msg(Arc<str>),
}

impl Error {
    pub fn msg(text: impl Into<String>) -> Self {
        Error::Msg(text.into().into())
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::Io(Arc::new(err)),
        }
    }
}
