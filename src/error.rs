use failure::{Backtrace, Context, Fail};
use std::fmt;
use std::io;

/// Error Type for the store
#[derive(Debug)]
pub struct StoreError {
    inner: Context<StoreErrorKind>,
}

/// Kinds of possible Errors in the store
#[derive(Debug, Fail)]
pub enum StoreErrorKind {
    /// IoError triggered by socket or file I/Os
    #[fail(display = "Io Error")]
    IoError,
    /// Malformed protocol framing on an inbound buffer
    #[fail(display = "Protocol Error")]
    ProtocolError,
    /// Snapshot file could not be parsed
    #[fail(display = "Snapshot Parse Error")]
    SnapshotError,
    /// Replication handshake did not complete
    #[fail(display = "Replication Handshake Error")]
    HandshakeError,
}

impl Fail for StoreError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<StoreErrorKind> for StoreError {
    fn from(kind: StoreErrorKind) -> StoreError {
        StoreError {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<StoreErrorKind>> for StoreError {
    fn from(context: Context<StoreErrorKind>) -> StoreError {
        StoreError { inner: context }
    }
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> StoreError {
        error.context(StoreErrorKind::IoError).into()
    }
}

impl From<std::str::Utf8Error> for StoreError {
    fn from(error: std::str::Utf8Error) -> StoreError {
        error.context(StoreErrorKind::ProtocolError).into()
    }
}
