use std::fmt;

use failure::Backtrace;
use failure::Context;
use failure::Fail;

/// Error information returned by the coordination API in case of errors.
#[derive(Debug)]
pub struct Error(Context<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.get_context()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error(Context::new(kind))
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error(inner)
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.0.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.0.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Exhaustive list of possible errors emitted by this crate.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "node {} already exists", _0)]
    AlreadyExists(String),

    #[fail(display = "{} failed due to coordination store error", _0)]
    Backend(&'static str),

    #[fail(display = "connection to coordination store failed")]
    BackendConnect,

    #[fail(display = "failed to decode {}", _0)]
    Decode(String),

    #[fail(display = "failed to encode {}", _0)]
    Encode(&'static str),

    #[fail(display = "coordination session expired")]
    SessionExpired,

    #[fail(display = "unable to spawn new thread for '{}'", _0)]
    SpawnThread(&'static str),

    #[fail(display = "transaction rolled back: {}", _0)]
    Transaction(String),

    #[fail(display = "transient coordination store error during {}", _0)]
    Transient(&'static str),

    #[fail(display = "{} failed after {} attempts", _0, _1)]
    RetryExhausted(&'static str, u32),
}

impl ErrorKind {
    /// Transient errors are retried with backoff before they surface.
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::Transient(_) => true,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            ErrorKind::AlreadyExists(_) => true,
            _ => false,
        }
    }
}

/// Short form alias for functions returning `Error`s.
pub type Result<T> = ::std::result::Result<T, Error>;
