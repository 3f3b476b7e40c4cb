use std::fmt;

use failure::Backtrace;
use failure::Context;
use failure::Fail;

use needlestack_models::api::RpcCode;

/// Error information returned by service clients in case of errors.
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
    #[fail(display = "failed to decode response from {}", _0)]
    Decode(String),

    #[fail(display = "invalid client credentials: {}", _0)]
    Credentials(String),

    #[fail(display = "remote call failed with {}: {}", _0, _1)]
    Remote(&'static str, String),

    #[fail(display = "transport error talking to {}", _0)]
    Transport(String),
}

impl ErrorKind {
    pub fn remote(code: RpcCode, message: String) -> ErrorKind {
        ErrorKind::Remote(code.as_str(), message)
    }

    /// The remote status code, when this error carries one.
    pub fn remote_code(&self) -> Option<RpcCode> {
        match self {
            ErrorKind::Remote(code, _) => match *code {
                "ALREADY_EXISTS" => Some(RpcCode::AlreadyExists),
                "FAILED_PRECONDITION" => Some(RpcCode::FailedPrecondition),
                "INVALID_ARGUMENT" => Some(RpcCode::InvalidArgument),
                "NOT_FOUND" => Some(RpcCode::NotFound),
                "UNAVAILABLE" => Some(RpcCode::Unavailable),
                _ => Some(RpcCode::Unknown),
            },
            _ => None,
        }
    }
}

/// Short form alias for functions returning `Error`s.
pub type Result<T> = ::std::result::Result<T, Error>;
