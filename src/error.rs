use std::fmt;

use failure::Backtrace;
use failure::Context;
use failure::Fail;

use needlestack_models::api::RpcCode;

/// Error information returned by functions in case of errors.
#[derive(Debug)]
pub struct Error(Context<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.get_context()
    }

    /// RPC status this error maps to at the service boundary.
    pub fn rpc_code(&self) -> RpcCode {
        self.kind().rpc_code()
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
    #[fail(display = "{}", _0)]
    AlreadyExists(String),

    #[fail(display = "could not coordinate with the cluster store")]
    Coordination,

    #[fail(display = "{}", _0)]
    FailedPrecondition(String),

    #[fail(display = "could not initialise {} interface", _0)]
    InterfaceInit(&'static str),

    #[fail(display = "{}", _0)]
    InvalidArgument(String),

    #[fail(display = "{}", _0)]
    NotFound(String),

    #[fail(display = "{}", _1)]
    Remote(&'static str, String),

    #[fail(display = "unable to spawn new thread for '{}'", _0)]
    SpawnThread(&'static str),

    #[fail(display = "{}", _0)]
    Unavailable(String),

    #[fail(display = "{}", _0)]
    Unknown(String),
}

impl ErrorKind {
    pub fn rpc_code(&self) -> RpcCode {
        match self {
            ErrorKind::AlreadyExists(_) => RpcCode::AlreadyExists,
            ErrorKind::FailedPrecondition(_) => RpcCode::FailedPrecondition,
            ErrorKind::InvalidArgument(_) => RpcCode::InvalidArgument,
            ErrorKind::NotFound(_) => RpcCode::NotFound,
            ErrorKind::Remote(code, _) => remote_code(code),
            ErrorKind::Coordination | ErrorKind::Unavailable(_) => RpcCode::Unavailable,
            _ => RpcCode::Unknown,
        }
    }
}

fn remote_code(code: &str) -> RpcCode {
    match code {
        "ALREADY_EXISTS" => RpcCode::AlreadyExists,
        "FAILED_PRECONDITION" => RpcCode::FailedPrecondition,
        "INVALID_ARGUMENT" => RpcCode::InvalidArgument,
        "NOT_FOUND" => RpcCode::NotFound,
        "UNAVAILABLE" => RpcCode::Unavailable,
        _ => RpcCode::Unknown,
    }
}

/// Map a searcher-side collection engine error onto an RPC-facing error.
pub fn from_collections(error: needlestack_collections::Error) -> Error {
    use needlestack_collections::ErrorKind as Kind;
    let kind = match error.kind() {
        Kind::DesiredState => ErrorKind::Unavailable(error.to_string()),
        Kind::DimensionMismatch(_) => ErrorKind::FailedPrecondition(error.to_string()),
        Kind::ShardLoad(_, _) => ErrorKind::Unknown(error.to_string()),
        Kind::UnknownShard(_, _) => ErrorKind::InvalidArgument(error.to_string()),
        Kind::Unsupported(_, _) => ErrorKind::FailedPrecondition(error.to_string()),
    };
    error.context(kind).into()
}

/// Map a coordination error onto an RPC-facing error.
pub fn from_coordinator(error: needlestack_coordinator::Error) -> Error {
    error.context(ErrorKind::Coordination).into()
}

/// Map a downstream client error, keeping remote codes intact.
pub fn from_client(error: needlestack_client::Error) -> Error {
    use needlestack_client::ErrorKind as Kind;
    let kind = match error.kind() {
        Kind::Remote(code, message) => ErrorKind::Remote(code, message.clone()),
        Kind::Transport(hostport) => {
            ErrorKind::Unavailable(format!("searcher {} unreachable", hostport))
        }
        _ => ErrorKind::Unknown(error.to_string()),
    };
    error.context(kind).into()
}

/// Map a placement solver error onto an RPC-facing error.
pub fn from_balancers(error: needlestack_balancers::Error) -> Error {
    error
        .context(ErrorKind::FailedPrecondition(
            "could not place shards on the cluster".into(),
        ))
        .into()
}

/// Short form alias for functions returning `Error`s.
pub type Result<T> = ::std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use needlestack_models::api::RpcCode;

    use super::ErrorKind;

    #[test]
    fn remote_codes_pass_through() {
        let kind = ErrorKind::Remote("NOT_FOUND", "missing".into());
        assert_eq!(kind.rpc_code(), RpcCode::NotFound);
        let kind = ErrorKind::Remote("SOMETHING_ELSE", "odd".into());
        assert_eq!(kind.rpc_code(), RpcCode::Unknown);
    }

    #[test]
    fn admin_codes() {
        assert_eq!(
            ErrorKind::AlreadyExists("c1".into()).rpc_code(),
            RpcCode::AlreadyExists
        );
        assert_eq!(
            ErrorKind::NotFound("ghost".into()).rpc_code(),
            RpcCode::NotFound
        );
        assert_eq!(ErrorKind::Coordination.rpc_code(), RpcCode::Unavailable);
    }
}
