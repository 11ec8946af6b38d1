use std::io;

/// Errors returned by [`Connection`](crate::Connection) and [`Connector`](crate::Connector)
/// implementations.
///
/// SQL errors raised by statements are not `ClientError`s: they are delivered as
/// [`QueryResult`](crate::QueryResult)s with an error status, the way the server reports them.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection to server failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unsupported authentication method: {0}")]
    UnsupportedAuthentication(&'static str),

    #[error("server closed the connection unexpectedly")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested operation is not allowed in the connection's current state, e.g. a simple
    /// query in pipeline mode
    #[error("{0}")]
    InvalidState(&'static str),

    /// An error reported by the server outside of a statement result, e.g. while preparing
    #[error("{message} (SQLSTATE {sqlstate})")]
    Server { sqlstate: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<nix::Error> for ClientError {
    fn from(errno: nix::Error) -> Self {
        ClientError::Io(errno.into())
    }
}
