use thiserror::Error;

/// Fatal control-connection errors reported to the session.
///
/// Everything else (unreachable hosts, broken sockets, malformed rows) is
/// absorbed by reconnecting; only errors that make forward progress
/// impossible end up here.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlConnectionError {
    /// Every host in the query plan was tried and none accepted a connection.
    #[error("No hosts available for the control connection")]
    NoHostsAvailable,

    /// The server rejected every protocol version down to the lowest one.
    #[error("Not even protocol version 1 is supported")]
    UnableToDetermineProtocol,

    /// The server rejected the provided credentials.
    #[error("Bad credentials: {0}")]
    BadCredentials(String),

    /// The TLS handshake failed.
    #[error("Unable to connect: {0}")]
    UnableToConnect(String),
}

/// Errors produced while establishing the control socket.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The server does not speak the requested protocol version.
    #[error("server does not support the requested protocol version")]
    InvalidProtocol,

    /// Authentication failed during the handshake.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    Ssl(String),

    /// DNS, TCP or any other transport-level failure.
    #[error("connect failed: {0}")]
    Io(String),
}

/// Errors produced by a single query on the control socket.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// The response did not carry the expected RESULT opcode.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The server answered with an ERROR response.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The per-connection stream-id pool is exhausted.
    #[error("no more streams available")]
    NoStreamAvailable,

    /// The socket went away while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}
