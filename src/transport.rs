//! The seam between the control connection and the connection codec.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{ConnectError, QueryError};
use crate::events::{EventTypes, ServerEvent};
use crate::rows::{ResultRows, Statement};
use crate::version::ProtocolVersion;

/// Why the socket went away.
#[derive(Clone, Debug, Error)]
#[error("control socket closed: {reason}")]
pub struct SocketClosed {
    pub reason: String,
}

/// A freshly established control socket, together with the channel server
/// events arrive on and the one-shot notification that fires when the
/// socket is closed or defuncted.
pub struct EstablishedConnection {
    pub socket: Arc<dyn ControlSocket>,
    pub events: mpsc::Receiver<ServerEvent>,
    pub closed: oneshot::Receiver<SocketClosed>,
}

/// Opens control sockets. Implementations perform the TCP connect, the
/// handshake at the requested protocol version, and the REGISTER for the
/// requested event types.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn connect(
        &self,
        address: SocketAddr,
        protocol: ProtocolVersion,
        events: EventTypes,
    ) -> Result<EstablishedConnection, ConnectError>;
}

/// One control socket.
#[async_trait]
pub trait ControlSocket: Send + Sync {
    fn address(&self) -> SocketAddr;

    /// Writes the statement and resolves with its RESULT rows.
    /// `NoStreamAvailable` is reported synchronously when the stream-id
    /// pool is exhausted.
    async fn query(&self, statement: Statement) -> Result<ResultRows, QueryError>;

    /// Marks the connection unusable. The close notification fires exactly
    /// once, whether the socket was defuncted or closed by the peer.
    fn defunct(&self);
}
