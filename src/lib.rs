//! Control connection core for a Cassandra client driver.
//!
//! A driver keeps one dedicated connection to one node of the cluster, the
//! control connection, which never carries user traffic. It discovers the
//! cluster through the `system.local` and `system.peers` tables, reads the
//! schema tables, registers for server-pushed topology/status/schema events,
//! and reconciles what it learns into the session's host registry, token map
//! and schema metadata. When the connection is lost it fails over to another
//! cluster member and re-scans from scratch.
//!
//! The crate is built around two pieces:
//! * [`machine::ControlMachine`]: the lifecycle (NEW, READY, CLOSED, with
//!   protocol-version negotiation, reconnect and event gating) as a pure
//!   state machine producing [`machine::Command`]s;
//! * [`ControlConnection`]: the worker that executes those commands against
//!   the [`ControlTransport`] and the [`ControlSession`].
//!
//! The wire codec, the data-plane connection pools, the session internals,
//! the load-balancing policy and the token-map builder are collaborators
//! behind traits; this crate contains no user-query paths.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use cass_control::{ControlConnection, ControlConnectionConfig};
//! # fn example<S, T>(session: Arc<S>, transport: Arc<T>)
//! # where S: cass_control::ControlSession + 'static,
//! #       T: cass_control::ControlTransport + 'static {
//! let (connection, handle) =
//!     ControlConnection::new(session, transport, ControlConnectionConfig::default());
//! tokio::spawn(connection.run());
//! // ... later:
//! handle.shutdown();
//! # }
//! ```

pub mod address;
pub mod config;
mod control;
pub mod errors;
pub mod events;
pub mod host;
pub mod machine;
pub mod metadata;
pub mod plan;
mod queries;
mod refresh;
pub mod rows;
mod schema;
pub mod session;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod transport;
pub mod version;

pub use config::ControlConnectionConfig;
pub use control::{ControlConnection, ControlConnectionHandle};
pub use errors::{ConnectError, ControlConnectionError, QueryError};
pub use host::Host;
pub use metadata::{BufferedSchema, MetadataStore, SchemaSnapshot};
pub use session::ControlSession;
pub use transport::{ControlSocket, ControlTransport, EstablishedConnection, SocketClosed};
pub use version::{ProtocolVersion, ServerVersion};
