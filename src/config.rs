//! Control-connection configuration.

use std::time::Duration;

use crate::version::ProtocolVersion;

/// Knobs for the control connection.
#[derive(Clone, Debug)]
pub struct ControlConnectionConfig {
    /// Protocol version to start negotiating from. `None` starts from the
    /// highest supported Cassandra version.
    pub protocol_version: Option<ProtocolVersion>,

    /// Whether schema metadata is tracked. Enables the bulk schema read and
    /// targeted schema refreshes.
    pub use_schema: bool,

    /// Whether token-aware routing is enabled. Makes the host queries fetch
    /// tokens and keeps the token map fed with keyspace replication rows.
    pub token_aware_routing: bool,

    /// Timeout for establishing the control socket.
    pub connect_timeout: Duration,

    /// Timeout for a single metadata query.
    pub request_timeout: Duration,

    /// How long to wait before retrying when a post-READY reconnect has
    /// exhausted the query plan.
    pub reconnect_interval: Duration,
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        ControlConnectionConfig {
            protocol_version: None,
            use_schema: true,
            token_aware_routing: true,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(12),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}
