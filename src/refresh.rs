//! Host discovery: the full `local` + `peers` scan and single-host
//! refreshes, with reconciliation into the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::address::resolve_peer_address;
use crate::errors::QueryError;
use crate::host::Host;
use crate::queries;
use crate::rows::{CqlValue, ResultRows, Row, Statement};
use crate::session::ControlSession;
use crate::transport::ControlSocket;
use crate::version::ServerVersion;

/// Why a scan was abandoned. Query errors other than `ConnectionClosed`
/// defunct the socket; the two host-table conditions below do too, because
/// a node that cannot describe itself (still bootstrapping) must not serve
/// as the control host.
#[derive(Debug)]
pub(crate) enum ScanError {
    Query(QueryError),
    EmptyLocal,
    UnknownControlHost,
}

impl ScanError {
    /// Whether the socket should be defuncted over this error.
    pub(crate) fn defuncts(&self) -> bool {
        !matches!(self, ScanError::Query(QueryError::ConnectionClosed))
    }
}

impl From<QueryError> for ScanError {
    fn from(error: QueryError) -> Self {
        ScanError::Query(error)
    }
}

/// Issues `statement` under the configured request timeout.
pub(crate) async fn query(
    socket: &dyn ControlSocket,
    statement: Statement,
    timeout: Duration,
) -> Result<ResultRows, QueryError> {
    match tokio::time::timeout(timeout, socket.query(statement)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout),
    }
}

/// Whether the row carries an update for an existing host record or the
/// first data for a freshly scanned one. Token-map wise the former rebuilds
/// the host's token ranges, the latter only adds them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdateHostType {
    Add,
    UpdateAndBuild,
}

/// The chained `local` + `peers` scan run on every successful connect.
///
/// Returns the server version read from the control host's `local` row;
/// that version decides which schema queries follow.
pub(crate) async fn run_full_scan<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    token_aware: bool,
    is_initial_connection: bool,
    generation: u64,
    request_timeout: Duration,
) -> Result<ServerVersion, ScanError> {
    let local_query = query(
        socket,
        Statement::new(queries::select_local(token_aware)),
        request_timeout,
    );
    let peers_query = query(
        socket,
        Statement::new(queries::select_peers(token_aware)),
        request_timeout,
    );
    let (local, peers) = futures::try_join!(local_query, peers_query)?;

    if token_aware {
        session.token_map_hosts_cleared();
    }

    let connected = socket.address();

    let host = match session.get_host(connected) {
        Some(host) => host,
        None => {
            warn!("Host {} from local system table not found", connected);
            return Err(ScanError::UnknownControlHost);
        }
    };
    host.set_mark(generation);

    // An empty `system.local` can happen while a node is bootstrapping; such
    // a node cannot be the control host.
    let local_row = match local.first() {
        Some(row) => row,
        None => {
            warn!("No row found in {}'s local system table", connected);
            return Err(ScanError::EmptyLocal);
        }
    };
    update_node_info(
        session,
        &host,
        local_row,
        UpdateHostType::Add,
        token_aware,
        connected,
    );
    let version = host.server_version().unwrap_or_default();

    for row in &peers.rows {
        let peer_value = row.get("peer").unwrap_or(&CqlValue::Null);
        let rpc_value = row.get("rpc_address").unwrap_or(&CqlValue::Null);
        let address = match resolve_peer_address(connected, peer_value, rpc_value) {
            Ok(address) => address,
            Err(_) => continue,
        };

        let (peer_host, is_new) = match session.get_host(address) {
            Some(existing) => (existing, false),
            None => (session.add_host(address), true),
        };
        peer_host.set_mark(generation);
        update_node_info(
            session,
            &peer_host,
            row,
            UpdateHostType::Add,
            token_aware,
            connected,
        );
        if is_new && !is_initial_connection {
            session.on_add(&peer_host);
        }
    }

    session.purge_hosts(generation, is_initial_connection);

    Ok(version)
}

/// Reconciles one `local`/`peers` row into a host record. Updates
/// datacenter and rack (rebalancing the load-balancing policy when either
/// changed on an established host), release version, listen address and
/// tokens. Never removes anything.
pub(crate) fn update_node_info<S: ControlSession + ?Sized>(
    session: &S,
    host: &Arc<Host>,
    row: &Row,
    update_type: UpdateHostType,
    token_aware: bool,
    connected: SocketAddr,
) {
    let rack = row.text("rack").unwrap_or("");
    let datacenter = row.text("data_center").unwrap_or("");
    let release_version = row.text("release_version").unwrap_or("");

    // Only `system.peers` rows carry `peer`.
    if let Some(peer_value) = row.get("peer") {
        if !peer_value.is_null() {
            match peer_value.as_inet() {
                Some(listen_ip) => host.set_listen_address(listen_ip.to_string()),
                None => warn!("Invalid address format for listen address"),
            }
        }
    }

    if (!rack.is_empty() && rack != host.rack())
        || (!datacenter.is_empty() && datacenter != host.datacenter())
    {
        if !host.was_just_added() {
            session.load_balancing_host_add_remove(host, false);
        }
        host.set_rack_and_dc(rack, datacenter);
        if !host.was_just_added() {
            session.load_balancing_host_add_remove(host, true);
        }
    }

    match release_version.parse::<ServerVersion>() {
        Ok(version) => host.set_server_version(version),
        Err(_) => warn!(
            "Invalid release version string \"{}\" on host {}",
            release_version,
            host.address()
        ),
    }

    if token_aware {
        let is_connected_host = host.address() == connected;
        if is_connected_host {
            if let Some(partitioner) = row.text("partitioner") {
                if !session.token_map_init(partitioner) {
                    trace!("Token map has already been initialized");
                }
            }
        }
        if let Some(tokens) = row.text_list("tokens") {
            host.set_tokens(tokens.to_vec());
            match update_type {
                UpdateHostType::Add => session.token_map_host_add(host),
                UpdateHostType::UpdateAndBuild => session.token_map_host_update(host),
            }
        }
    }
}

/// Refreshes one host's record, as triggered by NEW_NODE, MOVED_NODE and UP
/// events. Reads `local` when the target is the control host, a filtered
/// `peers` row when the listen address is known, and otherwise falls back
/// to a full `peers` scan filtered client-side. An empty result only logs:
/// the event is stale, the connection is fine.
pub(crate) async fn refresh_node_info<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    host: Arc<Host>,
    is_new_node: bool,
    query_tokens: bool,
    token_aware: bool,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    let connected = socket.address();
    let is_connected_host = host.address() == connected;
    let with_tokens = token_aware && (host.was_just_added() || query_tokens);

    let listen_address = host.listen_address();
    let (statement, filter_client_side) = if is_connected_host {
        (Statement::new(queries::select_local(with_tokens)), false)
    } else if let Some(listen_address) = &listen_address {
        (
            Statement::new(queries::select_peer_by_listen_address(
                with_tokens,
                listen_address,
            )),
            false,
        )
    } else {
        (Statement::new(queries::select_peers(with_tokens)), true)
    };
    debug!("refresh_node_info: {}", statement.text);

    let result = query(socket, statement, request_timeout).await?;

    if result.is_empty() {
        error!(
            "No row found for host {} in {}'s local/peers system table. {} will be ignored.",
            host.address(),
            connected,
            host.address()
        );
        return Ok(());
    }

    if filter_client_side {
        for row in &result.rows {
            let peer_value = row.get("peer").unwrap_or(&CqlValue::Null);
            let rpc_value = row.get("rpc_address").unwrap_or(&CqlValue::Null);
            match resolve_peer_address(connected, peer_value, rpc_value) {
                Ok(address) if address == host.address() => {
                    update_node_info(
                        session,
                        &host,
                        row,
                        UpdateHostType::UpdateAndBuild,
                        token_aware,
                        connected,
                    );
                    if is_new_node {
                        session.on_add(&host);
                    }
                    break;
                }
                _ => continue,
            }
        }
    } else {
        let row = result.first().expect("checked non-empty above");
        update_node_info(
            session,
            &host,
            row,
            UpdateHostType::UpdateAndBuild,
            token_aware,
            connected,
        );
        if is_new_node {
            session.on_add(&host);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::test_utils::{
        local_row, peer_row, setup_tracing, MockSession, MockSocket, SessionCall,
    };

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn full_scan_reconciles_local_and_peers() {
        setup_tracing();
        let session = MockSession::new();
        let control = session.add_host(addr("10.0.0.1:9042"));
        control.set_just_added(false);

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::SELECT_LOCAL_TOKENS,
            ResultRows::new(vec![local_row("dc1", "r1", "3.11.0")]),
        );
        socket.respond(
            queries::SELECT_PEERS_TOKENS,
            ResultRows::new(vec![
                peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "3.11.0"),
                peer_row("10.0.0.3", "10.0.0.3", "dc1", "r2", "3.11.0"),
            ]),
        );

        let version = run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(version, ServerVersion::new(3, 11, 0));
        assert_eq!(control.datacenter(), "dc1");
        assert_eq!(control.mark(), 1);
        let peer = session.get_host(addr("10.0.0.2:9042")).unwrap();
        assert_eq!(peer.rack(), "r1");
        assert_eq!(peer.listen_address().as_deref(), Some("10.0.0.2"));
        assert_eq!(peer.mark(), 1);
        assert!(session.get_host(addr("10.0.0.3:9042")).is_some());

        // Initial connection: discovered peers are not announced one by one.
        assert!(!session.calls().contains(&SessionCall::OnAdd(addr("10.0.0.2:9042"))));
        assert!(session
            .calls()
            .contains(&SessionCall::PurgeHosts { generation: 1, is_initial: true }));
    }

    #[tokio::test]
    async fn full_scan_marks_every_scanned_host_with_the_generation() {
        setup_tracing();
        let session = MockSession::new();
        session.add_host(addr("10.0.0.1:9042"));
        // A stale host the scan will not observe.
        session.add_host(addr("10.9.9.9:9042"));

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::SELECT_LOCAL_TOKENS,
            ResultRows::new(vec![local_row("dc1", "r1", "3.11.0")]),
        );
        socket.respond(
            queries::SELECT_PEERS_TOKENS,
            ResultRows::new(vec![peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "3.11.0")]),
        );

        run_full_scan(&socket, &session, true, false, 7, TIMEOUT)
            .await
            .unwrap();

        for host in session.hosts_snapshot() {
            assert_eq!(host.mark(), 7, "host {} kept after purge", host.address());
        }
        assert!(session.get_host(addr("10.9.9.9:9042")).is_none());
        // Non-initial scan announces the new peer.
        assert!(session.calls().contains(&SessionCall::OnAdd(addr("10.0.0.2:9042"))));
    }

    #[tokio::test]
    async fn empty_local_defuncts_the_scan() {
        setup_tracing();
        let session = MockSession::new();
        session.add_host(addr("10.0.0.1:9042"));

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(queries::SELECT_LOCAL_TOKENS, ResultRows::default());
        socket.respond(queries::SELECT_PEERS_TOKENS, ResultRows::default());

        let error = run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap_err();
        assert!(error.defuncts());
        assert_matches!(error, ScanError::EmptyLocal);
    }

    #[tokio::test]
    async fn server_error_aborts_the_scan_and_defuncts() {
        setup_tracing();
        let session = MockSession::new();
        session.add_host(addr("10.0.0.1:9042"));

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.fail(
            queries::SELECT_LOCAL_TOKENS,
            QueryError::Server {
                code: 0x2200,
                message: "unconfigured table".into(),
            },
        );
        socket.respond(queries::SELECT_PEERS_TOKENS, ResultRows::default());

        let error = run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap_err();
        assert!(error.defuncts());
        assert_matches!(error, ScanError::Query(QueryError::Server { .. }));
    }

    #[tokio::test]
    async fn closed_connection_does_not_defunct_again() {
        setup_tracing();
        let session = MockSession::new();
        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.fail(queries::SELECT_LOCAL_TOKENS, QueryError::ConnectionClosed);
        socket.respond(queries::SELECT_PEERS_TOKENS, ResultRows::default());

        let error = run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap_err();
        assert!(!error.defuncts());
    }

    #[tokio::test]
    async fn self_referential_peer_rows_are_skipped() {
        setup_tracing();
        let session = MockSession::new();
        session.add_host(addr("10.0.0.1:9042"));

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::SELECT_LOCAL_TOKENS,
            ResultRows::new(vec![local_row("dc1", "r1", "3.11.0")]),
        );
        socket.respond(
            queries::SELECT_PEERS_TOKENS,
            ResultRows::new(vec![
                // The connected host leaked into its own peers table.
                peer_row("10.0.0.1", "10.0.0.1", "dc1", "r1", "3.11.0"),
                peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "3.11.0"),
            ]),
        );

        run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap();

        let addresses: Vec<SocketAddr> = session
            .hosts_snapshot()
            .iter()
            .map(|h| h.address())
            .collect();
        assert_eq!(
            addresses,
            vec![addr("10.0.0.1:9042"), addr("10.0.0.2:9042")]
        );
    }

    #[tokio::test]
    async fn wildcard_rpc_address_uses_the_listen_address() {
        setup_tracing();
        let session = MockSession::new();
        session.add_host(addr("10.0.0.1:9042"));

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::SELECT_LOCAL_TOKENS,
            ResultRows::new(vec![local_row("dc1", "r1", "3.11.0")]),
        );
        socket.respond(
            queries::SELECT_PEERS_TOKENS,
            ResultRows::new(vec![peer_row("10.0.0.2", "0.0.0.0", "dc1", "r1", "3.11.0")]),
        );

        run_full_scan(&socket, &session, true, true, 1, TIMEOUT)
            .await
            .unwrap();

        assert!(session.get_host(addr("10.0.0.2:9042")).is_some());
        assert!(session.get_host(addr("0.0.0.0:9042")).is_none());
    }

    #[tokio::test]
    async fn dc_or_rack_change_rebalances_the_policy() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.2:9042"));
        host.set_just_added(false);
        host.set_rack_and_dc("r1", "dc1");

        let row = peer_row("10.0.0.2", "10.0.0.2", "dc2", "r1", "3.11.0");
        update_node_info(
            &session,
            &host,
            &row,
            UpdateHostType::UpdateAndBuild,
            false,
            addr("10.0.0.1:9042"),
        );

        assert_eq!(host.datacenter(), "dc2");
        let calls = session.calls();
        let remove = calls
            .iter()
            .position(|c| *c == SessionCall::LoadBalancingRemove(addr("10.0.0.2:9042")));
        let add = calls
            .iter()
            .position(|c| *c == SessionCall::LoadBalancingAdd(addr("10.0.0.2:9042")));
        assert!(remove.unwrap() < add.unwrap());
    }

    #[tokio::test]
    async fn version_parse_failure_keeps_the_previous_version() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.2:9042"));
        host.set_server_version(ServerVersion::new(3, 0, 8));

        let row = peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "definitely-not-a-version");
        update_node_info(
            &session,
            &host,
            &row,
            UpdateHostType::UpdateAndBuild,
            false,
            addr("10.0.0.1:9042"),
        );

        assert_eq!(host.server_version(), Some(ServerVersion::new(3, 0, 8)));
    }

    #[tokio::test]
    async fn single_refresh_uses_the_listen_address_filter() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.2:9042"));
        host.set_just_added(false);
        host.set_listen_address("10.0.0.2".into());

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::select_peer_by_listen_address(false, "10.0.0.2"),
            ResultRows::new(vec![peer_row("10.0.0.2", "10.0.0.2", "dc1", "r9", "3.11.0")]),
        );

        refresh_node_info(&socket, &session, host.clone(), false, false, false, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(host.rack(), "r9");
    }

    #[tokio::test]
    async fn single_refresh_without_listen_address_filters_client_side() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.3:9042"));
        host.set_just_added(false);

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::SELECT_PEERS,
            ResultRows::new(vec![
                peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "3.11.0"),
                peer_row("10.0.0.3", "10.0.0.3", "dc1", "r3", "3.11.0"),
            ]),
        );

        refresh_node_info(&socket, &session, host.clone(), false, false, false, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(host.rack(), "r3");
        assert_eq!(host.listen_address().as_deref(), Some("10.0.0.3"));
    }

    #[tokio::test]
    async fn empty_single_refresh_only_logs() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.2:9042"));
        host.set_listen_address("10.0.0.2".into());
        host.set_rack_and_dc("r1", "dc1");

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::select_peer_by_listen_address(true, "10.0.0.2"),
            ResultRows::default(),
        );

        let result =
            refresh_node_info(&socket, &session, host.clone(), true, false, true, TIMEOUT).await;
        assert_matches!(result, Ok(()));
        // The host was not announced: the refresh found nothing.
        assert!(!session.calls().contains(&SessionCall::OnAdd(addr("10.0.0.2:9042"))));
        assert_eq!(host.rack(), "r1");
    }

    #[tokio::test]
    async fn refresh_of_new_node_announces_it_after_the_update() {
        setup_tracing();
        let session = MockSession::new();
        let host = session.add_host(addr("10.0.0.2:9042"));
        host.set_listen_address("10.0.0.2".into());

        let socket = MockSocket::new(addr("10.0.0.1:9042"));
        socket.respond(
            queries::select_peer_by_listen_address(true, "10.0.0.2"),
            ResultRows::new(vec![peer_row("10.0.0.2", "10.0.0.2", "dc1", "r1", "3.11.0")]),
        );

        refresh_node_info(&socket, &session, host, true, false, true, TIMEOUT)
            .await
            .unwrap();

        assert!(session.calls().contains(&SessionCall::OnAdd(addr("10.0.0.2:9042"))));
    }
}
