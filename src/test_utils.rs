//! Mock session, transport and socket used by the unit tests, plus canned
//! system-table rows.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{ConnectError, ControlConnectionError, QueryError};
use crate::events::{EventTypes, ServerEvent};
use crate::host::Host;
use crate::metadata::{BufferedSchema, MetadataStore};
use crate::rows::{CqlValue, ResultRows, Row, Statement};
use crate::session::ControlSession;
use crate::transport::{ControlSocket, ControlTransport, EstablishedConnection, SocketClosed};
use crate::version::{ProtocolVersion, ServerVersion};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) fn local_row(datacenter: &str, rack: &str, release_version: &str) -> Row {
    [
        ("data_center", CqlValue::Text(datacenter.into())),
        ("rack", CqlValue::Text(rack.into())),
        ("release_version", CqlValue::Text(release_version.into())),
        (
            "partitioner",
            CqlValue::Text("org.apache.cassandra.dht.Murmur3Partitioner".into()),
        ),
        ("tokens", CqlValue::TextList(vec!["0".into()])),
    ]
    .into_iter()
    .collect()
}

pub(crate) fn peer_row(
    peer: &str,
    rpc_address: &str,
    datacenter: &str,
    rack: &str,
    release_version: &str,
) -> Row {
    [
        ("peer", CqlValue::Inet(peer.parse().unwrap())),
        ("rpc_address", CqlValue::Inet(rpc_address.parse().unwrap())),
        ("data_center", CqlValue::Text(datacenter.into())),
        ("rack", CqlValue::Text(rack.into())),
        ("release_version", CqlValue::Text(release_version.into())),
        ("tokens", CqlValue::TextList(vec!["0".into()])),
    ]
    .into_iter()
    .collect()
}

pub(crate) fn keyspace_row(name: &str) -> Row {
    [("keyspace_name", CqlValue::Text(name.into()))]
        .into_iter()
        .collect()
}

/// Every observable call the control connection makes on the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionCall {
    AddHost(SocketAddr),
    OnAdd(SocketAddr),
    OnRemove(SocketAddr),
    OnUp(SocketAddr),
    OnDown(SocketAddr),
    PurgeHosts { generation: u64, is_initial: bool },
    Ready,
    LoadBalancingAdd(SocketAddr),
    LoadBalancingRemove(SocketAddr),
    TokenMapInit(String),
    TokenMapHostsCleared,
    TokenMapHostAdd(SocketAddr),
    TokenMapHostUpdate(SocketAddr),
    TokenMapHostRemove(SocketAddr),
    TokenMapKeyspacesAdd(usize),
    TokenMapKeyspacesUpdate(usize),
}

pub(crate) struct MockSession {
    hosts: Mutex<BTreeMap<SocketAddr, Arc<Host>>>,
    calls: Mutex<Vec<SessionCall>>,
    pub(crate) schema: BufferedSchema,
    fatal: Mutex<Option<ControlConnectionError>>,
    token_map_initialized: Mutex<bool>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        MockSession {
            hosts: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            schema: BufferedSchema::new(),
            fatal: Mutex::new(None),
            token_map_initialized: Mutex::new(false),
        }
    }

    pub(crate) fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &SessionCall) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| *recorded == call)
            .count()
    }

    pub(crate) fn count_purges(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| matches!(recorded, SessionCall::PurgeHosts { .. }))
            .count()
    }

    pub(crate) fn fatal(&self) -> Option<ControlConnectionError> {
        self.fatal.lock().unwrap().clone()
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ControlSession for MockSession {
    fn hosts_snapshot(&self) -> Vec<Arc<Host>> {
        self.hosts.lock().unwrap().values().cloned().collect()
    }

    fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.lock().unwrap().get(&address).cloned()
    }

    fn add_host(&self, address: SocketAddr) -> Arc<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(existing) = hosts.get(&address) {
            return Arc::clone(existing);
        }
        let host = Arc::new(Host::new(address));
        hosts.insert(address, Arc::clone(&host));
        drop(hosts);
        self.record(SessionCall::AddHost(address));
        host
    }

    fn on_add(&self, host: &Arc<Host>) {
        host.set_just_added(false);
        self.record(SessionCall::OnAdd(host.address()));
    }

    fn on_remove(&self, host: &Arc<Host>) {
        self.hosts.lock().unwrap().remove(&host.address());
        self.record(SessionCall::OnRemove(host.address()));
    }

    fn on_up(&self, host: &Arc<Host>) {
        host.set_up(true);
        self.record(SessionCall::OnUp(host.address()));
    }

    fn on_down(&self, host: &Arc<Host>) {
        host.set_up(false);
        self.record(SessionCall::OnDown(host.address()));
    }

    fn purge_hosts(&self, generation: u64, is_initial_connection: bool) {
        self.hosts
            .lock()
            .unwrap()
            .retain(|_, host| host.mark() == generation);
        self.record(SessionCall::PurgeHosts {
            generation,
            is_initial: is_initial_connection,
        });
    }

    fn new_query_plan(&self) -> Vec<Arc<Host>> {
        self.hosts_snapshot()
    }

    fn load_balancing_host_add_remove(&self, host: &Arc<Host>, added: bool) {
        self.record(if added {
            SessionCall::LoadBalancingAdd(host.address())
        } else {
            SessionCall::LoadBalancingRemove(host.address())
        });
    }

    fn on_control_connection_ready(&self) {
        self.record(SessionCall::Ready);
    }

    fn on_control_connection_error(&self, error: ControlConnectionError) {
        *self.fatal.lock().unwrap() = Some(error);
    }

    fn token_map_init(&self, partitioner: &str) -> bool {
        self.record(SessionCall::TokenMapInit(partitioner.to_owned()));
        let mut initialized = self.token_map_initialized.lock().unwrap();
        let first_time = !*initialized;
        *initialized = true;
        first_time
    }

    fn token_map_hosts_cleared(&self) {
        self.record(SessionCall::TokenMapHostsCleared);
    }

    fn token_map_host_add(&self, host: &Arc<Host>) {
        self.record(SessionCall::TokenMapHostAdd(host.address()));
    }

    fn token_map_host_update(&self, host: &Arc<Host>) {
        self.record(SessionCall::TokenMapHostUpdate(host.address()));
    }

    fn token_map_host_remove(&self, host: &Arc<Host>) {
        self.record(SessionCall::TokenMapHostRemove(host.address()));
    }

    fn token_map_keyspaces_add(&self, _version: ServerVersion, keyspaces: &ResultRows) {
        self.record(SessionCall::TokenMapKeyspacesAdd(keyspaces.len()));
    }

    fn token_map_keyspaces_update(&self, _version: ServerVersion, keyspaces: &ResultRows) {
        self.record(SessionCall::TokenMapKeyspacesUpdate(keyspaces.len()));
    }

    fn metadata(&self) -> &dyn MetadataStore {
        &self.schema
    }
}

type ResponseMap = Arc<Mutex<HashMap<String, Result<ResultRows, QueryError>>>>;

pub(crate) struct MockSocket {
    address: SocketAddr,
    responses: ResponseMap,
    queries: Mutex<Vec<Statement>>,
    closed_tx: Mutex<Option<oneshot::Sender<SocketClosed>>>,
}

impl MockSocket {
    pub(crate) fn new(address: SocketAddr) -> Self {
        Self::with_responses(address, Arc::default())
    }

    fn with_responses(address: SocketAddr, responses: ResponseMap) -> Self {
        MockSocket {
            address,
            responses,
            queries: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(None),
        }
    }

    pub(crate) fn respond(&self, text: impl Into<String>, rows: ResultRows) {
        self.responses
            .lock()
            .unwrap()
            .insert(text.into(), Ok(rows));
    }

    pub(crate) fn fail(&self, text: impl Into<String>, error: QueryError) {
        self.responses
            .lock()
            .unwrap()
            .insert(text.into(), Err(error));
    }

    pub(crate) fn queries(&self) -> Vec<Statement> {
        self.queries.lock().unwrap().clone()
    }

    fn attach_closed(&self, closed_tx: oneshot::Sender<SocketClosed>) {
        *self.closed_tx.lock().unwrap() = Some(closed_tx);
    }
}

#[async_trait]
impl ControlSocket for MockSocket {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn query(&self, statement: Statement) -> Result<ResultRows, QueryError> {
        self.queries.lock().unwrap().push(statement.clone());
        match self.responses.lock().unwrap().get(&statement.text) {
            Some(response) => response.clone(),
            // Unregistered queries read as empty tables.
            None => Ok(ResultRows::default()),
        }
    }

    fn defunct(&self) {
        if let Some(closed_tx) = self.closed_tx.lock().unwrap().take() {
            let _ = closed_tx.send(SocketClosed {
                reason: "defunct".into(),
            });
        }
    }
}

#[derive(Default)]
struct NodeBehavior {
    fail: Option<ConnectError>,
    /// Highest accepted Cassandra protocol version; DSE always rejected.
    max_protocol: Option<u8>,
    responses: ResponseMap,
}

pub(crate) struct MockTransport {
    nodes: Mutex<HashMap<SocketAddr, NodeBehavior>>,
    connect_log: Mutex<Vec<(SocketAddr, ProtocolVersion, EventTypes)>>,
    sockets: Mutex<HashMap<SocketAddr, Arc<MockSocket>>>,
    event_senders: Mutex<HashMap<SocketAddr, mpsc::Sender<ServerEvent>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        MockTransport {
            nodes: Mutex::new(HashMap::new()),
            connect_log: Mutex::new(Vec::new()),
            sockets: Mutex::new(HashMap::new()),
            event_senders: Mutex::new(HashMap::new()),
        }
    }

    fn with_node(&self, address: SocketAddr, configure: impl FnOnce(&mut NodeBehavior)) {
        let mut nodes = self.nodes.lock().unwrap();
        configure(nodes.entry(address).or_default());
    }

    pub(crate) fn accept(&self, address: SocketAddr) {
        self.with_node(address, |node| node.fail = None);
    }

    pub(crate) fn refuse(&self, address: SocketAddr, error: ConnectError) {
        self.with_node(address, |node| node.fail = Some(error));
    }

    pub(crate) fn set_max_protocol(&self, address: SocketAddr, max_protocol: u8) {
        self.with_node(address, |node| node.max_protocol = Some(max_protocol));
    }

    /// Registers (or replaces) a canned response; live sockets to `address`
    /// observe the change immediately.
    pub(crate) fn respond(&self, address: SocketAddr, text: impl Into<String>, rows: ResultRows) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes
            .entry(address)
            .or_default()
            .responses
            .lock()
            .unwrap()
            .insert(text.into(), Ok(rows));
    }

    pub(crate) fn socket(&self, address: SocketAddr) -> Option<Arc<MockSocket>> {
        self.sockets.lock().unwrap().get(&address).cloned()
    }

    pub(crate) fn connect_log(&self) -> Vec<(SocketAddr, ProtocolVersion, EventTypes)> {
        self.connect_log.lock().unwrap().clone()
    }

    pub(crate) async fn push_event(&self, address: SocketAddr, event: ServerEvent) {
        let sender = self
            .event_senders
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .expect("no event channel for address");
        sender.send(event).await.expect("event channel closed");
    }

    /// Severs the live socket to `address`, as an unexpected close would.
    pub(crate) fn close(&self, address: SocketAddr) {
        if let Some(socket) = self.socket(address) {
            socket.defunct();
        }
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    async fn connect(
        &self,
        address: SocketAddr,
        protocol: ProtocolVersion,
        events: EventTypes,
    ) -> Result<EstablishedConnection, ConnectError> {
        self.connect_log
            .lock()
            .unwrap()
            .push((address, protocol, events));

        let (fail, max_protocol, responses) = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.entry(address).or_default();
            (
                node.fail.clone(),
                node.max_protocol,
                Arc::clone(&node.responses),
            )
        };

        if let Some(error) = fail {
            return Err(error);
        }
        if let Some(max_protocol) = max_protocol {
            if protocol.is_dse() || protocol > ProtocolVersion::cassandra(max_protocol) {
                return Err(ConnectError::InvalidProtocol);
            }
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let (closed_tx, closed_rx) = oneshot::channel();
        let socket = Arc::new(MockSocket::with_responses(address, responses));
        socket.attach_closed(closed_tx);
        self.sockets
            .lock()
            .unwrap()
            .insert(address, Arc::clone(&socket));
        self.event_senders.lock().unwrap().insert(address, event_tx);

        Ok(EstablishedConnection {
            socket: socket as Arc<dyn ControlSocket>,
            events: event_rx,
            closed: closed_rx,
        })
    }
}
