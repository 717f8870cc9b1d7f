//! The control-connection worker: executes the state machine's commands on
//! a single task pinned to the session's runtime.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ControlConnectionConfig;
use crate::errors::ConnectError;
use crate::events::{EventTypes, ServerEvent};
use crate::host::Host;
use crate::machine::{Command, ControlMachine, ControlState};
use crate::metadata::full_function_name;
use crate::plan::StartupQueryPlan;
use crate::refresh::{self, ScanError};
use crate::schema;
use crate::session::ControlSession;
use crate::transport::{ControlSocket, ControlTransport, EstablishedConnection, SocketClosed};
use crate::version::{ProtocolVersion, ServerVersion};

/// Handle for stopping the control connection from outside its task.
#[derive(Clone)]
pub struct ControlConnectionHandle {
    shutdown: mpsc::Sender<()>,
}

impl ControlConnectionHandle {
    /// Requests shutdown: the socket is closed, the reconnect timer
    /// cancelled and the worker task ends. Terminal.
    ///
    /// Dropping the last handle has the same effect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
    }
}

/// The control connection: one long-lived connection to one node of the
/// cluster, maintaining the session's view of topology and schema and
/// reacting to server-pushed events. Owns at most one socket at a time.
pub struct ControlConnection<S: ControlSession, T: ControlTransport> {
    session: Arc<S>,
    transport: Arc<T>,
    config: ControlConnectionConfig,
    machine: ControlMachine,
    rng: StdRng,

    socket: Option<Arc<dyn ControlSocket>>,
    events_rx: Option<mpsc::Receiver<ServerEvent>>,
    closed_rx: Option<oneshot::Receiver<SocketClosed>>,
    reconnect_at: Option<Instant>,
    shutdown_rx: mpsc::Receiver<()>,

    /// Incremented per full scan; hosts not stamped with the current value
    /// are purged after the scan.
    generation: u64,
    server_version: ServerVersion,
}

enum Wakeup {
    Timer,
    SocketClosed(Option<SocketClosed>),
    Event(Option<ServerEvent>),
    Shutdown,
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn socket_closed(rx: &mut Option<oneshot::Receiver<SocketClosed>>) -> Option<SocketClosed> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn server_event(rx: &mut Option<mpsc::Receiver<ServerEvent>>) -> Option<ServerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<S: ControlSession, T: ControlTransport> ControlConnection<S, T> {
    pub fn new(
        session: Arc<S>,
        transport: Arc<T>,
        config: ControlConnectionConfig,
    ) -> (Self, ControlConnectionHandle) {
        Self::with_rng(session, transport, config, StdRng::from_os_rng())
    }

    /// Like [`ControlConnection::new`], with a caller-supplied PRNG for the
    /// startup plan's starting index.
    pub fn with_rng(
        session: Arc<S>,
        transport: Arc<T>,
        config: ControlConnectionConfig,
        rng: StdRng,
    ) -> (Self, ControlConnectionHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let machine = ControlMachine::new(&config);

        let connection = ControlConnection {
            session,
            transport,
            config,
            machine,
            rng,
            socket: None,
            events_rx: None,
            closed_rx: None,
            reconnect_at: None,
            shutdown_rx,
            generation: 0,
            server_version: ServerVersion::default(),
        };
        let handle = ControlConnectionHandle {
            shutdown: shutdown_tx,
        };
        (connection, handle)
    }

    /// Runs the control connection until shutdown or a terminal error.
    /// Spawn this on the session's runtime.
    pub async fn run(mut self) {
        let hosts = self.session.hosts_snapshot();
        let startup_plan: Vec<Arc<Host>> =
            StartupQueryPlan::new(hosts, &mut self.rng).collect();
        let commands = self.machine.start(startup_plan);
        self.execute(commands).await;

        while self.machine.state() != ControlState::Closed {
            let wakeup = {
                let reconnect_at = self.reconnect_at;
                let closed_rx = &mut self.closed_rx;
                let events_rx = &mut self.events_rx;
                let shutdown_rx = &mut self.shutdown_rx;
                tokio::select! {
                    _ = reconnect_timer(reconnect_at) => Wakeup::Timer,
                    closed = socket_closed(closed_rx) => Wakeup::SocketClosed(closed),
                    event = server_event(events_rx) => Wakeup::Event(event),
                    _ = shutdown_rx.recv() => Wakeup::Shutdown,
                }
            };

            match wakeup {
                Wakeup::Timer => {
                    self.reconnect_at = None;
                    let plan = self.session.new_query_plan();
                    let commands = self.machine.reconnect_timer_fired(plan);
                    self.execute(commands).await;
                }
                Wakeup::SocketClosed(closed) => {
                    if let Some(closed) = closed {
                        debug!("{}", closed);
                    }
                    self.drop_socket();
                    let commands = self.machine.socket_closed();
                    self.execute(commands).await;
                }
                Wakeup::Event(Some(event)) => {
                    let commands = self.machine.event(&event);
                    self.execute(commands).await;
                }
                Wakeup::Event(None) => {
                    // Event sender gone; the close notification follows.
                    self.events_rx = None;
                }
                Wakeup::Shutdown => {
                    let commands = self.machine.shutdown();
                    self.execute(commands).await;
                }
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            let follow_up = match command {
                Command::Connect {
                    host,
                    protocol,
                    events,
                } => self.connect(host, protocol, events).await,
                Command::CloseSocket => {
                    self.drop_socket();
                    Vec::new()
                }
                Command::RunFullScan => self.full_scan().await,
                Command::NotifyReady => {
                    self.discard_pending_events();
                    self.session.on_control_connection_ready();
                    Vec::new()
                }
                Command::RebuildQueryPlan => {
                    let plan = self.session.new_query_plan();
                    self.machine.install_plan(plan);
                    Vec::new()
                }
                Command::ScheduleReconnect(interval) => {
                    self.reconnect_at = Some(Instant::now() + interval);
                    Vec::new()
                }
                Command::StopReconnectTimer => {
                    self.reconnect_at = None;
                    Vec::new()
                }
                Command::SurfaceError(error) => {
                    self.session.on_control_connection_error(error);
                    Vec::new()
                }
                Command::AddNode { address } => {
                    self.add_node(address).await;
                    Vec::new()
                }
                Command::RemoveNode { address } => {
                    self.remove_node(address);
                    Vec::new()
                }
                Command::RefreshMovedNode { address } => {
                    self.refresh_moved_node(address).await;
                    Vec::new()
                }
                Command::MarkHostUp { address } => {
                    self.mark_host_up(address).await;
                    Vec::new()
                }
                Command::MarkHostDown { address } => {
                    self.mark_host_down(address);
                    Vec::new()
                }
                Command::RefreshKeyspace { keyspace } => {
                    if let Some(socket) = self.socket.clone() {
                        let result = schema::refresh_keyspace(
                            socket.as_ref(),
                            self.session.as_ref(),
                            self.server_version,
                            self.config.use_schema,
                            self.config.token_aware_routing,
                            &keyspace,
                            self.config.request_timeout,
                        )
                        .await;
                        if let Err(error) = result {
                            self.abandon_refresh(error, &socket);
                        }
                    }
                    Vec::new()
                }
                Command::RefreshTableOrView { keyspace, name } => {
                    if let Some(socket) = self.socket.clone() {
                        let result = schema::refresh_table_or_view(
                            socket.as_ref(),
                            self.session.as_ref(),
                            self.server_version,
                            &keyspace,
                            &name,
                            self.config.request_timeout,
                        )
                        .await;
                        if let Err(error) = result {
                            self.abandon_refresh(error, &socket);
                        }
                    }
                    Vec::new()
                }
                Command::RefreshType { keyspace, name } => {
                    if let Some(socket) = self.socket.clone() {
                        let result = schema::refresh_type(
                            socket.as_ref(),
                            self.session.as_ref(),
                            self.server_version,
                            &keyspace,
                            &name,
                            self.config.request_timeout,
                        )
                        .await;
                        if let Err(error) = result {
                            self.abandon_refresh(error, &socket);
                        }
                    }
                    Vec::new()
                }
                Command::RefreshFunction {
                    keyspace,
                    name,
                    arg_types,
                    is_aggregate,
                } => {
                    if let Some(socket) = self.socket.clone() {
                        let result = schema::refresh_function(
                            socket.as_ref(),
                            self.session.as_ref(),
                            self.server_version,
                            &keyspace,
                            &name,
                            &arg_types,
                            is_aggregate,
                            self.config.request_timeout,
                        )
                        .await;
                        if let Err(error) = result {
                            self.abandon_refresh(error, &socket);
                        }
                    }
                    Vec::new()
                }
                Command::DropKeyspace { keyspace } => {
                    self.session.metadata().drop_keyspace(&keyspace);
                    Vec::new()
                }
                Command::DropTableOrView { keyspace, name } => {
                    self.session.metadata().drop_table_or_view(&keyspace, &name);
                    Vec::new()
                }
                Command::DropType { keyspace, name } => {
                    self.session.metadata().drop_user_type(&keyspace, &name);
                    Vec::new()
                }
                Command::DropFunction {
                    keyspace,
                    name,
                    arg_types,
                    is_aggregate,
                } => {
                    let full_name = full_function_name(&name, &arg_types);
                    if is_aggregate {
                        self.session.metadata().drop_aggregate(&keyspace, &full_name);
                    } else {
                        self.session.metadata().drop_function(&keyspace, &full_name);
                    }
                    Vec::new()
                }
            };

            for command in follow_up.into_iter().rev() {
                queue.push_front(command);
            }
        }
    }

    async fn connect(
        &mut self,
        host: Arc<Host>,
        protocol: ProtocolVersion,
        event_types: EventTypes,
    ) -> Vec<Command> {
        let connect = self
            .transport
            .connect(host.address(), protocol, event_types);
        let result = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Io("connect timed out".into())),
        };

        match result {
            Ok(EstablishedConnection {
                socket,
                events,
                closed,
            }) => {
                self.socket = Some(socket);
                self.events_rx = Some(events);
                self.closed_rx = Some(closed);
                self.machine.connect_succeeded()
            }
            Err(error) => self.machine.connect_failed(&error),
        }
    }

    async fn full_scan(&mut self) -> Vec<Command> {
        let Some(socket) = self.socket.clone() else {
            return Vec::new();
        };

        self.generation += 1;
        let is_initial_connection = self.machine.state() == ControlState::New;

        let scanned = refresh::run_full_scan(
            socket.as_ref(),
            self.session.as_ref(),
            self.config.token_aware_routing,
            is_initial_connection,
            self.generation,
            self.config.request_timeout,
        )
        .await;

        let version = match scanned {
            Ok(version) => version,
            Err(error) => {
                self.abandon_refresh(error, &socket);
                return Vec::new();
            }
        };
        self.server_version = version;

        let schema_scanned = schema::run_schema_scan(
            socket.as_ref(),
            self.session.as_ref(),
            version,
            self.config.use_schema,
            self.config.token_aware_routing,
            self.config.request_timeout,
        )
        .await;

        match schema_scanned {
            Ok(()) => self.machine.scan_completed(),
            Err(error) => {
                self.abandon_refresh(error, &socket);
                Vec::new()
            }
        }
    }

    /// Disposition for failed scans and refreshes: defunct the socket and
    /// let the close notification drive the reconnect.
    fn abandon_refresh(&self, error: ScanError, socket: &Arc<dyn ControlSocket>) {
        if error.defuncts() {
            debug!("Control connection query failed: {:?}", error);
            socket.defunct();
        }
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.events_rx = None;
        self.closed_rx = None;
    }

    fn discard_pending_events(&mut self) {
        if let Some(events) = &mut self.events_rx {
            while let Ok(event) = events.try_recv() {
                debug!("Discarding server event received before ready: {:?}", event);
            }
        }
    }

    async fn add_node(&mut self, address: SocketAddr) {
        if self.session.get_host(address).is_none() {
            let host = self.session.add_host(address);
            self.refresh_node(host, true, true).await;
        }
    }

    fn remove_node(&self, address: SocketAddr) {
        match self.session.get_host(address) {
            Some(host) => {
                self.session.on_remove(&host);
                self.session.token_map_host_remove(&host);
            }
            None => debug!("Tried to remove host {} that doesn't exist", address),
        }
    }

    async fn refresh_moved_node(&mut self, address: SocketAddr) {
        match self.session.get_host(address) {
            Some(host) => self.refresh_node(host, false, true).await,
            // An unknown moved host has nothing to reconcile; the next full
            // scan will discover it.
            None => debug!("Move event for host {} that doesn't exist", address),
        }
    }

    async fn mark_host_up(&mut self, address: SocketAddr) {
        match self.session.get_host(address) {
            Some(host) => {
                if host.is_up() {
                    return;
                }
                // Mark the node up immediately and refresh asynchronously: a
                // data-plane pool may be blocked waiting for exactly this.
                self.session.on_up(&host);
                self.refresh_node(host, false, false).await;
            }
            None => {
                let host = self.session.add_host(address);
                self.refresh_node(host, true, false).await;
            }
        }
    }

    fn mark_host_down(&self, address: SocketAddr) {
        match self.session.get_host(address) {
            Some(host) => {
                if !host.is_up() {
                    return;
                }
                self.session.on_down(&host);
            }
            None => debug!("Tried to down host {} that doesn't exist", address),
        }
    }

    async fn refresh_node(&mut self, host: Arc<Host>, is_new_node: bool, query_tokens: bool) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let result = refresh::refresh_node_info(
            socket.as_ref(),
            self.session.as_ref(),
            host,
            is_new_node,
            query_tokens,
            self.config.token_aware_routing,
            self.config.request_timeout,
        )
        .await;
        if let Err(error) = result {
            self.abandon_refresh(error, &socket);
        }
    }
}
