//! The control-connection lifecycle as a pure state machine.
//!
//! Every input returns the list of [`Command`]s the executor must perform;
//! the machine itself never touches the network or the session, which keeps
//! the whole lifecycle testable with plain function calls.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ControlConnectionConfig;
use crate::errors::{ConnectError, ControlConnectionError};
use crate::events::{
    EventTypes, SchemaChangeEvent, SchemaChangeType, ServerEvent, StatusChangeEvent,
    TopologyChangeEvent,
};
use crate::host::Host;
use crate::version::ProtocolVersion;

/// Control-connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    New,
    Ready,
    Closed,
}

/// An effect requested by the state machine.
#[derive(Debug)]
pub enum Command {
    /// Open a socket to `host`, handshaking at `protocol` and registering
    /// for `events`.
    Connect {
        host: Arc<Host>,
        protocol: ProtocolVersion,
        events: EventTypes,
    },
    /// Drop the current socket.
    CloseSocket,
    /// Run the chained `local` + `peers` scan (and the schema scan when
    /// enabled), then feed `scan_completed` back in.
    RunFullScan,
    /// Tell the session the control connection is ready.
    NotifyReady,
    /// Install a fresh plan from the session's load-balancing policy.
    RebuildQueryPlan,
    /// Arm the reconnect timer.
    ScheduleReconnect(Duration),
    /// Disarm the reconnect timer.
    StopReconnectTimer,
    /// Report a fatal error to the session.
    SurfaceError(ControlConnectionError),

    // Reactions to server events.
    AddNode { address: SocketAddr },
    RemoveNode { address: SocketAddr },
    RefreshMovedNode { address: SocketAddr },
    MarkHostUp { address: SocketAddr },
    MarkHostDown { address: SocketAddr },
    RefreshKeyspace {
        keyspace: String,
    },
    RefreshTableOrView {
        keyspace: String,
        name: String,
    },
    RefreshType {
        keyspace: String,
        name: String,
    },
    RefreshFunction {
        keyspace: String,
        name: String,
        arg_types: Vec<String>,
        is_aggregate: bool,
    },
    DropKeyspace {
        keyspace: String,
    },
    DropTableOrView {
        keyspace: String,
        name: String,
    },
    DropType {
        keyspace: String,
        name: String,
    },
    DropFunction {
        keyspace: String,
        name: String,
        arg_types: Vec<String>,
        is_aggregate: bool,
    },
}

/// The lifecycle state machine.
pub struct ControlMachine {
    state: ControlState,
    protocol: ProtocolVersion,
    event_types: EventTypes,
    use_schema: bool,
    reconnect_interval: Duration,
    plan: VecDeque<Arc<Host>>,
    current_host: Option<Arc<Host>>,
    connected: bool,
}

impl ControlMachine {
    pub fn new(config: &ControlConnectionConfig) -> Self {
        let mut event_types = EventTypes::TOPOLOGY_CHANGE | EventTypes::STATUS_CHANGE;
        if config.use_schema || config.token_aware_routing {
            event_types = event_types | EventTypes::SCHEMA_CHANGE;
        }

        ControlMachine {
            state: ControlState::New,
            protocol: config
                .protocol_version
                .unwrap_or(ProtocolVersion::HIGHEST_SUPPORTED),
            event_types,
            use_schema: config.use_schema,
            reconnect_interval: config.reconnect_interval,
            plan: VecDeque::new(),
            current_host: None,
            connected: false,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn current_host(&self) -> Option<&Arc<Host>> {
        self.current_host.as_ref()
    }

    pub fn event_types(&self) -> EventTypes {
        self.event_types
    }

    /// Kicks off the first connect over the startup plan.
    pub fn start(&mut self, startup_plan: Vec<Arc<Host>>) -> Vec<Command> {
        self.plan = startup_plan.into();
        self.reconnect(false)
    }

    /// Replaces the pending query plan, typically with one built by the
    /// session's load-balancing policy.
    pub fn install_plan(&mut self, plan: Vec<Arc<Host>>) {
        self.plan = plan.into();
    }

    pub fn connect_succeeded(&mut self) -> Vec<Command> {
        if self.state == ControlState::Closed {
            return vec![Command::CloseSocket];
        }
        self.connected = true;
        if let Some(host) = &self.current_host {
            debug!("Connection ready on host {}", host.address());
        }
        // A reconnect must always re-scan: events could have been missed
        // while not connected.
        vec![Command::RunFullScan]
    }

    pub fn connect_failed(&mut self, error: &ConnectError) -> Vec<Command> {
        if self.state == ControlState::Closed {
            return Vec::new();
        }

        let host_address = self.current_host.as_ref().map(|h| h.address());
        let mut retry_current_host = false;

        if self.state == ControlState::New {
            match error {
                ConnectError::InvalidProtocol => match self.protocol.step_down() {
                    Some(next) => {
                        if let Some(address) = host_address {
                            warn!(
                                "Host {} does not support protocol version {}. \
                                 Trying protocol version {}...",
                                address, self.protocol, next
                            );
                        }
                        self.protocol = next;
                        retry_current_host = true;
                    }
                    None => {
                        if let Some(address) = host_address {
                            error!("Host {} does not support any valid protocol version", address);
                        }
                        self.state = ControlState::Closed;
                        return vec![Command::SurfaceError(
                            ControlConnectionError::UnableToDetermineProtocol,
                        )];
                    }
                },
                ConnectError::Auth(message) => {
                    self.state = ControlState::Closed;
                    return vec![Command::SurfaceError(
                        ControlConnectionError::BadCredentials(message.clone()),
                    )];
                }
                ConnectError::Ssl(message) => {
                    self.state = ControlState::Closed;
                    return vec![Command::SurfaceError(
                        ControlConnectionError::UnableToConnect(message.clone()),
                    )];
                }
                ConnectError::Io(_) => {}
            }
        }

        if !retry_current_host {
            if let Some(address) = host_address {
                if self.state == ControlState::New {
                    error!(
                        "Unable to establish a control connection to host {} \
                         because of the following error: {}",
                        address, error
                    );
                } else {
                    warn!(
                        "Unable to reconnect control connection to host {} \
                         because of the following error: {}",
                        address, error
                    );
                }
            }
        }

        self.reconnect(retry_current_host)
    }

    /// The full host scan (and schema scan, when enabled) finished.
    pub fn scan_completed(&mut self) -> Vec<Command> {
        if self.state != ControlState::New {
            return Vec::new();
        }
        self.state = ControlState::Ready;
        // The plan is rebuilt so reconnects consider all the hosts just
        // discovered from the system tables.
        vec![Command::NotifyReady, Command::RebuildQueryPlan]
    }

    /// The socket went away, orderly or not.
    pub fn socket_closed(&mut self) -> Vec<Command> {
        self.connected = false;
        if self.state == ControlState::Closed {
            return Vec::new();
        }
        if let Some(host) = &self.current_host {
            warn!("Lost control connection to host {}", host.address());
        }
        self.reconnect(false)
    }

    /// The post-READY retry timer fired; `plan` is the session's fresh
    /// query plan.
    pub fn reconnect_timer_fired(&mut self, plan: Vec<Arc<Host>>) -> Vec<Command> {
        if self.state == ControlState::Closed {
            return Vec::new();
        }
        self.plan = plan.into();
        self.reconnect(false)
    }

    pub fn shutdown(&mut self) -> Vec<Command> {
        self.state = ControlState::Closed;
        let mut commands = vec![Command::StopReconnectTimer];
        if self.connected {
            self.connected = false;
            commands.push(Command::CloseSocket);
        }
        commands
    }

    fn reconnect(&mut self, retry_current_host: bool) -> Vec<Command> {
        if self.state == ControlState::Closed {
            return Vec::new();
        }

        let mut commands = Vec::new();

        if !retry_current_host {
            match self.plan.pop_front() {
                Some(host) => self.current_host = Some(host),
                None => {
                    self.current_host = None;
                    if self.state == ControlState::Ready {
                        // The driver still has a working session; it just
                        // lacks a control host momentarily.
                        commands.push(Command::ScheduleReconnect(self.reconnect_interval));
                    } else {
                        commands.push(Command::SurfaceError(
                            ControlConnectionError::NoHostsAvailable,
                        ));
                    }
                    return commands;
                }
            }
        }

        if self.connected {
            self.connected = false;
            commands.push(Command::CloseSocket);
        }

        let host = self
            .current_host
            .clone()
            .expect("reconnect requires a current host");
        commands.push(Command::Connect {
            host,
            protocol: self.protocol,
            events: self.event_types,
        });
        commands
    }

    /// Reacts to a server-pushed event. Events are only processed while
    /// READY; earlier ones are redundant with the scan that produces READY.
    pub fn event(&mut self, event: &ServerEvent) -> Vec<Command> {
        if self.state != ControlState::Ready {
            debug!("Ignoring server event received while the control connection is not ready");
            return Vec::new();
        }

        match event {
            ServerEvent::TopologyChange(topology) => match topology {
                TopologyChangeEvent::NewNode(address) => {
                    info!("New node {} added", address);
                    vec![Command::AddNode { address: *address }]
                }
                TopologyChangeEvent::RemovedNode(address) => {
                    info!("Node {} removed", address);
                    vec![Command::RemoveNode { address: *address }]
                }
                TopologyChangeEvent::MovedNode(address) => {
                    info!("Node {} moved", address);
                    vec![Command::RefreshMovedNode { address: *address }]
                }
            },
            ServerEvent::StatusChange(status) => match status {
                StatusChangeEvent::Up(address) => {
                    info!("Node {} is up", address);
                    vec![Command::MarkHostUp { address: *address }]
                }
                StatusChangeEvent::Down(address) => {
                    info!("Node {} is down", address);
                    vec![Command::MarkHostDown { address: *address }]
                }
            },
            ServerEvent::SchemaChange(schema_change) => {
                // With only token-aware routing on, keyspace changes are
                // still needed for replication settings; the rest is noise.
                if !self.use_schema && !schema_change.targets_keyspace() {
                    return Vec::new();
                }
                self.schema_event(schema_change)
            }
        }
    }

    fn schema_event(&self, schema_change: &SchemaChangeEvent) -> Vec<Command> {
        debug!("Schema change: {:?}", schema_change);
        match schema_change {
            SchemaChangeEvent::Keyspace { change, keyspace } => match change {
                SchemaChangeType::Created | SchemaChangeType::Updated => {
                    vec![Command::RefreshKeyspace {
                        keyspace: keyspace.clone(),
                    }]
                }
                SchemaChangeType::Dropped => vec![Command::DropKeyspace {
                    keyspace: keyspace.clone(),
                }],
            },
            SchemaChangeEvent::Table {
                change,
                keyspace,
                name,
            } => match change {
                SchemaChangeType::Created | SchemaChangeType::Updated => {
                    vec![Command::RefreshTableOrView {
                        keyspace: keyspace.clone(),
                        name: name.clone(),
                    }]
                }
                SchemaChangeType::Dropped => vec![Command::DropTableOrView {
                    keyspace: keyspace.clone(),
                    name: name.clone(),
                }],
            },
            SchemaChangeEvent::Type {
                change,
                keyspace,
                name,
            } => match change {
                SchemaChangeType::Created | SchemaChangeType::Updated => {
                    vec![Command::RefreshType {
                        keyspace: keyspace.clone(),
                        name: name.clone(),
                    }]
                }
                SchemaChangeType::Dropped => vec![Command::DropType {
                    keyspace: keyspace.clone(),
                    name: name.clone(),
                }],
            },
            SchemaChangeEvent::Function {
                change,
                keyspace,
                name,
                arg_types,
            } => Self::function_event(change, keyspace, name, arg_types, false),
            SchemaChangeEvent::Aggregate {
                change,
                keyspace,
                name,
                arg_types,
            } => Self::function_event(change, keyspace, name, arg_types, true),
        }
    }

    fn function_event(
        change: &SchemaChangeType,
        keyspace: &str,
        name: &str,
        arg_types: &[String],
        is_aggregate: bool,
    ) -> Vec<Command> {
        match change {
            SchemaChangeType::Created | SchemaChangeType::Updated => {
                vec![Command::RefreshFunction {
                    keyspace: keyspace.to_owned(),
                    name: name.to_owned(),
                    arg_types: arg_types.to_vec(),
                    is_aggregate,
                }]
            }
            SchemaChangeType::Dropped => vec![Command::DropFunction {
                keyspace: keyspace.to_owned(),
                name: name.to_owned(),
                arg_types: arg_types.to_vec(),
                is_aggregate,
            }],
        }
    }
}
