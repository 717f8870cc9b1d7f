//! Host records shared between the session and the control connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::version::ServerVersion;

/// One cluster node.
///
/// The session owns creation, removal and the up/down flag; the control
/// connection reconciles datacenter, rack, release version, listen address
/// and tokens from the `system.local`/`system.peers` rows. The generation
/// mark is stamped on every host reached during a full scan so that hosts
/// the scan did not observe can be purged afterwards.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    data: RwLock<HostData>,
    up: AtomicBool,
    just_added: AtomicBool,
    mark: AtomicU64,
}

#[derive(Debug, Default)]
struct HostData {
    datacenter: String,
    rack: String,
    server_version: Option<ServerVersion>,
    listen_address: Option<String>,
    tokens: Vec<String>,
}

impl Host {
    pub fn new(address: SocketAddr) -> Self {
        Host {
            address,
            data: RwLock::new(HostData::default()),
            up: AtomicBool::new(true),
            just_added: AtomicBool::new(true),
            mark: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> String {
        self.data.read().unwrap().datacenter.clone()
    }

    pub fn rack(&self) -> String {
        self.data.read().unwrap().rack.clone()
    }

    pub fn set_rack_and_dc(&self, rack: &str, datacenter: &str) {
        let mut data = self.data.write().unwrap();
        data.rack = rack.to_owned();
        data.datacenter = datacenter.to_owned();
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.data.read().unwrap().server_version
    }

    pub fn set_server_version(&self, version: ServerVersion) {
        self.data.write().unwrap().server_version = Some(version);
    }

    /// The address this node advertises for intra-cluster traffic, as a
    /// plain IP string (the `peer` column). Only known for peers.
    pub fn listen_address(&self) -> Option<String> {
        self.data.read().unwrap().listen_address.clone()
    }

    pub fn set_listen_address(&self, listen_address: String) {
        self.data.write().unwrap().listen_address = Some(listen_address);
    }

    pub fn tokens(&self) -> Vec<String> {
        self.data.read().unwrap().tokens.clone()
    }

    pub fn set_tokens(&self, tokens: Vec<String>) {
        self.data.write().unwrap().tokens = tokens;
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    /// True until the session delivers the `on_add` notification for this
    /// host.
    pub fn was_just_added(&self) -> bool {
        self.just_added.load(Ordering::Acquire)
    }

    pub fn set_just_added(&self, just_added: bool) {
        self.just_added.store(just_added, Ordering::Release);
    }

    pub fn mark(&self) -> u64 {
        self.mark.load(Ordering::Acquire)
    }

    pub fn set_mark(&self, generation: u64) {
        self.mark.store(generation, Ordering::Release);
    }
}
