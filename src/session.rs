//! The contract between the control connection and the session.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::errors::ControlConnectionError;
use crate::host::Host;
use crate::metadata::MetadataStore;
use crate::rows::ResultRows;
use crate::version::ServerVersion;

/// Everything the control connection needs from the session: the host
/// registry, lifecycle notifications, the load-balancing hook, the token
/// map and the schema metadata store.
///
/// All methods are called from the control connection's worker task; the
/// session guarantees they are safe to call from there.
pub trait ControlSession: Send + Sync {
    /// Snapshot of the currently known hosts, used to build the startup
    /// query plan.
    fn hosts_snapshot(&self) -> Vec<Arc<Host>>;

    fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>>;

    /// Creates and registers a new host record. The host stays "just added"
    /// until `on_add` is delivered for it.
    fn add_host(&self, address: SocketAddr) -> Arc<Host>;

    fn on_add(&self, host: &Arc<Host>);

    fn on_remove(&self, host: &Arc<Host>);

    fn on_up(&self, host: &Arc<Host>);

    fn on_down(&self, host: &Arc<Host>);

    /// Drops every host whose generation mark does not match `generation`,
    /// i.e. hosts the scan that just completed did not observe.
    fn purge_hosts(&self, generation: u64, is_initial_connection: bool);

    /// An ordered host plan from the load-balancing policy, used for
    /// reconnects once the cluster has been discovered.
    fn new_query_plan(&self) -> Vec<Arc<Host>>;

    /// Tells the load-balancing policy that a host left (`added == false`)
    /// or joined (`added == true`) its distance calculation, e.g. when its
    /// datacenter or rack changed.
    fn load_balancing_host_add_remove(&self, host: &Arc<Host>, added: bool);

    fn on_control_connection_ready(&self);

    fn on_control_connection_error(&self, error: ControlConnectionError);

    /// Initializes the token map with the cluster partitioner. Returns
    /// false when the map was already initialized.
    fn token_map_init(&self, partitioner: &str) -> bool;

    fn token_map_hosts_cleared(&self);

    fn token_map_host_add(&self, host: &Arc<Host>);

    fn token_map_host_update(&self, host: &Arc<Host>);

    fn token_map_host_remove(&self, host: &Arc<Host>);

    fn token_map_keyspaces_add(&self, version: ServerVersion, keyspaces: &ResultRows);

    fn token_map_keyspaces_update(&self, version: ServerVersion, keyspaces: &ResultRows);

    /// The schema metadata store updated by bulk and targeted refreshes.
    fn metadata(&self) -> &dyn MetadataStore;
}
