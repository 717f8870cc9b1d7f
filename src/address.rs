//! Derives the address used to contact a peer from its `system.peers` row.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::rows::CqlValue;

/// Why a `system.peers` row was not turned into a contact address.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PeerAddressRejection {
    #[error("invalid address format for peer address")]
    InvalidPeer,
    #[error("no rpc_address in peers row")]
    NoRpcAddress,
    #[error("invalid address format for rpc address")]
    InvalidRpc,
    #[error("self-referential peers entry")]
    SelfReferential,
}

/// Resolves the `(peer, rpc_address)` column pair of a peers row into the
/// address used to contact that peer, using the control connection's port.
///
/// Rows that name the connected host itself are rejected (a known server
/// bug), and a wildcard bind-any `rpc_address` falls back to the peer's
/// listen address.
pub fn resolve_peer_address(
    connected: SocketAddr,
    peer: &CqlValue,
    rpc: &CqlValue,
) -> Result<SocketAddr, PeerAddressRejection> {
    let port = connected.port();

    let peer_ip = match peer.as_inet() {
        Some(ip) => ip,
        None => {
            warn!("Invalid address format for peer address");
            return Err(PeerAddressRejection::InvalidPeer);
        }
    };
    let peer_address = SocketAddr::new(peer_ip, port);

    if rpc.is_null() {
        warn!(
            "No rpc_address for host {} in system.peers on {}. Ignoring this entry.",
            peer_address, connected
        );
        return Err(PeerAddressRejection::NoRpcAddress);
    }

    let rpc_ip = match rpc.as_inet() {
        Some(ip) => ip,
        None => {
            warn!("Invalid address format for rpc address");
            return Err(PeerAddressRejection::InvalidRpc);
        }
    };
    let rpc_address = SocketAddr::new(rpc_ip, port);

    if rpc_address == connected || peer_address == connected {
        debug!(
            "system.peers on {} contains a line with rpc_address for itself. \
             This is not normal, but is a known problem for some versions of DSE. \
             Ignoring this entry.",
            connected
        );
        return Err(PeerAddressRejection::SelfReferential);
    }

    if rpc_ip.is_unspecified() {
        warn!(
            "Found host with 'bind any' for rpc_address; using listen_address ({}) to contact \
             instead. If this is incorrect you should configure a specific interface for \
             rpc_address on the server.",
            peer_address
        );
        return Ok(peer_address);
    }

    Ok(rpc_address)
}
