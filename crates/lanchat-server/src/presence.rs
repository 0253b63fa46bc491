//! Presence tracking.
//!
//! Maintains an in-memory map of live connections to the identity they
//! resolved to. A peer is online while at least one of its connections is
//! registered.

use std::collections::BTreeMap;

use lanchat_shared::protocol::ClientsSnapshot;
use lanchat_shared::types::{PeerIp, RegisteredUser};
use tracing::debug;

/// Transport-assigned id of one live connection. Ids are handed out in
/// increasing order and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks which identities currently have a live connection.
///
/// Several connections may share one address; only single-connection
/// identities are guaranteed correct routing (see [`Self::find_connection_by_ip`]).
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    connections: BTreeMap<ConnectionId, PeerIp>,
}

impl PresenceTracker {
    pub fn register(&mut self, id: ConnectionId, ip: PeerIp) {
        debug!(conn = %id, ip = %ip, "Tracking connection");
        self.connections.insert(id, ip);
    }

    /// Forget a connection, returning the identity it belonged to.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<PeerIp> {
        let ip = self.connections.remove(&id);
        if let Some(ip) = &ip {
            debug!(conn = %id, ip = %ip, "Removed connection from tracker");
        }
        ip
    }

    /// Online identities, de-duplicated, in order of their oldest connection.
    pub fn online_ips(&self) -> Vec<PeerIp> {
        let mut ips: Vec<PeerIp> = Vec::new();
        for ip in self.connections.values() {
            if !ips.contains(ip) {
                ips.push(ip.clone());
            }
        }
        ips
    }

    pub fn is_online(&self, ip: &PeerIp) -> bool {
        self.connections.values().any(|v| v == ip)
    }

    /// Registered users with no live connection.
    pub fn offline_users(&self, registered: &[RegisteredUser]) -> Vec<RegisteredUser> {
        registered
            .iter()
            .filter(|u| !self.is_online(&u.ip))
            .cloned()
            .collect()
    }

    /// The oldest live connection of `ip`. When an identity has several
    /// connections only this one receives direct delivery.
    pub fn find_connection_by_ip(&self, ip: &PeerIp) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, v)| *v == ip)
            .map(|(id, _)| *id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Online/offline split of `registered`. An online identity missing from
    /// the user list is reported under the default name.
    pub fn snapshot(&self, registered: &[RegisteredUser]) -> ClientsSnapshot {
        let online = self
            .online_ips()
            .into_iter()
            .map(|ip| {
                registered
                    .iter()
                    .find(|u| u.ip == ip)
                    .cloned()
                    .unwrap_or_else(|| RegisteredUser::unnamed(ip))
            })
            .collect();

        ClientsSnapshot {
            online,
            offline: self.offline_users(registered),
        }
    }
}
