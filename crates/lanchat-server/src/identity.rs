//! Identity Resolver: derives a peer's identity from connection metadata.
//!
//! There is no login. Whoever connects from an address *is* that identity
//! (trust on connect). The [`IdentityResolver`] trait is the seam where an
//! authenticating resolver could replace address-based identity without
//! touching the relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use lanchat_shared::types::PeerIp;
use tracing::{debug, info, warn};

/// Transport-level facts about an incoming connection or request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    /// Raw `X-Forwarded-For` header, possibly a comma-separated list.
    pub forwarded_for: Option<String>,
    /// Remote socket address as seen by the listener.
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectionMeta {
    /// Collect metadata from an axum request. `ConnectInfo` is only present
    /// when the server runs with `into_make_service_with_connect_info`.
    pub fn from_request(headers: &HeaderMap, extensions: &Extensions) -> Self {
        Self {
            forwarded_for: headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            peer_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }
}

pub trait IdentityResolver: Send + Sync {
    /// Canonical identity for the connection, or `None` if no usable address
    /// could be derived.
    fn resolve(&self, meta: &ConnectionMeta) -> Option<PeerIp>;
}

/// Address-based resolver that maps loopback clients to the host's LAN
/// address, so a browser on the server machine and the same machine seen
/// over the LAN are one peer.
#[derive(Debug, Clone)]
pub struct LoopbackAwareResolver {
    host_ip: PeerIp,
}

impl LoopbackAwareResolver {
    pub fn new(host_ip: PeerIp) -> Self {
        Self { host_ip }
    }

    pub fn host_ip(&self) -> &PeerIp {
        &self.host_ip
    }

    fn resolve_raw(&self, raw: &str) -> Option<PeerIp> {
        let entries: Vec<&str> = raw.split(',').map(str::trim).collect();

        if entries
            .iter()
            .filter_map(|e| parse_canonical(e))
            .any(|ip| ip.is_loopback())
        {
            return Some(self.host_ip.clone());
        }

        let candidate = if entries.len() > 1 {
            // Proxied: the first IPv4-formatted hop is the client.
            entries.iter().find(|e| !e.contains(':')).copied()?
        } else {
            entries.first().copied()?
        };

        parse_canonical(candidate).map(PeerIp::from)
    }
}

impl IdentityResolver for LoopbackAwareResolver {
    fn resolve(&self, meta: &ConnectionMeta) -> Option<PeerIp> {
        let from_header = meta
            .forwarded_for
            .as_deref()
            .and_then(|raw| self.resolve_raw(raw));

        let resolved = from_header.or_else(|| {
            meta.peer_addr
                .and_then(|addr| self.resolve_raw(&addr.ip().to_string()))
        });

        debug!(
            forwarded = ?meta.forwarded_for,
            peer = ?meta.peer_addr,
            resolved = ?resolved,
            "Resolved identity"
        );
        resolved
    }
}

/// Parse an address, unwrapping IPv4-mapped IPv6 (`::ffff:a.b.c.d`) that
/// dual-stack listeners report for IPv4 clients.
fn parse_canonical(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// The host's LAN IPv4 address.
///
/// Takes the first non-loopback IPv4 found on the network interfaces. When
/// several qualify, the one the OS would route outbound traffic from wins.
/// Falls back to `127.0.0.1` when the host has no usable IPv4 interface,
/// which limits the server to same-machine clients.
pub fn detect_host_ipv4() -> PeerIp {
    let interfaces: Vec<(String, IpAddr)> = match if_addrs::get_if_addrs() {
        Ok(list) => list.into_iter().map(|i| (i.name.clone(), i.ip())).collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        }
    };

    match select_host_ipv4(&interfaces, routed_ipv4()) {
        Some(ip) => {
            info!(ip = %ip, "Detected host address");
            PeerIp::from(IpAddr::V4(ip))
        }
        None => {
            warn!("No non-loopback IPv4 address found, falling back to 127.0.0.1");
            PeerIp::from(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }
}

fn select_host_ipv4(
    interfaces: &[(String, IpAddr)],
    routed: Option<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let candidates: Vec<Ipv4Addr> = interfaces
        .iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => {
                debug!(interface = %name, ip = %v4, "Host address candidate");
                Some(*v4)
            }
            _ => None,
        })
        .collect();

    routed
        .filter(|r| candidates.contains(r))
        .or_else(|| candidates.first().copied())
}

/// Local address of the default route, if the host has one. A connected
/// UDP socket sends nothing.
fn routed_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}
