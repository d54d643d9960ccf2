// # UDP-Probe Address Resolver
//
// This crate provides the production AddressResolver for the dnat system.
//
// ## How It Works
//
// Both operations use the same zero-packet trick: `connect()` on a UDP
// socket performs no handshake and sends nothing, but it does force the
// OS to resolve the name and to pick a route.
//
// - `resolve_domain`: connect toward `(domain, 80)` and read the peer
//   address the OS resolver chose.
// - `local_address`: connect toward a fixed public address and read the
//   local address of the interface the OS would route through.
//
// Binding to `0.0.0.0:0` first pins both probes to IPv4, matching the
// IPv4-only rule text the compiler emits.

use std::net::IpAddr;

use async_trait::async_trait;
use dnat_core::traits::AddressResolver;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Wildcard IPv4 bind, port chosen by the OS
const BIND_ANY_V4: &str = "0.0.0.0:0";

/// Fixed public address used to learn the local outbound interface.
/// Nothing is ever sent to it.
const LOCAL_PROBE_ADDR: &str = "8.8.8.8:80";

/// Port used for domain probes; any port works since no packet leaves
const RESOLVE_PROBE_PORT: u16 = 80;

/// UDP-probe based resolver
pub struct UdpProbeResolver {
    /// When set, returned from `local_address` instead of probing. For
    /// hosts whose outbound interface is not the NAT inside interface.
    local_override: Option<IpAddr>,
}

impl UdpProbeResolver {
    /// Create a resolver that probes for the local address each cycle
    pub fn new() -> Self {
        Self {
            local_override: None,
        }
    }

    /// Create a resolver with a fixed local address
    pub fn with_local_override(local: IpAddr) -> Self {
        Self {
            local_override: Some(local),
        }
    }

    async fn probe(&self, target: &str, port: u16) -> Option<IpAddr> {
        let socket = match UdpSocket::bind(BIND_ANY_V4).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("cannot bind probe socket: {err}");
                return None;
            }
        };

        if let Err(err) = socket.connect((target, port)).await {
            debug!("probe toward {target}:{port} failed: {err}");
            return None;
        }

        match socket.peer_addr() {
            Ok(addr) => Some(addr.ip()),
            Err(err) => {
                debug!("no peer address for {target}:{port}: {err}");
                None
            }
        }
    }
}

impl Default for UdpProbeResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressResolver for UdpProbeResolver {
    async fn resolve_domain(&self, domain: &str) -> Option<IpAddr> {
        self.probe(domain, RESOLVE_PROBE_PORT).await
    }

    async fn local_address(&self) -> Option<IpAddr> {
        if let Some(local) = self.local_override {
            return Some(local);
        }

        let socket = match UdpSocket::bind(BIND_ANY_V4).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("cannot bind local probe socket: {err}");
                return None;
            }
        };

        if let Err(err) = socket.connect(LOCAL_PROBE_ADDR).await {
            warn!("local outbound probe failed: {err}");
            return None;
        }

        match socket.local_addr() {
            Ok(addr) => Some(addr.ip()),
            Err(err) => {
                warn!("no local address on probe socket: {err}");
                None
            }
        }
    }
}
