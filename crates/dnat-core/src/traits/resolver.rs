// # Address Resolver Trait
//
// Defines the interface for resolving the two kinds of addresses a cycle
// needs: the current address of each tracked domain, and the local
// outbound address used as the NAT inside address.
//
// ## Implementations
//
// - UDP-probe based: `dnat-resolver` crate
// - Scripted maps for tests: `tests/common`
//
// ## Usage
//
// ```rust,ignore
// use dnat_core::AddressResolver;
//
// #[tokio::main]
// async fn main() {
//     let resolver = /* AddressResolver implementation */;
//
//     if let Some(ip) = resolver.resolve_domain("example.com").await {
//         println!("example.com is currently {ip}");
//     }
// }
// ```

use async_trait::async_trait;
use std::net::IpAddr;

/// Trait for address resolver implementations
///
/// Both operations return `Option` rather than a `Result`: resolution
/// failure is an expected, recoverable condition (a dynamic-DNS host may
/// simply not exist right now), never a reason to abort a cycle on its
/// own. How each failure is handled is the engine's decision, not the
/// resolver's.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve a domain to the address the OS would route to.
    ///
    /// Implementations should lean on the OS resolver (no separate
    /// timeout is layered on top of its own) and prefer IPv4, since the
    /// rendered rule text is IPv4-only.
    ///
    /// # Parameters
    ///
    /// - `domain`: the dynamic-DNS host to look up
    ///
    /// # Returns
    ///
    /// - `Some(IpAddr)`: the domain's current address
    /// - `None`: any resolution failure (e.g. NXDOMAIN)
    async fn resolve_domain(&self, domain: &str) -> Option<IpAddr>;

    /// Determine the local outbound address.
    ///
    /// This is the address rewritten onto the return path of forwarded
    /// traffic. It is probed once per cycle and shared across all
    /// declarations of that cycle.
    ///
    /// # Returns
    ///
    /// - `Some(IpAddr)`: the interface address used to reach the internet
    /// - `None`: the probe failed (no route, no interface)
    async fn local_address(&self) -> Option<IpAddr>;
}
