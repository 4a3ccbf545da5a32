//! Bind address resolution.
//!
//! Turns the configured gossip bind address, optionally scoped to a named
//! network interface, into a concrete socket address.

use crate::config::AgentConfig;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

/// Address resolution errors
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Configured address is not `ip:port`
    #[error("Invalid bind address {addr:?}: {reason}")]
    InvalidBindAddr {
        /// Configured value
        addr: String,
        /// Parser message
        reason: String,
    },

    /// Named interface does not exist
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Interface enumeration failed
    #[error("Failed to get interface addresses: {0}")]
    Enumerate(#[from] std::io::Error),

    /// Interface exists but carries no addresses
    #[error("Interface '{0}' has no addresses")]
    NoAddresses(String),

    /// Every address on the interface is link-local
    #[error("Failed to find usable address for interface '{0}'")]
    NoUsableAddress(String),

    /// Configured concrete address is not on the interface
    #[error("Interface '{iface}' has no '{ip}' address")]
    AddressNotOnInterface {
        /// Interface name
        iface: String,
        /// Configured address
        ip: IpAddr,
    },
}

/// Source of network interface addresses
pub trait InterfaceSource: Send + Sync {
    /// Addresses of the named interface, in enumeration order
    ///
    /// # Errors
    ///
    /// Returns `InterfaceNotFound` when no interface has that name
    fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Interfaces of the running host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let all = if_addrs::get_if_addrs()?;
        let mut found = false;
        let mut addrs = Vec::new();
        for candidate in all {
            if candidate.name == iface {
                found = true;
                addrs.push(candidate.ip());
            }
        }
        if !found {
            return Err(ResolveError::InterfaceNotFound(iface.to_string()));
        }
        Ok(addrs)
    }
}

/// Fixed interface table
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticInterfaces {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface with its addresses
    #[must_use]
    pub fn with_interface(mut self, name: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.interfaces.insert(name.into(), addrs);
        self
    }
}

impl InterfaceSource for StaticInterfaces {
    fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.interfaces
            .get(iface)
            .cloned()
            .ok_or_else(|| ResolveError::InterfaceNotFound(iface.to_string()))
    }
}

/// Parse an `ip:port` bind address
///
/// # Errors
///
/// Returns error if the value is not a socket address
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, ResolveError> {
    addr.trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| ResolveError::InvalidBindAddr {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Address to advertise when bound to the wildcard address: the first
/// IPv4 address of the host that is neither loopback nor link-local.
#[must_use]
pub fn default_advertise_ip() -> Option<IpAddr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .map(|iface| iface.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback() && !is_link_local(ip))
}

/// Link-local unicast: 169.254.0.0/16 and fe80::/10
#[must_use]
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Pick the IP to bind on `iface` given the configured IP
///
/// # Errors
///
/// Returns error if the interface has no usable address or lacks the configured one
pub fn select_bind_ip(
    configured: IpAddr,
    iface: &str,
    addrs: &[IpAddr],
) -> Result<IpAddr, ResolveError> {
    if addrs.is_empty() {
        return Err(ResolveError::NoAddresses(iface.to_string()));
    }

    if configured.is_unspecified() {
        return addrs
            .iter()
            .find(|ip| !is_link_local(ip))
            .copied()
            .ok_or_else(|| ResolveError::NoUsableAddress(iface.to_string()));
    }

    if addrs.contains(&configured) {
        Ok(configured)
    } else {
        Err(ResolveError::AddressNotOnInterface {
            iface: iface.to_string(),
            ip: configured,
        })
    }
}

/// Resolve the gossip bind address of `config`.
///
/// When an interface is configured and the bind IP is the wildcard, the chosen
/// interface address is written back into `config.bind_addr`.
///
/// # Errors
///
/// Returns error on unparseable configuration or interface mismatch
pub fn resolve_bind_addr(
    config: &mut AgentConfig,
    source: &dyn InterfaceSource,
) -> Result<SocketAddr, ResolveError> {
    let configured = parse_bind_addr(&config.bind_addr)?;

    let Some(iface) = config.interface.as_deref() else {
        return Ok(configured);
    };

    let addrs = source.addresses(iface)?;
    let ip = select_bind_ip(configured.ip(), iface, &addrs)?;
    let resolved = SocketAddr::new(ip, configured.port());

    if configured.ip().is_unspecified() {
        info!(interface = iface, address = %ip, "Using interface address");
        config.bind_addr = resolved.to_string();
    }

    Ok(resolved)
}
