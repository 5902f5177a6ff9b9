//! Host names, ports and resolved peer addresses.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Maps a host name to the IP addresses it currently resolves to.
pub trait Resolver {
    /// Resolve `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or yields no addresses.
    fn resolve(&self, host: &str) -> Result<BTreeSet<IpAddr>, ResolveError>;
}

/// Resolver backed by the operating system's lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<BTreeSet<IpAddr>, ResolveError> {
        let ips: BTreeSet<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                message: e.to_string(),
            })?
            .map(|addr| addr.ip())
            .collect();
        if ips.is_empty() {
            return Err(ResolveError::NoAddresses(host.to_string()));
        }
        tracing::trace!(host, count = ips.len(), "resolved host");
        Ok(ips)
    }
}

/// A host name (or literal address) and a port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Every socket address `host` resolves to, paired with `port`.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error.
    pub fn resolve(&self, resolver: &dyn Resolver) -> Result<BTreeSet<SocketAddr>, ResolveError> {
        Ok(resolver
            .resolve(&self.host)?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, self.port))
            .collect())
    }
}

impl std::fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The address of a peer: the hosts it was configured with and everything
/// they resolved to when the address was built.
///
/// Two peer addresses are equal when their host sets are equal. Resolved
/// addresses are not compared, since they depend on when resolution ran.
#[derive(Debug, Clone, Default)]
pub struct PeerAddress {
    hosts: BTreeSet<HostAndPort>,
    ips: BTreeSet<SocketAddr>,
}

impl PeerAddress {
    /// Resolve every host in `hosts`.
    ///
    /// # Errors
    ///
    /// Returns the first resolution failure.
    pub fn new(
        hosts: BTreeSet<HostAndPort>,
        resolver: &dyn Resolver,
    ) -> Result<Self, ResolveError> {
        let mut ips = BTreeSet::new();
        for host in &hosts {
            ips.extend(host.resolve(resolver)?);
        }
        Ok(Self { hosts, ips })
    }

    #[must_use]
    pub const fn hosts(&self) -> &BTreeSet<HostAndPort> {
        &self.hosts
    }

    #[must_use]
    pub const fn ips(&self) -> &BTreeSet<SocketAddr> {
        &self.ips
    }

    /// The smallest host, or `None` for an address with no hosts.
    #[must_use]
    pub fn primary_host(&self) -> Option<&HostAndPort> {
        self.hosts.first()
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.hosts == other.hosts
    }
}

impl Eq for PeerAddress {}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{host}")?;
        }
        write!(f, "]")
    }
}

/// Whether `addr` passes the whitelist `filter`. Loopback addresses always
/// pass.
#[must_use]
pub fn check_address_filter(addr: &IpAddr, filter: &BTreeSet<IpAddr>) -> bool {
    addr.is_loopback() || filter.contains(addr)
}

/// The subset of `candidates` that passes `filter`, or all of them when
/// `get_all` is set.
#[must_use]
pub fn filter_local_ips(
    candidates: &BTreeSet<IpAddr>,
    filter: &BTreeSet<IpAddr>,
    get_all: bool,
) -> BTreeSet<IpAddr> {
    candidates
        .iter()
        .filter(|addr| get_all || check_address_filter(addr, filter))
        .copied()
        .collect()
}

/// Errors that can occur while resolving a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The lookup itself failed.
    Lookup { host: String, message: String },
    /// The lookup succeeded but returned nothing.
    NoAddresses(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lookup { host, message } => write!(f, "failed to resolve {host}: {message}"),
            Self::NoAddresses(host) => write!(f, "{host} resolved to no addresses"),
        }
    }
}

impl std::error::Error for ResolveError {}
