//! Network addressing for peers that serve trees.
//!
//! Only the address model lives here: hosts with ports, resolution to socket
//! addresses through a pluggable [`Resolver`], and the whitelist filter used
//! when choosing which local addresses to advertise.

pub mod address;

pub use address::{
    HostAndPort, PeerAddress, ResolveError, Resolver, SystemResolver, check_address_filter,
    filter_local_ips,
};
