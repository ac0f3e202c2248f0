//! Host networking: guest address lookup and per-instance tap devices.

mod leases;
mod tap;

use std::net::Ipv4Addr;

use vmlite_shared::errors::VmliteResult;

pub use leases::DnsmasqLeases;
pub use tap::{IpLinkNetwork, TapDevice};

/// Maps a guest MAC address to its current IPv4 address.
pub trait AddressResolver: Send + Sync {
    /// Single non-blocking lookup. `None` when no lease is known yet.
    fn lookup(&self, mac_addr: &str) -> Option<Ipv4Addr>;
}

/// Creates and removes host network devices.
pub trait HostNetwork: Send + Sync {
    fn create_tap(&self, name: &str) -> VmliteResult<()>;

    /// Remove a tap device. Missing devices are not an error.
    fn remove_tap(&self, name: &str);
}
