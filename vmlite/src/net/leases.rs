use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use super::AddressResolver;

/// Resolves guest addresses from a dnsmasq lease file.
///
/// Each line has the form `<expiry> <mac> <ip> <hostname> <client-id>`.
/// MACs compare case-insensitively and the last matching line wins, since
/// dnsmasq appends renewed leases.
#[derive(Debug, Clone)]
pub struct DnsmasqLeases {
    path: PathBuf,
}

impl DnsmasqLeases {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AddressResolver for DnsmasqLeases {
    fn lookup(&self, mac_addr: &str) -> Option<Ipv4Addr> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => find_lease(&contents, mac_addr),
            Err(e) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "Lease file not readable"
                );
                None
            }
        }
    }
}

fn find_lease(contents: &str, mac_addr: &str) -> Option<Ipv4Addr> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _expiry = fields.next()?;
            let mac = fields.next()?;
            let ip = fields.next()?;
            mac.eq_ignore_ascii_case(mac_addr)
                .then(|| ip.parse().ok())
                .flatten()
        })
        .last()
}
