//! Enumeration of the local machine's IPv4 addresses.
//!
//! Candidate client addresses come from the host's own network interfaces
//! rather than OS routing-table inspection or ICE candidate harvesting:
//! plain interface enumeration covers what the mapping engines need
//! (a set of non-loopback IPv4 addresses to race against candidate
//! gateways) without pulling in netlink/getifaddrs plumbing or a WebRTC
//! stack for a detail neither protocol actually requires.

use std::fmt;
use std::net::Ipv4Addr;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};

/// Supplies the set of local IPv4 addresses a port mapping attempt should
/// consider as candidate client addresses.
///
/// Implementations should return addresses ordered by preference; callers
/// performing a longest-prefix match break ties by earliest index.
pub trait LocalAddressProvider: fmt::Debug + Send + Sync {
    /// Returns every non-loopback, non-link-local IPv4 address currently
    /// assigned to a local interface.
    fn local_ipv4s(&self) -> Vec<Ipv4Addr>;
}

/// A [`LocalAddressProvider`] backed by the operating system's interface
/// list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddressProvider;

impl LocalAddressProvider for SystemAddressProvider {
    fn local_ipv4s(&self) -> Vec<Ipv4Addr> {
        let interfaces = match NetworkInterface::show() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::debug!("failed to list network interfaces: {e}");
                return Vec::new();
            }
        };

        let mut addrs = Vec::new();
        for iface in interfaces {
            for addr in iface.addr {
                if let std::net::IpAddr::V4(ip) = addr.ip() {
                    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
                        continue;
                    }
                    if !addrs.contains(&ip) {
                        addrs.push(ip);
                    }
                }
            }
        }
        addrs
    }
}

/// A fixed set of addresses, for use in tests.
#[derive(Debug, Clone)]
pub struct FixedAddressProvider(pub Vec<Ipv4Addr>);

impl LocalAddressProvider for FixedAddressProvider {
    fn local_ipv4s(&self) -> Vec<Ipv4Addr> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_provider_does_not_panic() {
        // We can't assert much about the host running the tests, only that
        // enumeration completes and never returns loopback/link-local addrs.
        let addrs = SystemAddressProvider.local_ipv4s();
        for addr in addrs {
            assert!(!addr.is_loopback());
            assert!(!addr.is_link_local());
        }
    }

    #[test]
    fn fixed_provider_returns_configured_addrs() {
        let provider = FixedAddressProvider(vec![Ipv4Addr::new(192, 168, 1, 50)]);
        assert_eq!(provider.local_ipv4s(), vec![Ipv4Addr::new(192, 168, 1, 50)]);
    }
}
