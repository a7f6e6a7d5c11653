//! Constants shared across engines: timeouts, well-known ports, and the
//! static router-candidate list used for blind fan-out.

use std::net::Ipv4Addr;
use std::time::Duration;

/// UDP port NAT-PMP and PCP gateways listen on.
pub const RFC_PORT: u16 = 5351;

/// Per-attempt timeout for a single NAT-PMP request.
pub const NAT_PMP_TIMEOUT: Duration = Duration::from_millis(2000);
/// Per-attempt timeout for a single PCP request.
pub const PCP_TIMEOUT: Duration = Duration::from_millis(2000);

/// SSDP collection window (Phase A).
pub const UPNP_SSDP_TIMEOUT: Duration = Duration::from_secs(3);
/// Per-response timeout for device description fetch + controlURL scrape (Phase B).
pub const UPNP_DESCRIBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for a single SOAP invocation (Phase C).
pub const UPNP_SOAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Probe port used when blind-testing NAT-PMP support.
pub const PROBE_PORT_NAT_PMP: u16 = 55555;
/// Probe port used when blind-testing PCP support.
pub const PROBE_PORT_PCP: u16 = 55556;
/// Probe port used when blind-testing UPnP support.
pub const PROBE_PORT_UPNP: u16 = 55557;

/// Re-invoke a zero-lifetime mapping's refresh once a day.
pub const ZERO_LIFETIME_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// SSDP multicast group address.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// SSDP multicast port.
pub const SSDP_MULTICAST_PORT: u16 = 1900;

/// Popular default gateway addresses, used for blind fan-out when neither
/// the router-IP cache nor local-subnet filtering yields a candidate.
pub fn default_router_candidates() -> Vec<Ipv4Addr> {
    const OCTETS: &[[u8; 4]] = &[
        [192, 168, 0, 1],
        [192, 168, 1, 1],
        [192, 168, 1, 254],
        [192, 168, 2, 1],
        [192, 168, 10, 1],
        [192, 168, 100, 1],
        [192, 168, 0, 254],
        [192, 168, 29, 1],
        [192, 168, 8, 1],
        [192, 168, 11, 1],
        [10, 0, 0, 1],
        [10, 0, 0, 138],
        [10, 0, 1, 1],
        [10, 1, 1, 1],
        [172, 16, 0, 1],
        [172, 16, 1, 1],
        [192, 168, 3, 1],
        [192, 168, 4, 1],
        [192, 168, 5, 1],
        [192, 168, 123, 254],
    ];
    OCTETS.iter().map(|o| Ipv4Addr::from(*o)).collect()
}
