use iroh_metrics::{Counter, MetricsGroup};
use serde::{Deserialize, Serialize};

/// Metrics for the mapping controller and its three protocol engines.
#[derive(Debug, Default, MetricsGroup, Serialize, Deserialize)]
#[metrics(name = "portmap")]
pub struct Metrics {
    /*
     * Controller-wide
     */
    /// Number of `add_mapping` calls started.
    pub mapping_attempts: Counter,
    /// Number of `add_mapping` calls that ended in a failure Mapping.
    pub mapping_failures: Counter,
    /// Number of `delete_mapping` calls that removed an active entry.
    pub mapping_deletions: Counter,
    /// Number of scheduled refresh timers that fired.
    pub refreshes_fired: Counter,
    /// Number of `probe_protocol_support` calls started.
    pub probes_started: Counter,

    /*
     * NAT-PMP
     */
    /// Number of NAT-PMP add attempts.
    pub nat_pmp_attempts: Counter,
    /// Number of NAT-PMP add attempts that succeeded.
    pub nat_pmp_successes: Counter,

    /*
     * PCP
     */
    /// Number of PCP add attempts.
    pub pcp_attempts: Counter,
    /// Number of PCP add attempts that succeeded.
    pub pcp_successes: Counter,

    /*
     * UPnP
     */
    /// Number of UPnP SSDP discovery rounds started.
    pub upnp_discoveries: Counter,
    /// Number of UPnP SOAP AddPortMapping attempts.
    pub upnp_attempts: Counter,
    /// Number of UPnP SOAP AddPortMapping attempts that succeeded.
    pub upnp_successes: Counter,
    /// Number of UPnP probes that found the service available (including
    /// via a `ConflictInMappingEntry` response).
    pub upnp_available: Counter,
}
