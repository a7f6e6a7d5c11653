//! Shared mutable state owned exclusively by the [`crate::Service`] task:
//! the active-mapping table, the router-IP cache, and the protocol-support
//! cache.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio_util::task::AbortOnDropHandle;

use crate::mapping::Mapping;

/// One entry in [`ActiveMappings`]: the mapping itself plus its scheduled
/// refresh/expiry task, if any. Dropping the handle cancels the task.
pub struct ActiveEntry {
    pub mapping: Mapping,
    pub refresh_task: Option<AbortOnDropHandle<()>>,
}

/// `external_port → Mapping`, unique by external port.
pub type ActiveMappings = HashMap<u16, ActiveEntry>;

/// Ordered, deduplicated list of router IPs known to have answered a
/// previous request; insertion preserves first-success ordering.
pub type RouterIpCache = Vec<Ipv4Addr>;

/// Cached outcome of the last [`crate::Client::probe_protocol_support`]
/// call. All fields are `None` before the first probe.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProtocolSupportCache {
    pub nat_pmp: Option<bool>,
    pub pcp: Option<bool>,
    pub upnp: Option<bool>,
    pub upnp_control_url: Option<String>,
}

impl ProtocolSupportCache {
    /// True once every protocol has been probed at least once.
    pub fn is_fully_probed(&self) -> bool {
        self.nat_pmp.is_some() && self.pcp.is_some() && self.upnp.is_some()
    }
}
