//! The `Mapping` record and the protocol tag it carries.

use std::net::Ipv4Addr;

/// Which wire protocol negotiated a [`Mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    NatPmp,
    Pcp,
    Upnp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::NatPmp => "nat-pmp",
            Protocol::Pcp => "pcp",
            Protocol::Upnp => "upnp",
        };
        f.write_str(s)
    }
}

/// A port mapping, either active or a failure record.
///
/// `external_port = None` signals failure, mirroring the sentinel the
/// external JSON API still exposes as `-1`; everywhere else in this crate
/// the tagged `Option` is the source of truth.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Mapping {
    pub internal_ip: Option<Ipv4Addr>,
    pub internal_port: u16,
    pub external_ip: Option<Ipv4Addr>,
    pub external_port: Option<u16>,
    pub requested_lifetime: u32,
    pub actual_lifetime: u32,
    pub protocol: Protocol,
    /// Present iff `protocol == Protocol::Pcp`.
    pub nonce: Option<[u32; 3]>,
    /// UPnP-only: the control endpoint used to create this mapping, kept so
    /// deletion can reuse it without re-running SSDP discovery.
    pub control_url: Option<String>,
    pub err_info: Option<String>,
}

impl Mapping {
    /// Builds a failure record for `protocol`, carrying `err_info` as the
    /// human-readable reason.
    pub fn failure(protocol: Protocol, internal_port: u16, err_info: impl Into<String>) -> Self {
        Mapping {
            internal_ip: None,
            internal_port,
            external_ip: None,
            external_port: None,
            requested_lifetime: 0,
            actual_lifetime: 0,
            protocol,
            nonce: None,
            control_url: None,
            err_info: Some(err_info.into()),
        }
    }

    /// Whether this record represents a successfully established mapping.
    pub fn is_success(&self) -> bool {
        self.external_port.is_some()
    }

    /// The external-port sentinel used at the JSON API boundary: the real
    /// port, or `-1` on failure.
    pub fn external_port_sentinel(&self) -> i32 {
        self.external_port.map(i32::from).unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_mapping_has_sentinel_port() {
        let m = Mapping::failure(Protocol::NatPmp, 4242, "no reply");
        assert!(!m.is_success());
        assert_eq!(m.external_port_sentinel(), -1);
        assert_eq!(m.err_info.as_deref(), Some("no reply"));
    }

    #[test]
    fn nonce_only_set_for_pcp() {
        let m = Mapping {
            internal_ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
            internal_port: 4242,
            external_ip: Some(Ipv4Addr::new(203, 0, 113, 7)),
            external_port: Some(50000),
            requested_lifetime: 7200,
            actual_lifetime: 3600,
            protocol: Protocol::Pcp,
            nonce: Some([0xA, 0xB, 0xC]),
            control_url: None,
            err_info: None,
        };
        assert!(m.is_success());
        assert_eq!(m.protocol, Protocol::Pcp);
        assert!(m.nonce.is_some());
    }
}
