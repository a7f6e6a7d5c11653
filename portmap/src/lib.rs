//! `portmap` negotiates inbound port mappings on consumer-grade NATs using
//! NAT-PMP, PCP, and UPnP IGD:WANIPConnection, unified behind a single
//! mapping lifecycle.
//!
//! The crate is split leaf-first: [`codec`] and [`addr`] are pure
//! functions; [`race`] is the generic parallel-dispatch primitive the three
//! protocol engines ([`nat_pmp`], [`pcp`], [`upnp`]) build on; [`Client`]
//! and the private `Service` it drives are the orchestrator that callers
//! actually talk to.
//!
//! Calling [`Client`] methods from multiple tasks is safe: every mutation
//! of the active-mapping table, router-IP cache, and protocol-support cache
//! happens on the single `Service` task, so there is exactly one writer per
//! external port without an explicit lock.

pub mod addr;
pub mod codec;
pub mod defaults;
pub mod mapping;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod nat_pmp;
pub mod pcp;
pub mod race;
pub mod state;
pub mod upnp;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use netif::{LocalAddressProvider, SystemAddressProvider};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, instrument, warn};

pub use mapping::{Mapping, Protocol};
pub use state::ProtocolSupportCache;

use state::{ActiveEntry, ActiveMappings, RouterIpCache};

/// Errors a [`Client`] call can surface.
///
/// Protocol-level failures never reach here: engines never propagate
/// exceptions, so those are folded into a failure [`Mapping`] or a `bool`
/// instead. This enum only covers the client/service channel itself going
/// away.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mapping controller has shut down")]
    ServiceGone,
    #[error("no local IPv4 addresses available")]
    NoLocalAddresses,
}

/// Configuration for a new [`Client`].
#[derive(Debug)]
pub struct Config {
    pub local_addrs: Arc<dyn LocalAddressProvider>,
    #[cfg(feature = "metrics")]
    pub metrics: Arc<metrics::Metrics>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_addrs: Arc::new(SystemAddressProvider),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(metrics::Metrics::default()),
        }
    }
}

enum Message {
    Add {
        protocol: Option<Protocol>,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        respond_to: oneshot::Sender<Mapping>,
    },
    Delete {
        protocol: Option<Protocol>,
        external_port: u16,
        respond_to: oneshot::Sender<bool>,
    },
    ProbeAll {
        respond_to: oneshot::Sender<ProtocolSupportCache>,
    },
    ProbeOne {
        protocol: Protocol,
        respond_to: oneshot::Sender<bool>,
    },
    GetActiveMappings {
        respond_to: oneshot::Sender<HashMap<u16, Mapping>>,
    },
    GetRouterIpCache {
        respond_to: oneshot::Sender<Vec<Ipv4Addr>>,
    },
    GetProtocolSupportCache {
        respond_to: oneshot::Sender<ProtocolSupportCache>,
    },
    GetUpnpControlUrl {
        respond_to: oneshot::Sender<Option<String>>,
    },
    GetPrivateIps {
        respond_to: oneshot::Sender<Vec<Ipv4Addr>>,
    },
    Refresh {
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    },
    ExpireOnly {
        external_port: u16,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable handle to a running mapping controller.
///
/// Cloning a `Client` is cheap (an `mpsc::Sender` clone); every clone talks
/// to the same underlying `Service` task.
#[derive(Clone)]
pub struct Client {
    tx: mpsc::Sender<Message>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Spawns the mapping controller's background task and returns a handle
    /// to it.
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let service = Service::new(config, rx, tx.clone());
        tokio::spawn(service.run());
        Client { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T, Error> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.tx
            .send(make(respond_tx))
            .await
            .map_err(|_| Error::ServiceGone)?;
        respond_rx.await.map_err(|_| Error::ServiceGone)
    }

    /// Establishes a mapping, trying protocols in fallback order (or the
    /// single protocol the support cache indicates) until one succeeds.
    pub async fn add_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Mapping, Error> {
        self.call(|respond_to| Message::Add {
            protocol: None,
            internal_port,
            external_port,
            lifetime,
            respond_to,
        })
        .await
    }

    /// Establishes a mapping via NAT-PMP specifically, bypassing fallback.
    pub async fn add_mapping_pmp(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Mapping, Error> {
        self.add_mapping_via(Protocol::NatPmp, internal_port, external_port, lifetime)
            .await
    }

    /// Establishes a mapping via PCP specifically, bypassing fallback.
    pub async fn add_mapping_pcp(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Mapping, Error> {
        self.add_mapping_via(Protocol::Pcp, internal_port, external_port, lifetime)
            .await
    }

    /// Establishes a mapping via UPnP specifically, bypassing fallback.
    pub async fn add_mapping_upnp(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Mapping, Error> {
        self.add_mapping_via(Protocol::Upnp, internal_port, external_port, lifetime)
            .await
    }

    async fn add_mapping_via(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Mapping, Error> {
        self.call(|respond_to| Message::Add {
            protocol: Some(protocol),
            internal_port,
            external_port,
            lifetime,
            respond_to,
        })
        .await
    }

    /// Deletes the mapping at `external_port`, dispatching on its recorded
    /// protocol. Returns `false` if no such mapping is active.
    pub async fn delete_mapping(&self, external_port: u16) -> Result<bool, Error> {
        self.call(|respond_to| Message::Delete {
            protocol: None,
            external_port,
            respond_to,
        })
        .await
    }

    /// Deletes `external_port` only if it was established via `protocol`.
    pub async fn delete_mapping_pmp(&self, external_port: u16) -> Result<bool, Error> {
        self.delete_mapping_via(Protocol::NatPmp, external_port).await
    }

    pub async fn delete_mapping_pcp(&self, external_port: u16) -> Result<bool, Error> {
        self.delete_mapping_via(Protocol::Pcp, external_port).await
    }

    pub async fn delete_mapping_upnp(&self, external_port: u16) -> Result<bool, Error> {
        self.delete_mapping_via(Protocol::Upnp, external_port).await
    }

    async fn delete_mapping_via(&self, protocol: Protocol, external_port: u16) -> Result<bool, Error> {
        self.call(|respond_to| Message::Delete {
            protocol: Some(protocol),
            external_port,
            respond_to,
        })
        .await
    }

    /// Probes all three protocols with a blind add at the fixed probe
    /// ports, filling the protocol-support cache.
    pub async fn probe_protocol_support(&self) -> Result<ProtocolSupportCache, Error> {
        self.call(|respond_to| Message::ProbeAll { respond_to }).await
    }

    pub async fn probe_pmp_support(&self) -> Result<bool, Error> {
        self.call(|respond_to| Message::ProbeOne {
            protocol: Protocol::NatPmp,
            respond_to,
        })
        .await
    }

    pub async fn probe_pcp_support(&self) -> Result<bool, Error> {
        self.call(|respond_to| Message::ProbeOne {
            protocol: Protocol::Pcp,
            respond_to,
        })
        .await
    }

    pub async fn probe_upnp_support(&self) -> Result<bool, Error> {
        self.call(|respond_to| Message::ProbeOne {
            protocol: Protocol::Upnp,
            respond_to,
        })
        .await
    }

    pub async fn get_active_mappings(&self) -> Result<HashMap<u16, Mapping>, Error> {
        self.call(|respond_to| Message::GetActiveMappings { respond_to })
            .await
    }

    pub async fn get_router_ip_cache(&self) -> Result<Vec<Ipv4Addr>, Error> {
        self.call(|respond_to| Message::GetRouterIpCache { respond_to })
            .await
    }

    pub async fn get_protocol_support_cache(&self) -> Result<ProtocolSupportCache, Error> {
        self.call(|respond_to| Message::GetProtocolSupportCache { respond_to })
            .await
    }

    pub async fn get_upnp_control_url(&self) -> Result<Option<String>, Error> {
        self.call(|respond_to| Message::GetUpnpControlUrl { respond_to })
            .await
    }

    /// Returns the local IPv4 addresses considered for mapping, or
    /// [`Error::NoLocalAddresses`] if none were discoverable.
    pub async fn get_private_ips(&self) -> Result<Vec<Ipv4Addr>, Error> {
        let ips = self
            .call(|respond_to| Message::GetPrivateIps { respond_to })
            .await?;
        if ips.is_empty() {
            Err(Error::NoLocalAddresses)
        } else {
            Ok(ips)
        }
    }

    /// Deletes every active mapping concurrently and cancels all refresh
    /// timers. Idempotent: a second call completes immediately.
    pub async fn close(&self) -> Result<(), Error> {
        self.call(|respond_to| Message::Close { respond_to }).await
    }
}

/// The task that owns all mutable controller state. Not constructible
/// outside this crate; reached only through [`Client`].
struct Service {
    config: Config,
    rx: mpsc::Receiver<Message>,
    self_tx: mpsc::Sender<Message>,
    active_mappings: ActiveMappings,
    router_ip_cache: RouterIpCache,
    protocol_support: ProtocolSupportCache,
    upnp_discovery: Option<upnp::Discovery>,
}

impl Service {
    fn new(config: Config, rx: mpsc::Receiver<Message>, self_tx: mpsc::Sender<Message>) -> Self {
        Service {
            config,
            rx,
            self_tx,
            active_mappings: ActiveMappings::new(),
            router_ip_cache: RouterIpCache::new(),
            protocol_support: ProtocolSupportCache::default(),
            upnp_discovery: None,
        }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
        }
    }

    #[instrument(skip_all)]
    async fn handle(&mut self, msg: Message) {
        match msg {
            Message::Add {
                protocol,
                internal_port,
                external_port,
                lifetime,
                respond_to,
            } => {
                let mapping = self
                    .dispatch_add(protocol, internal_port, external_port, lifetime)
                    .await;
                let _ = respond_to.send(mapping);
            }
            Message::Delete {
                protocol,
                external_port,
                respond_to,
            } => {
                let ok = self.dispatch_delete(protocol, external_port).await;
                let _ = respond_to.send(ok);
            }
            Message::ProbeAll { respond_to } => {
                let cache = self.probe_all().await;
                let _ = respond_to.send(cache);
            }
            Message::ProbeOne { protocol, respond_to } => {
                let ok = self.probe_one(protocol).await;
                let _ = respond_to.send(ok);
            }
            Message::GetActiveMappings { respond_to } => {
                let mappings = self
                    .active_mappings
                    .iter()
                    .map(|(port, entry)| (*port, entry.mapping.clone()))
                    .collect();
                let _ = respond_to.send(mappings);
            }
            Message::GetRouterIpCache { respond_to } => {
                let _ = respond_to.send(self.router_ip_cache.clone());
            }
            Message::GetProtocolSupportCache { respond_to } => {
                let _ = respond_to.send(self.protocol_support.clone());
            }
            Message::GetUpnpControlUrl { respond_to } => {
                let _ = respond_to.send(self.protocol_support.upnp_control_url.clone());
            }
            Message::GetPrivateIps { respond_to } => {
                let _ = respond_to.send(self.config.local_addrs.local_ipv4s());
            }
            Message::Refresh {
                protocol,
                internal_port,
                external_port,
                lifetime,
            } => {
                self.refresh(protocol, internal_port, external_port, lifetime)
                    .await;
            }
            Message::ExpireOnly { external_port } => {
                debug!(external_port, "mapping expired without refresh");
                self.active_mappings.remove(&external_port);
            }
            Message::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn dispatch_add(
        &mut self,
        protocol: Option<Protocol>,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Mapping {
        #[cfg(feature = "metrics")]
        self.config.metrics.mapping_attempts.inc();

        let order = match protocol {
            Some(p) => vec![p],
            None => self.fallback_order(),
        };
        if order.is_empty() {
            #[cfg(feature = "metrics")]
            self.config.metrics.mapping_failures.inc();
            return Mapping::failure(Protocol::NatPmp, internal_port, "No protocols supported");
        }

        for proto in order {
            let mapping = self
                .add_via(proto, internal_port, external_port, lifetime)
                .await;
            if mapping.is_success() {
                self.install(mapping.clone(), proto, internal_port, lifetime);
                return mapping;
            }
        }

        #[cfg(feature = "metrics")]
        self.config.metrics.mapping_failures.inc();
        Mapping::failure(
            Protocol::NatPmp,
            internal_port,
            "no protocol produced a mapping",
        )
    }

    /// Order to attempt protocols in for an unqualified `add_mapping` call.
    /// Once the support cache is fully populated this collapses to the
    /// single highest-priority protocol known to work, per
    /// `NatPmp > Pcp > Upnp`; with an unprobed cache, all three are tried
    /// in that same priority order until one succeeds.
    fn fallback_order(&self) -> Vec<Protocol> {
        if !self.protocol_support.is_fully_probed() {
            return vec![Protocol::NatPmp, Protocol::Pcp, Protocol::Upnp];
        }
        for proto in [Protocol::NatPmp, Protocol::Pcp, Protocol::Upnp] {
            if self.supported(proto) == Some(true) {
                return vec![proto];
            }
        }
        Vec::new()
    }

    fn supported(&self, protocol: Protocol) -> Option<bool> {
        match protocol {
            Protocol::NatPmp => self.protocol_support.nat_pmp,
            Protocol::Pcp => self.protocol_support.pcp,
            Protocol::Upnp => self.protocol_support.upnp,
        }
    }

    async fn add_via(
        &mut self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Mapping {
        let mapping = match protocol {
            Protocol::NatPmp => {
                #[cfg(feature = "metrics")]
                self.config.metrics.nat_pmp_attempts.inc();
                nat_pmp::add_mapping(
                    self.config.local_addrs.as_ref(),
                    &mut self.router_ip_cache,
                    internal_port,
                    external_port,
                    lifetime,
                )
                .await
            }
            Protocol::Pcp => {
                #[cfg(feature = "metrics")]
                self.config.metrics.pcp_attempts.inc();
                pcp::add_mapping(
                    self.config.local_addrs.as_ref(),
                    &mut self.router_ip_cache,
                    internal_port,
                    external_port,
                    lifetime,
                )
                .await
            }
            Protocol::Upnp => {
                #[cfg(feature = "metrics")]
                self.config.metrics.upnp_attempts.inc();
                let Some(discovery) = self.get_or_discover_upnp().await else {
                    return Mapping::failure(Protocol::Upnp, internal_port, "UPnP discovery failed");
                };
                let effective_external = if external_port == 0 {
                    internal_port
                } else {
                    external_port
                };
                upnp::add_mapping(&discovery, internal_port, effective_external, lifetime).await
            }
        };

        #[cfg(feature = "metrics")]
        if mapping.is_success() {
            match protocol {
                Protocol::NatPmp => self.config.metrics.nat_pmp_successes.inc(),
                Protocol::Pcp => self.config.metrics.pcp_successes.inc(),
                Protocol::Upnp => self.config.metrics.upnp_successes.inc(),
            };
        }

        mapping
    }

    async fn get_or_discover_upnp(&mut self) -> Option<upnp::Discovery> {
        if let Some(discovery) = &self.upnp_discovery {
            return Some(discovery.clone());
        }
        #[cfg(feature = "metrics")]
        self.config.metrics.upnp_discoveries.inc();
        let discovery = upnp::discover(self.config.local_addrs.as_ref()).await?;
        self.protocol_support.upnp_control_url = Some(discovery.control_url.clone());
        self.upnp_discovery = Some(discovery.clone());
        Some(discovery)
    }

    /// Inserts a successful mapping into the active table, cancelling any
    /// prior entry at the same external port and arming its refresh timer.
    fn install(&mut self, mapping: Mapping, protocol: Protocol, internal_port: u16, requested_lifetime: u32) {
        let Some(external_port) = mapping.external_port else {
            return;
        };
        // Overwriting an entry cancels its predecessor's refresh timer by
        // dropping the removed `ActiveEntry`.
        self.active_mappings.remove(&external_port);

        let refresh_task = self.arm_refresh(
            protocol,
            internal_port,
            external_port,
            requested_lifetime,
            mapping.actual_lifetime,
        );
        self.active_mappings
            .insert(external_port, ActiveEntry { mapping, refresh_task });
    }

    /// Implements the refresh-scheduling arithmetic from the controller's
    /// design: UPnP never refreshes; a zero requested lifetime re-invokes
    /// in 24h; a positive `Δ = requested − actual` re-invokes at
    /// `actual_lifetime` for the remaining `Δ` seconds; otherwise the entry
    /// is simply dropped once it expires.
    fn arm_refresh(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        requested_lifetime: u32,
        actual_lifetime: u32,
    ) -> Option<AbortOnDropHandle<()>> {
        if protocol == Protocol::Upnp {
            return None;
        }

        let self_tx = self.self_tx.clone();

        if requested_lifetime == 0 {
            let handle = tokio::spawn(async move {
                tokio::time::sleep(defaults::ZERO_LIFETIME_REFRESH_INTERVAL).await;
                let _ = self_tx
                    .send(Message::Refresh {
                        protocol,
                        internal_port,
                        external_port,
                        lifetime: 0,
                    })
                    .await;
            });
            return Some(AbortOnDropHandle::new(handle));
        }

        let delta = requested_lifetime.saturating_sub(actual_lifetime);
        let wait = Duration::from_secs(actual_lifetime as u64);

        let handle = if delta > 0 {
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = self_tx
                    .send(Message::Refresh {
                        protocol,
                        internal_port,
                        external_port,
                        lifetime: delta,
                    })
                    .await;
            })
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = self_tx.send(Message::ExpireOnly { external_port }).await;
            })
        };
        Some(AbortOnDropHandle::new(handle))
    }

    async fn refresh(&mut self, protocol: Protocol, internal_port: u16, external_port: u16, lifetime: u32) {
        #[cfg(feature = "metrics")]
        self.config.metrics.refreshes_fired.inc();
        let mapping = self.add_via(protocol, internal_port, external_port, lifetime).await;
        if mapping.is_success() {
            self.install(mapping, protocol, internal_port, lifetime);
        } else {
            warn!(external_port, %protocol, "refresh failed, dropping mapping");
            self.active_mappings.remove(&external_port);
        }
    }

    async fn dispatch_delete(&mut self, protocol: Option<Protocol>, external_port: u16) -> bool {
        let Some(entry) = self.active_mappings.get(&external_port) else {
            return false;
        };
        if let Some(expected) = protocol {
            if entry.mapping.protocol != expected {
                return false;
            }
        }
        let mapping = entry.mapping.clone();
        let ok = self.perform_wire_delete(&mapping).await;
        if ok {
            // Dropping the removed entry cancels its refresh timer.
            self.active_mappings.remove(&external_port);
            #[cfg(feature = "metrics")]
            self.config.metrics.mapping_deletions.inc();
        }
        ok
    }

    async fn perform_wire_delete(&self, mapping: &Mapping) -> bool {
        match mapping.protocol {
            Protocol::NatPmp => nat_pmp::delete_mapping(&self.router_ip_cache, mapping.internal_port).await,
            Protocol::Pcp => {
                let (Some(client_ip), Some(nonce)) = (mapping.internal_ip, mapping.nonce) else {
                    return false;
                };
                pcp::delete_mapping(&self.router_ip_cache, client_ip, mapping.internal_port, nonce).await
            }
            Protocol::Upnp => {
                let Some(control_url) = &mapping.control_url else {
                    return false;
                };
                let Some(external_port) = mapping.external_port else {
                    return false;
                };
                upnp::delete_mapping(control_url, external_port).await
            }
        }
    }

    async fn probe_all(&mut self) -> ProtocolSupportCache {
        #[cfg(feature = "metrics")]
        self.config.metrics.probes_started.inc();
        let nat_pmp = self.probe_one(Protocol::NatPmp).await;
        let pcp = self.probe_one(Protocol::Pcp).await;
        let upnp = self.probe_one(Protocol::Upnp).await;
        self.protocol_support.nat_pmp = Some(nat_pmp);
        self.protocol_support.pcp = Some(pcp);
        self.protocol_support.upnp = Some(upnp);
        self.protocol_support.clone()
    }

    async fn probe_one(&mut self, protocol: Protocol) -> bool {
        let probe_port = match protocol {
            Protocol::NatPmp => defaults::PROBE_PORT_NAT_PMP,
            Protocol::Pcp => defaults::PROBE_PORT_PCP,
            Protocol::Upnp => defaults::PROBE_PORT_UPNP,
        };

        let supported = if protocol == Protocol::Upnp {
            match self.get_or_discover_upnp().await {
                Some(discovery) => upnp::probe_supported(&discovery, probe_port).await,
                None => false,
            }
        } else {
            let mapping = self
                .add_via(protocol, probe_port, probe_port, 120)
                .await;
            mapping.is_success()
        };

        match protocol {
            Protocol::NatPmp => self.protocol_support.nat_pmp = Some(supported),
            Protocol::Pcp => self.protocol_support.pcp = Some(supported),
            Protocol::Upnp => {
                self.protocol_support.upnp = Some(supported);
                #[cfg(feature = "metrics")]
                if supported {
                    self.config.metrics.upnp_available.inc();
                }
            }
        }
        supported
    }

    /// Deletes every active mapping concurrently and cancels their refresh
    /// timers, settling once every deletion attempt has completed.
    /// Shutdown clears the table regardless of whether individual wire
    /// deletes succeeded.
    async fn close(&mut self) {
        let mappings: Vec<Mapping> = self
            .active_mappings
            .values()
            .map(|entry| entry.mapping.clone())
            .collect();

        let deletions = mappings.iter().map(|mapping| self.perform_wire_delete(mapping));
        futures_util::future::join_all(deletions).await;

        self.active_mappings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netif::interfaces::FixedAddressProvider;

    fn test_config() -> Config {
        Config {
            local_addrs: Arc::new(FixedAddressProvider(vec![Ipv4Addr::new(127, 0, 0, 1)])),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(metrics::Metrics::default()),
        }
    }

    #[tokio::test]
    async fn s4_fallback_order_tries_nat_pmp_then_pcp_then_upnp_until_probed() {
        // S4: with an unprobed cache, add_mapping must be willing to fall
        // through NAT-PMP (which times out) to PCP (which succeeds) to
        // UPnP, in that priority order.
        let (_tx, rx) = mpsc::channel(64);
        let (self_tx, _self_rx) = mpsc::channel(64);
        let mut service = Service::new(test_config(), rx, self_tx);
        assert_eq!(
            service.fallback_order(),
            vec![Protocol::NatPmp, Protocol::Pcp, Protocol::Upnp]
        );

        service.protocol_support.nat_pmp = Some(false);
        service.protocol_support.pcp = Some(true);
        service.protocol_support.upnp = Some(true);
        // Once fully probed, fallback collapses to the single
        // highest-priority protocol known to work (PCP, since NAT-PMP is
        // false), rather than retrying every protocol again.
        assert_eq!(service.fallback_order(), vec![Protocol::Pcp]);

        service.protocol_support.nat_pmp = Some(false);
        service.protocol_support.pcp = Some(false);
        service.protocol_support.upnp = Some(false);
        assert!(service.fallback_order().is_empty());
    }

    #[tokio::test]
    async fn unsupported_protocols_yield_no_protocols_supported() {
        let client = Client::new(test_config());
        // Force a fully-probed-but-all-false cache by probing against a
        // loopback-only environment where nothing answers.
        let _ = client.probe_protocol_support().await;
        let mapping = client.add_mapping(4242, 0, 120).await.unwrap();
        assert!(!mapping.is_success());
    }

    #[tokio::test]
    async fn delete_missing_mapping_returns_false() {
        let client = Client::new(test_config());
        let deleted = client.delete_mapping(50000).await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = Client::new(test_config());
        client.close().await.unwrap();
        client.close().await.unwrap();
        let mappings = client.get_active_mappings().await.unwrap();
        assert!(mappings.is_empty());
    }

    #[tokio::test]
    async fn get_private_ips_rejects_when_empty() {
        let config = Config {
            local_addrs: Arc::new(FixedAddressProvider(Vec::new())),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(metrics::Metrics::default()),
        };
        let client = Client::new(config);
        let result = client.get_private_ips().await;
        assert!(matches!(result, Err(Error::NoLocalAddresses)));
    }

    #[tokio::test]
    async fn s5_close_clears_two_active_mappings_and_cancels_refresh_timers() {
        // S5: two active mappings (a NAT-PMP entry with a refresh armed, a
        // UPnP entry). close() must settle with ActiveMappings empty and
        // every refresh timer cancelled, regardless of whether the wire
        // deletes it fires actually reach a router.
        let (_tx, rx) = mpsc::channel(64);
        let (self_tx, _self_rx) = mpsc::channel(64);
        let mut service = Service::new(test_config(), rx, self_tx);

        let pmp_mapping = Mapping {
            internal_ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
            internal_port: 4242,
            external_ip: None,
            external_port: Some(50000),
            requested_lifetime: 120,
            actual_lifetime: 120,
            protocol: Protocol::NatPmp,
            nonce: None,
            control_url: None,
            err_info: None,
        };
        let refresh_task = Some(AbortOnDropHandle::new(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })));
        service.active_mappings.insert(
            50000,
            ActiveEntry {
                mapping: pmp_mapping,
                refresh_task,
            },
        );

        let upnp_mapping = Mapping {
            internal_ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
            internal_port: 4243,
            external_ip: None,
            external_port: Some(50001),
            requested_lifetime: 0,
            actual_lifetime: 0,
            protocol: Protocol::Upnp,
            nonce: None,
            control_url: Some("http://192.168.1.1:0/ctl/IPConn".to_string()),
            err_info: None,
        };
        service.active_mappings.insert(
            50001,
            ActiveEntry {
                mapping: upnp_mapping,
                refresh_task: None,
            },
        );

        assert_eq!(service.active_mappings.len(), 2);
        service.close().await;
        assert!(service.active_mappings.is_empty());

        // A following close() on an already-empty table completes immediately.
        service.close().await;
        assert!(service.active_mappings.is_empty());
    }
}
