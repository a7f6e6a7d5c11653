//! PCP engine (RFC 6887): same wave strategy as NAT-PMP, plus a mapping
//! nonce and a per-target client-address encoded into the request payload.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use netif::{LocalAddressProvider, UdpSocket};
use rand::RngCore;

use crate::addr::{compute_waves, longest_prefix_match};
use crate::codec::{build_pcp_map_request, parse_pcp_response, PcpResponse};
use crate::defaults::{PCP_TIMEOUT, RFC_PORT};
use crate::mapping::{Mapping, Protocol};
use crate::race::race;

/// PCP result codes this engine treats as an acceptable outcome for a
/// deletion: `SUCCESS` and `NO_RESOURCES` (the mapping is already gone).
const RESULT_SUCCESS: u8 = 0;
const RESULT_NO_RESOURCES: u8 = 8;

/// Requests a PCP mapping, generating a fresh nonce for this attempt.
pub async fn add_mapping(
    local_addrs: &dyn LocalAddressProvider,
    router_ip_cache: &mut Vec<Ipv4Addr>,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Mapping {
    let nonce = fresh_nonce();
    add_mapping_with_nonce(
        local_addrs,
        router_ip_cache,
        internal_port,
        external_port,
        lifetime,
        nonce,
    )
    .await
}

async fn add_mapping_with_nonce(
    local_addrs: &dyn LocalAddressProvider,
    router_ip_cache: &mut Vec<Ipv4Addr>,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
    nonce: [u32; 3],
) -> Mapping {
    let local_ips = local_addrs.local_ipv4s();
    if local_ips.is_empty() {
        return Mapping::failure(Protocol::Pcp, internal_port, "getPrivateIps failed");
    }

    let (first_wave, second_wave) = compute_waves(router_ip_cache, &local_ips);

    for wave in [first_wave, second_wave] {
        if wave.is_empty() {
            continue;
        }
        let local_ips = local_ips.clone();
        let reply = race(wave, PCP_TIMEOUT, move |router_ip| {
            let local_ips = local_ips.clone();
            async move {
                // PCP requires the client address in the payload to match
                // the source address the gateway actually observes, so it
                // is chosen per target rather than once up front.
                let client_ip = longest_prefix_match(&local_ips, router_ip)?;
                send_and_parse(
                    router_ip,
                    client_ip,
                    internal_port,
                    external_port,
                    lifetime,
                    nonce,
                )
                .await
            }
        })
        .await;

        if let Some((router_ip, client_ip, response)) = reply {
            if response.result_code != RESULT_SUCCESS {
                continue;
            }
            if !router_ip_cache.contains(&router_ip) {
                router_ip_cache.push(router_ip);
            }
            return Mapping {
                internal_ip: Some(client_ip),
                internal_port,
                external_ip: Some(response.external_ipv4),
                external_port: Some(response.external_port),
                requested_lifetime: lifetime,
                actual_lifetime: response.lifetime,
                protocol: Protocol::Pcp,
                nonce: Some(nonce),
                control_url: None,
                err_info: None,
            };
        }
    }

    Mapping::failure(Protocol::Pcp, internal_port, "no PCP reply from any candidate router")
}

/// Deletes a PCP mapping, reusing the nonce from the original `add` so the
/// gateway can bind the deletion to that mapping. Accepts `SUCCESS` and
/// `NO_RESOURCES` as a successful deletion. Races every router IP known to
/// have answered a request before.
pub async fn delete_mapping(
    router_ip_cache: &[Ipv4Addr],
    client_ip: Ipv4Addr,
    internal_port: u16,
    nonce: [u32; 3],
) -> bool {
    if router_ip_cache.is_empty() {
        return false;
    }
    let reply = race(
        router_ip_cache.to_vec(),
        PCP_TIMEOUT,
        move |router_ip| async move {
            send_and_parse(router_ip, client_ip, internal_port, 0, 0, nonce).await
        },
    )
    .await;

    matches!(
        reply,
        Some((_, _, response))
            if response.result_code == RESULT_SUCCESS || response.result_code == RESULT_NO_RESOURCES
    )
}

fn fresh_nonce() -> [u32; 3] {
    let mut rng = rand::thread_rng();
    [rng.next_u32(), rng.next_u32(), rng.next_u32()]
}

async fn send_and_parse(
    router_ip: Ipv4Addr,
    client_ip: Ipv4Addr,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
    nonce: [u32; 3],
) -> Option<(Ipv4Addr, Ipv4Addr, PcpResponse)> {
    let request =
        build_pcp_map_request(client_ip, internal_port, external_port, lifetime, nonce);

    let socket = UdpSocket::bind_ephemeral(client_ip).ok()?;
    let peer = SocketAddr::V4(SocketAddrV4::new(router_ip, RFC_PORT));
    socket.send_to(&request, peer).await.ok()?;

    let mut buf = [0u8; 60];
    let (n, from) = socket.recv_from(&mut buf).await.ok()?;
    if from.ip() != std::net::IpAddr::V4(router_ip) {
        return None;
    }
    let response = parse_pcp_response(&buf[..n]).ok()?;
    if response.nonce_echo != nonce {
        return None;
    }
    Some((router_ip, client_ip, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netif::interfaces::FixedAddressProvider;

    #[tokio::test]
    async fn fails_cleanly_with_no_local_ips() {
        let provider = FixedAddressProvider(Vec::new());
        let mut cache = Vec::new();
        let mapping = add_mapping(&provider, &mut cache, 4242, 0, 7200).await;
        assert!(!mapping.is_success());
    }

    #[test]
    fn fresh_nonce_is_nonzero_with_high_probability() {
        // Not a cryptographic claim, just a smoke test that we aren't
        // accidentally returning an all-zero nonce.
        let nonce = fresh_nonce();
        assert_ne!(nonce, [0, 0, 0]);
    }

    #[tokio::test]
    async fn s6_delete_with_reused_nonce_treats_no_resources_as_success() {
        // S6: mapping stored with nonce [0xA, 0xB, 0xC]; delete emits a PCP
        // request with lifetime=0, ext_port=0, carrying that same nonce; a
        // router reply of result=8 (NO_RESOURCES) still counts as success.
        // delete_mapping is hardwired to RFC_PORT like real routers require,
        // so the responder is driven through send_and_parse_on_port instead.
        let nonce = [0xA, 0xB, 0xC];
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_port = responder.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 60];
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            let mut resp = [0u8; 60];
            resp[1] = 1; // opcode echoed back
            resp[3] = RESULT_NO_RESOURCES;
            resp[24..28].copy_from_slice(&nonce[0].to_be_bytes());
            resp[28..32].copy_from_slice(&nonce[1].to_be_bytes());
            resp[32..36].copy_from_slice(&nonce[2].to_be_bytes());
            responder.send_to(&resp, peer).await.unwrap();
        });

        let loopback = Ipv4Addr::new(127, 0, 0, 1);
        let result = send_and_parse_on_port(loopback, responder_port, loopback, 4242, 0, 0, nonce).await;
        handle.await.unwrap();

        let (_, _, response) = result.expect("expected a parsed response");
        assert!(response.result_code == RESULT_SUCCESS || response.result_code == RESULT_NO_RESOURCES);
        assert_eq!(response.nonce_echo, nonce);
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_and_parse_on_port(
        router_ip: Ipv4Addr,
        port: u16,
        client_ip: Ipv4Addr,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        nonce: [u32; 3],
    ) -> Option<(Ipv4Addr, Ipv4Addr, PcpResponse)> {
        let request = build_pcp_map_request(client_ip, internal_port, external_port, lifetime, nonce);
        let socket = UdpSocket::bind_ephemeral(client_ip).ok()?;
        let peer = SocketAddr::V4(SocketAddrV4::new(router_ip, port));
        socket.send_to(&request, peer).await.ok()?;
        let mut buf = [0u8; 60];
        let (n, _from) = socket.recv_from(&mut buf).await.ok()?;
        let response = parse_pcp_response(&buf[..n]).ok()?;
        if response.nonce_echo != nonce {
            return None;
        }
        Some((router_ip, client_ip, response))
    }
}
