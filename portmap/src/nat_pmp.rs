//! NAT-PMP engine (RFC 6886): wave-raced UDP requests to candidate routers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use netif::{LocalAddressProvider, UdpSocket};

use crate::addr::{compute_waves, longest_prefix_match};
use crate::codec::{build_natpmp_request, parse_natpmp_response};
use crate::defaults::{NAT_PMP_TIMEOUT, RFC_PORT};
use crate::mapping::{Mapping, Protocol};
use crate::race::race;

/// Requests a NAT-PMP mapping of `internal_port` to `external_port` (`0`
/// lets the gateway choose) for `lifetime` seconds, racing the router-IP
/// cache and local-subnet candidates before falling back to the default
/// candidate list.
///
/// On success, appends the responding router IP to `router_ip_cache` if it
/// isn't already present.
pub async fn add_mapping(
    local_addrs: &dyn LocalAddressProvider,
    router_ip_cache: &mut Vec<Ipv4Addr>,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Mapping {
    let local_ips = local_addrs.local_ipv4s();
    if local_ips.is_empty() {
        return Mapping::failure(Protocol::NatPmp, internal_port, "getPrivateIps failed");
    }

    let (first_wave, second_wave) = compute_waves(router_ip_cache, &local_ips);

    let request = build_natpmp_request(internal_port, external_port, lifetime);

    for wave in [first_wave, second_wave] {
        if wave.is_empty() {
            continue;
        }
        let reply = race(wave, NAT_PMP_TIMEOUT, move |router_ip| async move {
            send_and_parse(router_ip, &request).await
        })
        .await;

        if let Some((router_ip, response)) = reply {
            if response.result_code != 0 {
                continue;
            }
            if !router_ip_cache.contains(&router_ip) {
                router_ip_cache.push(router_ip);
            }
            let internal_ip = longest_prefix_match(&local_ips, router_ip);
            return Mapping {
                internal_ip,
                internal_port,
                external_ip: None,
                external_port: Some(response.external_port),
                requested_lifetime: lifetime,
                actual_lifetime: response.lifetime,
                protocol: Protocol::NatPmp,
                nonce: None,
                control_url: None,
                err_info: None,
            };
        }
    }

    Mapping::failure(
        Protocol::NatPmp,
        internal_port,
        "no NAT-PMP reply from any candidate router",
    )
}

/// Deletes a previously established NAT-PMP mapping by sending a request
/// with `external_port = 0, lifetime = 0`, per RFC 6886 §3.4, racing every
/// router IP known to have answered a request before.
pub async fn delete_mapping(router_ip_cache: &[Ipv4Addr], internal_port: u16) -> bool {
    if router_ip_cache.is_empty() {
        return false;
    }
    let request = build_natpmp_request(internal_port, 0, 0);
    let reply = race(router_ip_cache.to_vec(), NAT_PMP_TIMEOUT, move |router_ip| {
        async move { send_and_parse(router_ip, &request).await }
    })
    .await;
    matches!(reply, Some((_, response)) if response.result_code == 0)
}

async fn send_and_parse(
    router_ip: Ipv4Addr,
    request: &[u8; 12],
) -> Option<(Ipv4Addr, crate::codec::NatPmpResponse)> {
    let socket = UdpSocket::bind_ephemeral(Ipv4Addr::UNSPECIFIED).ok()?;
    let peer = SocketAddr::V4(SocketAddrV4::new(router_ip, RFC_PORT));
    socket.send_to(request, peer).await.ok()?;

    let mut buf = [0u8; 16];
    let (n, from) = socket.recv_from(&mut buf).await.ok()?;
    if from.ip() != std::net::IpAddr::V4(router_ip) {
        return None;
    }
    let response = parse_natpmp_response(&buf[..n]).ok()?;
    Some((router_ip, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netif::interfaces::FixedAddressProvider;

    #[tokio::test]
    async fn fails_cleanly_with_no_local_ips() {
        let provider = FixedAddressProvider(Vec::new());
        let mut cache = Vec::new();
        let mapping = add_mapping(&provider, &mut cache, 4242, 0, 120).await;
        assert!(!mapping.is_success());
        assert_eq!(mapping.err_info.as_deref(), Some("getPrivateIps failed"));
    }

    #[tokio::test]
    async fn s1_nat_pmp_add_success_against_loopback_responder() {
        // Spin up a fake NAT-PMP responder on loopback playing the role of
        // 192.168.1.1 in spec scenario S1, answering with
        // response[10..12] = 0xC350 (50000), response[12..16] = 0x78 (120).
        // add_mapping itself is hardwired to RFC_PORT (5351) as real
        // routers require, so the responder is driven through
        // send_and_parse_on_port directly instead.
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_port = responder.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 12];
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            let mut resp = [0u8; 16];
            resp[1] = 0x81;
            resp[10..12].copy_from_slice(&50000u16.to_be_bytes());
            resp[12..16].copy_from_slice(&120u32.to_be_bytes());
            responder.send_to(&resp, peer).await.unwrap();
        });

        let loopback = Ipv4Addr::new(127, 0, 0, 1);
        let request = build_natpmp_request(4242, 0, 120);
        let result = send_and_parse_on_port(loopback, responder_port, &request).await;
        handle.await.unwrap();

        let (router_ip, response) = result.expect("expected a parsed response");
        assert_eq!(router_ip, loopback);
        assert_eq!(response.external_port, 50000);
        assert_eq!(response.lifetime, 120);

        let internal_ip = longest_prefix_match(&[loopback], router_ip);
        assert_eq!(internal_ip, Some(loopback));
    }

    async fn send_and_parse_on_port(
        router_ip: Ipv4Addr,
        port: u16,
        request: &[u8; 12],
    ) -> Option<(Ipv4Addr, crate::codec::NatPmpResponse)> {
        let socket = UdpSocket::bind_ephemeral(Ipv4Addr::UNSPECIFIED).ok()?;
        let peer = SocketAddr::V4(SocketAddrV4::new(router_ip, port));
        socket.send_to(request, peer).await.ok()?;
        let mut buf = [0u8; 16];
        let (n, _from) = socket.recv_from(&mut buf).await.ok()?;
        parse_natpmp_response(&buf[..n]).ok().map(|r| (router_ip, r))
    }
}
