//! UPnP IGD engine: SSDP discovery, device-description scraping, and SOAP
//! AddPortMapping/DeletePortMapping invocation.
//!
//! The XML handling here is a deliberate string scan rather than a
//! structured parse: routers in the wild emit XML that general-purpose
//! parsers choke on. Search for `WANIPConnection`, then the next
//! `<controlURL>` after it.

use std::net::Ipv4Addr;

use netif::{LocalAddressProvider, UdpSocket};
use url::Url;

use crate::addr::longest_prefix_match;
use crate::defaults::{
    SSDP_MULTICAST_ADDR, SSDP_MULTICAST_PORT, UPNP_DESCRIBE_TIMEOUT, UPNP_SOAP_TIMEOUT,
    UPNP_SSDP_TIMEOUT,
};
use crate::mapping::{Mapping, Protocol};

const SERVICE_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
const WAN_IP_CONNECTION_MARKER: &str = "WANIPConnection";

/// Errors surfaced internally while discovering or invoking a UPnP IGD.
/// Every public entry point in this module still collapses these into a
/// failure [`Mapping`] or `bool`, per the crate's no-propagated-exceptions
/// error policy; this type exists so the phases can share a `?`-friendly
/// internal plumbing.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("no SSDP responses received")]
    NoSsdpResponses,
    #[error("SSDP response carried no LOCATION header")]
    MissingLocation,
    #[error("device description fetch failed: {0}")]
    DescribeFailed(String),
    #[error("no WANIPConnection controlURL found in device description")]
    MissingControlUrl,
    #[error("no local IP addresses available")]
    NoLocalIps,
    #[error("controlURL is not a valid URL: {0}")]
    InvalidUrl(String),
}

/// Result of Phase A + Phase B: a discovered controlURL together with the
/// client IP that should be asserted against it.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub control_url: String,
    pub client_ip: Ipv4Addr,
}

/// Runs SSDP discovery (Phase A) followed by description-fetch and
/// controlURL extraction (Phase B), returning the first successful result
/// across all SSDP responses.
pub async fn discover(local_addrs: &dyn LocalAddressProvider) -> Option<Discovery> {
    discover_inner(local_addrs).await.ok()
}

async fn discover_inner(local_addrs: &dyn LocalAddressProvider) -> Result<Discovery, Error> {
    let local_ips = local_addrs.local_ipv4s();
    if local_ips.is_empty() {
        return Err(Error::NoLocalIps);
    }

    let responses = ssdp_search().await?;
    if responses.is_empty() {
        return Err(Error::NoSsdpResponses);
    }

    for response in responses {
        let Some(location) = extract_location(&response) else {
            continue;
        };
        match describe_and_extract_control_url(&location).await {
            Ok(control_url) => {
                let Ok(parsed) = Url::parse(&control_url) else {
                    continue;
                };
                let host_ip = parsed
                    .host_str()
                    .and_then(|h| h.parse::<Ipv4Addr>().ok());
                let client_ip = match host_ip {
                    Some(host_ip) => longest_prefix_match(&local_ips, host_ip)
                        .unwrap_or_else(|| local_ips[0]),
                    None => local_ips[0],
                };
                return Ok(Discovery {
                    control_url,
                    client_ip,
                });
            }
            Err(_) => continue,
        }
    }

    Err(Error::MissingControlUrl)
}

/// Sends an M-SEARCH to the SSDP multicast group and collects every
/// response that arrives within [`UPNP_SSDP_TIMEOUT`].
async fn ssdp_search() -> Result<Vec<String>, Error> {
    let socket = UdpSocket::bind_ephemeral(Ipv4Addr::UNSPECIFIED)
        .map_err(|e| Error::DescribeFailed(e.to_string()))?;
    socket
        .join_multicast_v4(SSDP_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)
        .ok();

    let request = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {addr}:{port}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {st}\r\n\r\n",
        addr = SSDP_MULTICAST_ADDR,
        port = SSDP_MULTICAST_PORT,
        st = SERVICE_TYPE,
    );

    let peer = std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
        SSDP_MULTICAST_ADDR,
        SSDP_MULTICAST_PORT,
    ));
    socket
        .send_to(request.as_bytes(), peer)
        .await
        .map_err(|e| Error::DescribeFailed(e.to_string()))?;

    let mut responses = Vec::new();
    let deadline = tokio::time::sleep(UPNP_SSDP_TIMEOUT);
    tokio::pin!(deadline);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => break,
            recv = socket.recv_from(&mut buf) => {
                if let Ok((n, _from)) = recv {
                    if let Ok(text) = std::str::from_utf8(&buf[..n]) {
                        responses.push(text.to_string());
                    }
                }
            }
        }
    }

    Ok(responses)
}

/// Finds the `LOCATION:` header in a raw SSDP response, preserving the
/// value's case exactly as sent by the router.
fn extract_location(response: &str) -> Option<String> {
    for line in response.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("location:") {
            let offset = line.len() - rest.len();
            return Some(line[offset..].trim().to_string());
        }
    }
    None
}

/// GETs `location` and scrapes the controlURL following the first
/// `WANIPConnection` occurrence, resolved against `location`'s scheme+host.
async fn describe_and_extract_control_url(location: &str) -> Result<String, Error> {
    let client = reqwest::Client::builder()
        .timeout(UPNP_DESCRIBE_TIMEOUT)
        .build()
        .map_err(|e| Error::DescribeFailed(e.to_string()))?;
    let body = client
        .get(location)
        .send()
        .await
        .map_err(|e| Error::DescribeFailed(e.to_string()))?
        .text()
        .await
        .map_err(|e| Error::DescribeFailed(e.to_string()))?;

    let control_url_path = scrape_control_url(&body).ok_or(Error::MissingControlUrl)?;
    resolve_against(location, &control_url_path)
}

/// Searches `body` for `WANIPConnection`, then the next `<controlURL>` tag
/// after that point, returning its text content.
fn scrape_control_url(body: &str) -> Option<String> {
    let marker_pos = body.find(WAN_IP_CONNECTION_MARKER)?;
    let rest = &body[marker_pos..];
    let open_tag = "<controlURL>";
    let close_tag = "</controlURL>";
    let open_pos = rest.find(open_tag)?;
    let after_open = &rest[open_pos + open_tag.len()..];
    let close_pos = after_open.find(close_tag)?;
    Some(after_open[..close_pos].trim().to_string())
}

/// Resolves `maybe_relative` against the scheme+host of `location`.
fn resolve_against(location: &str, maybe_relative: &str) -> Result<String, Error> {
    let base = Url::parse(location).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    let resolved = base
        .join(maybe_relative)
        .map_err(|e| Error::InvalidUrl(e.to_string()))?;
    Ok(resolved.to_string())
}

/// Builds and POSTs the SOAP `AddPortMapping` envelope.
pub async fn add_mapping(
    discovery: &Discovery,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Mapping {
    let envelope = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:AddPortMapping xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{ext}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
<NewInternalPort>{int}</NewInternalPort>
<NewInternalClient>{client}</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>portmap</NewPortMappingDescription>
<NewLeaseDuration>{lifetime}</NewLeaseDuration>
</u:AddPortMapping>
</s:Body>
</s:Envelope>"#,
        ext = external_port,
        int = internal_port,
        client = discovery.client_ip,
        lifetime = lifetime,
    );

    match invoke_soap(
        &discovery.control_url,
        "urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping",
        &envelope,
    )
    .await
    {
        Ok(()) => Mapping {
            internal_ip: Some(discovery.client_ip),
            internal_port,
            external_ip: None,
            external_port: Some(external_port),
            requested_lifetime: lifetime,
            actual_lifetime: lifetime,
            protocol: Protocol::Upnp,
            nonce: None,
            control_url: Some(discovery.control_url.clone()),
            err_info: None,
        },
        Err(err_info) => Mapping::failure(Protocol::Upnp, internal_port, err_info),
    }
}

/// Builds and POSTs the SOAP `DeletePortMapping` envelope.
pub async fn delete_mapping(control_url: &str, external_port: u16) -> bool {
    let envelope = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:DeletePortMapping xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{ext}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
</u:DeletePortMapping>
</s:Body>
</s:Envelope>"#,
        ext = external_port,
    );

    invoke_soap(
        control_url,
        "urn:schemas-upnp-org:service:WANIPConnection:1#DeletePortMapping",
        &envelope,
    )
    .await
    .is_ok()
}

/// POSTs a SOAP envelope. `Ok(())` on HTTP 200; `Err(description)` on any
/// other status, with the `<errorDescription>` scraped out when present.
///
/// A `ConflictInMappingEntry` description is returned as an error here;
/// callers doing support probing are expected to special-case it as
/// evidence the service is reachable, per [`probe_supported`].
async fn invoke_soap(control_url: &str, soap_action: &str, envelope: &str) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(UPNP_SOAP_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .post(control_url)
        .header("Content-Type", "text/xml")
        .header("SOAPAction", format!("\"{soap_action}\""))
        .body(envelope.to_string())
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    let description = scrape_error_description(&body)
        .unwrap_or_else(|| "UPnP SOAP request failed".to_string());
    Err(description)
}

fn scrape_error_description(body: &str) -> Option<String> {
    let open_tag = "<errorDescription>";
    let close_tag = "</errorDescription>";
    let open_pos = body.find(open_tag)?;
    let after_open = &body[open_pos + open_tag.len()..];
    let close_pos = after_open.find(close_tag)?;
    Some(after_open[..close_pos].trim().to_string())
}

/// Probes for UPnP support by attempting a blind `AddPortMapping` at the
/// UPnP probe port. A `ConflictInMappingEntry` failure is treated as proof
/// the service is live (support is not the same as success).
pub async fn probe_supported(discovery: &Discovery, probe_port: u16) -> bool {
    let mapping = add_mapping(discovery, probe_port, probe_port, 120).await;
    if mapping.is_success() {
        return true;
    }
    mapping
        .err_info
        .as_deref()
        .map(|desc| desc.contains("ConflictInMappingEntry"))
        .unwrap_or(false)
}
