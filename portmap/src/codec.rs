//! Byte-exact NAT-PMP and PCP wire codecs.
//!
//! These functions perform no I/O and no allocation beyond the returned
//! buffer; they are pure encoders/decoders over the fixed layouts from
//! RFC 6886 (NAT-PMP) and RFC 6887 (PCP).

use std::net::Ipv4Addr;

/// NAT-PMP/PCP opcode used for all requests this crate sends: a UDP port
/// mapping request. NAT-PMP calls this opcode `1` ("Map UDP"); PCP calls it
/// opcode `1` ("MAP").
const NAT_PMP_OP_MAP_UDP: u8 = 1;
const PCP_OPCODE_MAP: u8 = 1;
/// IANA protocol number for UDP, used in the PCP MAP request's protocol field.
const PCP_PROTOCOL_UDP: u8 = 17;

/// Errors produced while decoding a NAT-PMP or PCP response.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("response is too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },
    #[error("response carries an unexpected opcode {0:#x}")]
    UnexpectedOpcode(u8),
}

/// A decoded NAT-PMP response, covering both the "determine external
/// address" and "map UDP port" reply formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatPmpResponse {
    /// Opcode echoed back by the server, with the response bit (`0x80`)
    /// already stripped.
    pub op: u8,
    pub result_code: u16,
    /// Mapped external port. Zero for a "determine external address" reply.
    pub external_port: u16,
    /// Granted lifetime in seconds. Zero for a "determine external address" reply.
    pub lifetime: u32,
}

/// Builds a 12-byte NAT-PMP "Map UDP port" request.
///
/// Layout (big-endian): version=0 (u8), op=1 (u8), reserved=0 (u16),
/// internal port (u16), external port (u16), requested lifetime (u32).
pub fn build_natpmp_request(internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = 0; // version
    buf[1] = NAT_PMP_OP_MAP_UDP;
    // bytes 2..4 stay reserved/zero
    buf[4..6].copy_from_slice(&internal_port.to_be_bytes());
    buf[6..8].copy_from_slice(&external_port.to_be_bytes());
    buf[8..12].copy_from_slice(&lifetime.to_be_bytes());
    buf
}

/// Parses a NAT-PMP response datagram.
///
/// Accepts both the 12-byte "determine external address" reply and the
/// 16-byte "map UDP port" reply; fields that don't apply to the shorter
/// reply are returned as zero.
pub fn parse_natpmp_response(bytes: &[u8]) -> Result<NatPmpResponse, Error> {
    if bytes.len() < 12 {
        return Err(Error::TooShort {
            got: bytes.len(),
            need: 12,
        });
    }
    let op = bytes[1] & 0x7f;
    let result_code = u16::from_be_bytes([bytes[2], bytes[3]]);

    if bytes.len() >= 16 {
        let external_port = u16::from_be_bytes([bytes[10], bytes[11]]);
        let lifetime = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Ok(NatPmpResponse {
            op,
            result_code,
            external_port,
            lifetime,
        })
    } else {
        Ok(NatPmpResponse {
            op,
            result_code,
            external_port: 0,
            lifetime: 0,
        })
    }
}

/// A decoded PCP MAP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpResponse {
    pub result_code: u8,
    pub lifetime: u32,
    pub external_port: u16,
    pub external_ipv4: Ipv4Addr,
    pub nonce_echo: [u32; 3],
}

/// Builds a 60-byte PCP MAP request.
///
/// See RFC 6887 §11 and §19.2 for the wire layout this mirrors exactly.
#[allow(clippy::too_many_arguments)]
pub fn build_pcp_map_request(
    client_ipv4: Ipv4Addr,
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
    nonce: [u32; 3],
) -> [u8; 60] {
    let mut buf = [0u8; 60];
    buf[0] = 2; // version
    buf[1] = PCP_OPCODE_MAP; // R=0, opcode=MAP
    // bytes 2..4 reserved
    buf[4..8].copy_from_slice(&lifetime.to_be_bytes());

    // bytes 8..24: client IP as an IPv4-mapped IPv6 address (::ffff:a.b.c.d)
    write_ipv4_mapped(&mut buf[8..24], client_ipv4);

    // bytes 24..36: mapping nonce, three big-endian u32 words
    for (i, word) in nonce.iter().enumerate() {
        buf[24 + i * 4..28 + i * 4].copy_from_slice(&word.to_be_bytes());
    }

    buf[36] = PCP_PROTOCOL_UDP;
    // bytes 37..40 reserved
    buf[40..42].copy_from_slice(&internal_port.to_be_bytes());
    buf[42..44].copy_from_slice(&suggested_external_port.to_be_bytes());
    // bytes 44..60: suggested external address; 0.0.0.0 (no preference),
    // still written as an IPv4-mapped IPv6 address per the MAP opcode layout.
    write_ipv4_mapped(&mut buf[44..60], Ipv4Addr::UNSPECIFIED);

    buf
}

/// Parses a 60-byte PCP MAP response.
pub fn parse_pcp_response(bytes: &[u8]) -> Result<PcpResponse, Error> {
    if bytes.len() < 60 {
        return Err(Error::TooShort {
            got: bytes.len(),
            need: 60,
        });
    }
    let opcode = bytes[1] & 0x7f;
    if opcode != PCP_OPCODE_MAP {
        return Err(Error::UnexpectedOpcode(opcode));
    }

    let result_code = bytes[3];
    let lifetime = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let mut nonce_echo = [0u32; 3];
    for (i, word) in nonce_echo.iter_mut().enumerate() {
        *word = u32::from_be_bytes([
            bytes[24 + i * 4],
            bytes[25 + i * 4],
            bytes[26 + i * 4],
            bytes[27 + i * 4],
        ]);
    }

    let external_port = u16::from_be_bytes([bytes[42], bytes[43]]);
    let external_ipv4 = Ipv4Addr::new(bytes[56], bytes[57], bytes[58], bytes[59]);

    Ok(PcpResponse {
        result_code,
        lifetime,
        external_port,
        external_ipv4,
        nonce_echo,
    })
}

/// Writes an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) into a 16-byte slice.
fn write_ipv4_mapped(dst: &mut [u8], addr: Ipv4Addr) {
    debug_assert_eq!(dst.len(), 16);
    for b in dst.iter_mut() {
        *b = 0;
    }
    dst[10] = 0xff;
    dst[11] = 0xff;
    dst[12..16].copy_from_slice(&addr.octets());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natpmp_request_layout() {
        let req = build_natpmp_request(4242, 0, 120);
        assert_eq!(req[0], 0);
        assert_eq!(req[1], 1);
        assert_eq!(&req[2..4], &[0, 0]);
        assert_eq!(u16::from_be_bytes([req[4], req[5]]), 4242);
        assert_eq!(u16::from_be_bytes([req[6], req[7]]), 0);
        assert_eq!(u32::from_be_bytes([req[8], req[9], req[10], req[11]]), 120);
    }

    #[test]
    fn natpmp_response_s1() {
        // S1: response[10..12] = 0xC350 (50000), response[12..16] = 0x78 (120)
        let mut bytes = [0u8; 16];
        bytes[0] = 0;
        bytes[1] = 0x81; // response bit set, op=1
        bytes[2..4].copy_from_slice(&0u16.to_be_bytes());
        bytes[10..12].copy_from_slice(&50000u16.to_be_bytes());
        bytes[12..16].copy_from_slice(&120u32.to_be_bytes());

        let parsed = parse_natpmp_response(&bytes).unwrap();
        assert_eq!(parsed.op, 1);
        assert_eq!(parsed.result_code, 0);
        assert_eq!(parsed.external_port, 50000);
        assert_eq!(parsed.lifetime, 120);
    }

    #[test]
    fn pcp_request_client_ip_is_ipv4_mapped() {
        let client = Ipv4Addr::new(192, 168, 1, 50);
        let req = build_pcp_map_request(client, 4242, 0, 7200, [1, 2, 3]);
        assert_eq!(req.len(), 60);
        assert_eq!(req[0], 2);
        assert_eq!(req[1], 1);
        assert_eq!(u32::from_be_bytes([req[4], req[5], req[6], req[7]]), 7200);
        assert_eq!(&req[8..18], &[0u8; 10]);
        assert_eq!(&req[18..20], &[0xff, 0xff]);
        assert_eq!(&req[20..24], &client.octets());
        assert_eq!(req[36], 17);
        assert_eq!(u16::from_be_bytes([req[40], req[41]]), 4242);
    }

    #[test]
    fn pcp_response_s2() {
        // S2: result=0, lifetime=3600, ext_port=50000, ext_ipv4=203.0.113.7
        let mut bytes = [0u8; 60];
        bytes[1] = 1;
        bytes[3] = 0;
        bytes[4..8].copy_from_slice(&3600u32.to_be_bytes());
        bytes[24..28].copy_from_slice(&0xAu32.to_be_bytes());
        bytes[28..32].copy_from_slice(&0xBu32.to_be_bytes());
        bytes[32..36].copy_from_slice(&0xCu32.to_be_bytes());
        bytes[42..44].copy_from_slice(&50000u16.to_be_bytes());
        bytes[56..60].copy_from_slice(&[203, 0, 113, 7]);

        let parsed = parse_pcp_response(&bytes).unwrap();
        assert_eq!(parsed.result_code, 0);
        assert_eq!(parsed.lifetime, 3600);
        assert_eq!(parsed.external_port, 50000);
        assert_eq!(parsed.external_ipv4, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(parsed.nonce_echo, [0xA, 0xB, 0xC]);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(
            parse_natpmp_response(&[0u8; 4]),
            Err(Error::TooShort { .. })
        ));
        assert!(matches!(
            parse_pcp_response(&[0u8; 10]),
            Err(Error::TooShort { .. })
        ));
    }
}
