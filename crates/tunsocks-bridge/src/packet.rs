//! Diagnostic decoder for raw IP datagrams.
//!
//! Turns one packet read from a TUN device into a [`ParsedPacket`] summary.
//! Nothing in the bridge data path depends on it; it exists for logging and
//! the `tunsocks decode` command.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::Serialize;

/// Transport protocol carried by a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "OTHER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Normalized view of one IP datagram.
///
/// Ports are present for TCP and UDP only, flags for TCP only. `payload` is
/// the transport payload for TCP and UDP, the whole ICMP message for ICMP,
/// and absent for other protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedPacket {
    pub protocol: Protocol,
    pub source_address: String,
    pub dest_address: String,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub payload: Option<Vec<u8>>,
    pub flags: Option<TcpFlags>,
}

impl fmt::Display for ParsedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.protocol)?;
        match (self.source_port, self.dest_port) {
            (Some(sp), Some(dp)) => write!(
                f,
                "{} -> {}",
                endpoint(&self.source_address, sp),
                endpoint(&self.dest_address, dp)
            )?,
            _ => write!(f, "{} -> {}", self.source_address, self.dest_address)?,
        }
        if let Some(flags) = &self.flags {
            write!(f, " {flags}")?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " len={}", payload.len())?;
        }
        Ok(())
    }
}

fn endpoint(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Decode a raw IP datagram.
///
/// Returns `None` for anything that is not a complete, well-formed IPv4 or
/// IPv6 packet. Never panics.
pub fn parse(data: &[u8]) -> Option<ParsedPacket> {
    let version = data.first()? >> 4;
    if version != 4 && version != 6 {
        return None;
    }

    let sliced = SlicedPacket::from_ip(data).ok()?;

    let (source_address, dest_address, ip_payload) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                Ipv4Addr::from(header.source()).to_string(),
                Ipv4Addr::from(header.destination()).to_string(),
                ipv4.payload().payload,
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                Ipv6Addr::from(header.source()).to_string(),
                Ipv6Addr::from(header.destination()).to_string(),
                ipv6.payload().payload,
            )
        }
        #[allow(unreachable_patterns)]
        _ => return None,
    };

    let mut packet = ParsedPacket {
        protocol: Protocol::Other,
        source_address,
        dest_address,
        source_port: None,
        dest_port: None,
        payload: None,
        flags: None,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            packet.protocol = Protocol::Tcp;
            packet.source_port = Some(tcp.source_port());
            packet.dest_port = Some(tcp.destination_port());
            packet.payload = Some(tcp.payload().to_vec());
            packet.flags = Some(TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
            });
        }
        Some(TransportSlice::Udp(udp)) => {
            packet.protocol = Protocol::Udp;
            packet.source_port = Some(udp.source_port());
            packet.dest_port = Some(udp.destination_port());
            packet.payload = Some(udp.payload().to_vec());
        }
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => {
            packet.protocol = Protocol::Icmp;
            packet.payload = Some(ip_payload.to_vec());
        }
        _ => {}
    }

    Some(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// IPv4 header with a correct checksum and the given payload.
    fn ipv4(protocol: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = (20 + payload.len()) as u16;
        let mut header = vec![
            0x45, 0x00, 0, 0, // version/IHL, TOS, total length
            0x00, 0x01, 0x40, 0x00, // id, DF
            64, protocol, 0, 0, // TTL, protocol, checksum
        ];
        header[2..4].copy_from_slice(&total.to_be_bytes());
        header.extend_from_slice(&src);
        header.extend_from_slice(&dst);

        let mut sum: u32 = header
            .chunks(2)
            .map(|w| u32::from(u16::from_be_bytes([w[0], w[1]])))
            .sum();
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        header[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());

        header.extend_from_slice(payload);
        header
    }

    fn tcp_segment(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&1u32.to_be_bytes()); // seq
        segment.extend_from_slice(&0u32.to_be_bytes()); // ack
        segment.push(0x50); // data offset 5 words
        segment.push(flags);
        segment.extend_from_slice(&[0xFF, 0xFF, 0, 0, 0, 0]); // window, checksum, urgent
        segment.extend_from_slice(payload);
        segment
    }

    fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&src_port.to_be_bytes());
        datagram.extend_from_slice(&dst_port.to_be_bytes());
        datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        datagram.extend_from_slice(&[0, 0]);
        datagram.extend_from_slice(payload);
        datagram
    }

    // ========================================================================
    // IPv4
    // ========================================================================

    #[test]
    fn test_ipv4_tcp_syn() {
        let data = ipv4(6, [10, 0, 0, 1], [93, 184, 216, 34], &tcp_segment(51000, 443, 0x02, &[]));
        let packet = parse(&data).unwrap();

        assert_eq!(packet.protocol, Protocol::Tcp);
        assert_eq!(packet.source_address, "10.0.0.1");
        assert_eq!(packet.dest_address, "93.184.216.34");
        assert_eq!(packet.source_port, Some(51000));
        assert_eq!(packet.dest_port, Some(443));
        assert_eq!(packet.payload, Some(vec![]));
        assert_eq!(
            packet.flags,
            Some(TcpFlags {
                syn: true,
                ..Default::default()
            })
        );
        assert_eq!(packet.to_string(), "TCP 10.0.0.1:51000 -> 93.184.216.34:443 [SYN] len=0");
    }

    #[test]
    fn test_ipv4_tcp_psh_ack_with_payload() {
        let data = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp_segment(1, 2, 0x18, b"abc"));
        let packet = parse(&data).unwrap();

        let flags = packet.flags.unwrap();
        assert!(flags.psh && flags.ack);
        assert!(!flags.syn && !flags.fin && !flags.rst);
        assert_eq!(packet.payload.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_ipv4_udp() {
        let data = ipv4(17, [192, 168, 1, 5], [8, 8, 8, 8], &udp_datagram(5353, 53, b"query"));
        let packet = parse(&data).unwrap();

        assert_eq!(packet.protocol, Protocol::Udp);
        assert_eq!(packet.source_port, Some(5353));
        assert_eq!(packet.dest_port, Some(53));
        assert_eq!(packet.payload.as_deref(), Some(&b"query"[..]));
        assert!(packet.flags.is_none());
    }

    #[test]
    fn test_ipv4_icmp_echo() {
        let echo = [8, 0, 0xF7, 0xFF, 0, 0, 0, 0];
        let data = ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &echo);
        let packet = parse(&data).unwrap();

        assert_eq!(packet.protocol, Protocol::Icmp);
        assert_eq!(packet.source_port, None);
        assert_eq!(packet.dest_port, None);
        assert_eq!(packet.payload, Some(echo.to_vec()));
        assert_eq!(packet.to_string(), "ICMP 10.0.0.1 -> 10.0.0.2 len=8");
    }

    #[test]
    fn test_ipv4_unknown_protocol_keeps_addresses_only() {
        let data = ipv4(47, [10, 0, 0, 1], [10, 0, 0, 2], &[0, 0, 0x08, 0x00]);
        let packet = parse(&data).unwrap();

        assert_eq!(packet.protocol, Protocol::Other);
        assert_eq!(packet.source_address, "10.0.0.1");
        assert_eq!(packet.dest_address, "10.0.0.2");
        assert!(packet.source_port.is_none());
        assert!(packet.payload.is_none());
        assert!(packet.flags.is_none());
    }

    // ========================================================================
    // IPv6
    // ========================================================================

    #[test]
    fn test_ipv6_udp() {
        let udp = udp_datagram(40000, 53, b"hi");
        let mut data = vec![0x60, 0, 0, 0];
        data.extend_from_slice(&(udp.len() as u16).to_be_bytes());
        data.push(17); // next header
        data.push(64); // hop limit
        let mut src = [0u8; 16];
        src[0] = 0xFD;
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[0] = 0xFD;
        dst[15] = 2;
        data.extend_from_slice(&src);
        data.extend_from_slice(&dst);
        data.extend_from_slice(&udp);

        let packet = parse(&data).unwrap();
        assert_eq!(packet.protocol, Protocol::Udp);
        assert_eq!(packet.source_address, "fd00::1");
        assert_eq!(packet.dest_address, "fd00::2");
        assert_eq!(packet.dest_port, Some(53));
        assert_eq!(packet.to_string(), "UDP [fd00::1]:40000 -> [fd00::2]:53 len=2");
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    #[test]
    fn test_empty_and_one_byte_buffers() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[0x45]).is_none());
    }

    #[test]
    fn test_unknown_ip_version() {
        let mut data = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp_segment(1, 2, 0x02, &[]));
        data[0] = 0x55;
        assert!(parse(&data).is_none());
    }

    #[test]
    fn test_truncated_tcp_header() {
        let full = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp_segment(1, 2, 0x02, &[]));
        assert!(parse(&full[..30]).is_none());
    }

    #[test]
    fn test_parsed_packet_serializes() {
        let data = ipv4(17, [10, 0, 0, 1], [10, 0, 0, 2], &udp_datagram(1, 2, &[]));
        let json = serde_json::to_value(parse(&data).unwrap()).unwrap();
        assert_eq!(json["protocol"], "udp");
        assert_eq!(json["dest_port"], 2);
        assert!(json["flags"].is_null());
    }
}
