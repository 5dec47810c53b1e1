//! RUDPConn: a connectionless UDP-over-raw-Ethernet endpoint layered on an
//! `EtherConn` (spec §4.4). Performs IPv4/IPv6 + UDP encapsulation on send
//! and strips/validates those headers on receive without touching the
//! host OS's IP stack.
//!
//! Header field accessors generalize
//! `examples/Naxaes-packet-analyser/src/ipv4.rs`'s bit-level `BitArray`
//! reader into a builder that also serializes, since this crate must
//! originate IP/UDP headers, not just inspect them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::time::Instant;

use crate::error::{ConfigError, RecvError, SendError};
use crate::etherconn::EtherConn;
use crate::mac::MacAddress;

const PROTO_UDP: u8 = 17;

/// Resolves a next-hop MAC for an IP destination (spec §4.4, "resolver
/// callback" design note: this replaces any ARP/ND logic in the core).
#[async_trait]
pub trait ResolveNextHopMac: Send + Sync {
    async fn resolve(&self, dst: IpAddr) -> Option<MacAddress>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpAddr {
    pub ip: IpAddr,
    pub port: u16,
}

/// Construction options (spec §4.4, §6 `RUDPConnOption`).
pub struct RUDPConnOptions {
    pub resolve_next_hop_mac: Option<Arc<dyn ResolveNextHopMac>>,
}

impl Default for RUDPConnOptions {
    fn default() -> Self {
        Self {
            resolve_next_hop_mac: None,
        }
    }
}

pub type RUDPConnOption = Box<dyn FnOnce(&mut RUDPConnOptions)>;

pub fn with_resolve_next_hop_mac_func(resolver: Arc<dyn ResolveNextHopMac>) -> RUDPConnOption {
    Box::new(move |o| o.resolve_next_hop_mac = Some(resolver))
}

/// A UDP-socket-like API backed by an `EtherConn` (spec §4.4).
pub struct RUDPConn {
    local_ip: IpAddr,
    local_port: u16,
    ether_conn: Arc<EtherConn>,
    resolver: Option<Arc<dyn ResolveNextHopMac>>,
}

impl RUDPConn {
    /// Parses `addr_str` as `"IP:port"` (IPv4 or bracketed IPv6) and binds
    /// to it (spec §4.4 construction).
    pub fn new(
        addr_str: &str,
        ether_conn: Arc<EtherConn>,
        opts: Vec<RUDPConnOption>,
    ) -> Result<Self, ConfigError> {
        let mut options = RUDPConnOptions::default();
        for opt in opts {
            opt(&mut options);
        }

        let socket_addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr_str.to_string()))?;

        Ok(Self {
            local_ip: socket_addr.ip(),
            local_port: socket_addr.port(),
            ether_conn,
            resolver: options.resolve_next_hop_mac,
        })
    }

    pub fn local_addr(&self) -> UdpAddr {
        UdpAddr {
            ip: self.local_ip,
            port: self.local_port,
        }
    }

    /// Builds a UDP header, wraps it in an IPv4 or IPv6 header matching the
    /// address families, resolves the next-hop MAC, and delegates to
    /// `EtherConn::write_ip_pkt_to` (spec §4.4 `WriteTo`).
    pub async fn write_to(&self, payload: &[u8], to: UdpAddr) -> Result<usize, SendError> {
        if self.local_ip.is_unspecified() {
            // An unspecified local address has no family to check against;
            // nothing here constrains the outgoing datagram's family
            // beyond `to`'s own.
        } else if std::mem::discriminant(&family_tag(self.local_ip))
            != std::mem::discriminant(&family_tag(to.ip))
        {
            return Err(SendError::AddressFamilyMismatch);
        }

        let udp_segment = build_udp_segment(self.local_ip, self.local_port, to.ip, to.port, payload);

        let ip_datagram = match (self.local_ip, to.ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => build_ipv4_datagram(src, dst, &udp_segment),
            (IpAddr::V6(src), IpAddr::V6(dst)) => build_ipv6_datagram(src, dst, &udp_segment),
            _ => return Err(SendError::AddressFamilyMismatch),
        };

        let dst_mac = match &self.resolver {
            Some(resolver) => resolver
                .resolve(to.ip)
                .await
                .ok_or(SendError::NoNextHopResolver)?,
            // No resolver configured: only broadcast/multicast
            // destinations can proceed, since their MAC is derivable
            // without ARP/ND (spec §4.4: "if no resolver is supplied and
            // sends require non-broadcast destinations, sends fail").
            None => broadcast_or_multicast_mac(to.ip).ok_or(SendError::NoNextHopResolver)?,
        };

        self.ether_conn.write_ip_pkt_to(&ip_datagram, dst_mac).await?;
        Ok(payload.len())
    }

    /// Reads the next frame, parses the outer IP header, validates it's UDP
    /// addressed to this binding, and copies the UDP payload into `buf`
    /// (spec §4.4 `ReadFrom`). Non-UDP frames, wrong-destination frames,
    /// and checksum mismatches are dropped and retried, never surfaced.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, UdpAddr), RecvError> {
        let mut scratch = vec![0u8; 65535];
        loop {
            let (n, _src_mac) = self.ether_conn.read_pkt_from(&mut scratch).await?;
            let datagram = &scratch[..n];

            let parsed = match parse_ip_datagram(datagram) {
                Some(p) => p,
                None => continue,
            };

            if parsed.protocol != PROTO_UDP {
                continue;
            }

            let udp = match parse_udp_segment(&parsed.payload) {
                Some(u) => u,
                None => continue,
            };

            if !self.local_ip.is_unspecified() && parsed.dst_ip != self.local_ip {
                continue;
            }
            if udp.dst_port != self.local_port {
                continue;
            }
            if !verify_udp_checksum(parsed.src_ip, parsed.dst_ip, &parsed.payload) {
                continue;
            }

            let copy_len = udp.payload.len().min(buf.len());
            buf[..copy_len].copy_from_slice(&udp.payload[..copy_len]);
            return Ok((
                copy_len,
                UdpAddr {
                    ip: parsed.src_ip,
                    port: udp.src_port,
                },
            ));
        }
    }

    /// Forwards to the underlying `EtherConn`'s deadline (spec §4.4).
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.ether_conn.set_read_deadline(deadline);
    }

    /// Does not close the underlying `EtherConn` (spec §3 lifecycle).
    pub async fn close(&self) {}
}

#[derive(Clone, Copy)]
enum FamilyTag {
    V4,
    V6,
}

fn family_tag(ip: IpAddr) -> FamilyTag {
    match ip {
        IpAddr::V4(_) => FamilyTag::V4,
        IpAddr::V6(_) => FamilyTag::V6,
    }
}

/// MAC a destination IP maps to without needing a resolver: the IPv4
/// limited broadcast address, standard IPv4/IPv6 multicast-to-MAC mapping
/// (RFC 1112 / RFC 2464). Returns `None` for any unicast address.
fn broadcast_or_multicast_mac(ip: IpAddr) -> Option<MacAddress> {
    match ip {
        IpAddr::V4(v4) if v4.is_broadcast() => Some(crate::mac::BROADCAST_MAC),
        IpAddr::V4(v4) if v4.is_multicast() => {
            let o = v4.octets();
            Some(MacAddress::new([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]))
        }
        IpAddr::V6(v6) if v6.is_multicast() => {
            let o = v6.octets();
            Some(MacAddress::new([0x33, 0x33, o[12], o[13], o[14], o[15]]))
        }
        _ => None,
    }
}

fn build_udp_segment(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let length = 8 + payload.len();
    let mut segment = vec![0u8; length];
    BigEndian::write_u16(&mut segment[0..2], src_port);
    BigEndian::write_u16(&mut segment[2..4], dst_port);
    BigEndian::write_u16(&mut segment[4..6], length as u16);
    segment[8..].copy_from_slice(payload);

    let checksum = udp_checksum(src_ip, dst_ip, &segment);
    BigEndian::write_u16(&mut segment[6..8], checksum);
    segment
}

/// One's-complement sum over the UDP pseudo-header + segment (RFC 768).
/// A zero result is transmitted as `0xFFFF` for IPv4 per RFC 768; IPv6
/// never transmits a zero UDP checksum (RFC 8200 §8.1).
fn udp_checksum(src_ip: IpAddr, dst_ip: IpAddr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum += sum16(&src.octets());
            sum += sum16(&dst.octets());
            sum += PROTO_UDP as u32;
            sum += segment.len() as u32;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum += sum16(&src.octets());
            sum += sum16(&dst.octets());
            sum += (segment.len() as u32) >> 16;
            sum += (segment.len() as u32) & 0xffff;
            sum += PROTO_UDP as u32;
        }
        _ => {}
    }

    sum += sum16(segment);

    let folded = fold_checksum(sum);
    let complemented = !folded;
    if complemented == 0 {
        0xffff
    } else {
        complemented
    }
}

fn verify_udp_checksum(src_ip: IpAddr, dst_ip: IpAddr, udp_segment: &[u8]) -> bool {
    if udp_segment.len() < 8 {
        return false;
    }
    let received = BigEndian::read_u16(&udp_segment[6..8]);
    if received == 0 {
        // Checksum disabled (only legal over IPv4).
        return matches!(src_ip, IpAddr::V4(_));
    }
    // Recompute with the checksum field zeroed, same as on send.
    let mut scratch = udp_segment.to_vec();
    scratch[6] = 0;
    scratch[7] = 0;
    udp_checksum(src_ip, dst_ip, &scratch) == received
}

fn build_ipv4_datagram(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut datagram = vec![0u8; total_len];

    datagram[0] = (4 << 4) | 5; // version=4, IHL=5 (no options)
    datagram[1] = 0; // DSCP/ECN
    BigEndian::write_u16(&mut datagram[2..4], total_len as u16);
    let id: u16 = rand::random();
    BigEndian::write_u16(&mut datagram[4..6], id);
    BigEndian::write_u16(&mut datagram[6..8], 0); // flags/fragment offset
    datagram[8] = 64; // TTL
    datagram[9] = PROTO_UDP;
    BigEndian::write_u16(&mut datagram[10..12], 0); // checksum, filled below
    datagram[12..16].copy_from_slice(&src.octets());
    datagram[16..20].copy_from_slice(&dst.octets());
    datagram[20..].copy_from_slice(payload);

    let checksum = fold_checksum(sum16(&datagram[0..20])) ^ 0xffff;
    BigEndian::write_u16(&mut datagram[10..12], checksum);
    datagram
}

fn build_ipv6_datagram(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; 40 + payload.len()];

    datagram[0] = 6 << 4; // version=6, traffic class/flow label = 0
    BigEndian::write_u16(&mut datagram[4..6], payload.len() as u16); // payload length
    datagram[6] = PROTO_UDP; // next header
    datagram[7] = 64; // hop limit
    datagram[8..24].copy_from_slice(&src.octets());
    datagram[24..40].copy_from_slice(&dst.octets());
    datagram[40..].copy_from_slice(payload);
    datagram
}

struct ParsedIpDatagram {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: u8,
    payload: Vec<u8>,
}

fn parse_ip_datagram(datagram: &[u8]) -> Option<ParsedIpDatagram> {
    if datagram.is_empty() {
        return None;
    }
    match datagram[0] >> 4 {
        4 => parse_ipv4_datagram(datagram),
        6 => parse_ipv6_datagram(datagram),
        _ => None,
    }
}

fn parse_ipv4_datagram(datagram: &[u8]) -> Option<ParsedIpDatagram> {
    if datagram.len() < 20 {
        return None;
    }
    let ihl = (datagram[0] & 0x0f) as usize * 4;
    if datagram.len() < ihl {
        return None;
    }
    let protocol = datagram[9];
    let src_ip = IpAddr::V4(Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]));
    Some(ParsedIpDatagram {
        src_ip,
        dst_ip,
        protocol,
        payload: datagram[ihl..].to_vec(),
    })
}

fn parse_ipv6_datagram(datagram: &[u8]) -> Option<ParsedIpDatagram> {
    if datagram.len() < 40 {
        return None;
    }
    let protocol = datagram[6];
    let mut src = [0u8; 16];
    src.copy_from_slice(&datagram[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&datagram[24..40]);
    Some(ParsedIpDatagram {
        src_ip: IpAddr::V6(Ipv6Addr::from(src)),
        dst_ip: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol,
        payload: datagram[40..].to_vec(),
    })
}

struct ParsedUdpSegment {
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

fn parse_udp_segment(segment: &[u8]) -> Option<ParsedUdpSegment> {
    if segment.len() < 8 {
        return None;
    }
    let src_port = BigEndian::read_u16(&segment[0..2]);
    let dst_port = BigEndian::read_u16(&segment[2..4]);
    let length = BigEndian::read_u16(&segment[4..6]) as usize;
    if length < 8 || length > segment.len() {
        return None;
    }
    Some(ParsedUdpSegment {
        src_port,
        dst_port,
        payload: segment[8..length].to_vec(),
    })
}

/// Sums 16-bit big-endian words, padding a trailing odd byte with a zero
/// low byte; the caller folds and complements.
fn sum16(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += BigEndian::read_u16(chunk) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_datagram_round_trips_headers() {
        let src = Ipv4Addr::new(1, 1, 1, 1);
        let dst = Ipv4Addr::new(1, 1, 1, 100);
        let udp = build_udp_segment(IpAddr::V4(src), 1999, IpAddr::V4(dst), 2999, b"hello");
        let datagram = build_ipv4_datagram(src, dst, &udp);

        let parsed = parse_ip_datagram(&datagram).unwrap();
        assert_eq!(parsed.src_ip, IpAddr::V4(src));
        assert_eq!(parsed.dst_ip, IpAddr::V4(dst));
        assert_eq!(parsed.protocol, PROTO_UDP);

        let udp_parsed = parse_udp_segment(&parsed.payload).unwrap();
        assert_eq!(udp_parsed.src_port, 1999);
        assert_eq!(udp_parsed.dst_port, 2999);
        assert_eq!(udp_parsed.payload, b"hello");
    }

    #[test]
    fn ipv6_datagram_round_trips_headers() {
        let src: Ipv6Addr = "2001:dead::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:beef::1".parse().unwrap();
        let udp = build_udp_segment(IpAddr::V6(src), 1999, IpAddr::V6(dst), 2999, b"world!!");
        let datagram = build_ipv6_datagram(src, dst, &udp);

        let parsed = parse_ip_datagram(&datagram).unwrap();
        assert_eq!(parsed.src_ip, IpAddr::V6(src));
        assert_eq!(parsed.dst_ip, IpAddr::V6(dst));

        let udp_parsed = parse_udp_segment(&parsed.payload).unwrap();
        assert_eq!(udp_parsed.payload, b"world!!");
    }

    #[test]
    fn udp_checksum_verifies() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let segment = build_udp_segment(src, 100, dst, 200, b"payload-bytes");
        assert!(verify_udp_checksum(src, dst, &segment));
    }

    #[test]
    fn udp_checksum_detects_corruption() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let mut segment = build_udp_segment(src, 100, dst, 200, b"payload-bytes");
        let last = segment.len() - 1;
        segment[last] ^= 0xff;
        assert!(!verify_udp_checksum(src, dst, &segment));
    }

    #[test]
    fn ipv4_header_checksum_is_self_consistent() {
        let src = Ipv4Addr::new(192, 168, 1, 1);
        let dst = Ipv4Addr::new(192, 168, 1, 2);
        let datagram = build_ipv4_datagram(src, dst, &[0u8; 8]);
        // Summing the whole header (with the transmitted checksum in
        // place) over ones-complement arithmetic must fold to zero.
        let sum = fold_checksum(sum16(&datagram[0..20]));
        assert_eq!(sum, 0xffff);
    }
}
