//! Ethernet-II frame codec with zero or more 802.1Q/ad VLAN tags (spec §4.1).
//!
//! Offset layout follows `examples/Naxaes-packet-analyser/src/ethernet.rs`'s
//! `DEST_MAC_ADDRESS_OFFSET`/`SRC_MAC_ADDRESS_OFFSET`/`ETHER_TYPE_OFFSET`
//! constants, generalized to walk a variable number of VLAN tags before
//! reaching the inner EtherType.

use byteorder::{BigEndian, ByteOrder};

use crate::error::FrameError;
use crate::mac::MacAddress;
use crate::vlan::{is_tag_ether_type, Vlan, VlanStack};

const MAC_LEN: usize = 6;
const TAG_LEN: usize = 4;
const HEADER_MIN_LEN: usize = 2 * MAC_LEN + 2; // dst + src + inner ethertype

/// Common EtherTypes this crate cares about (spec §3).
pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_IPV6: u16 = 0x86dd;

/// `DefaultEtherTypes = {0x0800, 0x86DD}` (spec §3).
pub const DEFAULT_ETHER_TYPES: [u16; 2] = [ETHER_TYPE_IPV4, ETHER_TYPE_IPV6];

/// The parsed fields of an Ethernet-II frame (spec §4.1 `Parse`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub vlans: VlanStack,
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

/// Builds `dstMac(6) || srcMac(6) || {vlan.ether_type(2), tci(2)}* || etherType(2) || payload`.
/// No padding is added here; that's the raw socket/NIC's job (spec §4.1).
pub fn serialize(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    vlans: &VlanStack,
    ether_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_MIN_LEN + TAG_LEN * vlans.len() + payload.len());
    out.extend_from_slice(&dst_mac.octets());
    out.extend_from_slice(&src_mac.octets());
    for tag in vlans.tags() {
        let mut etype_buf = [0u8; 2];
        BigEndian::write_u16(&mut etype_buf, tag.ether_type());
        out.extend_from_slice(&etype_buf);

        // TCI: priority=0, DEI=0, 12-bit id.
        let tci = tag.id() & 0x0fff;
        let mut tci_buf = [0u8; 2];
        BigEndian::write_u16(&mut tci_buf, tci);
        out.extend_from_slice(&tci_buf);
    }
    let mut etype_buf = [0u8; 2];
    BigEndian::write_u16(&mut etype_buf, ether_type);
    out.extend_from_slice(&etype_buf);
    out.extend_from_slice(payload);
    out
}

/// Reads MACs, then repeatedly consumes `(tag_ether_type, tci)` pairs while
/// the next EtherType-position bytes are a recognized tag TPID; the first
/// non-tag EtherType is `innerEtherType` and the rest is `payload`.
pub fn parse(frame: &[u8]) -> Result<ParsedFrame, FrameError> {
    if frame.len() < HEADER_MIN_LEN {
        return Err(FrameError::TooShort { len: frame.len() });
    }

    let dst_mac = MacAddress::from_slice(&frame[0..6]).expect("slice is exactly 6 bytes");
    let src_mac = MacAddress::from_slice(&frame[6..12]).expect("slice is exactly 6 bytes");

    let mut offset = 12;
    let mut tags = Vec::new();
    loop {
        if offset + 2 > frame.len() {
            return Err(FrameError::TruncatedTag { offset });
        }
        let candidate = BigEndian::read_u16(&frame[offset..offset + 2]);
        if !is_tag_ether_type(candidate) {
            break;
        }
        if offset + TAG_LEN > frame.len() {
            return Err(FrameError::TruncatedTag { offset });
        }
        let tci = BigEndian::read_u16(&frame[offset + 2..offset + 4]);
        let id = tci & 0x0fff;
        tags.push(Vlan::new(id, candidate).expect("masked to 12 bits"));
        offset += TAG_LEN;
    }

    if offset + 2 > frame.len() {
        return Err(FrameError::TruncatedTag { offset });
    }
    let ether_type = BigEndian::read_u16(&frame[offset..offset + 2]);
    let payload = frame[offset + 2..].to_vec();

    Ok(ParsedFrame {
        dst_mac,
        src_mac,
        vlans: VlanStack::new(tags),
        ether_type,
        payload,
    })
}
