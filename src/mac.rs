//! Ethernet MAC addresses.
//!
//! Generalizes `examples/Naxaes-packet-analyser/src/shared.rs`'s
//! capture-internal `MacAddress` into a type fit for a public API: colon-hex
//! `Display`, a `FromStr` for building endpoints from user-supplied strings,
//! and the broadcast constant spec §3 names.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// A 6-byte Ethernet hardware address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

/// `FF:FF:FF:FF:FF:FF` (spec §3).
pub const BROADCAST_MAC: MacAddress = MacAddress([0xff; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        if data.len() != 6 {
            return Err(ConfigError::InvalidMac(format!(
                "expected 6 bytes, got {}",
                data.len()
            )));
        }
        let mut octets = [0u8; 6];
        octets.copy_from_slice(data);
        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Low bit of the first octet set means multicast (broadcast included).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST_MAC
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}
