//! VLAN tag and VLAN stack value types (spec §3).
//!
//! Validation mirrors `examples/rust-netlink-netlink-packet-route/src/net/ethernet.rs`'s
//! `VlanId::new` (reject ids >= 4096 with a typed error) generalized to an
//! ordered stack with spec-mandated render and fingerprint semantics.

use crate::error::ConfigError;

/// Canonical outer-tag EtherTypes (802.1Q / 802.1ad).
pub const TPID_CTAG: u16 = 0x8100;
pub const TPID_STAG: u16 = 0x88a8;

/// A single 802.1Q/ad tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vlan {
    id: u16,
    ether_type: u16,
}

impl Vlan {
    /// `id` must be `<= 4095` (spec §3 invariant).
    pub fn new(id: u16, ether_type: u16) -> Result<Self, ConfigError> {
        if id > 4095 {
            return Err(ConfigError::InvalidVlanId(id));
        }
        Ok(Self { id, ether_type })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn ether_type(&self) -> u16 {
        self.ether_type
    }
}

/// An ordered stack of VLAN tags, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VlanStack(Vec<Vlan>);

impl VlanStack {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(tags: Vec<Vlan>) -> Self {
        Self(tags)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tags(&self) -> &[Vlan] {
        &self.0
    }

    /// `"|id1|id2|..."`, outermost first; `""` when empty (spec §3/§8).
    pub fn render(&self) -> String {
        self.0.iter().fold(String::new(), |mut acc, tag| {
            acc.push('|');
            acc.push_str(&tag.id.to_string());
            acc
        })
    }

    /// A string usable as a map key that agrees with `VlanStack` equality:
    /// equal stacks (same length, pairwise-equal id *and* ether_type)
    /// yield equal fingerprints, resolving the "registry key
    /// canonicalization" open question (spec §9) with the render plus
    /// per-tag EtherTypes appended.
    pub fn fingerprint(&self) -> String {
        self.0.iter().fold(String::new(), |mut acc, tag| {
            acc.push_str(&format!("|{:04x}:{:04x}", tag.id, tag.ether_type));
            acc
        })
    }

    /// Replaces every tag's id in place, preserving each tag's EtherType.
    /// Fails unless `new_ids.len() == self.len()` (spec §3).
    pub fn set_ids(&mut self, new_ids: &[u16]) -> Result<(), ConfigError> {
        if new_ids.len() != self.0.len() {
            return Err(ConfigError::VlanSetIdsLengthMismatch {
                stack_len: self.0.len(),
                new_len: new_ids.len(),
            });
        }
        for (tag, &id) in self.0.iter_mut().zip(new_ids.iter()) {
            if id > 4095 {
                return Err(ConfigError::InvalidVlanId(id));
            }
            tag.id = id;
        }
        Ok(())
    }
}

/// `true` iff `etype` is a recognized tag TPID (0x8100 or 0x88a8).
pub fn is_tag_ether_type(etype: u16) -> bool {
    etype == TPID_CTAG || etype == TPID_STAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stack_renders_empty_string() {
        assert_eq!(VlanStack::empty().render(), "");
    }

    #[test]
    fn qinq_stack_renders_pipe_joined() {
        let stack = VlanStack::new(vec![
            Vlan::new(100, TPID_STAG).unwrap(),
            Vlan::new(222, TPID_CTAG).unwrap(),
        ]);
        assert_eq!(stack.render(), "|100|222");
    }

    #[test]
    fn rejects_id_above_4095() {
        assert_eq!(Vlan::new(4096, TPID_CTAG), Err(ConfigError::InvalidVlanId(4096)));
        assert!(Vlan::new(4095, TPID_CTAG).is_ok());
    }

    #[test]
    fn equal_stacks_have_equal_fingerprints() {
        let a = VlanStack::new(vec![Vlan::new(100, TPID_CTAG).unwrap()]);
        let b = VlanStack::new(vec![Vlan::new(100, TPID_CTAG).unwrap()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a, b);
    }

    #[test]
    fn different_ether_type_differs_fingerprint_even_if_id_equal() {
        let a = VlanStack::new(vec![Vlan::new(100, TPID_CTAG).unwrap()]);
        let b = VlanStack::new(vec![Vlan::new(100, TPID_STAG).unwrap()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn set_ids_requires_matching_length() {
        let mut stack = VlanStack::new(vec![
            Vlan::new(1, TPID_CTAG).unwrap(),
            Vlan::new(2, TPID_CTAG).unwrap(),
        ]);
        assert!(stack.set_ids(&[10]).is_err());
        assert!(stack.set_ids(&[10, 20]).is_ok());
        assert_eq!(stack.tags()[0].id(), 10);
        assert_eq!(stack.tags()[1].id(), 20);
        // EtherTypes preserved.
        assert_eq!(stack.tags()[0].ether_type(), TPID_CTAG);
    }

    #[test]
    fn set_ids_rejects_out_of_range_id() {
        let mut stack = VlanStack::new(vec![Vlan::new(1, TPID_CTAG).unwrap()]);
        assert!(stack.set_ids(&[5000]).is_err());
    }
}
