//! EtherConn: a logical L2 endpoint registered with a Relay (spec §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::error::{ConfigError, RecvError, SendError};
use crate::frame::{self, DEFAULT_ETHER_TYPES, ETHER_TYPE_IPV4, ETHER_TYPE_IPV6};
use crate::mac::MacAddress;
use crate::queue::{CloseReason, DeliveryQueue, PopResult};
use crate::relay::{EndpointKey, Relay};
use crate::vlan::VlanStack;

/// Construction options (spec §4.3, §6 `EtherConnOption`).
#[derive(Clone)]
pub struct EtherConnOptions {
    pub vlans: VlanStack,
    pub ether_types: Vec<u16>,
    pub recv_multicast: bool,
    pub is_default: bool,
    /// Per-endpoint queue depth override. `None` defers to the owning
    /// Relay's `RelayOptions::recv_buffer_size` (spec §4.2 "receive-buffer
    /// size" / §4.3 "default depth configurable, e.g., 32").
    pub recv_queue_depth: Option<usize>,
}

impl Default for EtherConnOptions {
    fn default() -> Self {
        Self {
            vlans: VlanStack::empty(),
            ether_types: DEFAULT_ETHER_TYPES.to_vec(),
            recv_multicast: false,
            is_default: false,
            recv_queue_depth: None,
        }
    }
}

pub type EtherConnOption = Box<dyn FnOnce(&mut EtherConnOptions)>;

pub fn with_vlans(stack: VlanStack) -> EtherConnOption {
    Box::new(move |o| o.vlans = stack)
}

pub fn with_ether_types(types: Vec<u16>) -> EtherConnOption {
    Box::new(move |o| o.ether_types = types)
}

pub fn with_recv_multicast(enabled: bool) -> EtherConnOption {
    Box::new(move |o| o.recv_multicast = enabled)
}

pub fn with_default() -> EtherConnOption {
    Box::new(move |o| o.is_default = true)
}

pub fn with_recv_queue_depth(n: usize) -> EtherConnOption {
    Box::new(move |o| o.recv_queue_depth = Some(n))
}

/// A logical L2 endpoint scoped to (MAC, VLAN stack, allowed EtherTypes),
/// registered with exactly one `Relay` per EtherType in its allowed set
/// (spec §4.3).
pub struct EtherConn {
    mac: MacAddress,
    vlans: VlanStack,
    allowed_ether_types: Vec<u16>,
    recv_multicast: bool,
    is_default: bool,
    relay: Arc<Relay>,
    queue: Arc<DeliveryQueue>,
    read_deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl EtherConn {
    /// Registers `(mac, vlans, etherType)` with `relay` for every EtherType
    /// in the chosen set. If `default=true`, also installs into the
    /// Relay's default slot (spec §4.3 construction).
    pub fn new(
        mac: MacAddress,
        relay: Arc<Relay>,
        opts: Vec<EtherConnOption>,
    ) -> Result<Arc<Self>, ConfigError> {
        let mut options = EtherConnOptions::default();
        for opt in opts {
            opt(&mut options);
        }

        if options.ether_types.is_empty() {
            return Err(ConfigError::EmptyEtherTypeSet);
        }

        let depth = options
            .recv_queue_depth
            .unwrap_or(relay.options().recv_buffer_size);
        let queue = Arc::new(DeliveryQueue::new(depth));

        // Identifies this EtherConn's claim on the default slot, if any,
        // so a rollback can clear it along with the per-EtherType entries
        // already registered (spec §7: no partial construction).
        let default_owner = options
            .is_default
            .then(|| (mac, options.vlans.fingerprint()));

        let mut registered: Vec<EndpointKey> = Vec::new();
        for (i, &ether_type) in options.ether_types.iter().enumerate() {
            let key = EndpointKey::new(mac, &options.vlans, ether_type);
            // Only the first registration for a multi-EtherType EtherConn
            // installs the default slot; the slot is per-Relay, not
            // per-EtherType.
            let as_default = options.is_default && i == 0;
            if let Err(e) = relay.register(
                key.clone(),
                options.ether_types.clone(),
                options.recv_multicast,
                queue.clone(),
                as_default,
            ) {
                for done in &registered {
                    relay.unregister(done, default_owner.clone());
                }
                return Err(e);
            }
            registered.push(key);
        }

        Ok(Arc::new(Self {
            mac,
            vlans: options.vlans,
            allowed_ether_types: options.ether_types,
            recv_multicast: options.recv_multicast,
            is_default: options.is_default,
            relay,
            queue,
            read_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn vlans(&self) -> &VlanStack {
        &self.vlans
    }

    /// Serializes `(srcMac=self.mac, dstMac, self.vlans, etherType, payload)`
    /// and hands it to `Relay::send_frame`. EtherType is selected from the
    /// payload's first nibble (spec §4.3 `WriteIPPktTo`). Returns the
    /// number of payload bytes written (not the framed length).
    pub async fn write_ip_pkt_to(&self, payload: &[u8], dst_mac: MacAddress) -> Result<usize, SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        let version_nibble = payload.first().map(|b| b >> 4).unwrap_or(0);
        let ether_type = match version_nibble {
            0x4 => ETHER_TYPE_IPV4,
            0x6 => ETHER_TYPE_IPV6,
            other => return Err(SendError::UnknownIpVersion(other)),
        };

        let framed = frame::serialize(self.mac, dst_mac, &self.vlans, ether_type, payload);

        let mtu = self.relay.options().send_mtu;
        if framed.len() > mtu {
            return Err(SendError::FrameTooLarge {
                len: framed.len(),
                mtu,
            });
        }

        self.relay.send_frame(&framed).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotConnected {
                SendError::Closed
            } else {
                SendError::SendFailed(e.to_string())
            }
        })?;
        Ok(payload.len())
    }

    /// Dequeues the next accepted delivery (spec §4.3 `ReadPktFrom`),
    /// applying the acceptance tests in order: allowed-EtherType, then
    /// multicast policy. Rejected deliveries are dropped and the wait
    /// continues against the same deadline.
    pub async fn read_pkt_from(&self, buf: &mut [u8]) -> Result<(usize, MacAddress), RecvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecvError::Closed);
        }

        loop {
            let deadline = *self.read_deadline.lock().expect("deadline lock poisoned");
            match self.queue.pop(deadline).await {
                PopResult::Closed(CloseReason::Stopped) => return Err(RecvError::Closed),
                PopResult::Closed(CloseReason::Drained) => return Err(RecvError::QueueDrained),
                PopResult::Timeout => return Err(RecvError::Timeout),
                PopResult::Delivery(delivery) => {
                    // Step 1: EtherType must be allowed unless this is the
                    // default endpoint, which accepts anything delivered to
                    // it.
                    if !self.allowed_ether_types.contains(&delivery.ether_type) && !self.is_default {
                        continue;
                    }

                    // Step 2: multicast/broadcast policy, bypassed for the
                    // default endpoint (spec §4.3 step 2 exception).
                    if delivery.dst_mac.is_multicast() && !self.recv_multicast && !self.is_default {
                        continue;
                    }

                    let n = delivery.payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&delivery.payload[..n]);
                    return Ok((n, delivery.src_mac));
                }
            }
        }
    }

    /// Absolute deadline; `None` clears it (spec §4.3 `SetReadDeadline`).
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().expect("deadline lock poisoned") = deadline;
    }

    /// Unregisters every Relay entry this EtherConn holds and marks the
    /// queue drained. Idempotent. Must be awaited explicitly — this can't
    /// happen in `Drop` since unregistration is async.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close(CloseReason::Stopped);
        for &ether_type in &self.allowed_ether_types {
            let key = EndpointKey::new(self.mac, &self.vlans, ether_type);
            let default_owner = if self.is_default {
                Some((self.mac, self.vlans.fingerprint()))
            } else {
                None
            };
            self.relay.unregister(&key, default_owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Relay;
    use crate::transport::ChannelTransport;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x14, 0x11, 0x11, 0x11, 0x11, last])
    }

    fn test_relay() -> Arc<Relay> {
        let (a, _b) = ChannelTransport::pair();
        Relay::new(Box::new(a), vec![])
    }

    #[tokio::test]
    async fn new_rejects_empty_ether_type_set() {
        let relay = test_relay();
        let err = EtherConn::new(mac(1), relay, vec![with_ether_types(vec![])]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyEtherTypeSet);
    }

    #[tokio::test]
    async fn write_ip_pkt_to_rejects_unknown_ip_version() {
        let relay = test_relay();
        let conn = EtherConn::new(mac(1), relay, vec![]).unwrap();
        let bad_payload = [0x00u8; 8]; // version nibble 0, neither 4 nor 6
        let err = conn.write_ip_pkt_to(&bad_payload, mac(2)).await.unwrap_err();
        assert_eq!(err, SendError::UnknownIpVersion(0));
    }

    #[tokio::test]
    async fn write_after_relay_stop_is_rejected_as_closed() {
        let relay = test_relay();
        let conn = EtherConn::new(mac(1), relay.clone(), vec![]).unwrap();
        relay.stop().await;
        let err = conn
            .write_ip_pkt_to(&[0x45, 0, 0, 0, 0, 0, 0, 0], mac(2))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Closed);
    }

    #[tokio::test]
    async fn write_rejects_frame_exceeding_send_mtu() {
        let (a, _b) = ChannelTransport::pair();
        let relay = Relay::new(Box::new(a), vec![crate::relay::with_send_mtu(20)]);
        let conn = EtherConn::new(mac(1), relay, vec![]).unwrap();
        let payload = vec![0x45u8; 32]; // framed length (14 + 32) exceeds the 20-byte MTU
        let err = conn.write_ip_pkt_to(&payload, mac(2)).await.unwrap_err();
        assert!(matches!(err, SendError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let relay = test_relay();
        let conn = EtherConn::new(mac(1), relay, vec![]).unwrap();
        conn.close().await;
        let err = conn
            .write_ip_pkt_to(&[0x45, 0, 0, 0, 0, 0, 0, 0], mac(2))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unregisters_from_relay() {
        let relay = test_relay();
        let conn = EtherConn::new(mac(1), relay.clone(), vec![]).unwrap();
        conn.close().await;
        conn.close().await; // must not panic or double-unregister

        // The MAC is free again: a fresh EtherConn can claim it.
        let second = EtherConn::new(mac(1), relay, vec![]);
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn new_rolls_back_partial_registration_on_collision() {
        let relay = test_relay();
        // Claims only the IPv4 EtherType at this MAC/VLAN combination.
        let _blocker = EtherConn::new(
            mac(1),
            relay.clone(),
            vec![with_ether_types(vec![ETHER_TYPE_IPV4])],
        )
        .unwrap();

        // A second EtherConn wanting both default EtherTypes collides on
        // the second iteration (IPv4 already taken) — the whole
        // construction must fail, rolling back the IPv6 registration
        // that succeeded on the first iteration.
        let err = EtherConn::new(
            mac(1),
            relay.clone(),
            vec![with_ether_types(vec![ETHER_TYPE_IPV6, ETHER_TYPE_IPV4])],
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateEndpointKey);

        // IPv6 at this MAC must be free again after the rollback.
        let retry = EtherConn::new(mac(1), relay, vec![with_ether_types(vec![ETHER_TYPE_IPV6])]);
        assert!(retry.is_ok());
    }
}
