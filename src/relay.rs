//! The Relay: single owner of a raw socket, one receive task, a registry of
//! endpoints keyed by (dst MAC, VLAN-stack fingerprint, EtherType), and an
//! optional default-endpoint slot (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConfigError;
use crate::frame::{self, ParsedFrame};
use crate::mac::MacAddress;
use crate::queue::{CloseReason, DeliveryQueue};
use crate::transport::RawTransport;
use crate::vlan::VlanStack;

/// The key the Relay uses to demultiplex received frames (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub mac: MacAddress,
    pub vlan_fingerprint: String,
    pub ether_type: u16,
}

impl EndpointKey {
    pub fn new(mac: MacAddress, vlans: &VlanStack, ether_type: u16) -> Self {
        Self {
            mac,
            vlan_fingerprint: vlans.fingerprint(),
            ether_type,
        }
    }
}

/// A delivered frame, post-demux, handed to an `EtherConn`'s queue (spec
/// §4.2 step 4): the source MAC, the inner EtherType and the L3 payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

/// The Relay's half of an endpoint registration: where to enqueue
/// deliveries, plus the identity needed for mirroring (spec §4.2 step 4).
#[derive(Clone)]
struct RegisteredEndpoint {
    mac: MacAddress,
    vlan_fingerprint: String,
    ether_types: Vec<u16>,
    recv_multicast: bool,
    queue: Arc<DeliveryQueue>,
}

/// Live counters for observability (spec §7: protocol errors are logged
/// under debug, never propagated).
#[derive(Default)]
pub struct RelayStats {
    pub frames_dropped_parse_error: AtomicU64,
    pub frames_dropped_no_endpoint: AtomicU64,
    pub frames_dropped_queue_full: AtomicU64,
    pub frames_delivered: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            frames_dropped_parse_error: self.frames_dropped_parse_error.load(Ordering::Relaxed),
            frames_dropped_no_endpoint: self.frames_dropped_no_endpoint.load(Ordering::Relaxed),
            frames_dropped_queue_full: self.frames_dropped_queue_full.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStatsSnapshot {
    pub frames_dropped_parse_error: u64,
    pub frames_dropped_no_endpoint: u64,
    pub frames_dropped_queue_full: u64,
    pub frames_delivered: u64,
}

struct Registry {
    endpoints: HashMap<EndpointKey, RegisteredEndpoint>,
    default_endpoint: Option<RegisteredEndpoint>,
}

impl Registry {
    fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
            default_endpoint: None,
        }
    }
}

/// Construction-time options (spec §4.2, §6 `RelayOption`).
#[derive(Clone)]
pub struct RelayOptions {
    pub debug: bool,
    pub bpf_filter: Option<String>,
    pub default_receival: bool,
    pub default_mirror: bool,
    pub recv_buffer_size: usize,
    pub send_mtu: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            debug: false,
            bpf_filter: None,
            default_receival: false,
            default_mirror: false,
            recv_buffer_size: 32,
            send_mtu: 1500,
        }
    }
}

pub type RelayOption = Box<dyn FnOnce(&mut RelayOptions)>;

pub fn with_debug(enabled: bool) -> RelayOption {
    Box::new(move |o| o.debug = enabled)
}

pub fn with_bpf_filter(expr: impl Into<String>) -> RelayOption {
    let expr = expr.into();
    Box::new(move |o| o.bpf_filter = Some(expr))
}

pub fn with_default_receival(mirror: bool) -> RelayOption {
    Box::new(move |o| {
        o.default_receival = true;
        o.default_mirror = mirror;
    })
}

pub fn with_recv_buffer_size(n: usize) -> RelayOption {
    Box::new(move |o| o.recv_buffer_size = n)
}

pub fn with_send_mtu(n: usize) -> RelayOption {
    Box::new(move |o| o.send_mtu = n)
}

/// Single owner of a raw socket for one NIC (spec §4.2).
pub struct Relay {
    registry: Arc<RwLock<Registry>>,
    stats: Arc<RelayStats>,
    transport: Arc<tokio::sync::Mutex<Box<dyn RawTransport>>>,
    cancel: CancellationToken,
    recv_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    options: RelayOptions,
}

impl Relay {
    /// Opens a relay over an already-constructed transport and spawns the
    /// receive task. Production callers build a `PcapTransport`; tests pass
    /// a `ChannelTransport` end (spec §4.2 construction).
    pub fn new(transport: Box<dyn RawTransport>, opts: Vec<RelayOption>) -> Arc<Self> {
        let mut options = RelayOptions::default();
        for opt in opts {
            opt(&mut options);
        }

        let registry = Arc::new(RwLock::new(Registry::new()));
        let stats = Arc::new(RelayStats::default());
        let cancel = CancellationToken::new();
        let transport = Arc::new(tokio::sync::Mutex::new(transport));

        let recv_cancel = cancel.clone();
        let recv_registry = registry.clone();
        let recv_stats = stats.clone();
        let recv_transport = transport.clone();
        let debug_enabled = options.debug;
        let default_mirror = options.default_mirror;

        let recv_task = tokio::spawn(async move {
            loop {
                let recv_fut = async {
                    let mut guard = recv_transport.lock().await;
                    guard.recv().await
                };
                tokio::select! {
                    biased;
                    _ = recv_cancel.cancelled() => break,
                    result = recv_fut => {
                        match result {
                            Ok(bytes) => {
                                Self::dispatch(&recv_registry, &recv_stats, debug_enabled, default_mirror, &bytes);
                            }
                            Err(e) => {
                                debug!(error = %e, "raw socket read failed, stopping receive task");
                                Self::drain_all(&recv_registry, CloseReason::Drained);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            registry,
            stats,
            transport,
            cancel,
            recv_task: std::sync::Mutex::new(Some(recv_task)),
            options,
        })
    }

    fn dispatch(
        registry: &Arc<RwLock<Registry>>,
        stats: &Arc<RelayStats>,
        debug_enabled: bool,
        default_mirror: bool,
        bytes: &[u8],
    ) {
        let parsed: ParsedFrame = match frame::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                stats
                    .frames_dropped_parse_error
                    .fetch_add(1, Ordering::Relaxed);
                if debug_enabled {
                    debug!(error = %e, "dropping malformed frame");
                }
                return;
            }
        };

        let key = EndpointKey::new(parsed.dst_mac, &parsed.vlans, parsed.ether_type);
        let delivery = Delivery {
            src_mac: parsed.src_mac,
            dst_mac: parsed.dst_mac,
            ether_type: parsed.ether_type,
            payload: parsed.payload,
        };

        let reg = registry.read().expect("registry lock poisoned");

        let record_push = |evicted: bool| {
            stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
            if evicted {
                stats.frames_dropped_queue_full.fetch_add(1, Ordering::Relaxed);
            }
        };

        let mut delivered = false;
        let mut claimed: Vec<Arc<DeliveryQueue>> = Vec::new();

        if let Some(endpoint) = reg.endpoints.get(&key) {
            record_push(endpoint.queue.push(delivery.clone()));
            delivered = true;
            claimed.push(endpoint.queue.clone());
        }

        if let Some(default_ep) = &reg.default_endpoint {
            if !delivered {
                // Plain fallback: nothing claimed this key, the default
                // slot takes it regardless of the mirror flag.
                record_push(default_ep.queue.push(delivery.clone()));
                delivered = true;
                claimed.push(default_ep.queue.clone());
            } else if default_mirror
                && default_ep.mac == key.mac
                && !default_ep.ether_types.contains(&parsed.ether_type)
            {
                // An exact match elsewhere already claimed the frame, but
                // the default endpoint shares its destination MAC and
                // wasn't itself eligible to claim this EtherType — mirror
                // it a copy too (spec §4.2 step 4 / §8 scenario 5). The
                // default's own VLAN stack is irrelevant here: mirroring
                // is keyed on MAC + EtherType only.
                record_push(default_ep.queue.push(delivery.clone()));
                claimed.push(default_ep.queue.clone());
            }
        }

        // A multicast/broadcast destination MAC never matches any
        // endpoint's own registered key (endpoints register under their
        // own unicast MAC), so the exact-match/default paths above never
        // reach an endpoint this way. Any endpoint opted into multicast
        // reception still gets a copy, VLAN and MAC mismatch
        // notwithstanding — confirmed by the broadcast test pair in
        // etherconn_test.go (recvMulticast=true vs. false, same
        // mismatched VLAN, only the former succeeds).
        if parsed.dst_mac.is_multicast() {
            for endpoint in reg.endpoints.values() {
                if !endpoint.recv_multicast {
                    continue;
                }
                if !endpoint.ether_types.contains(&parsed.ether_type) {
                    continue;
                }
                if claimed.iter().any(|q| Arc::ptr_eq(q, &endpoint.queue)) {
                    continue;
                }
                record_push(endpoint.queue.push(delivery.clone()));
                delivered = true;
                claimed.push(endpoint.queue.clone());
            }
        }

        if !delivered {
            stats
                .frames_dropped_no_endpoint
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Closes every registered queue (normal entries and the default slot)
    /// with `reason`, without touching the registry's contents — callers
    /// that also want the registry cleared (`stop`) do that themselves.
    fn drain_all(registry: &Arc<RwLock<Registry>>, reason: CloseReason) {
        let reg = registry.read().expect("registry lock poisoned");
        for endpoint in reg.endpoints.values() {
            endpoint.queue.close(reason);
        }
        if let Some(default_ep) = &reg.default_endpoint {
            default_ep.queue.close(reason);
        }
    }

    /// Registers a new endpoint under `key`. Rejects a colliding key
    /// (spec §4.2 `register`). `as_default` additionally installs this
    /// same registration into the Relay's default slot — a normal
    /// endpoint entry is always created regardless (spec §4.3: default
    /// status is additive, not a substitute for the per-EtherType
    /// registration).
    pub(crate) fn register(
        &self,
        key: EndpointKey,
        ether_types: Vec<u16>,
        recv_multicast: bool,
        queue: Arc<DeliveryQueue>,
        as_default: bool,
    ) -> Result<(), ConfigError> {
        let mut reg = self.registry.write().expect("registry lock poisoned");

        if reg.endpoints.contains_key(&key) {
            return Err(ConfigError::DuplicateEndpointKey);
        }
        if as_default {
            if !self.options.default_receival {
                return Err(ConfigError::DefaultReceivalNotEnabled);
            }
            if reg.default_endpoint.is_some() {
                return Err(ConfigError::DefaultAlreadySet);
            }
        }

        let endpoint = RegisteredEndpoint {
            mac: key.mac,
            vlan_fingerprint: key.vlan_fingerprint.clone(),
            ether_types,
            recv_multicast,
            queue,
        };

        if as_default {
            reg.default_endpoint = Some(endpoint.clone());
        }
        reg.endpoints.insert(key, endpoint);
        Ok(())
    }

    /// Idempotent; clears the default slot too if `default_owner` matches
    /// it (spec §4.2 `unregister`). The default slot has no `EndpointKey`
    /// of its own, so it's identified by (mac, vlan fingerprint) instead.
    pub(crate) fn unregister(&self, key: &EndpointKey, default_owner: Option<(MacAddress, String)>) {
        let mut reg = self.registry.write().expect("registry lock poisoned");
        reg.endpoints.remove(key);
        if let Some((mac, fp)) = default_owner {
            let matches = reg
                .default_endpoint
                .as_ref()
                .map(|ep| ep.mac == mac && ep.vlan_fingerprint == fp)
                .unwrap_or(false);
            if matches {
                reg.default_endpoint = None;
            }
        }
    }

    /// Writes a fully framed byte slice to the raw socket (spec §4.2
    /// `sendFrame`). Any short write is reported whole as `SendFailed` by
    /// the caller (record-oriented raw sockets can't partial-write). Fails
    /// with `NotConnected` once `stop()` has run — the caller maps that to
    /// `SendError::Closed` (spec §4.2 `Stop`/§7 terminal errors: "after
    /// stop, sends fail").
    pub(crate) async fn send_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "relay stopped",
            ));
        }
        let mut guard = self.transport.lock().await;
        guard.send(bytes).await
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Stops the receive task and marks every registered queue as drained
    /// (blocked/future readers observe `Closed`). Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .recv_task
            .lock()
            .expect("recv_task lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Self::drain_all(&self.registry, CloseReason::Stopped);

        let mut reg = self.registry.write().expect("registry lock poisoned");
        reg.endpoints.clear();
        reg.default_endpoint = None;
    }
}
