//! User-space Ethernet multiplexing over a single raw NIC.
//!
//! Three subsystems, built to share one promiscuous raw socket across many
//! logical endpoints:
//!
//! - [`relay::Relay`] owns the raw socket, runs the receive loop, and
//!   routes frames to registered endpoints by `(dst MAC, VLAN stack,
//!   EtherType)`.
//! - [`etherconn::EtherConn`] is a logical L2 endpoint registered with a
//!   `Relay`: packet-oriented read/write scoped to a MAC/VLAN/EtherType
//!   tuple.
//! - [`rudpconn::RUDPConn`] layers IPv4/IPv6 + UDP encapsulation on top of
//!   an `EtherConn`, presenting a UDP-socket-like API without touching the
//!   host OS's IP stack.
//!
//! ARP/ND resolution, BPF filter compilation, and configuration-file
//! parsing are explicitly out of scope: the Relay consumes an
//! already-expressed filter string, and `RUDPConn` consumes a user-supplied
//! next-hop MAC resolver.

pub mod error;
pub mod etherconn;
pub mod frame;
pub mod mac;
pub mod queue;
pub mod relay;
pub mod rudpconn;
pub mod transport;
pub mod vlan;

pub use error::{ConfigError, FrameError, RecvError, SendError};
pub use etherconn::{
    with_default, with_ether_types, with_recv_multicast, with_recv_queue_depth, with_vlans,
    EtherConn, EtherConnOption,
};
pub use frame::DEFAULT_ETHER_TYPES;
pub use mac::{MacAddress, BROADCAST_MAC};
pub use relay::{
    with_bpf_filter, with_debug, with_default_receival, with_recv_buffer_size, with_send_mtu,
    Relay, RelayOption,
};
pub use rudpconn::{with_resolve_next_hop_mac_func, RUDPConn, RUDPConnOption, ResolveNextHopMac, UdpAddr};
pub use transport::{ChannelTransport, OpenOptions, PcapTransport, RawTransport};
pub use vlan::{Vlan, VlanStack};
