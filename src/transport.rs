//! The raw-socket abstraction boundary (spec §6 "Raw socket").
//!
//! `RawTransport` is the seam between the Relay's demultiplexing logic and
//! the actual NIC. `PcapTransport` is the production implementation, built
//! on the teacher's `pcap` dependency the same way
//! `examples/Naxaes-packet-analyser/src/main.rs` opens a device: promiscuous
//! mode, then a blocking/async read loop. `ChannelTransport` is an in-memory
//! stand-in for a veth pair, used by integration tests (`tests/end_to_end.rs`)
//! so the scenarios in spec §8 can run without root privileges or a real NIC.

use async_trait::async_trait;
use pcap::{Active, Capture, Device, Linktype, Packet};
use tokio::sync::mpsc;

use crate::error::ConfigError;

/// A complete-frame-oriented raw socket. Implementors read and write whole
/// Ethernet frames, including any VLAN tags the kernel would otherwise
/// strip (spec §6).
#[async_trait]
pub trait RawTransport: Send + Sync {
    /// Blocks until one frame is available.
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;

    /// Writes one complete frame. Raw packet sockets are record-oriented:
    /// a short write is impossible at this layer, so any failure is total
    /// (spec §4.2 `sendFrame`).
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Options threaded through to `PcapTransport::open` (spec §4.2 construction
/// options, raw-socket-facing subset).
pub struct OpenOptions {
    pub bpf_filter: Option<String>,
    pub snaplen: i32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            bpf_filter: None,
            snaplen: 65535,
        }
    }
}

/// Production transport: one promiscuous `pcap` capture per interface,
/// same device-selection and `.promisc(true)` call as the teacher's
/// `main.rs`, with an attached BPF filter (spec §4.2/§6) instead of the
/// teacher's unfiltered firehose.
pub struct PcapTransport {
    capture: Capture<Active>,
}

impl PcapTransport {
    pub fn open(iface: &str, opts: &OpenOptions) -> Result<Self, ConfigError> {
        let device = Device::list()
            .map_err(|e| ConfigError::InterfaceNotFound(format!("{iface}: {e}")))?
            .into_iter()
            .find(|d| d.name == iface)
            .ok_or_else(|| ConfigError::InterfaceNotFound(iface.to_string()))?;

        let mut capture = Capture::from_device(device)
            .map_err(|e| ConfigError::InsufficientPrivilege(e.to_string()))?
            .promisc(true)
            .immediate_mode(true)
            .snaplen(opts.snaplen)
            .open()
            .map_err(|e| ConfigError::InsufficientPrivilege(e.to_string()))?;

        // On platforms that strip VLAN tags by default, request the raw
        // Ethernet linktype so tags reach user-space intact (spec §6).
        let _ = capture.set_datalink(Linktype::ETHERNET);

        if let Some(filter) = &opts.bpf_filter {
            capture
                .filter(filter, true)
                .map_err(|e| ConfigError::FilterCompile(e.to_string()))?;
        }

        Ok(Self { capture })
    }

    fn packet_to_vec(packet: &Packet<'_>) -> Vec<u8> {
        packet.data.to_vec()
    }
}

#[async_trait]
impl RawTransport for PcapTransport {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        // `pcap::Capture::next_packet` is blocking; run it on a blocking
        // thread so it never stalls the receive task's executor (spec §5:
        // the receive loop blocks on the raw-socket read, but other tokio
        // tasks must keep making progress).
        let packet = self
            .capture
            .next_packet()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(Self::packet_to_vec(&packet))
    }

    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.capture
            .sendpacket(frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

/// One end of an in-memory veth-pair stand-in (spec §8 scenarios use two
/// peers connected back to back). Frames written on one end arrive, whole
/// and in order, as reads on the other.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Builds a connected pair `(a, b)`: frames sent on `a` are received on
    /// `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self { tx: tx_a, rx: rx_b },
            Self { tx: tx_b, rx: rx_a },
        )
    }
}

#[async_trait]
impl RawTransport for ChannelTransport {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_bidirectional() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), vec![1, 2, 3]);

        b.send(&[9, 9]).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), vec![9, 9]);
    }

    #[tokio::test]
    async fn recv_errors_once_peer_is_dropped() {
        let (mut a, b) = ChannelTransport::pair();
        drop(b);
        assert!(a.recv().await.is_err());
    }

    #[tokio::test]
    async fn send_errors_once_peer_is_dropped() {
        let (mut a, b) = ChannelTransport::pair();
        drop(b);
        assert!(a.send(&[1]).await.is_err());
    }
}
