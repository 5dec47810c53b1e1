//! Error taxonomy for the crate (spec §7): construction-time `ConfigError`s
//! propagate synchronously, runtime send errors propagate to the writer,
//! runtime receive errors are either returned (`RecvError`) or dropped
//! silently with a debug counter (protocol errors never reach the caller).

use thiserror::Error;

/// Errors raised synchronously at construction time. No partial
/// construction: a `ConfigError` means the object was never created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid VLAN id {0}, must be <= 4095")]
    InvalidVlanId(u16),

    #[error("EtherType set must not be empty")]
    EmptyEtherTypeSet,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("BPF filter compile failed: {0}")]
    FilterCompile(String),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("insufficient privilege to open raw socket: {0}")]
    InsufficientPrivilege(String),

    #[error("endpoint key already registered")]
    DuplicateEndpointKey,

    #[error("a default endpoint is already set on this relay")]
    DefaultAlreadySet,

    #[error("VLAN id replacement length mismatch: stack has {stack_len} tags, got {new_len} ids")]
    VlanSetIdsLengthMismatch { stack_len: usize, new_len: usize },

    #[error("default registration requested but this relay was not opened WithDefaultReceival")]
    DefaultReceivalNotEnabled,
}

/// Runtime errors on the send path. These propagate to the caller of
/// `WriteIPPktTo`/`WriteTo`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("raw socket write failed: {0}")]
    SendFailed(String),

    #[error("unknown IP version in payload's first nibble: {0:#x}")]
    UnknownIpVersion(u8),

    #[error("no next-hop MAC resolver configured")]
    NoNextHopResolver,

    #[error("local and destination addresses are of different IP families")]
    AddressFamilyMismatch,

    #[error("endpoint is closed")]
    Closed,

    #[error("framed length {len} exceeds configured send MTU {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },
}

/// Runtime errors on the receive path, surfaced to the caller of
/// `ReadPktFrom`/`ReadFrom`. Protocol-level drops (malformed frame, bad
/// checksum, wrong destination) are *not* represented here: they are
/// retried internally and never reach the reader, per spec §7.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecvError {
    #[error("read deadline elapsed")]
    Timeout,

    #[error("endpoint is closed")]
    Closed,

    #[error("receive queue drained")]
    QueueDrained,
}

/// Frame-codec parse failures (spec §4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least 14")]
    TooShort { len: usize },

    #[error("frame truncated mid-VLAN-tag at offset {offset}")]
    TruncatedTag { offset: usize },
}
