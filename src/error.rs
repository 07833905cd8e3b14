use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// All the ways the protocol can fail, across the codec, the payload pipeline
/// and the transports.
///
/// Transport-level I/O errors are propagated verbatim through the `Io`
/// variant; everything else is a protocol-level condition the caller can
/// match on. `Ineffective`, `OutOfWindow` and `Duplicate` are non-fatal:
/// the send pipeline recovers from the first locally, and the reliable layer
/// reports the latter two after having already re-emitted an ACK.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("truncated input: {actual} bytes, need at least {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    #[error("unsupported protocol version 0x{0:02x}")]
    BadVersion(u8),

    #[error("payload length {payload_len} exceeds packet bounds ({packet_len} bytes)")]
    LengthOverflow { payload_len: usize, packet_len: usize },

    #[error("crc mismatch: computed 0x{computed:08x}, received 0x{received:08x}")]
    CrcMismatch { computed: u32, received: u32 },

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("empty input")]
    Empty,

    #[error("compression did not reduce the payload")]
    Ineffective,

    #[error("decompressed output exceeds the {0} byte cap")]
    BombSuspected(usize),

    #[error("encryption key not set")]
    NoKey,

    #[error("encryption key must be 32 bytes, got {0}")]
    BadKeySize(usize),

    #[error("iv must be 12 bytes, got {0}")]
    BadIv(usize),

    #[error("authentication failed")]
    AuthFailed,

    #[error("payload needs {0} fragments, more than the maximum of 256")]
    TooManyFragments(usize),

    #[error("fragment reassembly timed out")]
    FragmentTimeout,

    #[error("fragment id {frag_id} out of range for {total_frags} fragments")]
    InvalidFragId { frag_id: u16, total_frags: u16 },

    #[error("mtu {0} cannot carry a single fragment")]
    MtuTooSmall(u32),

    #[error("send window full")]
    WindowFull,

    #[error("datagram from {actual}, context is bound to {expected}")]
    WrongPeer { expected: SocketAddr, actual: SocketAddr },

    #[error("sequence {seq} outside the receive window starting at {base}")]
    OutOfWindow { seq: u32, base: u32 },

    #[error("duplicate packet {0}")]
    Duplicate(u32),

    #[error("packet {0} dropped after exhausting retries")]
    MaxRetriesExceeded(u32),

    #[error("not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("connection handle does not match the requested proto")]
    BadConnType,

    #[error("unsupported proto 0x{0:02x}")]
    UnsupportedProto(u8),

    #[error("connection closed")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),
}
