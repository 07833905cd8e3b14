use crate::error::ProtoError;
use crate::packet_header::{CRC_SIZE, HEADER_SIZE};

/// MTU assumed when the socket cannot be probed.
pub const DEFAULT_MTU: u32 = 1400;

/// Endpoint configuration. The defaults match the protocol's well-known
/// values; `mtu` only bounds outgoing UDP frames (the fragmenter engages
/// above it), it is not negotiated with peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub mtu: u32,
    /// reserved; sockets are driven by the async runtime regardless
    pub non_blocking: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            tcp_port: 8080,
            udp_port: 8080,
            mtu: DEFAULT_MTU,
            non_blocking: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.mtu as usize <= HEADER_SIZE + CRC_SIZE {
            return Err(ProtoError::MtuTooSmall(self.mtu));
        }
        Ok(())
    }
}
