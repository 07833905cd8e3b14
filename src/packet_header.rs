use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtoError;
use crate::safe_converter::SaturatingCast;

pub const MAGIC: u16 = 0xABCD;
pub const VERSION: u8 = 0x01;

/// Serialized header length in octets.
pub const HEADER_SIZE: usize = 24;
/// Length of the CRC32 trailer.
pub const CRC_SIZE: usize = 4;
/// A header-only frame: header plus trailer.
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + CRC_SIZE;
/// `payload_len` is a u16, so this is the hard payload ceiling.
pub const MAX_PAYLOAD_SIZE: usize = 65_535;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        const FRAGMENT   = 0x01;
        const COMPRESSED = 0x02;
        const ENCRYPTED  = 0x04;
        const RELIABLE   = 0x08;
        const ACK        = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Data = 1,
    Control = 2,
    Ack = 3,
    Ping = 4,
    Pong = 5,
}
impl Opcode {
    pub fn from_u8(raw: u8) -> Option<Opcode> {
        match raw {
            1 => Some(Opcode::Data),
            2 => Some(Opcode::Control),
            3 => Some(Opcode::Ack),
            4 => Some(Opcode::Ping),
            5 => Some(Opcode::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Proto {
    Tcp = 1,
    Udp = 2,
    /// Reserved on the wire, not routable.
    Http = 3,
}
impl Proto {
    pub fn from_u8(raw: u8) -> Option<Proto> {
        match raw {
            1 => Some(Proto::Tcp),
            2 => Some(Proto::Udp),
            3 => Some(Proto::Http),
            _ => None,
        }
    }
}

/// The fixed 24-octet packet header, all multi-byte fields big-endian on the wire.
///
/// `opcode` and `proto` are carried as raw octets: the codec validates only the
/// envelope and never interprets them. The typed [`Opcode`]/[`Proto`] enums are
/// the API-surface view.
///
/// `timestamp` is stamped at construction for local telemetry but the word at
/// offset 20 is reserved and always *transmitted* as zero - it is part of the
/// CRC preimage exactly as it appears on the wire. After `deser` it holds
/// whatever the wire carried, which a conforming sender zeroes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    pub version: u8,
    pub flags: Flags,
    pub opcode: u8,
    pub proto: u8,
    pub stream_id: u32,
    pub seq: u32,
    pub frag_id: u16,
    pub total_frags: u16,
    pub payload_len: u16,
    pub timestamp: u32,
}

impl PacketHeader {
    pub fn new(stream_id: u32, opcode: Opcode, proto: Proto, flags: Flags) -> PacketHeader {
        PacketHeader {
            magic: MAGIC,
            version: VERSION,
            flags,
            opcode: opcode as u8,
            proto: proto as u8,
            stream_id,
            seq: 0,
            frag_id: 0,
            total_frags: 0,
            payload_len: 0,
            timestamp: unix_now(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.opcode);
        buf.put_u8(self.proto);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.seq);
        buf.put_u16(self.frag_id);
        buf.put_u16(self.total_frags);
        buf.put_u16(self.payload_len);
        // reserved word: always zero on the wire, regardless of the in-memory timestamp
        buf.put_u32(0);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, ProtoError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtoError::Truncated { needed: HEADER_SIZE, actual: buf.remaining() });
        }

        let magic = buf.get_u16();
        let version = buf.get_u8();
        let flags = Flags::from_bits_retain(buf.get_u8());
        let opcode = buf.get_u8();
        let proto = buf.get_u8();
        let stream_id = buf.get_u32();
        let seq = buf.get_u32();
        let frag_id = buf.get_u16();
        let total_frags = buf.get_u16();
        let payload_len = buf.get_u16();
        let timestamp = buf.get_u32();

        if magic != MAGIC {
            return Err(ProtoError::BadMagic(magic));
        }
        if version != VERSION {
            return Err(ProtoError::BadVersion(version));
        }

        Ok(PacketHeader {
            magic,
            version,
            flags,
            opcode,
            proto,
            stream_id,
            seq,
            frag_id,
            total_frags,
            payload_len,
            timestamp,
        })
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .saturating_cast()
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn header(flags: Flags, opcode: Opcode, proto: Proto) -> PacketHeader {
        let mut header = PacketHeader::new(0x12345678, opcode, proto, flags);
        header.seq = 0x87654321;
        header.frag_id = 0x1111;
        header.total_frags = 0x2222;
        header.payload_len = 4;
        header.timestamp = 0;
        header
    }

    #[rstest]
    #[case::plain(header(Flags::empty(), Opcode::Data, Proto::Tcp))]
    #[case::reliable(header(Flags::RELIABLE, Opcode::Data, Proto::Udp))]
    #[case::ack(header(Flags::ACK | Flags::RELIABLE, Opcode::Ack, Proto::Udp))]
    #[case::all_flags(header(Flags::all(), Opcode::Control, Proto::Udp))]
    #[case::ping(header(Flags::empty(), Opcode::Ping, Proto::Udp))]
    #[case::pong(header(Flags::empty(), Opcode::Pong, Proto::Tcp))]
    fn test_header_round_trip(#[case] header: PacketHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let deser = PacketHeader::deser(&mut buf.as_ref()).unwrap();
        assert_eq!(deser, header);
    }

    #[test]
    fn test_wire_layout() {
        let header = header(Flags::empty(), Opcode::Data, Proto::Tcp);
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(&buf[0..6], &[0xAB, 0xCD, 0x01, 0x00, 0x01, 0x01]);
        assert_eq!(&buf[6..10], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&buf[10..14], &[0x87, 0x65, 0x43, 0x21]);
        assert_eq!(&buf[14..16], &[0x11, 0x11]);
        assert_eq!(&buf[16..18], &[0x22, 0x22]);
        assert_eq!(&buf[18..20], &[0x00, 0x04]);
        assert_eq!(&buf[20..24], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_reserved_word_zeroed_on_wire() {
        let mut header = header(Flags::empty(), Opcode::Data, Proto::Tcp);
        header.timestamp = 0xDEADBEEF;

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]);

        let deser = PacketHeader::deser(&mut buf.as_ref()).unwrap();
        assert_eq!(deser.timestamp, 0);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_short(HEADER_SIZE - 1)]
    fn test_deser_truncated(#[case] len: usize) {
        let buf = vec![0u8; len];
        match PacketHeader::deser(&mut buf.as_slice()) {
            Err(ProtoError::Truncated { needed, actual }) => {
                assert_eq!(needed, HEADER_SIZE);
                assert_eq!(actual, len);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_deser_bad_magic() {
        let mut buf = BytesMut::new();
        let mut h = header(Flags::empty(), Opcode::Data, Proto::Tcp);
        h.magic = 0x1234;
        h.ser(&mut buf);

        match PacketHeader::deser(&mut buf.as_ref()) {
            Err(ProtoError::BadMagic(m)) => assert_eq!(m, 0x1234),
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn test_deser_bad_version() {
        let mut buf = BytesMut::new();
        let mut h = header(Flags::empty(), Opcode::Data, Proto::Tcp);
        h.version = 0x02;
        h.ser(&mut buf);

        match PacketHeader::deser(&mut buf.as_ref()) {
            Err(ProtoError::BadVersion(v)) => assert_eq!(v, 0x02),
            other => panic!("expected BadVersion, got {:?}", other),
        }
    }

    #[rstest]
    #[case(1, Some(Opcode::Data))]
    #[case(3, Some(Opcode::Ack))]
    #[case(5, Some(Opcode::Pong))]
    #[case(0, None)]
    #[case(6, None)]
    fn test_opcode_from_u8(#[case] raw: u8, #[case] expected: Option<Opcode>) {
        assert_eq!(Opcode::from_u8(raw), expected);
    }

    #[rstest]
    #[case(1, Some(Proto::Tcp))]
    #[case(2, Some(Proto::Udp))]
    #[case(3, Some(Proto::Http))]
    #[case(4, None)]
    fn test_proto_from_u8(#[case] raw: u8, #[case] expected: Option<Proto>) {
        assert_eq!(Proto::from_u8(raw), expected);
    }
}
