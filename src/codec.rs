use bytes::{BufMut, BytesMut};
use crc::Crc;

use crate::error::ProtoError;
use crate::packet_header::{PacketHeader, CRC_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, MIN_PACKET_SIZE};
use crate::safe_converter::PrecheckedCast;

/// IEEE 802.3 reflected CRC32: poly 0xEDB88320, init 0xFFFFFFFF, xorout 0xFFFFFFFF.
const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC over the header octets exactly as they appear on the wire (reserved
/// word included) concatenated with the payload.
pub fn crc32(header_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(header_bytes);
    digest.update(payload);
    digest.finalize()
}

/// Assemble the full wire frame: header(24) | payload | crc32(4).
///
/// `payload_len` is stamped from the actual payload; the reserved word is
/// written as zero before the CRC is computed, so the CRC preimage is the
/// frame exactly as transmitted.
pub fn serialize(header: &PacketHeader, payload: &[u8]) -> Result<BytesMut, ProtoError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }

    let mut wire_header = header.clone();
    wire_header.payload_len = payload.len().prechecked_cast();

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    wire_header.ser(&mut buf);
    buf.put_slice(payload);

    let crc = crc32(&buf[..HEADER_SIZE], payload);
    buf.put_u32(crc);

    Ok(buf)
}

/// Parse and validate a wire frame, returning the header and a copy of the payload.
pub fn deserialize(data: &[u8]) -> Result<(PacketHeader, Vec<u8>), ProtoError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(ProtoError::Truncated { needed: MIN_PACKET_SIZE, actual: data.len() });
    }

    let header = PacketHeader::deser(&mut &data[..])?;

    let payload_len = header.payload_len as usize;
    if HEADER_SIZE + payload_len + CRC_SIZE > data.len() {
        return Err(ProtoError::LengthOverflow { payload_len, packet_len: data.len() });
    }

    let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];

    let trailer_offset = HEADER_SIZE + payload_len;
    let received = u32::from_be_bytes(
        data[trailer_offset..trailer_offset + CRC_SIZE]
            .try_into()
            .expect("slice has exactly four bytes"),
    );

    // the CRC preimage is the header as received, including any reserved bits
    let computed = crc32(&data[..HEADER_SIZE], payload);
    if received != computed {
        return Err(ProtoError::CrcMismatch { computed, received });
    }

    Ok((header, payload.to_vec()))
}
