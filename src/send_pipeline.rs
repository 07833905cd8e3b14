use tracing::trace;

use crate::compress;
use crate::crypto::{KeySlot, IV_SIZE, TAG_SIZE};
use crate::error::ProtoError;
use crate::packet_header::{Flags, MAX_PAYLOAD_SIZE};

/// Payload preparation for the send path: optional deflate, then optional
/// AEAD sealing.
///
/// Compression engages above the threshold unless the caller already flagged
/// the data as compressed; an ineffective attempt is recovered locally and
/// the original bytes travel. Encryption requires a key and replaces the
/// payload with `iv | ciphertext | tag`.
pub fn prepare_payload(
    data: &[u8],
    mut flags: Flags,
    key: &KeySlot,
) -> Result<(Vec<u8>, Flags), ProtoError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::PayloadTooLarge(data.len()));
    }

    let mut payload = data.to_vec();

    if compress::should_compress(payload.len()) && !flags.contains(Flags::COMPRESSED) {
        match compress::compress(&payload) {
            Ok(compressed) => {
                trace!("compressed payload {} -> {} bytes", payload.len(), compressed.len());
                payload = compressed;
                flags |= Flags::COMPRESSED;
            }
            Err(ProtoError::Ineffective) => {
                trace!("compression ineffective - sending {} bytes raw", payload.len());
            }
            Err(e) => return Err(e),
        }
    }

    if flags.contains(Flags::ENCRYPTED) {
        if !key.is_enabled() {
            return Err(ProtoError::NoKey);
        }
        let (ciphertext, iv) = key.encrypt(&payload)?;

        let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        payload = sealed;
    }

    Ok((payload, flags))
}

/// The receive-side inverse: unseal if ENCRYPTED, inflate if COMPRESSED.
pub fn open_payload(flags: Flags, payload: &[u8], key: &KeySlot) -> Result<Vec<u8>, ProtoError> {
    let mut data = payload.to_vec();

    if flags.contains(Flags::ENCRYPTED) {
        if data.len() < IV_SIZE + TAG_SIZE {
            return Err(ProtoError::Truncated { needed: IV_SIZE + TAG_SIZE, actual: data.len() });
        }
        let (iv, ciphertext) = data.split_at(IV_SIZE);
        data = key.decrypt(ciphertext, iv)?;
    }

    if flags.contains(Flags::COMPRESSED) {
        data = compress::decompress(&data)?;
    }

    Ok(data)
}
