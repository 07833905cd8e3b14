use std::sync::RwLock;

use aead::{Aead, AeadCore, Key, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use tracing::debug;

use crate::error::ProtoError;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Process-wide AES-256-GCM key slot.
///
/// Readers snapshot the key under the read lock and release it before any
/// cipher work; `clear` overwrites the buffer with zeros before dropping it.
/// The slot lives between `Init` and `Shutdown` of the owning endpoint.
#[derive(Default)]
pub struct KeySlot {
    key: RwLock<Option<[u8; KEY_SIZE]>>,
}

impl KeySlot {
    pub fn new() -> KeySlot {
        KeySlot { key: RwLock::new(None) }
    }

    pub fn set(&self, key: &[u8]) -> Result<(), ProtoError> {
        if key.len() != KEY_SIZE {
            return Err(ProtoError::BadKeySize(key.len()));
        }
        let mut slot = [0u8; KEY_SIZE];
        slot.copy_from_slice(key);
        *self.key.write().expect("key lock poisoned") = Some(slot);
        debug!("encryption key installed");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.key.read().expect("key lock poisoned").is_some()
    }

    /// Zeroize the key buffer in place, then release the slot.
    pub fn clear(&self) {
        let mut guard = self.key.write().expect("key lock poisoned");
        if let Some(key) = guard.as_mut() {
            key.fill(0);
        }
        *guard = None;
    }

    fn snapshot(&self) -> Result<[u8; KEY_SIZE], ProtoError> {
        self.key.read().expect("key lock poisoned").ok_or(ProtoError::NoKey)
    }

    /// Encrypt `plain` with a fresh random 96-bit IV.
    ///
    /// Returns `(ciphertext | tag, iv)`; the send path concatenates
    /// `iv | ciphertext | tag` into the packet payload.
    pub fn encrypt(&self, plain: &[u8]) -> Result<(Vec<u8>, [u8; IV_SIZE]), ProtoError> {
        let key = self.snapshot()?;
        if plain.is_empty() {
            return Err(ProtoError::Empty);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plain).map_err(|_| ProtoError::AuthFailed)?;

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(nonce.as_slice());
        Ok((ciphertext, iv))
    }

    /// Decrypt `ciphertext | tag`. The tag is verified before any plaintext
    /// is returned.
    pub fn decrypt(&self, data: &[u8], iv: &[u8]) -> Result<Vec<u8>, ProtoError> {
        let key = self.snapshot()?;
        if data.is_empty() {
            return Err(ProtoError::Empty);
        }
        if iv.len() != IV_SIZE {
            return Err(ProtoError::BadIv(iv.len()));
        }
        if data.len() < TAG_SIZE {
            return Err(ProtoError::Truncated { needed: TAG_SIZE, actual: data.len() });
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::<Aes256Gcm>::from_slice(iv), data)
            .map_err(|_| ProtoError::AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn slot_with_zero_key() -> KeySlot {
        let slot = KeySlot::new();
        slot.set(&[0u8; KEY_SIZE]).unwrap();
        slot
    }

    #[rstest]
    #[case(b"hi".to_vec())]
    #[case(vec![0x42; 1000])]
    #[case(vec![0; 1])]
    fn test_encrypt_decrypt_round_trip(#[case] plain: Vec<u8>) {
        let slot = slot_with_zero_key();

        let (ciphertext, iv) = slot.encrypt(&plain).unwrap();
        assert_eq!(ciphertext.len(), plain.len() + TAG_SIZE);
        assert_eq!(slot.decrypt(&ciphertext, &iv).unwrap(), plain);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let slot = slot_with_zero_key();
        let (_, iv1) = slot.encrypt(b"hi").unwrap();
        let (_, iv2) = slot.encrypt(b"hi").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn test_encrypt_without_key() {
        let slot = KeySlot::new();
        assert!(matches!(slot.encrypt(b"hi"), Err(ProtoError::NoKey)));
    }

    #[test]
    fn test_encrypt_empty() {
        let slot = slot_with_zero_key();
        assert!(matches!(slot.encrypt(&[]), Err(ProtoError::Empty)));
    }

    #[rstest]
    #[case(0)]
    #[case(31)]
    #[case(33)]
    fn test_bad_key_size(#[case] len: usize) {
        let slot = KeySlot::new();
        match slot.set(&vec![0u8; len]) {
            Err(ProtoError::BadKeySize(actual)) => assert_eq!(actual, len),
            other => panic!("expected BadKeySize, got {:?}", other),
        }
        assert!(!slot.is_enabled());
    }

    #[test]
    fn test_tag_tampering_fails_auth() {
        let slot = slot_with_zero_key();
        let (ciphertext, iv) = slot.encrypt(b"hi").unwrap();

        for bit in 0..8 {
            let mut tampered = ciphertext.clone();
            let tag_start = tampered.len() - TAG_SIZE;
            tampered[tag_start] ^= 1 << bit;
            assert!(matches!(slot.decrypt(&tampered, &iv), Err(ProtoError::AuthFailed)));
        }
    }

    #[test]
    fn test_ciphertext_tampering_fails_auth() {
        let slot = slot_with_zero_key();
        let (mut ciphertext, iv) = slot.encrypt(b"hello world").unwrap();
        ciphertext[0] ^= 0x80;
        assert!(matches!(slot.decrypt(&ciphertext, &iv), Err(ProtoError::AuthFailed)));
    }

    #[rstest]
    #[case(11)]
    #[case(13)]
    #[case(0)]
    fn test_decrypt_bad_iv(#[case] iv_len: usize) {
        let slot = slot_with_zero_key();
        let (ciphertext, _) = slot.encrypt(b"hi").unwrap();
        match slot.decrypt(&ciphertext, &vec![0u8; iv_len]) {
            Err(ProtoError::BadIv(actual)) => assert_eq!(actual, iv_len),
            other => panic!("expected BadIv, got {:?}", other),
        }
    }

    #[test]
    fn test_decrypt_shorter_than_tag() {
        let slot = slot_with_zero_key();
        assert!(matches!(
            slot.decrypt(&[0u8; TAG_SIZE - 1], &[0u8; IV_SIZE]),
            Err(ProtoError::Truncated { .. })
        ));
    }

    #[test]
    fn test_clear_disables_encryption() {
        let slot = slot_with_zero_key();
        assert!(slot.is_enabled());

        slot.clear();
        assert!(!slot.is_enabled());
        assert!(matches!(slot.encrypt(b"hi"), Err(ProtoError::NoKey)));
    }
}
