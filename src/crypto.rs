//! CryptoState: the engine's single source of truth for the pre-shared key.
//!
//! This is the "KeyLock" of the concurrency model — guards the key for the
//! duration of one envelope's encrypt/decrypt, and lets rotation replace it
//! atomically via `set_key`.

use crate::constants::{CRYPTO_KEY_MAXLEN, IV_SIZE, PAYLOAD_CIPHER_SIZE, PAYLOAD_SIZE};
use crate::error::CodecError;
use blowfish::Blowfish;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

type BlowfishCbcEnc = cbc::Encryptor<Blowfish>;
type BlowfishCbcDec = cbc::Decryptor<Blowfish>;

/// The engine's encryption key. A 64-bit block cipher (Blowfish) in CBC mode
/// with no MAC, matching the legacy wire format this daemon must interop
/// with — see the non-goals around authenticated encryption.
pub struct CryptoState {
    key: RwLock<Vec<u8>>,
}

impl CryptoState {
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        validate_key(key)?;
        Ok(Self {
            key: RwLock::new(key.to_vec()),
        })
    }

    /// Rotate the key. Existing in-flight encrypt/decrypt calls complete
    /// under the old or new key depending on interleaving; there is no
    /// stronger consistency guarantee than the lock itself provides.
    pub fn set_key(&self, key: &[u8]) -> Result<(), CodecError> {
        validate_key(key)?;
        *self.key.write().expect("crypto key lock poisoned") = key.to_vec();
        Ok(())
    }

    fn key_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let guard = self.key.read().expect("crypto key lock poisoned");
        if guard.is_empty() {
            return Err(CodecError::NoKey);
        }
        Ok(guard.clone())
    }

    /// Draw 8 random bytes from the OS CSPRNG. If the CSPRNG is unavailable,
    /// fall back to a deterministic time⊕pid-seeded stream — a documented
    /// security degradation (predictable IVs), not a silent one.
    pub fn fill_iv(&self, iv: &mut [u8; IV_SIZE]) {
        if rand::rngs::OsRng.try_fill_bytes(iv).is_ok() {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut seed = now.as_secs() ^ (now.subsec_nanos() as u64) ^ (std::process::id() as u64);
        for b in iv.iter_mut() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *b = (seed >> 33) as u8;
        }
    }

    /// Encrypt exactly `PAYLOAD_CIPHER_SIZE` bytes of `payload` in place,
    /// using CBC with `iv`. The trailing bytes of `payload` are left
    /// untouched — the wire quirk documented in the envelope codec.
    pub fn encrypt_payload(
        &self,
        payload: &mut [u8; PAYLOAD_SIZE],
        iv: &[u8; IV_SIZE],
    ) -> Result<(), CodecError> {
        let key = self.key_bytes()?;
        let enc = BlowfishCbcEnc::new_from_slices(&key, iv)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        let mut block_buf = payload[..PAYLOAD_CIPHER_SIZE].to_vec();
        enc.encrypt_padded_mut::<NoPadding>(&mut block_buf, PAYLOAD_CIPHER_SIZE)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        payload[..PAYLOAD_CIPHER_SIZE].copy_from_slice(&block_buf);
        Ok(())
    }

    /// Inverse of `encrypt_payload`.
    pub fn decrypt_payload(
        &self,
        payload: &mut [u8; PAYLOAD_SIZE],
        iv: &[u8; IV_SIZE],
    ) -> Result<(), CodecError> {
        let key = self.key_bytes()?;
        let dec = BlowfishCbcDec::new_from_slices(&key, iv)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        let mut block_buf = payload[..PAYLOAD_CIPHER_SIZE].to_vec();
        dec.decrypt_padded_mut::<NoPadding>(&mut block_buf)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        payload[..PAYLOAD_CIPHER_SIZE].copy_from_slice(&block_buf);
        Ok(())
    }
}

fn validate_key(key: &[u8]) -> Result<(), CodecError> {
    if key.is_empty() {
        return Err(CodecError::EmptyKey);
    }
    if key.len() > CRYPTO_KEY_MAXLEN {
        return Err(CodecError::KeyTooLong(key.len(), CRYPTO_KEY_MAXLEN));
    }
    Ok(())
}
