//! The fixed 100-byte wire envelope: layout, identifier construction,
//! checksum, and the codec functions that operate on it.
//!
//! ```text
//! offset 0   : uint8   type (1=DISCOVER, 2=MSG)
//! offset 1   : 14-byte MessageId (be: ip, sec, usec, sum)
//! offset 15  : 8-byte  IV
//! offset 23  : 77-byte payload
//! ```

use crate::constants::{
    IV_SIZE, MESSAGE_ID_SIZE, MSGSIZE, PAYLOAD_SIZE, TYPE_DISCOVER, TYPE_MSG,
};
use crate::crypto::CryptoState;
use crate::error::CodecError;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

const TYPE_OFFSET: usize = 0;
const ID_OFFSET: usize = 1;
const IV_OFFSET: usize = ID_OFFSET + MESSAGE_ID_SIZE;
const PAYLOAD_OFFSET: usize = IV_OFFSET + IV_SIZE;

const _: () = assert!(PAYLOAD_OFFSET + PAYLOAD_SIZE == MSGSIZE);

/// The sender identifier embedded in every envelope: who sent it, when, and
/// a checksum over the whole (plaintext) envelope. Two envelopes carry "the
/// same message" iff these 14 bytes are byte-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub sender_ip: u32,
    pub sender_secs: u32,
    pub sender_usecs_low16: u16,
    pub checksum: u16,
}

impl MessageId {
    const SIZE: usize = MESSAGE_ID_SIZE;

    fn from_bytes(b: &[u8]) -> Self {
        debug_assert_eq!(b.len(), Self::SIZE);
        Self {
            sender_ip: u32::from_be_bytes(b[0..4].try_into().unwrap()),
            sender_secs: u32::from_be_bytes(b[4..8].try_into().unwrap()),
            sender_usecs_low16: u16::from_be_bytes(b[8..10].try_into().unwrap()),
            checksum: u16::from_be_bytes(b[10..12].try_into().unwrap()),
        }
    }

    fn write_bytes(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), Self::SIZE);
        out[0..4].copy_from_slice(&self.sender_ip.to_be_bytes());
        out[4..8].copy_from_slice(&self.sender_secs.to_be_bytes());
        out[8..10].copy_from_slice(&self.sender_usecs_low16.to_be_bytes());
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..14].fill(0);
    }

    pub fn sender_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.sender_ip)
    }
}

/// An envelope in plaintext (decoded) form: whichever region is "payload" is
/// the plaintext chat text or zero-padding, never ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Envelope {
    pub kind: u8,
    pub id: MessageId,
    pub iv: [u8; IV_SIZE],
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Envelope {
    pub fn new_msg(text: &[u8]) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        let n = text.len().min(PAYLOAD_SIZE - 1);
        payload[..n].copy_from_slice(&text[..n]);
        Self {
            kind: TYPE_MSG,
            id: MessageId {
                sender_ip: 0,
                sender_secs: 0,
                sender_usecs_low16: 0,
                checksum: 0,
            },
            iv: [0u8; IV_SIZE],
            payload,
        }
    }

    pub fn new_discover() -> Self {
        Self {
            kind: TYPE_DISCOVER,
            id: MessageId {
                sender_ip: 0,
                sender_secs: 0,
                sender_usecs_low16: 0,
                checksum: 0,
            },
            iv: [0u8; IV_SIZE],
            payload: [0u8; PAYLOAD_SIZE],
        }
    }

    pub fn is_discover(&self) -> bool {
        self.kind == TYPE_DISCOVER
    }

    /// Serialize to the 100-byte wire form, honouring whatever is currently
    /// in `payload` (plaintext or ciphertext — the caller decides).
    pub fn to_wire(&self) -> [u8; MSGSIZE] {
        let mut out = [0u8; MSGSIZE];
        out[TYPE_OFFSET] = self.kind;
        self.id.write_bytes(&mut out[ID_OFFSET..ID_OFFSET + MessageId::SIZE]);
        out[IV_OFFSET..IV_OFFSET + IV_SIZE].copy_from_slice(&self.iv);
        out[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
        out
    }

    /// Parse a 100-byte wire buffer. Does not validate `kind` — call
    /// `validate` explicitly, matching the codec contract in the component
    /// design (size-check and type-check are separate steps at the receiver).
    pub fn from_wire(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != MSGSIZE {
            return Err(CodecError::WrongSize(buf.len(), MSGSIZE));
        }
        let id = MessageId::from_bytes(&buf[ID_OFFSET..ID_OFFSET + MessageId::SIZE]);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&buf[IV_OFFSET..IV_OFFSET + IV_SIZE]);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[PAYLOAD_OFFSET..]);
        Ok(Self {
            kind: buf[TYPE_OFFSET],
            id,
            iv,
            payload,
        })
    }
}

/// `type ∈ {1,2}`; size is guaranteed by `from_wire`/`to_wire` already
/// operating on fixed-size arrays, so only the type needs checking here.
pub fn validate(env: &Envelope) -> Result<(), CodecError> {
    match env.kind {
        TYPE_DISCOVER | TYPE_MSG => Ok(()),
        other => Err(CodecError::UnknownType(other)),
    }
}

/// Fill `id` from `self_ip` and the current time, then compute and store the
/// checksum over the full envelope (checksum field zeroed first). Must be
/// called before the payload is encrypted — the checksum covers plaintext.
pub fn set_id(env: &mut Envelope, self_ip: Ipv4Addr) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    env.id.sender_ip = u32::from(self_ip);
    env.id.sender_secs = now.as_secs() as u32;
    env.id.sender_usecs_low16 = (now.subsec_micros() & 0xFFFF) as u16;
    env.id.checksum = 0;

    let wire = env.to_wire();
    env.id.checksum = internet_checksum(&wire);
}

/// Classic Internet checksum (Stevens, TCP/IP Illustrated): sum 16-bit
/// big-endian words, fold carries from the high 16 bits into the low 16 bits
/// twice, then take the one's complement. `buf` must be exactly `MSGSIZE`
/// bytes with the checksum field already zeroed.
pub fn internet_checksum(buf: &[u8; MSGSIZE]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = buf.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum = (sum & 0xFFFF) + (sum >> 16);
    !(sum as u16)
}

/// Verify that `env`'s stored checksum matches a fresh computation over the
/// envelope with the checksum field zeroed.
pub fn verify_checksum(env: &Envelope) -> bool {
    let mut copy = env.clone();
    let stored = copy.id.checksum;
    copy.id.checksum = 0;
    let wire = copy.to_wire();
    internet_checksum(&wire) == stored
}

/// Encrypt `env.payload` in place over the `PAYLOAD_CIPHER_SIZE`-aligned
/// prefix, drawing a fresh random IV first. Fails if no key is set.
pub fn encrypt(env: &mut Envelope, crypto: &CryptoState) -> Result<(), CodecError> {
    crypto.fill_iv(&mut env.iv);
    crypto.encrypt_payload(&mut env.payload, &env.iv)
}

/// Inverse of `encrypt`, in place. Fails if no key is set.
pub fn decrypt(env: &mut Envelope, crypto: &CryptoState) -> Result<(), CodecError> {
    crypto.decrypt_payload(&mut env.payload, &env.iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoState;

    fn addr() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    #[test]
    fn checksum_round_trip() {
        let mut env = Envelope::new_msg(b"hello");
        set_id(&mut env, addr());
        assert!(verify_checksum(&env));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut env = Envelope::new_msg(b"hello");
        set_id(&mut env, addr());
        env.payload[0] ^= 0xFF;
        assert!(!verify_checksum(&env));
    }

    #[test]
    fn wire_round_trip_preserves_fields() {
        let mut env = Envelope::new_msg(b"round trip");
        set_id(&mut env, addr());
        let wire = env.to_wire();
        let parsed = Envelope::from_wire(&wire).unwrap();
        assert_eq!(env, parsed);
    }

    #[test]
    fn from_wire_rejects_wrong_size() {
        let buf = vec![0u8; 99];
        assert!(matches!(
            Envelope::from_wire(&buf),
            Err(CodecError::WrongSize(99, MSGSIZE))
        ));
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let mut env = Envelope::new_msg(b"x");
        env.kind = 9;
        assert!(matches!(validate(&env), Err(CodecError::UnknownType(9))));
    }

    #[test]
    fn encrypt_decrypt_is_inverse_except_iv() {
        let crypto = CryptoState::new(b"hunter2").unwrap();
        let mut env = Envelope::new_msg(b"secret message");
        set_id(&mut env, addr());
        let original_payload = env.payload;

        encrypt(&mut env, &crypto).unwrap();
        assert_ne!(env.payload[..crate::constants::PAYLOAD_CIPHER_SIZE],
            original_payload[..crate::constants::PAYLOAD_CIPHER_SIZE]);

        decrypt(&mut env, &crypto).unwrap();
        assert_eq!(env.payload, original_payload);
    }

    #[test]
    fn encrypt_leaves_trailing_bytes_plaintext() {
        let crypto = CryptoState::new(b"hunter2").unwrap();
        let mut env = Envelope::new_msg(b"0123456789012345678901234567890123456789012345678901234567890123456789012");
        let before = env.payload;
        encrypt(&mut env, &crypto).unwrap();
        let tail_start = crate::constants::PAYLOAD_CIPHER_SIZE;
        assert_eq!(&env.payload[tail_start..], &before[tail_start..]);
    }
}
