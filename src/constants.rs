//! Reserved wire constants shared by every component.

/// Total size of an envelope on the wire, in bytes.
pub const MSGSIZE: usize = 100;

/// Size of the encrypted/plaintext payload region.
pub const PAYLOAD_SIZE: usize = 77;

/// Bytes of the payload actually covered by CBC encryption (`floor(77/8)*8`).
/// The trailing 5 bytes travel as plaintext — a wire quirk of the original
/// implementation, preserved here for interop rather than "fixed".
pub const PAYLOAD_CIPHER_SIZE: usize = (PAYLOAD_SIZE / 8) * 8;

/// Size of the MessageId, in bytes: 4 (ip) + 4 (sec) + 2 (usec low16) + 2 (checksum) + 2 pad... see envelope.rs for exact layout.
pub const MESSAGE_ID_SIZE: usize = 14;

/// Size of the IV field, in bytes.
pub const IV_SIZE: usize = 8;

/// Maximum number of retransmit attempts for an originated message.
pub const MSG_RESEND_TIMES: u32 = 10;

/// Maximum number of buffered messages before oldest-first eviction.
pub const MAXMSGS: usize = 1000;

/// Maximum number of registered local reader sockets.
pub const MAXCLIENTS: usize = 20;

/// Maximum pre-shared key length, in bytes (Blowfish's own limit).
pub const CRYPTO_KEY_MAXLEN: usize = 60;

/// Default multicast group address.
pub const CHAT_GROUP: &str = "239.0.0.1";

/// Default multicast group port.
pub const CHAT_GROUP_PORT: u16 = 11011;

/// Default local TCP port for outgoing chat text (client -> daemon).
pub const CHAT_SEND_PORT: u16 = 11012;

/// Default local TCP port for buffer dump / reader registration / sync.
pub const CHAT_RECV_PORT: u16 = 11013;

/// Envelope type byte: peer discovery.
pub const TYPE_DISCOVER: u8 = 1;

/// Envelope type byte: chat message.
pub const TYPE_MSG: u8 = 2;

/// Acceptor restart backoff after an `accept()` failure.
pub const ACCEPT_BACKOFF_SECS: u64 = 5;
