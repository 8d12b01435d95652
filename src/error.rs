//! Error taxonomy for the few call boundaries that need a `Result`.
//!
//! Most failure modes in this engine are handled locally and logged rather
//! than propagated — see the receiver loop in `mcast.rs` and the forwarding
//! policy, which match on errors and `continue` instead of bubbling them up.
//! `EngineError` exists for the boundaries that genuinely cross an API: startup,
//! sync, and the codec's own fallible operations.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope has wrong size: {0} bytes (expected {1})")]
    WrongSize(usize, usize),

    #[error("unknown envelope type: {0}")]
    UnknownType(u8),

    #[error("no encryption key set")]
    NoKey,

    #[error("key length {0} exceeds CRYPTO_KEY_MAXLEN ({1})")]
    KeyTooLong(usize, usize),

    #[error("key must be at least 1 byte")]
    EmptyKey,

    #[error("cipher error: {0}")]
    Cipher(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error talking to {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error during sync with {peer}: {source}")]
    Codec {
        peer: SocketAddr,
        #[source]
        source: CodecError,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind multicast socket on {addr}: {source}")]
    MulticastBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind TCP listener on {addr}: {source}")]
    TcpBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] CodecError),

    #[error("engine already started")]
    AlreadyStarted,
}
