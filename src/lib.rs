pub mod config;
pub mod constants;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod local;
pub mod mcast;
pub mod msgbuf;
pub mod peerset;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{CodecError, EngineError, SyncError};
