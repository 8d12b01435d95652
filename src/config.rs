//! Library-level configuration, independent of the CLI front-end.

use crate::constants::{CHAT_GROUP, CHAT_GROUP_PORT, CHAT_RECV_PORT, CHAT_SEND_PORT};
use std::net::Ipv4Addr;

/// Everything the engine needs to start. The CLI binary builds one of these
/// from `clap` args; library consumers can build one directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's interface IPv4 address. The Wi-Fi interface-configuration
    /// service (out of scope) is assumed to have already assigned this.
    pub self_ip: Ipv4Addr,
    /// Pre-shared Blowfish key, 1..=60 bytes.
    pub key: Vec<u8>,
    pub group_ip: Ipv4Addr,
    pub group_port: u16,
    pub send_port: u16,
    pub recv_port: u16,
}

impl EngineConfig {
    pub fn new(self_ip: Ipv4Addr, key: Vec<u8>) -> Self {
        Self {
            self_ip,
            key,
            group_ip: CHAT_GROUP.parse().expect("constant multicast group address"),
            group_port: CHAT_GROUP_PORT,
            send_port: CHAT_SEND_PORT,
            recv_port: CHAT_RECV_PORT,
        }
    }
}
