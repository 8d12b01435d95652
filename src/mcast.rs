//! Multicast receiver and sender: the forwarding policy, ACK-by-observation
//! retransmit loop, and the socket setup shared by both.

use crate::constants::{MSGSIZE, MSG_RESEND_TIMES};
use crate::crypto::CryptoState;
use crate::envelope::{self, Envelope};
use crate::msgbuf::MsgBuf;
use crate::peerset::PeerSet;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

/// Bind a UDP socket for the multicast group, `SO_REUSEPORT`'d so several
/// peers can run on one host during testing, then join the group on the
/// given interface address.
pub fn bind_multicast(self_ip: Ipv4Addr, group: Ipv4Addr, port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &self_ip)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Compute the forwarding decision for a just-buffered envelope. `seen` is
/// the sighting count `msgbuf.add` just returned; `from_self` is whether the
/// UDP source address was this node; `source_is_id_sender` is whether the
/// UDP source matches the id's embedded sender IP (the original sender
/// retransmitting, as opposed to a relay).
///
/// The probability branch intentionally implements `p = seen * 10%`, which
/// *increases* with sighting count rather than decreasing as the source
/// comment claims — preserved for interop, not "fixed".
pub fn should_forward(seen: u32, from_self: bool, source_is_id_sender: bool, rng: &mut impl Rng) -> bool {
    if from_self {
        return false;
    }
    if (1..=5).contains(&seen) {
        return true;
    }
    if source_is_id_sender && seen > 1 {
        return true;
    }
    if seen > 1 && seen <= MSG_RESEND_TIMES {
        let roll = rng.gen_range(0..100u32);
        return roll <= seen * 10;
    }
    false
}

pub struct Receiver {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    self_ip: Ipv4Addr,
    crypto: Arc<CryptoState>,
    msgbuf: Arc<MsgBuf>,
    peers: Arc<PeerSet>,
    /// Cached ciphertext DISCOVER reply template, set once discovery startup
    /// has stamped and encrypted this node's own DISCOVER envelope.
    discover_reply: Arc<RwLock<Option<[u8; MSGSIZE]>>>,
    stop: Arc<AtomicBool>,
}

impl Receiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        group: SocketAddrV4,
        self_ip: Ipv4Addr,
        crypto: Arc<CryptoState>,
        msgbuf: Arc<MsgBuf>,
        peers: Arc<PeerSet>,
        discover_reply: Arc<RwLock<Option<[u8; MSGSIZE]>>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            socket,
            group,
            self_ip,
            crypto,
            msgbuf,
            peers,
            discover_reply,
            stop,
        }
    }

    /// Blocks on UDP recv until `stop` is set. Never holds a lock across the
    /// `recv_from` await itself — only briefly, inside `msgbuf.add`/`peers.add`.
    pub async fn run(&self) {
        let mut buf = [0u8; MSGSIZE];
        let mut rng = rand::thread_rng();
        while !self.stop.load(Ordering::Relaxed) {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("multicast recv failed: {e}");
                    continue;
                }
            };
            if len != MSGSIZE {
                trace!("dropping datagram of wrong size {len}");
                continue;
            }
            let source_ip = match source {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => continue,
            };

            self.handle_datagram(&buf, source_ip, &mut rng).await;
        }
    }

    async fn handle_datagram(&self, wire: &[u8; MSGSIZE], source_ip: Ipv4Addr, rng: &mut impl Rng) {
        let ciphertext_copy = *wire;
        let mut env = match Envelope::from_wire(wire) {
            Ok(e) => e,
            Err(e) => {
                debug!("dropping malformed envelope: {e}");
                return;
            }
        };
        if envelope::decrypt(&mut env, &self.crypto).is_err() {
            debug!("dropping envelope that failed to decrypt");
            return;
        }
        if envelope::validate(&env).is_err() {
            debug!("dropping envelope with invalid type {}", env.kind);
            return;
        }

        let from_self = source_ip == self.self_ip;
        if from_self && env.id.sender_ip == u32::from(self.self_ip) && self.msgbuf.exist(&env) > 0 {
            // Our own echo of our own message, already counted once locally;
            // the kernel's multicast loopback must not double-count it.
            return;
        }

        let seen = match self.msgbuf.add(&env).await {
            Ok(c) => c,
            Err(e) => {
                debug!("dropping envelope with invalid type: {e}");
                return;
            }
        };

        let source_is_id_sender = source_ip == env.id.sender_addr();
        if should_forward(seen, from_self, source_is_id_sender, rng) {
            if let Err(e) = self.socket.send_to(&ciphertext_copy, self.group).await {
                warn!("forward send failed: {e}");
            }
        }

        if env.is_discover() && seen == 1 {
            if let Some(reply) = *self.discover_reply.read().expect("discover reply lock poisoned") {
                if let Err(e) = self.socket.send_to(&reply, self.group).await {
                    warn!("discover reply send failed: {e}");
                }
            }
        }

        if !from_self {
            self.peers.add(source_ip);
        }
    }
}

/// Encrypt a copy of `env` and retransmit it with ACK-by-observation
/// semantics: sleep and poll `msgbuf.exist` between attempts, stopping as
/// soon as some peer (or our own echo) has rebroadcast it. On exhaustion,
/// remove the envelope from the buffer and report failure.
pub async fn send(
    env: &Envelope,
    want_ack: bool,
    socket: &UdpSocket,
    group: SocketAddrV4,
    msgbuf: &MsgBuf,
    crypto: &CryptoState,
) -> Result<(), ()> {
    let mut out = env.clone();
    envelope::encrypt(&mut out, crypto).map_err(|_| ())?;
    let wire = out.to_wire();

    for r in 1..=MSG_RESEND_TIMES {
        if let Err(e) = socket.send_to(&wire, group).await {
            warn!("mcast send failed (attempt {r}): {e}");
        }
        if !want_ack {
            return Ok(());
        }
        let mut sleep_ms = (r as u64) * 100;
        if r > 3 {
            sleep_ms *= 2;
        }
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        if msgbuf.exist(env) > 1 {
            return Ok(());
        }
    }

    msgbuf.delete(env);
    Err(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn never_forwards_own_traffic() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(!should_forward(3, true, true, &mut rng));
    }

    #[test]
    fn always_forwards_low_sighting_counts() {
        let mut rng = StdRng::seed_from_u64(1);
        for seen in 1..=5 {
            assert!(should_forward(seen, false, false, &mut rng));
        }
    }

    #[test]
    fn always_forwards_original_sender_retransmits() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(should_forward(9, false, true, &mut rng));
    }

    #[test]
    fn is_deterministic_given_a_seed() {
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        for seen in 6..=10 {
            assert_eq!(
                should_forward(seen, false, false, &mut rng_a),
                should_forward(seen, false, false, &mut rng_b)
            );
        }
    }

    #[test]
    fn never_forwards_past_resend_cap() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(!should_forward(MSG_RESEND_TIMES + 1, false, false, &mut rng));
    }
}
