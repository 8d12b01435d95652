//! Startup discovery burst and the sync-on-join worker.

use crate::constants::MSGSIZE;
use crate::crypto::CryptoState;
use crate::envelope::{self, Envelope};
use crate::mcast;
use crate::msgbuf::MsgBuf;
use crate::peerset::PeerSet;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::time::Duration;
use tracing::{info, warn};

/// Build this node's DISCOVER envelope, cache an encrypted copy for use as
/// the reply template in the receiver, and emit two DISCOVER datagrams
/// 200ms apart with `want_ack = false`. Then sleep 1s and hand off to the
/// sync worker.
pub async fn run_startup(
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    msgbuf: Arc<MsgBuf>,
    crypto: Arc<CryptoState>,
    peers: Arc<PeerSet>,
    discover_reply: Arc<RwLock<Option<[u8; MSGSIZE]>>>,
    recv_port: u16,
    stop: Arc<AtomicBool>,
) {
    let mut discover = Envelope::new_discover();
    msgbuf.set_id(&mut discover);

    let mut cached = discover.clone();
    if let Err(e) = envelope::encrypt(&mut cached, &crypto) {
        warn!("discovery: failed to encrypt reply template: {e}");
    } else {
        *discover_reply.write().expect("discover reply lock poisoned") = Some(cached.to_wire());
    }

    for i in 0..2 {
        if mcast::send(&discover, false, &socket, group, &msgbuf, &crypto)
            .await
            .is_err()
        {
            warn!("discovery: failed to send DISCOVER burst {i}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    run_sync_worker(msgbuf, peers, recv_port, stop).await;
}

/// Wait until the peer set is non-empty, then try peers in order, stopping
/// at the first one that yields at least one message. A node that never
/// sees any sync backfill (alone on the network) simply never returns from
/// the wait loop until `stop` is set.
async fn run_sync_worker(
    msgbuf: Arc<MsgBuf>,
    peers: Arc<PeerSet>,
    recv_port: u16,
    stop: Arc<AtomicBool>,
) {
    while peers.is_empty() {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for peer in peers.snapshot() {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match msgbuf.sync(peer, recv_port).await {
            Ok(count) if count > 0 => {
                info!("sync: pulled {count} messages from {peer}");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("sync: failed against {peer}: {e}");
                continue;
            }
        }
    }
}
