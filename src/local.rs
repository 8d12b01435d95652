//! Local TCP acceptors: the chat-text send port and the buffer-dump/reader
//! recv port. Both restart after a 5s backoff on `accept()` failure, and
//! every accepted connection is closed on completion or error before its
//! worker returns.

use crate::constants::{ACCEPT_BACKOFF_SECS, PAYLOAD_SIZE};
use crate::crypto::CryptoState;
use crate::envelope::Envelope;
use crate::mcast;
use crate::msgbuf::MsgBuf;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use std::net::SocketAddrV4;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// `CHAT_SEND_PORT` acceptor: one connection per outgoing message. Reads
/// exactly 77 bytes of chat text, wraps it in a MSG envelope, sends it with
/// `want_ack = true`, and writes back a 4-byte little-endian status.
pub async fn run_send_acceptor(
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    msgbuf: Arc<MsgBuf>,
    crypto: Arc<CryptoState>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("send acceptor: accept failed: {e}, backing off {ACCEPT_BACKOFF_SECS}s");
                tokio::time::sleep(Duration::from_secs(ACCEPT_BACKOFF_SECS)).await;
                continue;
            }
        };
        let socket = socket.clone();
        let msgbuf = msgbuf.clone();
        let crypto = crypto.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_send_client(stream, socket, group, msgbuf, crypto).await {
                debug!("send client {peer} error: {e}");
            }
        });
    }
}

async fn handle_send_client(
    mut stream: TcpStream,
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    msgbuf: Arc<MsgBuf>,
    crypto: Arc<CryptoState>,
) -> std::io::Result<()> {
    let mut text = [0u8; PAYLOAD_SIZE];
    stream.read_exact(&mut text).await?;

    let mut env = Envelope::new_msg(&text);
    msgbuf.set_id(&mut env);

    let delivered = mcast::send(&env, true, &socket, group, &msgbuf, &crypto)
        .await
        .is_ok();

    let status: i32 = if delivered { 0 } else { 1 };
    stream.write_all(&status.to_le_bytes()).await?;
    Ok(())
}

/// `CHAT_RECV_PORT` acceptor: dumps the buffer to every connecting client,
/// then either registers the socket as a persistent reader (same-host
/// clients) or closes it (remote sync clients, per §4.6/§4.7).
pub async fn run_recv_acceptor(
    listener: TcpListener,
    self_ip: Ipv4Addr,
    msgbuf: Arc<MsgBuf>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("recv acceptor: accept failed: {e}, backing off {ACCEPT_BACKOFF_SECS}s");
                tokio::time::sleep(Duration::from_secs(ACCEPT_BACKOFF_SECS)).await;
                continue;
            }
        };
        let msgbuf = msgbuf.clone();
        tokio::spawn(async move {
            handle_recv_client(stream, peer, self_ip, msgbuf).await;
        });
    }
}

async fn handle_recv_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    self_ip: Ipv4Addr,
    msgbuf: Arc<MsgBuf>,
) {
    let peer_ip = match peer {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => return,
    };
    let is_local = peer_ip == self_ip;

    if is_local {
        if msgbuf.dump_and_register(stream, false).await.is_none() {
            warn!("reader registry full or write failed, dropping local reader {peer}");
        } else {
            info!("registered local reader {peer}");
        }
        return;
    }

    let dumped = msgbuf.dump(&mut stream, true).await;
    debug!("dumped {dumped} messages to remote sync client {peer}");
    // Remote (sync) clients: stream drops here, closing the connection.
}
