//! End-to-end scenarios exercised over real sockets, following the same
//! "spin up real listeners on loopback" convention as the rest of the corpus.
//! Two logical nodes share one process and are told apart by distinct
//! loopback addresses (127.0.0.1 / 127.0.0.2) rather than distinct ports, so
//! they can run the daemon's real TCP/multicast ports unmodified and the
//! sender-identity logic (self vs. remote) exercises the same code path it
//! would across two hosts.

use ibsschat::constants::{CHAT_RECV_PORT, CHAT_SEND_PORT, PAYLOAD_SIZE};
use ibsschat::envelope::Envelope;
use ibsschat::{Engine, EngineConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

const KEY: &[u8] = b"integration-test-key";

async fn connect_from(local_ip: Ipv4Addr, target: (Ipv4Addr, u16)) -> TcpStream {
    let socket = TcpSocket::new_v4().expect("v4 socket");
    socket
        .bind(SocketAddr::new(IpAddr::V4(local_ip), 0))
        .expect("bind local addr");
    socket
        .connect(SocketAddr::new(IpAddr::V4(target.0), target.1))
        .await
        .expect("connect")
}

async fn start_node(ip: Ipv4Addr) -> Engine {
    let config = EngineConfig::new(ip, KEY.to_vec());
    let mut engine = Engine::new(config).expect("construct engine");
    engine.start().await.expect("start engine");
    engine
}

fn text_payload(s: &str) -> [u8; PAYLOAD_SIZE] {
    let mut buf = [0u8; PAYLOAD_SIZE];
    let n = s.len().min(PAYLOAD_SIZE);
    buf[..n].copy_from_slice(s.as_bytes());
    buf
}

async fn read_one_envelope(stream: &mut TcpStream) -> Envelope {
    let mut buf = [0u8; ibsschat::constants::MSGSIZE];
    stream.read_exact(&mut buf).await.expect("read envelope");
    Envelope::from_wire(&buf).expect("decode envelope")
}

/// S1: a message sent on node A's send port reaches node B's reader, and
/// node A's own reader also observes it once B's forward echoes back.
#[tokio::test]
async fn two_node_delivery_reaches_remote_reader_and_echoes_home() {
    let ip_a = Ipv4Addr::new(127, 0, 0, 1);
    let ip_b = Ipv4Addr::new(127, 0, 0, 2);

    let _engine_a = start_node(ip_a).await;
    let _engine_b = start_node(ip_b).await;

    // Let discovery/sync settle so both sides have each other in the peer set.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Register both nodes' own reader sockets before sending, so neither
    // misses the fan-out.
    let mut reader_a = connect_from(ip_a, (ip_a, CHAT_RECV_PORT)).await;
    let mut reader_b = connect_from(ip_b, (ip_b, CHAT_RECV_PORT)).await;

    let mut sender = connect_from(ip_a, (ip_a, CHAT_SEND_PORT)).await;
    sender
        .write_all(&text_payload("hello from a"))
        .await
        .expect("write payload");
    let mut status = [0u8; 4];
    sender.read_exact(&mut status).await.expect("read status");

    let remote = timeout(Duration::from_secs(5), read_one_envelope(&mut reader_b))
        .await
        .expect("b should observe the message");
    assert_eq!(remote.id.sender_addr(), ip_a);
    assert!(remote.payload.starts_with(b"hello from a"));

    let home = timeout(Duration::from_secs(5), read_one_envelope(&mut reader_a))
        .await
        .expect("a should see its own message echoed back as a reader");
    assert_eq!(home.id, remote.id);
}

/// S3: a lone node with no peers still accepts a send, retries the
/// configured number of times, then gives up and drops the message from the
/// buffer instead of holding it forever.
#[tokio::test]
async fn unacknowledged_message_eventually_drops_from_buffer() {
    let ip = Ipv4Addr::new(127, 0, 0, 3);
    let engine = start_node(ip).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut sender = connect_from(ip, (ip, CHAT_SEND_PORT)).await;
    sender
        .write_all(&text_payload("nobody is listening"))
        .await
        .expect("write payload");
    let mut status = [0u8; 4];
    sender.read_exact(&mut status).await.expect("read status");

    // Resend loop runs ~10s worst case (see mcast::send's backoff schedule).
    timeout(Duration::from_secs(15), async {
        loop {
            if engine.msgbuf().len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("message should eventually be evicted after exhausting retries");
}

/// S6: the buffer never grows past its cap; excess entries drop the oldest
/// first rather than rejecting new ones.
#[tokio::test]
async fn buffer_eviction_keeps_newest_entries_under_cap() {
    let ip = Ipv4Addr::new(127, 0, 0, 4);
    let engine = start_node(ip).await;

    for i in 0..(ibsschat::constants::MAXMSGS + 5) {
        let mut env = Envelope::new_msg(format!("msg {i}").as_bytes());
        env.id.sender_ip = u32::from(Ipv4Addr::new(203, 0, 113, 1));
        env.id.sender_secs = i as u32;
        env.id.sender_usecs_low16 = 0;
        env.id.checksum = 0;
        let wire = env.to_wire();
        env.id.checksum = ibsschat::envelope::internet_checksum(&wire);
        let _ = engine.msgbuf().add(&env).await;
    }

    assert_eq!(engine.msgbuf().len(), ibsschat::constants::MAXMSGS);
}
