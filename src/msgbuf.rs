//! The message buffer: bounded FIFO dedup cache plus the reader registry and
//! fan-out logic that rides on top of it.
//!
//! Two locks live here, per the concurrency model: `entries` is "BufLock"
//! (a plain `std::sync::Mutex` — every critical section is short and never
//! crosses an `.await`), and `readers` is "SockLock" (a `tokio::sync::Mutex`,
//! since the fan-out write loop does async socket I/O). `add`/`sync`
//! compute what to deliver under BufLock, drop it, then take SockLock to do
//! the writes — never holding both at once. `dump_and_register` is the one
//! place that nests them (BufLock outer, SockLock inner, the only order the
//! design allows), and only ever synchronously, to register a reader
//! without a window in which a concurrent `add()` could complete between
//! the backfill and the registration.

use crate::constants::{MAXCLIENTS, MAXMSGS};
use crate::crypto::CryptoState;
use crate::envelope::{self, Envelope, MessageId};
use crate::error::{CodecError, SyncError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{debug, warn};

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[derive(Clone)]
struct BufferedMessage {
    envelope: Envelope,
    count: u32,
    first_seen_secs: u32,
}

#[derive(Default)]
struct Entries {
    order: VecDeque<MessageId>,
    map: HashMap<MessageId, BufferedMessage>,
}

pub struct MsgBuf {
    self_ip: Ipv4Addr,
    crypto: Arc<CryptoState>,
    entries: Mutex<Entries>,
    readers: tokio::sync::Mutex<HashMap<u64, TcpStream>>,
    next_reader_id: AtomicU64,
}

impl MsgBuf {
    pub fn new(self_ip: Ipv4Addr, crypto: Arc<CryptoState>) -> Self {
        Self {
            self_ip,
            crypto,
            entries: Mutex::new(Entries::default()),
            readers: tokio::sync::Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(0),
        }
    }

    fn is_local_origin(&self, id: &MessageId) -> bool {
        id.sender_ip == u32::from(self.self_ip)
    }

    /// Stamp a fresh `MessageId` onto `env` for a locally-originated send.
    pub fn set_id(&self, env: &mut Envelope) {
        envelope::set_id(env, self.self_ip);
    }

    /// Insert or bump the sighting count for `env`'s id, returning the new
    /// count. Triggers fan-out to registered readers when the delivery
    /// readiness rule (§4.3) is met.
    pub async fn add(&self, env: &Envelope) -> Result<u32, CodecError> {
        envelope::validate(env)?;
        let id = env.id;
        let is_local = self.is_local_origin(&id);

        let (count, deliver) = {
            let mut entries = self.entries.lock().expect("msgbuf lock poisoned");
            if let Some(existing) = entries.map.get_mut(&id) {
                existing.count += 1;
                let count = existing.count;
                let deliver = is_local && count == 2;
                (count, deliver)
            } else {
                if entries.order.len() >= MAXMSGS {
                    if let Some(oldest) = entries.order.pop_front() {
                        entries.map.remove(&oldest);
                    }
                }
                entries.order.push_back(id);
                entries.map.insert(
                    id,
                    BufferedMessage {
                        envelope: env.clone(),
                        count: 1,
                        first_seen_secs: now_secs(),
                    },
                );
                (1, !is_local)
            }
        };

        if deliver {
            self.fan_out(env).await;
        }

        Ok(count)
    }

    /// Current sighting count for `env`'s id, or 0 if unknown.
    pub fn exist(&self, env: &Envelope) -> u32 {
        let entries = self.entries.lock().expect("msgbuf lock poisoned");
        entries.map.get(&env.id).map(|m| m.count).unwrap_or(0)
    }

    /// Remove `env`'s id from the buffer. Returns whether it was present.
    pub fn delete(&self, env: &Envelope) -> bool {
        let mut entries = self.entries.lock().expect("msgbuf lock poisoned");
        if entries.map.remove(&env.id).is_some() {
            entries.order.retain(|id| id != &env.id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("msgbuf lock poisoned").order.len()
    }

    /// Write every buffered envelope to `writer` in insertion order. A
    /// locally-originated envelope is skipped unless it has been echoed at
    /// least once (`count >= 2`). Writer failure stops the walk early and
    /// returns the number of envelopes written so far.
    pub async fn dump(&self, writer: &mut TcpStream, encrypt_out: bool) -> usize {
        let snapshot: Vec<BufferedMessage> = {
            let entries = self.entries.lock().expect("msgbuf lock poisoned");
            entries
                .order
                .iter()
                .filter_map(|id| entries.map.get(id).cloned())
                .collect()
        };

        let mut written = 0;
        for msg in snapshot {
            if self.is_local_origin(&msg.envelope.id) && msg.count < 2 {
                continue;
            }
            let mut out = msg.envelope.clone();
            if encrypt_out {
                if let Err(e) = envelope::encrypt(&mut out, &self.crypto) {
                    warn!("dump: failed to encrypt outgoing copy: {e}");
                    break;
                }
            }
            let wire = out.to_wire();
            if let Err(e) = writer.write_all(&wire).await {
                debug!("dump: writer closed after {written} envelopes: {e}");
                break;
            }
            written += 1;
        }
        written
    }

    /// Dump the buffer to `stream`, then register it as a reader, without
    /// ever leaving a window in which an envelope delivered between the
    /// dump and the registration is missed. Writes happen outside any lock
    /// (BufLock must not cross `.await`); registration re-checks the buffer
    /// under BufLock with SockLock nested inside it (the order the
    /// concurrency model allows) so no envelope can complete `add()` and
    /// slip past without either being in the backfill or reaching the
    /// reader via the normal fan-out path. Returns `None` if the registry
    /// is full or the stream errors before registration completes.
    pub async fn dump_and_register(&self, mut stream: TcpStream, encrypt_out: bool) -> Option<u64> {
        let mut sent: HashSet<MessageId> = HashSet::new();

        loop {
            let pending: Vec<BufferedMessage> = {
                let entries = self.entries.lock().expect("msgbuf lock poisoned");
                entries
                    .order
                    .iter()
                    .filter(|id| !sent.contains(*id))
                    .filter_map(|id| entries.map.get(id).cloned())
                    .collect()
            };

            for msg in &pending {
                if self.is_local_origin(&msg.envelope.id) && msg.count < 2 {
                    sent.insert(msg.envelope.id);
                    continue;
                }
                let mut out = msg.envelope.clone();
                if encrypt_out {
                    if let Err(e) = envelope::encrypt(&mut out, &self.crypto) {
                        warn!("dump: failed to encrypt outgoing copy: {e}");
                        return None;
                    }
                }
                if let Err(e) = stream.write_all(&out.to_wire()).await {
                    debug!("dump: writer closed mid-backfill: {e}");
                    return None;
                }
                sent.insert(msg.envelope.id);
            }

            // BufLock, held synchronously (no `.await` below until we return
            // or loop), with SockLock nested inside it to register. If
            // anything landed in `entries` since the snapshot above, or the
            // registry is momentarily locked by a concurrent fan-out, go
            // around again and backfill the delta instead of registering a
            // reader that could miss it.
            let entries = self.entries.lock().expect("msgbuf lock poisoned");
            let caught_up = entries.order.iter().all(|id| sent.contains(id));
            if !caught_up {
                drop(entries);
                continue;
            }

            let mut readers = match self.readers.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    drop(entries);
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            if readers.len() >= MAXCLIENTS {
                return None;
            }
            let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
            readers.insert(id, stream);
            return Some(id);
        }
    }

    /// Connect to `peer:port`, read 100-byte envelopes until EOF, decrypt
    /// and insert any unknown ids with sighting count forced to 2 (so a
    /// locally-originated duplicate pulled in via sync is not re-flooded as
    /// unacknowledged). Returns the number of newly inserted messages.
    pub async fn sync(&self, peer: Ipv4Addr, port: u16) -> Result<usize, SyncError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(peer, port));
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SyncError::Io { peer: addr, source })?;

        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut inserted = 0usize;
        let mut buf = [0u8; crate::constants::MSGSIZE];
        loop {
            match stream.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(source) => return Err(SyncError::Io { peer: addr, source }),
            }

            let mut env = Envelope::from_wire(&buf).map_err(|source| SyncError::Codec {
                peer: addr,
                source,
            })?;
            if envelope::decrypt(&mut env, &self.crypto).is_err() {
                debug!("sync: dropping envelope that failed to decrypt from {addr}");
                continue;
            }

            let mut entries = self.entries.lock().expect("msgbuf lock poisoned");
            if entries.map.contains_key(&env.id) {
                continue;
            }
            if entries.order.len() >= MAXMSGS {
                if let Some(oldest) = entries.order.pop_front() {
                    entries.map.remove(&oldest);
                }
            }
            let first_seen_secs = env.id.sender_secs;
            entries.order.push_back(env.id);
            entries.map.insert(
                env.id,
                BufferedMessage {
                    envelope: env,
                    count: 2,
                    first_seen_secs,
                },
            );
            inserted += 1;
        }

        Ok(inserted)
    }

    /// Register `stream` as a reader socket. Returns `None` if the registry
    /// is already at `MAXCLIENTS` capacity, in which case the caller should
    /// close the connection.
    pub async fn add_reader(&self, stream: TcpStream) -> Option<u64> {
        let mut readers = self.readers.lock().await;
        if readers.len() >= MAXCLIENTS {
            return None;
        }
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        readers.insert(id, stream);
        Some(id)
    }

    pub async fn remove_reader(&self, id: u64) {
        self.readers.lock().await.remove(&id);
    }

    pub async fn reader_count(&self) -> usize {
        self.readers.lock().await.len()
    }

    /// Write `env` (plaintext) to every registered reader; drop any socket
    /// that fails the write.
    async fn fan_out(&self, env: &Envelope) {
        let wire = env.to_wire();
        let mut readers = self.readers.lock().await;
        let mut dead = Vec::new();
        for (id, stream) in readers.iter_mut() {
            if let Err(e) = stream.write_all(&wire).await {
                debug!("fan-out: dropping reader {id}: {e}");
                dead.push(*id);
            }
        }
        for id in dead {
            readers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAYLOAD_SIZE;

    fn make_env(self_ip: Ipv4Addr, sender: Ipv4Addr, secs: u32) -> Envelope {
        let mut env = Envelope::new_msg(b"hi");
        env.id.sender_ip = u32::from(sender);
        env.id.sender_secs = secs;
        let _ = self_ip;
        env
    }

    fn buf() -> MsgBuf {
        let crypto = Arc::new(CryptoState::new(b"k").unwrap());
        MsgBuf::new(Ipv4Addr::new(10, 0, 0, 1), crypto)
    }

    #[tokio::test]
    async fn dedup_increments_count() {
        let mb = buf();
        let env = make_env(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1);
        assert_eq!(mb.add(&env).await.unwrap(), 1);
        assert_eq!(mb.add(&env).await.unwrap(), 2);
        assert_eq!(mb.add(&env).await.unwrap(), 3);
        assert_eq!(mb.exist(&env), 3);
    }

    #[tokio::test]
    async fn fifo_eviction_drops_oldest() {
        let mb = buf();
        for i in 0..(MAXMSGS + 3) {
            let env = make_env(
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                i as u32,
            );
            mb.add(&env).await.unwrap();
        }
        assert_eq!(mb.len(), MAXMSGS);
        let evicted = make_env(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 0);
        assert_eq!(mb.exist(&evicted), 0);
        let survivor = make_env(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 5);
        assert_eq!(mb.exist(&survivor), 1);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let mb = buf();
        let env = make_env(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1);
        mb.add(&env).await.unwrap();
        assert!(mb.delete(&env));
        assert_eq!(mb.exist(&env), 0);
        assert!(!mb.delete(&env));
    }

    #[tokio::test]
    async fn remote_origin_delivers_on_first_sighting() {
        let self_ip = Ipv4Addr::new(10, 0, 0, 1);
        let mb = MsgBuf::new(self_ip, Arc::new(CryptoState::new(b"k").unwrap()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let id = mb.add_reader(server_side).await.unwrap();
        assert_eq!(mb.reader_count().await, 1);

        let env = make_env(self_ip, Ipv4Addr::new(10, 0, 0, 2), 1);
        assert_eq!(mb.add(&env).await.unwrap(), 1);

        let mut client = client;
        let mut buf = [0u8; crate::constants::MSGSIZE];
        client.read_exact(&mut buf).await.unwrap();
        let received = Envelope::from_wire(&buf).unwrap();
        assert_eq!(received.id, env.id);
        let _ = id;
        let _ = PAYLOAD_SIZE;
    }

    #[tokio::test]
    async fn local_origin_delivers_only_after_first_echo() {
        let self_ip = Ipv4Addr::new(10, 0, 0, 1);
        let mb = MsgBuf::new(self_ip, Arc::new(CryptoState::new(b"k").unwrap()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        mb.add_reader(server_side).await.unwrap();

        let env = make_env(self_ip, self_ip, 1);
        assert_eq!(mb.add(&env).await.unwrap(), 1);

        // Not yet delivered at count == 1: the client should have nothing to read.
        let mut one_byte = [0u8; 1];
        let immediate =
            tokio::time::timeout(Duration::from_millis(50), client.peek(&mut one_byte)).await;
        assert!(immediate.is_err() || immediate.unwrap().unwrap_or(0) == 0);

        assert_eq!(mb.add(&env).await.unwrap(), 2);
        let mut buf = [0u8; crate::constants::MSGSIZE];
        client.read_exact(&mut buf).await.unwrap();
        let received = Envelope::from_wire(&buf).unwrap();
        assert_eq!(received.id, env.id);
    }
}
