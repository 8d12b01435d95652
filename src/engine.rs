//! `Engine`: the composition root. Packages the shared mutable state (key,
//! self IP, peer set, msgbuf) that the original design left as loose global
//! statics into a single value with an explicit `new -> start -> stop`
//! lifecycle, per the redesign notes.

use crate::config::EngineConfig;
use crate::constants::MSGSIZE;
use crate::crypto::CryptoState;
use crate::error::EngineError;
use crate::mcast::{self, Receiver};
use crate::msgbuf::MsgBuf;
use crate::peerset::PeerSet;
use crate::{discovery, local};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Engine {
    config: EngineConfig,
    crypto: Arc<CryptoState>,
    msgbuf: Arc<MsgBuf>,
    peers: Arc<PeerSet>,
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let crypto = Arc::new(CryptoState::new(&config.key)?);
        let msgbuf = Arc::new(MsgBuf::new(config.self_ip, crypto.clone()));
        let peers = Arc::new(PeerSet::new());
        Ok(Self {
            config,
            crypto,
            msgbuf,
            peers,
            stop: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        })
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn msgbuf(&self) -> &Arc<MsgBuf> {
        &self.msgbuf
    }

    /// Bind the multicast socket and both local TCP acceptors, then spawn
    /// the receiver loop, discovery/sync sequence, and acceptor tasks.
    /// Returns once everything is spawned; the tasks run until `stop()`.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if !self.tasks.is_empty() {
            return Err(EngineError::AlreadyStarted);
        }

        let group = SocketAddrV4::new(self.config.group_ip, self.config.group_port);

        let std_socket = mcast::bind_multicast(self.config.self_ip, self.config.group_ip, self.config.group_port)
            .map_err(|source| EngineError::MulticastBind {
                addr: SocketAddr::V4(SocketAddrV4::new(self.config.self_ip, self.config.group_port)),
                source,
            })?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(|source| {
            EngineError::MulticastBind {
                addr: SocketAddr::V4(group),
                source,
            }
        })?);

        let send_addr = SocketAddrV4::new(self.config.self_ip, self.config.send_port);
        let send_listener = TcpListener::bind(SocketAddr::V4(send_addr))
            .await
            .map_err(|source| EngineError::TcpBind {
                addr: SocketAddr::V4(send_addr),
                source,
            })?;

        let recv_addr = SocketAddrV4::new(self.config.self_ip, self.config.recv_port);
        let recv_listener = TcpListener::bind(SocketAddr::V4(recv_addr))
            .await
            .map_err(|source| EngineError::TcpBind {
                addr: SocketAddr::V4(recv_addr),
                source,
            })?;

        let discover_reply: Arc<RwLock<Option<[u8; MSGSIZE]>>> = Arc::new(RwLock::new(None));

        let receiver = Receiver::new(
            socket.clone(),
            group,
            self.config.self_ip,
            self.crypto.clone(),
            self.msgbuf.clone(),
            self.peers.clone(),
            discover_reply.clone(),
            self.stop.clone(),
        );
        self.tasks.push(tokio::spawn(async move {
            receiver.run().await;
        }));

        self.tasks.push(tokio::spawn(discovery::run_startup(
            socket.clone(),
            group,
            self.msgbuf.clone(),
            self.crypto.clone(),
            self.peers.clone(),
            discover_reply,
            self.config.recv_port,
            self.stop.clone(),
        )));

        self.tasks.push(tokio::spawn(local::run_send_acceptor(
            send_listener,
            socket.clone(),
            group,
            self.msgbuf.clone(),
            self.crypto.clone(),
            self.stop.clone(),
        )));

        self.tasks.push(tokio::spawn(local::run_recv_acceptor(
            recv_listener,
            self.config.self_ip,
            self.msgbuf.clone(),
            self.stop.clone(),
        )));

        info!(
            "engine started on {} (group {}:{}, send {}, recv {})",
            self.config.self_ip,
            self.config.group_ip,
            self.config.group_port,
            self.config.send_port,
            self.config.recv_port
        );

        Ok(())
    }

    /// Signal every spawned task to stop and abort them. Background sleeps
    /// between retries are interrupted immediately; in-flight blocking I/O
    /// may take up to one more iteration to notice the flag.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
