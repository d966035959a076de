//! A running peer: one chain, a listener, and a thread per peer link.
//!
//! Shared state is the chain (behind `chain`) and the peer registry (its own lock). The two
//! locks are never held together. Every chain mutation bumps `chain_epoch`, which is how an
//! in-flight mining round learns its parent went stale.

use crate::config::{NodeConfig, GLOBAL_CONFIG};
use crate::core::{Block, Blockchain};
use crate::error::{BlockchainError, Result};
use crate::network::message::Message;
use crate::network::peer::{Direction, LinkReader, LinkState, PeerLink};
use crate::network::peer_registry::PeerRegistry;
use crate::utils::sync::{lock, read, write};
use log::{debug, error, info, warn};
use num_bigint::BigUint;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pause after a failed `accept` so a persistent error cannot spin the acceptor
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// Granularity at which the resync thread notices shutdown
const RESYNC_POLL: Duration = Duration::from_millis(100);
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// How an event is presented to whoever is watching the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// Receives every observable node event
pub type LogSink = Arc<dyn Fn(&str, Severity) + Send + Sync>;

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) chain: Mutex<Blockchain>,
    pub(crate) chain_epoch: AtomicU64,
    pub(crate) peers: PeerRegistry,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    log_sink: RwLock<Option<LogSink>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_link_id: AtomicU64,
}

/// Handle to a node. Clones share the same chain, peers and threads.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Validate `config` and mine the genesis block. Nothing touches the network until
    /// [`Node::start_node`].
    pub fn new(config: NodeConfig) -> Result<Node> {
        config.validate()?;
        let mut chain = Blockchain::from_config(&config);
        chain.create_genesis(config.genesis_payload.clone())?;

        Ok(Node {
            inner: Arc::new(NodeInner {
                peers: PeerRegistry::new(config.max_peers, config.max_pending_peers),
                config,
                chain: Mutex::new(chain),
                chain_epoch: AtomicU64::new(0),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                log_sink: RwLock::new(None),
                workers: Mutex::new(Vec::new()),
                next_link_id: AtomicU64::new(1),
            }),
        })
    }

    /// Node built from defaults plus `PEERCHAIN_*` overrides
    pub fn from_global_config() -> Result<Node> {
        Node::new(GLOBAL_CONFIG.clone())
    }

    /// Bind `host:port` (0 picks a free port) and start the acceptor, the miner when
    /// enabled, and the periodic resync. Returns the bound port.
    pub fn start_node(&self, port: u16) -> Result<u16> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BlockchainError::AlreadyStarted);
        }

        let (listener, local) = match self.bind(port) {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.emit(format!("Failed to start node: {e}"), Severity::Error);
                return Err(e);
            }
        };
        *lock(&self.inner.local_addr) = Some(local);

        if let Err(e) = self.spawn_workers(listener) {
            self.stop();
            return Err(e);
        }

        self.emit(
            format!("Node started on port {}", local.port()),
            Severity::Success,
        );
        Ok(local.port())
    }

    fn bind(&self, port: u16) -> Result<(TcpListener, SocketAddr)> {
        let host = self.inner.config.host.as_str();
        let listener = TcpListener::bind((host, port))
            .map_err(|e| BlockchainError::Io(format!("Failed to bind to {host}:{port}: {e}")))?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    fn spawn_workers(&self, listener: TcpListener) -> Result<()> {
        let node = self.clone();
        self.spawn_worker("acceptor", move || node.accept_loop(listener))?;

        if self.inner.config.mining_enabled {
            let node = self.clone();
            self.spawn_worker("miner", move || node.run_miner())?;
        }
        if let Some(interval) = self.inner.config.resync_interval() {
            let node = self.clone();
            self.spawn_worker("resync", move || node.run_resync(interval))?;
        }
        Ok(())
    }

    fn spawn_worker<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| BlockchainError::Io(format!("Failed to spawn {name} thread: {e}")))?;
        lock(&self.inner.workers).push(handle);
        Ok(())
    }

    fn accept_loop(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            if !self.is_running() {
                break;
            }
            match stream {
                Ok(stream) => {
                    if !self.inner.peers.should_accept_connection() {
                        warn!("Rejecting inbound connection: peer limit reached");
                        continue;
                    }
                    if !self.inner.peers.should_accept_pending() {
                        warn!("Rejecting inbound connection: too many pending handshakes");
                        continue;
                    }
                    if let Err(e) = self.accept_link(stream) {
                        self.emit(format!("Inbound connection failed: {e}"), Severity::Error);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        debug!("Acceptor exiting");
    }

    /// Inbound links stay in `Connecting` until the peer's CONNECT names its port, and are
    /// closed if that does not happen within the handshake timeout.
    fn accept_link(&self, stream: TcpStream) -> Result<()> {
        let (link, reader) = PeerLink::from_stream(
            self.next_link_id(),
            stream,
            Direction::Inbound,
            self.inner.config.connect_timeout(),
            self.inner.config.max_frame_bytes,
        )?;
        let link = Arc::new(link);
        info!("New connection from {}", link.remote());
        self.inner.peers.track(Arc::clone(&link));
        self.spawn_handler(link, reader)
    }

    fn run_resync(&self, interval: Duration) {
        let mut last = Instant::now();
        while self.is_running() {
            thread::sleep(RESYNC_POLL);
            if last.elapsed() >= interval {
                let asked = self.request_sync_from_all();
                debug!("Periodic resync sent to {asked} peers");
                last = Instant::now();
            }
        }
    }

    /// Dial a peer; false when not started, already connected, dialing ourselves, or the
    /// connection fails. The reason is reported through the log sink.
    pub fn connect_to_peer(&self, host: &str, port: u16) -> bool {
        match self.dial(host, port) {
            Ok(addr) => {
                self.emit(format!("Connected to peer {addr}"), Severity::Success);
                true
            }
            Err(e) => {
                self.emit(
                    format!("Could not connect to {host}:{port}: {e}"),
                    Severity::Error,
                );
                false
            }
        }
    }

    /// Fallible form of [`Node::connect_to_peer`]; returns the address the peer is
    /// registered under.
    pub fn dial(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let local_port = self.local_port().ok_or(BlockchainError::NotStarted)?;
        let addr = resolve(host, port)?;
        if self.is_own_address(&addr) {
            return Err(BlockchainError::PeerRejected(format!(
                "{addr} is this node"
            )));
        }
        if self.inner.peers.is_known(&addr) {
            return Err(BlockchainError::PeerRejected(format!(
                "already connected to {addr}"
            )));
        }
        if !self.inner.peers.should_accept_connection() {
            return Err(BlockchainError::PeerRejected(
                "peer limit reached".to_string(),
            ));
        }

        let (link, reader) = PeerLink::connect(
            self.next_link_id(),
            addr,
            self.inner.config.connect_timeout(),
            self.inner.config.max_frame_bytes,
        )?;
        let link = Arc::new(link);
        if let Err(e) = self.inner.peers.register(addr, &link) {
            link.close();
            return Err(e);
        }

        link.set_state(LinkState::Syncing);
        let handshake = link
            .send(&Message::Connect { port: local_port })
            .and_then(|_| link.send(&Message::SyncRequest));
        if let Err(e) = handshake {
            self.drop_link(&link);
            return Err(e);
        }
        self.spawn_handler(link, reader)?;
        Ok(addr)
    }

    pub(crate) fn spawn_handler(&self, link: Arc<PeerLink>, reader: LinkReader) -> Result<()> {
        let node = self.clone();
        let handler_link = Arc::clone(&link);
        thread::Builder::new()
            .name(format!("peer-{}", link.id()))
            .spawn(move || node.handle_link(handler_link, reader))
            .map(|_| ())
            .map_err(|e| {
                self.drop_link(&link);
                BlockchainError::Io(format!("Failed to spawn peer handler: {e}"))
            })
    }

    /// Unregister and close; reports a disconnect only the first time per link.
    pub(crate) fn drop_link(&self, link: &Arc<PeerLink>) {
        link.close();
        if self.inner.peers.remove(link.id()).is_some() {
            self.emit(
                format!("Peer {} disconnected", link.label()),
                Severity::Info,
            );
        }
    }

    /// Our listener is reachable at `addr`. A wildcard bind answers on every local
    /// interface, so the port alone is not enough to decide.
    fn is_own_address(&self, addr: &SocketAddr) -> bool {
        match self.local_addr() {
            Some(local) if local.port() == addr.port() => {
                if local.ip().is_unspecified() {
                    is_local_interface(addr.ip())
                } else {
                    local.ip() == addr.ip()
                }
            }
            _ => false,
        }
    }

    /// Stop every thread and close every link. Safe to call more than once.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // The acceptor is parked in accept(); a throwaway connection releases it
        if let Some(local) = lock(&self.inner.local_addr).take() {
            let _ = TcpStream::connect_timeout(&wake_address(local), WAKE_TIMEOUT);
        }
        for link in self.inner.peers.drain() {
            link.close();
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!("{name} thread panicked");
            }
        }
        self.emit("Node stopped", Severity::Info);
    }

    pub fn set_log_sink<F>(&self, sink: F)
    where
        F: Fn(&str, Severity) + Send + Sync + 'static,
    {
        *write(&self.inner.log_sink) = Some(Arc::new(sink));
    }

    pub fn clear_log_sink(&self) {
        *write(&self.inner.log_sink) = None;
    }

    /// Log through `log` and forward to the sink. The sink runs with no lock held.
    pub(crate) fn emit(&self, message: impl AsRef<str>, severity: Severity) {
        let message = message.as_ref();
        match severity {
            Severity::Info | Severity::Success => info!("{message}"),
            Severity::Error => error!("{message}"),
        }
        let sink = read(&self.inner.log_sink).clone();
        if let Some(sink) = sink {
            sink(message, severity);
        }
    }

    pub(crate) fn chain_epoch(&self) -> u64 {
        self.inner.chain_epoch.load(Ordering::SeqCst)
    }

    /// Called with the chain lock held, after every append or replace
    pub(crate) fn bump_epoch(&self) {
        self.inner.chain_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn next_link_id(&self) -> u64 {
        self.inner.next_link_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Copy of the whole chain, genesis first
    pub fn chain_snapshot(&self) -> Vec<Block> {
        lock(&self.inner.chain).blocks().to_vec()
    }

    pub fn latest_block(&self) -> Option<Block> {
        lock(&self.inner.chain).latest().cloned()
    }

    /// Number of blocks, genesis included
    pub fn height(&self) -> usize {
        lock(&self.inner.chain).len()
    }

    /// Difficulty the next mined block will declare
    pub fn difficulty(&self) -> u32 {
        lock(&self.inner.chain).difficulty()
    }

    pub fn cumulative_work(&self) -> BigUint {
        lock(&self.inner.chain).cumulative_work()
    }

    /// Registered peer addresses, sorted
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.inner.peers.connected_addresses()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peer_state(&self, addr: &SocketAddr) -> Option<LinkState> {
        self.inner.peers.get(addr).map(|link| link.state())
    }
}

/// First resolved address, IPv4 preferred since the listener binds IPv4 by default
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Transport(format!("Failed to resolve {host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| BlockchainError::Transport(format!("No address found for {host}")))
}

/// `ip` belongs to this host. Connecting a UDP socket sends nothing; it only asks the OS
/// which source address it would route from, which is `ip` itself when `ip` is ours.
fn is_local_interface(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let any = match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    UdpSocket::bind((any, 0))
        .and_then(|socket| {
            socket.connect((ip, 9))?;
            socket.local_addr()
        })
        .is_ok_and(|source| source.ip() == ip)
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    } else {
        local
    }
}
