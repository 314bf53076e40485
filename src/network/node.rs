//! Gossip node
//!
//! The node owns the peer set and everything around it:
//! - the listener and inbound admission (bans, capacity, identity)
//! - outbound dialing with the compression probe and signed handshake
//! - the event loop serving peer requests and feeding the broadcaster
//! - operator surfaces: peer info, net info, blacklist, certificates
//! - block, header and mempool fetching from peers
//!
//! Peers are keyed by identity name. Registration checks and inserts
//! under one write lock, so two connections carrying the same identity
//! can never both be registered.

use crate::chain::ChainClient;
use crate::config::{ConfigError, GossipConfig};
use crate::core::{Block, BlockHeader, Transaction};
use crate::network::addrbook::AddrBook;
use crate::network::blacklist::{BanEntry, BlackList};
use crate::network::broadcast::{BroadcastConfig, Broadcaster, GossipStatsSnapshot};
use crate::network::codec::MessageCodec;
use crate::network::connection::{spawn_connection, BoxedStream, PeerEvent};
use crate::network::download::{BlockFetcher, DownloadJob};
use crate::network::error::{ErrorClass, P2pError};
use crate::network::filter::TimedCache;
use crate::network::handshake::{self, HandshakeResult, LocalHandshake};
use crate::network::message::{
    Envelope, Message, PeerInfoMessage, RejectCode, MAX_ADDR_PER_MESSAGE, MAX_BLOCKS_PER_REQUEST,
};
use crate::network::monitor;
use crate::network::netaddress::{DialOptions, NetAddress, DIAL_TIMEOUT};
use crate::network::peer::{Peer, PeerInfo, PeerParams, PeerState, REQUEST_TIMEOUT};
use crate::network::tls::{PeerCertificate, RevocationRegistry, TlsCredentials};
use crate::network::version::{calc_channel_version, local_services, PROTOCOL_VERSION};
use crate::storage::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Queue between connection tasks and the event loop
const EVENT_QUEUE_SIZE: usize = 1024;

/// Candidates dialed recently, to avoid concurrent dials of one address
const DIAL_CACHE_SIZE: usize = 1024;

/// How long a dial attempt holds its address
const DIAL_CACHE_TIMEOUT: Duration = Duration::from_secs(30);

/// Network information for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetInfo {
    /// Our identity name
    pub name: String,
    pub listen_addr: Option<String>,
    /// Address peers observed us at
    pub external_addr: Option<String>,
    /// Whether the external address is publicly routable
    pub nat_public: bool,
    pub inbound: usize,
    pub outbound: usize,
    pub known_addresses: usize,
    pub banned: usize,
    /// Protocol violations seen since start
    pub violations: u64,
    pub gossip: GossipStatsSnapshot,
}

/// Gossip P2P node
pub struct Node {
    config: GossipConfig,
    chain: Arc<dyn ChainClient>,
    store: Arc<KvStore>,
    addrbook: Arc<AddrBook>,
    blacklist: Arc<BlackList>,
    registry: Arc<RevocationRegistry>,
    tls: Option<Arc<TlsCredentials>>,
    broadcaster: Broadcaster,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    dialing: TimedCache<String, ()>,
    listen: StdRwLock<Option<NetAddress>>,
    external: StdRwLock<Option<NetAddress>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    violations: AtomicU64,
    cancel: CancellationToken,
}

impl Node {
    /// Create a node with its store under `config.data_dir`
    pub fn new(config: GossipConfig, chain: Arc<dyn ChainClient>) -> Result<Arc<Self>, P2pError> {
        let store = Arc::new(KvStore::open(&config.data_dir)?);
        Self::with_store(config, chain, store)
    }

    /// Create a node over an existing store
    pub fn with_store(
        config: GossipConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<KvStore>,
    ) -> Result<Arc<Self>, P2pError> {
        config.validate()?;

        let addrbook = Arc::new(AddrBook::new(store.clone())?);
        let blacklist = Arc::new(
            BlackList::with_ban_duration(Duration::from_secs(config.ban_duration_secs))
                .with_identity_window(Duration::from_secs(config.quarantine_secs)),
        );
        let registry = Arc::new(RevocationRegistry::load(&store)?);
        let tls = if config.enable_tls {
            Some(Arc::new(load_credentials(&config, registry.clone())?))
        } else {
            None
        };
        let broadcaster = Broadcaster::new(BroadcastConfig::from(&config), chain.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        log::info!(
            "Node identity {} on channel {}",
            addrbook.public_key_hex(),
            config.channel
        );

        Ok(Arc::new(Self {
            config,
            chain,
            store,
            addrbook,
            blacklist,
            registry,
            tls,
            broadcaster,
            peers: RwLock::new(HashMap::new()),
            dialing: TimedCache::new(DIAL_CACHE_SIZE, DIAL_CACHE_TIMEOUT),
            listen: StdRwLock::new(None),
            external: StdRwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            violations: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Our identity name (public key hex)
    pub fn name(&self) -> String {
        self.addrbook.public_key_hex()
    }

    pub fn addrbook(&self) -> &Arc<AddrBook> {
        &self.addrbook
    }

    pub fn blacklist(&self) -> &Arc<BlackList> {
        &self.blacklist
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bound listen address, once started
    pub fn listen_addr(&self) -> Option<NetAddress> {
        self.listen.read().ok().and_then(|l| l.clone())
    }

    /// Address peers last observed us at
    pub fn external_addr(&self) -> Option<NetAddress> {
        self.external.read().ok().and_then(|e| e.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start listening, the event loop and the background monitors
    ///
    /// Returns the bound listen address when the server is enabled.
    pub async fn start(self: &Arc<Self>) -> Result<Option<SocketAddr>, P2pError> {
        let events = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| ConfigError::Invalid("node already started".to_string()))?;

        let mut bound = None;
        if self.config.server_start {
            let listener = TcpListener::bind(self.config.listen_addr()).await?;
            let local = listener.local_addr()?;
            let listen = NetAddress::from_socket_addr(local);
            self.addrbook.add_our_address(&listen);
            if local.ip().is_unspecified() {
                self.addrbook.add_our_address(&NetAddress::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    local.port(),
                ));
            }
            if let Ok(mut l) = self.listen.write() {
                *l = Some(listen);
            }
            log::info!("Gossip node listening on {}", local);

            let node = self.clone();
            tokio::spawn(async move { node.run_listener(listener).await });
            bound = Some(local);
        }

        let node = self.clone();
        tokio::spawn(async move { node.run_events(events).await });

        monitor::spawn_all(self.clone());
        Ok(bound)
    }

    /// Stop every task, close every peer and persist the address book
    pub async fn shutdown(&self) {
        log::info!("Shutting down gossip node");
        self.cancel.cancel();
        for peer in self.peers.write().await.drain().map(|(_, p)| p) {
            peer.close();
        }
        if let Err(e) = self.addrbook.persist() {
            log::warn!("Failed to persist address book: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // =========================================================================
    // Peer set
    // =========================================================================

    /// Live registered peers
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| !p.is_closed())
            .cloned()
            .collect()
    }

    pub async fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(name).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers().await.len()
    }

    pub async fn outbound_count(&self) -> usize {
        self.peers().await.iter().filter(|p| p.is_outbound()).count()
    }

    /// Whether the node wants more outbound connections
    pub async fn need_more(&self) -> bool {
        self.outbound_count().await < self.config.target_outbound
    }

    /// Whether a live peer is registered at `addr`
    pub async fn is_connected_to(&self, addr: &NetAddress) -> bool {
        self.peers().await.iter().any(|p| p.addr() == addr)
    }

    /// Check and insert under the write lock
    ///
    /// An identity that is live, or was recently seen, at another address
    /// is refused and the new address quarantined.
    async fn register(
        &self,
        result: &HandshakeResult,
        certificate: Option<PeerCertificate>,
        outbound: bool,
        persistent: bool,
    ) -> Result<(Arc<Peer>, mpsc::Receiver<Envelope>), P2pError> {
        let mut peers = self.peers.write().await;

        if result.name == self.name() {
            return Err(P2pError::SelfConnection);
        }
        if let Some(existing) = peers.get(&result.name) {
            if !existing.is_closed() {
                if existing.addr() != &result.reachable {
                    log::warn!(
                        "Identity {} claimed from {} while live at {}",
                        existing.short_name(),
                        result.reachable,
                        existing.addr()
                    );
                    self.blacklist.quarantine(
                        &result.reachable,
                        Duration::from_secs(self.config.quarantine_secs),
                    );
                }
                return Err(P2pError::DuplicatePeer(result.name.clone()));
            }
        }
        if let Some(previous) = self.blacklist.lookup_identity(&result.name) {
            if previous != result.reachable {
                log::warn!(
                    "Identity {} seen at {} reappeared from {}",
                    result.name.get(..16).unwrap_or(&result.name),
                    previous,
                    result.reachable
                );
                self.blacklist.quarantine(
                    &result.reachable,
                    Duration::from_secs(self.config.quarantine_secs),
                );
                return Err(P2pError::DuplicatePeer(result.name.clone()));
            }
        }

        if !outbound {
            let live: Vec<&Arc<Peer>> = peers
                .values()
                .filter(|p| !p.is_closed() && !p.is_outbound())
                .collect();
            if live.len() >= self.config.max_inbound {
                return Err(P2pError::PeerSetFull);
            }
            let from_ip = live
                .iter()
                .filter(|p| p.addr().ip() == result.reachable.ip())
                .count();
            if from_ip >= self.config.max_inbound_per_ip {
                return Err(P2pError::Rejected(format!(
                    "too many connections from {}",
                    result.reachable.ip()
                )));
            }
        }

        let (peer, rx) = Peer::channel(PeerParams {
            name: result.name.clone(),
            addr: result.reachable.clone(),
            outbound,
            persistent,
            channel_version: result.channel_version,
            protocol_version: result.protocol_version,
            services: result.services,
            height: result.height,
            certificate,
        });
        peer.set_state(PeerState::Registered);
        peers.insert(result.name.clone(), peer.clone());
        drop(peers);

        self.blacklist
            .record_identity(&result.name, result.reachable.clone());
        log::info!(
            "Registered {} peer {} at {} (version {}, height {})",
            if outbound { "outbound" } else { "inbound" },
            peer.short_name(),
            peer.addr(),
            result.protocol_version,
            result.height
        );
        if let Some(cert) = peer.certificate() {
            match &cert.spiffe_id {
                Some(id) => log::info!(
                    "Peer {} certificate {} ({})",
                    peer.short_name(),
                    cert.serial,
                    id
                ),
                None => log::info!("Peer {} certificate {}", peer.short_name(), cert.serial),
            }
        }
        Ok((peer, rx))
    }

    /// Remove `peer` if it is still the registered one for its name
    async fn deregister(&self, peer: &Arc<Peer>) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(peer.name()) {
                Some(current) if Arc::ptr_eq(current, peer) => {
                    peers.remove(peer.name());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.blacklist.release_identity(peer.name());
            self.broadcaster.forget_peer(peer.name());
            log::info!("Peer {} at {} removed", peer.short_name(), peer.addr());
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Dial, handshake and register a peer
    pub async fn connect(self: &Arc<Self>, addr: NetAddress) -> Result<Arc<Peer>, P2pError> {
        self.connect_with(addr, false).await
    }

    /// Dial a configured seed; seeds are redialed when they drop
    pub async fn connect_persistent(
        self: &Arc<Self>,
        addr: NetAddress,
    ) -> Result<Arc<Peer>, P2pError> {
        self.connect_with(addr, true).await
    }

    async fn connect_with(
        self: &Arc<Self>,
        addr: NetAddress,
        persistent: bool,
    ) -> Result<Arc<Peer>, P2pError> {
        if self.addrbook.is_our_address(&addr) {
            return Err(P2pError::SelfConnection);
        }
        if self.is_connected_to(&addr).await {
            return Err(P2pError::DuplicatePeer(addr.to_string()));
        }
        let key = addr.to_string();
        if !self.dialing.insert_if_absent(key.clone(), ()) {
            return Err(P2pError::DialInProgress(key));
        }

        let result = self.dial_and_register(&addr, persistent).await;
        self.dialing.take(&key);

        match &result {
            Ok(_) => {
                self.addrbook.record_attempt(&addr, true);
            }
            Err(P2pError::SelfConnection) => {
                log::info!("{} is one of our own addresses", addr);
                self.addrbook.add_our_address(&addr);
            }
            Err(e) => {
                log::debug!("Connection to {} failed: {}", addr, e);
                self.addrbook.record_attempt(&addr, false);
                if dial_failure_is_violation(e) {
                    self.record_violation(&addr);
                }
            }
        }
        result
    }

    async fn dial_and_register(
        self: &Arc<Self>,
        addr: &NetAddress,
        persistent: bool,
    ) -> Result<Arc<Peer>, P2pError> {
        let opts = DialOptions {
            tls: self.tls.clone(),
            compression: self.config.enable_compression,
            timeout: DIAL_TIMEOUT,
        };
        let (mut conn, certificate) = addr.dial(&opts, &self.blacklist).await?;

        let local = self.local_handshake().await?;
        let result = handshake::outbound(&mut conn, &local, addr).await?;
        if let Some(observed) = &result.observed {
            self.learn_external(observed);
        }

        let (peer, rx) = self
            .register(&result, certificate, true, persistent)
            .await?;
        spawn_connection(conn, peer.clone(), rx, self.events_tx.clone());
        Ok(peer)
    }

    async fn local_handshake(&self) -> Result<LocalHandshake, P2pError> {
        let key = self
            .addrbook
            .key_pair()
            .ok_or_else(|| ConfigError::Invalid("node identity key unavailable".to_string()))?;
        let height = self.chain.block_height().await.unwrap_or(0);
        Ok(LocalHandshake {
            key,
            channel: self.config.channel,
            channel_version: calc_channel_version(self.config.channel, PROTOCOL_VERSION),
            services: local_services(self.config.enable_compression),
            height,
            addr_from: self.advertised_addr(),
        })
    }

    /// Address we put into our Version message
    fn advertised_addr(&self) -> NetAddress {
        let port = self
            .listen_addr()
            .map(|l| l.port())
            .unwrap_or(self.config.listen_port);
        if let Some(listen) = self.listen_addr() {
            if !listen.ip().is_unspecified() {
                return listen;
            }
        }
        match self.external_addr() {
            Some(external) => NetAddress::new(external.ip(), port),
            None => NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        }
    }

    /// Track the address a peer saw us dial from
    fn learn_external(&self, observed: &NetAddress) {
        let port = self
            .listen_addr()
            .map(|l| l.port())
            .unwrap_or(self.config.listen_port);
        let external = NetAddress::new(observed.ip(), port);
        let changed = match self.external.write() {
            Ok(mut current) => {
                let changed = current.as_ref() != Some(&external);
                *current = Some(external.clone());
                changed
            }
            Err(_) => false,
        };
        if changed {
            self.addrbook.add_our_address(&external);
            log::info!(
                "External address {} ({})",
                external,
                if external.is_public() { "public" } else { "behind NAT" }
            );
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        let observed = NetAddress::from_socket_addr(remote);
                        if let Err(e) = node.handle_inbound(stream, remote).await {
                            node.on_inbound_error(&observed, e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                }
            }
        }
        log::info!("Listener stopped");
    }

    async fn handle_inbound(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), P2pError> {
        let observed = NetAddress::from_socket_addr(remote);
        stream.set_nodelay(true)?;

        let (stream, certificate): (BoxedStream, _) = match &self.tls {
            Some(creds) => creds.server_handshake(stream, &observed).await?,
            None => (Box::pin(stream) as BoxedStream, None),
        };
        let codec = if self.config.enable_compression {
            MessageCodec::new(false)
        } else {
            MessageCodec::uncompressed_only()
        };
        let mut conn = Framed::new(stream, codec);

        if self.blacklist.is_banned(observed.as_str()) {
            handshake::reject(&mut conn, RejectCode::Banned, "banned").await;
            return Err(P2pError::Banned(observed.to_string()));
        }

        let local = self.local_handshake().await?;
        let version = match handshake::read_version(&mut conn, &local, remote).await {
            Ok(version) => version,
            Err(e) => {
                if e.is_version_error() {
                    handshake::reject(&mut conn, RejectCode::Version, e.to_string()).await;
                }
                return Err(e);
            }
        };

        let result = handshake::describe_dialer(&version, &observed);
        if self.blacklist.is_banned(result.reachable.as_str()) {
            handshake::reject(&mut conn, RejectCode::Banned, "quarantined").await;
            return Err(P2pError::Banned(result.reachable.to_string()));
        }

        let (peer, rx) = match self.register(&result, certificate, false, false).await {
            Ok(registered) => registered,
            Err(e) => {
                if matches!(e, P2pError::SelfConnection) {
                    self.addrbook.add_our_address(&result.reachable);
                }
                handshake::reject(&mut conn, reject_code(&e), e.to_string()).await;
                return Err(e);
            }
        };

        if let Err(e) = handshake::accept(&mut conn, &local, &version, &observed).await {
            peer.close();
            self.deregister(&peer).await;
            return Err(e);
        }

        self.addrbook
            .add(result.reachable.clone(), Some(peer.name().to_string()));
        spawn_connection(conn, peer, rx, self.events_tx.clone());
        Ok(())
    }

    fn on_inbound_error(&self, observed: &NetAddress, e: P2pError) {
        match e.class() {
            ErrorClass::ProtocolViolation => {
                log::warn!("Inbound connection from {} refused: {}", observed, e);
                self.record_violation(observed);
            }
            ErrorClass::Local if matches!(e, P2pError::SelfConnection) => {
                log::debug!("Refused connection from ourselves at {}", observed);
            }
            _ => log::debug!("Inbound connection from {} failed: {}", observed, e),
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                PeerEvent::Message(peer, envelope) => {
                    if let Err(e) = self.handle_message(&peer, envelope).await {
                        self.on_peer_error(&peer, e);
                    }
                }
                PeerEvent::Closed(peer) => self.deregister(&peer).await,
            }
        }
    }

    async fn handle_message(&self, peer: &Arc<Peer>, envelope: Envelope) -> Result<(), P2pError> {
        let id = envelope.id;
        match envelope.message {
            Message::Ping(nonce) => peer.reply(id, Message::Pong(nonce)).await,
            Message::Pong(_) => Ok(()),

            Message::GetAddr => {
                let addrs = self.addrbook.get_addrs(MAX_ADDR_PER_MESSAGE);
                peer.reply(id, Message::Addr(addrs)).await
            }
            Message::Addr(addrs) => {
                let added = self.addrbook.add_many(&addrs, peer.name());
                log::debug!("Learned {} addresses from {}", added, peer.addr());
                Ok(())
            }

            Message::GetPeerInfo => {
                let info = self.local_peer_info().await?;
                peer.reply(id, Message::PeerInfo(info)).await
            }
            Message::GetHeaders { start, end } => {
                let end = clamp_range(start, end);
                let headers = if end < start {
                    Vec::new()
                } else {
                    self.chain.get_headers(start, end).await?
                };
                peer.reply(id, Message::Headers(headers)).await
            }
            Message::GetBlocks { start, end } => {
                let end = clamp_range(start, end);
                let blocks = if end < start {
                    Vec::new()
                } else {
                    self.chain.get_blocks(start, end).await?
                };
                peer.reply(id, Message::Blocks(blocks)).await
            }
            Message::GetMempool => {
                let txs = self.chain.mempool_txs().await?;
                peer.reply(id, Message::Mempool(txs)).await
            }
            Message::GetMempoolSize => {
                let size = self.chain.mempool_size().await?;
                peer.reply(id, Message::MempoolSize(size as u64)).await
            }

            Message::Version(_) | Message::VersionAck(_) => {
                Err(P2pError::InvalidHandshake("handshake after registration".into()))
            }
            Message::Reject(reject) => {
                log::warn!(
                    "Peer {} rejected us: {:?} {}",
                    peer.addr(),
                    reject.code,
                    reject.reason
                );
                peer.close();
                Ok(())
            }

            message if message.is_gossip() => {
                let peers = self.peers().await;
                self.broadcaster.handle(peer, message, &peers).await
            }

            other => {
                log::debug!("Ignoring unsolicited {} from {}", other.type_name(), peer.addr());
                Ok(())
            }
        }
    }

    fn on_peer_error(&self, peer: &Arc<Peer>, e: P2pError) {
        match e.class() {
            ErrorClass::ProtocolViolation => {
                log::warn!("Protocol violation by {}: {}", peer.addr(), e);
                if e.is_version_error() {
                    peer.set_version_unsupported();
                }
                peer.close();
                self.record_violation(peer.addr());
            }
            ErrorClass::DataIntegrity => {
                log::warn!("Integrity failure from {}: {}", peer.addr(), e);
            }
            ErrorClass::Transient => {
                log::debug!("Transient error with {}: {}", peer.addr(), e);
            }
            ErrorClass::ResourceExhausted | ErrorClass::Local => {
                log::warn!("Failed to handle message from {}: {}", peer.addr(), e);
            }
        }
    }

    /// Count a violation; enough of them from one IP ban it
    fn record_violation(&self, addr: &NetAddress) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        if self.blacklist.record_violation(addr) {
            log::warn!("Banned {} after repeated violations", addr.ip());
        }
    }

    async fn local_peer_info(&self) -> Result<PeerInfoMessage, P2pError> {
        let header = self.chain.last_header().await?;
        let mempool_size = self.chain.mempool_size().await? as u64;
        Ok(PeerInfoMessage {
            name: self.name(),
            addr: self.advertised_addr().to_string(),
            version: calc_channel_version(self.config.channel, PROTOCOL_VERSION),
            services: local_services(self.config.enable_compression),
            height: header.height,
            header_hash: header.hash(),
            mempool_size,
        })
    }

    // =========================================================================
    // Gossip
    // =========================================================================

    /// Flood a local transaction; returns the number of peers it went to
    pub async fn broadcast_tx(&self, tx: Transaction) -> usize {
        let peers = self.peers().await;
        self.broadcaster.broadcast_tx(tx, &peers).await
    }

    /// Flood a local block; returns the number of peers it went to
    pub async fn broadcast_block(&self, block: Block) -> usize {
        let peers = self.peers().await;
        self.broadcaster.broadcast_block(block, &peers).await
    }

    pub fn gossip_stats(&self) -> GossipStatsSnapshot {
        self.broadcaster.stats()
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    /// Download `[start, end]` from peers and hand the blocks to the chain
    ///
    /// Returns the number of blocks submitted. Fails if any height could
    /// not be fetched; the fetched ones are still submitted.
    pub async fn fetch_blocks(&self, start: u64, end: u64) -> Result<usize, P2pError> {
        let peers: Vec<Arc<dyn BlockFetcher>> = self
            .peers()
            .await
            .into_iter()
            .filter(|p| p.height() >= start)
            .map(|p| p as Arc<dyn BlockFetcher>)
            .collect();
        if peers.is_empty() {
            return Err(P2pError::NoPeers);
        }

        let job = DownloadJob::new(peers, self.config.download_concurrency)
            .with_cancel(self.cancel.child_token());
        let report = job.download(start, end).await?;
        for removed in &report.removed_peers {
            log::warn!("Peer {} dropped from download after repeated failures", removed);
        }

        let mut submitted = 0;
        for block in report.blocks {
            let height = block.height();
            match self.chain.submit_block(block).await {
                Ok(()) => submitted += 1,
                Err(crate::chain::ChainError::Duplicate(_)) => {}
                Err(e) => {
                    log::warn!("Chain refused downloaded block {}: {}", height, e);
                    return Err(e.into());
                }
            }
        }

        if !report.failed.is_empty() {
            return Err(P2pError::DownloadFailed(format!(
                "heights {:?}",
                report.failed
            )));
        }
        log::info!("Downloaded blocks {}..={} ({} new)", start, end, submitted);
        Ok(submitted)
    }

    /// Fetch headers from the highest peer
    pub async fn fetch_headers(&self, start: u64, end: u64) -> Result<Vec<BlockHeader>, P2pError> {
        let peer = self.best_peer().await.ok_or(P2pError::NoPeers)?;
        match peer
            .request(Message::GetHeaders { start, end }, REQUEST_TIMEOUT)
            .await?
        {
            Message::Headers(headers) => Ok(headers),
            _ => Err(P2pError::UnexpectedResponse("GetHeaders")),
        }
    }

    /// Pull the highest peer's mempool into ours
    ///
    /// Returns the number of transactions the chain accepted.
    pub async fn fetch_mempool(&self) -> Result<usize, P2pError> {
        let peer = self.best_peer().await.ok_or(P2pError::NoPeers)?;
        let txs = match peer.request(Message::GetMempool, REQUEST_TIMEOUT).await? {
            Message::Mempool(txs) => txs,
            _ => return Err(P2pError::UnexpectedResponse("GetMempool")),
        };

        let mut accepted = 0;
        for tx in txs {
            if self.chain.has_tx(&tx.hash()).await.unwrap_or(false) {
                continue;
            }
            if self.chain.submit_tx(tx).await.is_ok() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Ask one peer for its node info
    pub async fn query_peer_info(&self, name: &str) -> Result<PeerInfoMessage, P2pError> {
        let peer = self.peer(name).await.ok_or(P2pError::NoPeers)?;
        match peer.request(Message::GetPeerInfo, REQUEST_TIMEOUT).await? {
            Message::PeerInfo(info) => {
                peer.update_height(info.height);
                Ok(info)
            }
            _ => Err(P2pError::UnexpectedResponse("GetPeerInfo")),
        }
    }

    async fn best_peer(&self) -> Option<Arc<Peer>> {
        self.peers().await.into_iter().max_by_key(|p| p.height())
    }

    // =========================================================================
    // Operator surfaces
    // =========================================================================

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers().await.iter().map(|p| p.info()).collect()
    }

    pub async fn net_info(&self) -> NetInfo {
        let peers = self.peers().await;
        let outbound = peers.iter().filter(|p| p.is_outbound()).count();
        let external = self.external_addr();
        NetInfo {
            name: self.name(),
            listen_addr: self.listen_addr().map(|l| l.to_string()),
            nat_public: external.as_ref().map(|e| e.is_public()).unwrap_or(false),
            external_addr: external.map(|e| e.to_string()),
            inbound: peers.len() - outbound,
            outbound,
            known_addresses: self.addrbook.len(),
            banned: self.blacklist.bad_peers().len(),
            violations: self.violations.load(Ordering::Relaxed),
            gossip: self.broadcaster.stats(),
        }
    }

    /// Ban an address (or bare IP) and close matching peers
    pub async fn add_blacklist(&self, addr: &str, secs: u64) -> Result<(), P2pError> {
        let ip_only = addr.parse::<IpAddr>().is_ok();
        if !ip_only {
            NetAddress::parse(addr)?;
        }
        self.blacklist.ban(addr, secs);

        for peer in self.peers().await {
            let matches = if ip_only {
                peer.addr().ip().to_string() == addr
            } else {
                peer.addr().as_str() == addr
            };
            if matches {
                log::info!("Closing banned peer {}", peer.addr());
                peer.close();
            }
        }
        Ok(())
    }

    pub fn remove_blacklist(&self, addr: &str) -> bool {
        self.blacklist.unban(addr)
    }

    pub fn show_blacklist(&self) -> Vec<BanEntry> {
        self.blacklist.bad_peers()
    }

    /// Revoke a certificate serial; persisted across restarts
    pub fn revoke_certificate(&self, serial: &str) -> Result<bool, P2pError> {
        let changed = self.registry.revoke(serial);
        self.registry.persist(&self.store)?;
        Ok(changed)
    }

    /// Lift a revocation
    pub fn restore_certificate(&self, serial: &str) -> Result<bool, P2pError> {
        let changed = self.registry.restore(serial);
        self.registry.persist(&self.store)?;
        Ok(changed)
    }

    pub fn revocation_registry(&self) -> &Arc<RevocationRegistry> {
        &self.registry
    }
}

fn load_credentials(
    config: &GossipConfig,
    registry: Arc<RevocationRegistry>,
) -> Result<TlsCredentials, P2pError> {
    let tls = &config.tls;
    match (&tls.cert_path, &tls.key_path, &tls.ca_path) {
        (Some(cert), Some(key), Some(ca)) => Ok(TlsCredentials::from_pem_files(
            cert,
            key,
            ca,
            &tls.server_name,
            registry,
        )?),
        _ => Err(ConfigError::Invalid("TLS enabled without certificate paths".to_string()).into()),
    }
}

/// Whether a failed dial counts against the remote
///
/// Identity clashes found by our own registration are not the remote's
/// doing; a Reject it sent is not a violation either.
fn dial_failure_is_violation(e: &P2pError) -> bool {
    match e {
        P2pError::DuplicatePeer(_) | P2pError::SelfConnection => false,
        e => e.class() == ErrorClass::ProtocolViolation,
    }
}

/// Cap a requested range at `MAX_BLOCKS_PER_REQUEST` heights
fn clamp_range(start: u64, end: u64) -> u64 {
    end.min(start.saturating_add(MAX_BLOCKS_PER_REQUEST - 1))
}

fn reject_code(e: &P2pError) -> RejectCode {
    match e {
        P2pError::Banned(_) => RejectCode::Banned,
        P2pError::PeerSetFull => RejectCode::InboundFull,
        P2pError::Rejected(_) => RejectCode::TooManyFromIp,
        P2pError::DuplicatePeer(_) | P2pError::SelfConnection => RejectCode::Duplicate,
        e if e.is_version_error() => RejectCode::Version,
        _ => RejectCode::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::network::message::RejectCode;

    fn test_config() -> GossipConfig {
        GossipConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            ..GossipConfig::default()
        }
    }

    fn test_node() -> Arc<Node> {
        Node::with_store(
            test_config(),
            Arc::new(MemoryChain::new()),
            Arc::new(KvStore::in_memory()),
        )
        .unwrap()
    }

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(0, 10), 10);
        assert_eq!(clamp_range(0, 1_000), MAX_BLOCKS_PER_REQUEST - 1);
        assert_eq!(clamp_range(u64::MAX - 1, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_reject_codes() {
        assert_eq!(reject_code(&P2pError::PeerSetFull), RejectCode::InboundFull);
        assert_eq!(
            reject_code(&P2pError::DuplicatePeer("x".into())),
            RejectCode::Duplicate
        );
        assert_eq!(
            reject_code(&P2pError::ChannelMismatch { ours: 1, theirs: 2 }),
            RejectCode::Version
        );
    }

    #[test]
    fn test_tls_requires_paths() {
        let config = GossipConfig {
            enable_tls: true,
            ..test_config()
        };
        let result = Node::with_store(
            config,
            Arc::new(MemoryChain::new()),
            Arc::new(KvStore::in_memory()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let node = test_node();
        let bound = node.start().await.unwrap().unwrap();
        assert_ne!(bound.port(), 0);
        assert!(node
            .addrbook()
            .is_our_address(&NetAddress::from_socket_addr(bound)));
        assert!(node.start().await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_dialing_our_own_address_is_refused() {
        let node = test_node();
        let bound = node.start().await.unwrap().unwrap();
        let err = node
            .connect(NetAddress::from_socket_addr(bound))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::SelfConnection));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_blacklist_admin() {
        let node = test_node();
        node.add_blacklist("10.1.2.3:13802", 60).await.unwrap();
        node.add_blacklist("10.9.9.9", 60).await.unwrap();
        assert!(node.add_blacklist("not an address", 60).await.is_err());

        assert_eq!(node.show_blacklist().len(), 3);
        assert!(node.remove_blacklist("10.1.2.3:13802"));
        assert!(!node.blacklist().is_banned("10.1.2.3:13802"));
        assert!(node.blacklist().is_banned("10.9.9.9:1"));
    }

    #[tokio::test]
    async fn test_blacklist_admin_huge_duration() {
        let node = test_node();
        let handle = {
            let node = node.clone();
            tokio::spawn(async move { node.add_blacklist("10.1.2.3:1000", u64::MAX).await })
        };
        handle.await.unwrap().unwrap();
        assert!(node.blacklist().is_banned("10.1.2.3:1000"));
    }

    #[test]
    fn test_dial_failure_violation_policy() {
        assert!(!dial_failure_is_violation(&P2pError::DuplicatePeer("x".into())));
        assert!(!dial_failure_is_violation(&P2pError::SelfConnection));
        assert!(!dial_failure_is_violation(&P2pError::PeerSetFull));
        assert!(!dial_failure_is_violation(&P2pError::Disconnected));
        assert!(dial_failure_is_violation(&P2pError::InvalidSignature));
        assert!(dial_failure_is_violation(&P2pError::TtlExceeded { ttl: 9, max: 8 }));
    }

    #[tokio::test]
    async fn test_certificate_revocation_persists() {
        let store = Arc::new(KvStore::in_memory());
        let node = Node::with_store(test_config(), Arc::new(MemoryChain::new()), store.clone())
            .unwrap();
        node.revocation_registry().record("0a1b", "10.0.0.7");
        assert!(node.revoke_certificate("0a1b").unwrap());

        let reloaded = RevocationRegistry::load(&store).unwrap();
        assert!(reloaded.is_revoked("0a1b"));

        assert!(node.restore_certificate("0a1b").unwrap());
        assert!(!RevocationRegistry::load(&store).unwrap().is_revoked("0a1b"));
    }

    #[tokio::test]
    async fn test_fetch_without_peers() {
        let node = test_node();
        assert!(matches!(node.fetch_blocks(1, 3).await, Err(P2pError::NoPeers)));
        assert!(matches!(node.fetch_mempool().await, Err(P2pError::NoPeers)));
    }
}
