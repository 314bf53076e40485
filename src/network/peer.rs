//! Peer connections
//!
//! A [`Peer`] is the node-side handle of one registered connection:
//! identity, negotiated version, health counters and the outbound
//! message queue drained by the connection's writer task.
//!
//! Requests are correlated by envelope id. The reader task completes the
//! matching pending request directly, so a caller awaiting a reply never
//! depends on the node's message loop.

use crate::network::error::P2pError;
use crate::network::message::{Envelope, Message};
use crate::network::netaddress::NetAddress;
use crate::network::tls::PeerCertificate;
use crate::network::version::{supports_light_broadcast, Services};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per peer
pub const PEER_QUEUE_SIZE: usize = 256;

/// Bound on queueing one message for a peer
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a request round trip
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Handshaking,
    Registered,
    Closing,
    Closed,
}

/// Rolling health counters
#[derive(Debug, Default)]
pub struct PeerStat {
    ok: AtomicU64,
    fail: AtomicU64,
    consecutive_fail: AtomicU32,
}

impl PeerStat {
    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
        self.consecutive_fail.store(0, Ordering::Relaxed);
    }

    /// Record a failure and return the consecutive failure count
    pub fn record_fail(&self) -> u32 {
        self.fail.fetch_add(1, Ordering::Relaxed);
        self.consecutive_fail.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ok(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn fail(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub fn consecutive_fail(&self) -> u32 {
        self.consecutive_fail.load(Ordering::Relaxed)
    }
}

/// Negotiated parameters of a connection
#[derive(Debug, Clone)]
pub struct PeerParams {
    /// Identity name (public key hex)
    pub name: String,
    /// Address the peer is reachable at
    pub addr: NetAddress,
    /// Whether we dialed it
    pub outbound: bool,
    /// Whether it is a configured seed
    pub persistent: bool,
    /// Remote channel version
    pub channel_version: u32,
    /// Remote protocol version
    pub protocol_version: u32,
    pub services: Services,
    /// Remote chain height at handshake
    pub height: u64,
    /// Peer certificate, on TLS connections
    pub certificate: Option<PeerCertificate>,
}

/// Snapshot of a peer for operators and GetPeerInfo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub addr: String,
    pub outbound: bool,
    pub persistent: bool,
    pub version: u32,
    pub light_broadcast: bool,
    pub height: u64,
    pub state: PeerState,
    pub ok: u64,
    pub fail: u64,
    pub connected_at: DateTime<Utc>,
    /// Certificate serial, on TLS connections
    pub cert_serial: Option<String>,
    /// SPIFFE identity from the certificate
    pub spiffe_id: Option<String>,
}

/// A registered peer
pub struct Peer {
    params: PeerParams,
    persistent: AtomicBool,
    version_supported: AtomicBool,
    height: AtomicU64,
    state: Mutex<PeerState>,
    stat: PeerStat,
    tx: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl Peer {
    /// Create a peer around an outbound queue
    pub fn new(params: PeerParams, tx: mpsc::Sender<Envelope>) -> Arc<Self> {
        Arc::new(Self {
            persistent: AtomicBool::new(params.persistent),
            version_supported: AtomicBool::new(true),
            height: AtomicU64::new(params.height),
            state: Mutex::new(PeerState::Handshaking),
            stat: PeerStat::default(),
            tx,
            pending: Mutex::new(HashMap::new()),
            // Ids below this are used by the handshake
            next_id: AtomicU64::new(16),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
            params,
        })
    }

    /// Create a peer plus the receiving end of its queue
    pub fn channel(params: PeerParams) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_SIZE);
        (Self::new(params, tx), rx)
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    /// Name prefix for logs
    pub fn short_name(&self) -> &str {
        let name = &self.params.name;
        name.get(..16).unwrap_or(name)
    }

    pub fn addr(&self) -> &NetAddress {
        &self.params.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.params.outbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Relaxed)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Relaxed);
    }

    pub fn channel_version(&self) -> u32 {
        self.params.channel_version
    }

    pub fn protocol_version(&self) -> u32 {
        self.params.protocol_version
    }

    pub fn services(&self) -> Services {
        self.params.services
    }

    /// Whether light advertisements can be sent to this peer
    pub fn supports_light_broadcast(&self) -> bool {
        self.version_supported.load(Ordering::Relaxed)
            && supports_light_broadcast(self.params.protocol_version)
            && self.params.services.contains(Services::LIGHT_BROADCAST)
    }

    /// Whether the peer's version is still considered usable
    pub fn version_supported(&self) -> bool {
        self.version_supported.load(Ordering::Relaxed)
    }

    /// Mark the peer's version unusable after a version error
    pub fn set_version_unsupported(&self) {
        self.version_supported.store(false, Ordering::Relaxed);
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    /// Raise the known height (never lowers it)
    pub fn update_height(&self, height: u64) {
        self.height.fetch_max(height, Ordering::Relaxed);
    }

    pub fn certificate(&self) -> Option<&PeerCertificate> {
        self.params.certificate.as_ref()
    }

    pub fn stat(&self) -> &PeerStat {
        &self.stat
    }

    pub fn state(&self) -> PeerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PeerState::Closed)
    }

    pub fn set_state(&self, state: PeerState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<(), P2pError> {
        if self.is_closed() {
            return Err(P2pError::Disconnected);
        }
        match timeout(SEND_TIMEOUT, self.tx.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(P2pError::Disconnected),
            Err(_) => Err(P2pError::Timeout(format!("send to {}", self.params.addr))),
        }
    }

    /// Queue a push message
    pub async fn send(&self, msg: Message) -> Result<(), P2pError> {
        let id = self.next_id();
        self.enqueue(Envelope::request(id, msg)).await
    }

    /// Queue a reply to request `to`
    pub async fn reply(&self, to: u64, msg: Message) -> Result<(), P2pError> {
        let id = self.next_id();
        self.enqueue(Envelope::reply(id, to, msg)).await
    }

    /// Send a request and wait for the matching reply
    pub async fn request(&self, msg: Message, wait: Duration) -> Result<Message, P2pError> {
        let id = self.next_id();
        let (done_tx, done_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, done_tx);
        }

        let kind = msg.type_name();
        if let Err(e) = self.enqueue(Envelope::request(id, msg)).await {
            self.forget(id);
            return Err(e);
        }

        let result = tokio::select! {
            reply = timeout(wait, done_rx) => match reply {
                Ok(Ok(Message::Reject(reject))) => Err(P2pError::Rejected(reject.reason)),
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(P2pError::Disconnected),
                Err(_) => Err(P2pError::Timeout(format!("{} to {}", kind, self.params.addr))),
            },
            _ = self.cancel.cancelled() => Err(P2pError::Disconnected),
        };
        if result.is_err() {
            self.forget(id);
        }
        result
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Deliver a reply to its waiting request; false if nobody waits
    pub fn complete(&self, reply_to: u64, msg: Message) -> bool {
        let waiter = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&reply_to));
        match waiter {
            Some(done) => done.send(msg).is_ok(),
            None => false,
        }
    }

    /// Close the peer; unblocks every task waiting on it
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.set_state(PeerState::Closing);
        self.cancel.cancel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the peer closes
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: self.params.name.clone(),
            addr: self.params.addr.to_string(),
            outbound: self.params.outbound,
            persistent: self.is_persistent(),
            version: self.params.channel_version,
            light_broadcast: self.supports_light_broadcast(),
            height: self.height(),
            state: self.state(),
            ok: self.stat.ok(),
            fail: self.stat.fail(),
            connected_at: self.connected_at,
            cert_serial: self.params.certificate.as_ref().map(|c| c.serial.clone()),
            spiffe_id: self
                .params
                .certificate
                .as_ref()
                .and_then(|c| c.spiffe_id.as_ref())
                .map(|id| id.to_string()),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.params.name)
            .field("addr", &self.params.addr)
            .field("outbound", &self.params.outbound)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::version::{local_services, LIGHT_BROADCAST_VERSION, PROTOCOL_VERSION};

    pub(crate) fn params(name: &str, port: u16, protocol_version: u32) -> PeerParams {
        PeerParams {
            name: name.to_string(),
            addr: NetAddress::parse(&format!("127.0.0.1:{}", port)).unwrap(),
            outbound: true,
            persistent: false,
            channel_version: (1 << 16) | protocol_version,
            protocol_version,
            services: local_services(false),
            height: 0,
            certificate: None,
        }
    }

    #[tokio::test]
    async fn test_send_reaches_queue() {
        let (peer, mut rx) = Peer::channel(params("a", 1, PROTOCOL_VERSION));
        peer.send(Message::Ping(7)).await.unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.message, Message::Ping(7));
        assert!(env.reply_to.is_none());
    }

    #[tokio::test]
    async fn test_request_completed_by_reply() {
        let (peer, mut rx) = Peer::channel(params("a", 1, PROTOCOL_VERSION));
        let responder = {
            let peer = peer.clone();
            tokio::spawn(async move {
                let env = rx.recv().await.unwrap();
                assert!(peer.complete(env.id, Message::MempoolSize(3)));
            })
        };

        let reply = peer
            .request(Message::GetMempoolSize, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Message::MempoolSize(3));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (peer, _rx) = Peer::channel(params("a", 1, PROTOCOL_VERSION));
        let result = peer
            .request(Message::GetAddr, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(P2pError::Timeout(_))));
        // A late reply finds nobody waiting
        assert!(!peer.complete(16, Message::Addr(vec![])));
    }

    #[tokio::test]
    async fn test_close_unblocks_requests() {
        let (peer, _rx) = Peer::channel(params("a", 1, PROTOCOL_VERSION));
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.request(Message::GetAddr, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(P2pError::Disconnected)));
        assert!(matches!(
            peer.send(Message::Ping(1)).await,
            Err(P2pError::Disconnected)
        ));
        assert_eq!(peer.state(), PeerState::Closing);
    }

    #[test]
    fn test_light_broadcast_support() {
        let (old, _) = Peer::channel(params("old", 1, LIGHT_BROADCAST_VERSION - 1));
        let (new, _) = Peer::channel(params("new", 2, PROTOCOL_VERSION));
        assert!(!old.supports_light_broadcast());
        assert!(new.supports_light_broadcast());

        new.set_version_unsupported();
        assert!(!new.supports_light_broadcast());
    }

    #[test]
    fn test_stat_counters() {
        let (peer, _) = Peer::channel(params("a", 1, PROTOCOL_VERSION));
        assert_eq!(peer.stat().record_fail(), 1);
        assert_eq!(peer.stat().record_fail(), 2);
        peer.stat().record_ok();
        assert_eq!(peer.stat().consecutive_fail(), 0);
        assert_eq!(peer.info().fail, 2);
        assert_eq!(peer.info().ok, 1);
    }

    #[test]
    fn test_info_carries_certificate_identity() {
        let (plain, _) = Peer::channel(params("plain", 1, PROTOCOL_VERSION));
        assert!(plain.certificate().is_none());
        assert!(plain.info().cert_serial.is_none());

        let mut with_cert = params("tls", 2, PROTOCOL_VERSION);
        with_cert.certificate = Some(PeerCertificate {
            serial: "0a".into(),
            spiffe_id: crate::network::tls::parse_spiffe_uri("spiffe://example.org/node/1"),
        });
        let (peer, _) = Peer::channel(with_cert);
        let info = peer.info();
        assert_eq!(info.cert_serial.as_deref(), Some("0a"));
        assert_eq!(info.spiffe_id.as_deref(), Some("spiffe://example.org/node/1"));
    }
}
