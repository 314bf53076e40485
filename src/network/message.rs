//! Network message types for P2P communication
//!
//! Every frame carries an [`Envelope`]. Requests get a fresh id and the
//! answer echoes it in `reply_to`; gossip pushes are fire-and-forget.

use crate::core::{Block, BlockHeader, Transaction};
use crate::network::netaddress::NetAddress;
use crate::network::version::Services;
use serde::{Deserialize, Serialize};

/// Maximum number of addresses in one Addr message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum number of blocks or headers served per request
pub const MAX_BLOCKS_PER_REQUEST: u64 = 128;

/// Gossip routing metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Remaining hop budget
    pub ttl: u32,
    /// Whether the message was relayed as a light advertisement
    pub light: bool,
}

impl Route {
    pub fn new(ttl: u32) -> Self {
        Self { ttl, light: false }
    }

    /// Route for the next hop, or None once the budget is spent
    pub fn next_hop(&self, light: bool) -> Option<Route> {
        if self.ttl == 0 {
            return None;
        }
        Some(Route {
            ttl: self.ttl - 1,
            light,
        })
    }
}

/// Handshake sent by the dialing side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Random challenge, echoed and signed by the responder
    pub nonce: u64,
    /// Channel version (`channel << 16 | protocol_version`)
    pub version: u32,
    /// Advertised services
    pub services: Services,
    /// Address the dialer can be reached at
    pub addr_from: NetAddress,
    /// Address the dialer used to reach the responder
    pub addr_recv: NetAddress,
    /// Dialer's chain height
    pub height: u64,
    /// Sender's Unix timestamp, bounded against replays
    pub timestamp: i64,
    /// Dialer's compressed public key (hex)
    pub pubkey: String,
    /// Signature over the fields above (hex)
    pub signature: String,
}

/// Handshake answer from the responding side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionAck {
    /// The dialer's nonce
    pub nonce: u64,
    /// Responder's channel version
    pub version: u32,
    /// Advertised services
    pub services: Services,
    /// Address the responder saw the dialer connect from
    pub observed_addr: NetAddress,
    /// Responder's chain height
    pub height: u64,
    /// Responder's compressed public key (hex)
    pub pubkey: String,
    /// Signature over the fields above (hex)
    pub signature: String,
}

/// Reasons a connection is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Banned,
    InboundFull,
    TooManyFromIp,
    Duplicate,
    Version,
    Invalid,
}

/// Sent right before closing a refused connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub code: RejectCode,
    pub reason: String,
}

/// Peer details served for GetPeerInfo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfoMessage {
    /// Identity name (public key hex)
    pub name: String,
    /// Address the node is reachable at
    pub addr: String,
    /// Channel version
    pub version: u32,
    pub services: Services,
    /// Tip height
    pub height: u64,
    /// Tip hash
    pub header_hash: String,
    pub mempool_size: u64,
}

/// Light block advertisement: header plus short transaction hashes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightBlock {
    pub header: BlockHeader,
    /// First transaction in full; it is never in anyone's mempool
    pub first_tx: Option<Transaction>,
    /// Short hashes of the remaining transactions, in block order
    pub short_hashes: Vec<String>,
    pub route: Route,
}

impl LightBlock {
    /// Build the advertisement for a block
    pub fn from_block(block: &Block, route: Route) -> Self {
        let mut txs = block.transactions.iter();
        let first_tx = txs.next().cloned();
        Self {
            header: block.header.clone(),
            first_tx,
            short_hashes: txs.map(|tx| tx.short_hash()).collect(),
            route,
        }
    }

    /// Block hash being advertised
    pub fn block_hash(&self) -> String {
        self.header.hash()
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Handshake
    Version(VersionMessage),
    VersionAck(VersionAck),
    Reject(RejectMessage),

    // Liveness
    Ping(u64),
    Pong(u64),

    // Address exchange
    GetAddr,
    Addr(Vec<String>),

    // Node queries
    GetPeerInfo,
    PeerInfo(PeerInfoMessage),
    GetHeaders { start: u64, end: u64 },
    Headers(Vec<BlockHeader>),
    GetBlocks { start: u64, end: u64 },
    Blocks(Vec<Block>),
    GetMempool,
    Mempool(Vec<Transaction>),
    GetMempoolSize,
    MempoolSize(u64),

    // Gossip
    P2PTx { tx: Transaction, route: Route },
    P2PBlock { block: Block, route: Route },
    LightTx { hash: String, route: Route },
    LightBlock(LightBlock),
    TxRequest { hash: String },
    BlockTxRequest { block_hash: String, indices: Vec<u32> },
    BlockTxReply {
        block_hash: String,
        indices: Vec<u32>,
        txs: Vec<Transaction>,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Whether this is a gossip push (routed, deduplicated)
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            Message::P2PTx { .. }
                | Message::P2PBlock { .. }
                | Message::LightTx { .. }
                | Message::LightBlock(_)
                | Message::TxRequest { .. }
                | Message::BlockTxRequest { .. }
                | Message::BlockTxReply { .. }
        )
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::VersionAck(_) => "VersionAck",
            Message::Reject(_) => "Reject",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::GetAddr => "GetAddr",
            Message::Addr(_) => "Addr",
            Message::GetPeerInfo => "GetPeerInfo",
            Message::PeerInfo(_) => "PeerInfo",
            Message::GetHeaders { .. } => "GetHeaders",
            Message::Headers(_) => "Headers",
            Message::GetBlocks { .. } => "GetBlocks",
            Message::Blocks(_) => "Blocks",
            Message::GetMempool => "GetMempool",
            Message::Mempool(_) => "Mempool",
            Message::GetMempoolSize => "GetMempoolSize",
            Message::MempoolSize(_) => "MempoolSize",
            Message::P2PTx { .. } => "P2PTx",
            Message::P2PBlock { .. } => "P2PBlock",
            Message::LightTx { .. } => "LightTx",
            Message::LightBlock(_) => "LightBlock",
            Message::TxRequest { .. } => "TxRequest",
            Message::BlockTxRequest { .. } => "BlockTxRequest",
            Message::BlockTxReply { .. } => "BlockTxReply",
        }
    }
}

/// A framed message with request/response correlation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-chosen id
    pub id: u64,
    /// Id of the request this answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    pub message: Message,
}

impl Envelope {
    /// A request or push
    pub fn request(id: u64, message: Message) -> Self {
        Self {
            id,
            reply_to: None,
            message,
        }
    }

    /// A reply to the request `to`
    pub fn reply(id: u64, to: u64, message: Message) -> Self {
        Self {
            id,
            reply_to: Some(to),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        if let Message::Ping(nonce) = decoded {
            assert_eq!(nonce, 12345);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_route_next_hop() {
        let route = Route::new(2);
        let hop = route.next_hop(true).unwrap();
        assert_eq!(hop, Route { ttl: 1, light: true });
        let last = hop.next_hop(false).unwrap();
        assert_eq!(last.ttl, 0);
        assert!(last.next_hop(false).is_none());
    }

    #[test]
    fn test_light_block_from_block() {
        let txs: Vec<Transaction> = (0..4)
            .map(|i| Transaction::new("coins", &[i as u8], 1, i))
            .collect();
        let block = Block::new(7, "0".repeat(64), txs.clone());
        let light = LightBlock::from_block(&block, Route::new(3));

        assert_eq!(light.block_hash(), block.hash());
        assert_eq!(light.first_tx.as_ref(), Some(&txs[0]));
        assert_eq!(light.short_hashes.len(), 3);
        assert_eq!(light.short_hashes[0], txs[1].short_hash());
    }

    #[test]
    fn test_envelope_reply_field_omitted_for_requests() {
        let env = Envelope::request(9, Message::GetAddr);
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("reply_to"));

        let reply = Envelope::reply(10, 9, Message::Addr(vec![]));
        let back: Envelope = serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();
        assert_eq!(back.reply_to, Some(9));
    }

    #[test]
    fn test_is_gossip() {
        assert!(Message::TxRequest { hash: "h".into() }.is_gossip());
        assert!(!Message::GetAddr.is_gossip());
    }
}
