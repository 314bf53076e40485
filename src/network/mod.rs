//! Gossip P2P networking
//!
//! Transport and broadcast layer of a blockchain node.
//!
//! # Features
//! - TCP connections with optional mutual TLS and gzip frames
//! - Signed version handshake with channel checks
//! - Address book with weighted selection and persistence
//! - Time-bounded blacklist and identity quarantine
//! - Transaction and block flooding with TTL routing
//! - Light broadcast with merkle-checked block reconstruction
//! - Parallel block download over a rotating peer pool

pub mod addrbook;
pub mod blacklist;
pub mod broadcast;
pub mod codec;
pub mod connection;
pub mod download;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod message;
pub mod monitor;
pub mod netaddress;
pub mod node;
pub mod peer;
pub mod tls;
pub mod version;

pub use addrbook::{AddrBook, AddrEntry};
pub use blacklist::{BanEntry, BlackList};
pub use broadcast::{BroadcastConfig, Broadcaster, GossipStatsSnapshot};
pub use codec::{MessageCodec, MAGIC, MAX_MESSAGE_SIZE};
pub use connection::{BoxedStream, FramedConn, PeerEvent};
pub use download::{BlockFetcher, DownloadJob, DownloadReport};
pub use error::{ErrorClass, P2pError};
pub use filter::{HashFilter, SentFilter, TimedCache};
pub use message::{
    Envelope, LightBlock, Message, PeerInfoMessage, RejectCode, RejectMessage, Route,
    VersionAck, VersionMessage,
};
pub use netaddress::{AddressError, DialOptions, NetAddress};
pub use node::{NetInfo, Node};
pub use peer::{Peer, PeerInfo, PeerState};
pub use tls::{RevocationRegistry, TlsCredentials, TlsError};
pub use version::{Services, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
