//! Network error type and failure classes
//!
//! Every failure on a connection maps onto one [`ErrorClass`], which
//! decides what happens next: retry, close and count a violation, count
//! an integrity failure, or report back-pressure.

use crate::chain::ChainError;
use crate::config::ConfigError;
use crate::crypto::KeyError;
use crate::network::netaddress::AddressError;
use crate::network::tls::TlsError;
use crate::storage::StorageError;
use thiserror::Error;

/// Failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Dial timeout, reset, closed stream; retried for persistent peers
    Transient,
    /// Abusive or malformed peer behavior; closes the connection and escalates
    ProtocolViolation,
    /// Reconstructed data does not match its commitment
    DataIntegrity,
    /// Peer set full, no free peer, queue saturated
    ResourceExhausted,
    /// Local state or configuration problem
    Local,
}

/// P2P errors
#[derive(Error, Debug)]
pub enum P2pError {
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Address is banned: {0}")]
    Banned(String),
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Duplicate peer identity: {0}")]
    DuplicatePeer(String),
    #[error("Channel mismatch: ours {ours}, theirs {theirs}")]
    ChannelMismatch { ours: u32, theirs: u32 },
    #[error("Unsupported protocol version: {0}")]
    VersionMismatch(u32),
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Invalid handshake signature")]
    InvalidSignature,
    #[error("TTL {ttl} exceeds maximum {max}")]
    TtlExceeded { ttl: u32, max: u32 },
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("Merkle root mismatch for block {0}")]
    MerkleMismatch(String),
    #[error("Reconstruction of block {0} timed out")]
    ReconstructionTimeout(String),
    #[error("Peer set full")]
    PeerSetFull,
    #[error("Rejected by peer: {0}")]
    Rejected(String),
    #[error("No peers available")]
    NoPeers,
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Range {start}..={end} exceeds {max} blocks")]
    RangeTooLarge { start: u64, end: u64, max: u64 },
    #[error("Dial to {0} already in progress")]
    DialInProgress(String),
    #[error("Cancelled")]
    Cancelled,
}

impl P2pError {
    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            P2pError::Io(_)
            | P2pError::Timeout(_)
            | P2pError::Disconnected
            | P2pError::DownloadFailed(_) => ErrorClass::Transient,

            P2pError::Tls(TlsError::CertificateRevoked(_)) => ErrorClass::ProtocolViolation,
            P2pError::Tls(_) => ErrorClass::Transient,

            P2pError::Serialization(_)
            | P2pError::DuplicatePeer(_)
            | P2pError::ChannelMismatch { .. }
            | P2pError::VersionMismatch(_)
            | P2pError::InvalidHandshake(_)
            | P2pError::InvalidSignature
            | P2pError::TtlExceeded { .. }
            | P2pError::UnexpectedResponse(_) => ErrorClass::ProtocolViolation,

            P2pError::MerkleMismatch(_) | P2pError::ReconstructionTimeout(_) => {
                ErrorClass::DataIntegrity
            }

            P2pError::PeerSetFull
            | P2pError::Rejected(_)
            | P2pError::NoPeers
            | P2pError::RangeTooLarge { .. } => ErrorClass::ResourceExhausted,

            P2pError::Address(AddressError::Resolve(_)) => ErrorClass::Transient,
            P2pError::Address(_)
            | P2pError::Storage(_)
            | P2pError::Chain(_)
            | P2pError::Key(_)
            | P2pError::Config(_)
            | P2pError::DialInProgress(_)
            | P2pError::Banned(_)
            | P2pError::SelfConnection
            | P2pError::Cancelled => ErrorClass::Local,
        }
    }

    /// Whether a persistent peer should be redialed after this error
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the error marks the remote's version as unsupported
    pub fn is_version_error(&self) -> bool {
        matches!(
            self,
            P2pError::ChannelMismatch { .. } | P2pError::VersionMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(P2pError::Disconnected.class(), ErrorClass::Transient);
        assert_eq!(
            P2pError::DuplicatePeer("abc".into()).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            P2pError::TtlExceeded { ttl: 9, max: 8 }.class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            P2pError::Tls(TlsError::CertificateRevoked("01".into())).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            P2pError::MerkleMismatch("h".into()).class(),
            ErrorClass::DataIntegrity
        );
        assert_eq!(P2pError::PeerSetFull.class(), ErrorClass::ResourceExhausted);
        assert_eq!(
            P2pError::RangeTooLarge {
                start: 0,
                end: u64::MAX,
                max: 10
            }
            .class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(P2pError::SelfConnection.class(), ErrorClass::Local);
    }

    #[test]
    fn test_version_errors() {
        assert!(P2pError::VersionMismatch(1).is_version_error());
        assert!(P2pError::ChannelMismatch { ours: 1, theirs: 2 }.is_version_error());
        assert!(!P2pError::Disconnected.is_version_error());
    }
}
