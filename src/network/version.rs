//! Protocol versioning
//!
//! The advertised version packs the network channel into the upper 16
//! bits and the protocol version into the lower 16, so one number tells a
//! peer both which network we are on and what we can speak.

use crate::network::error::P2pError;
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 120;

/// Oldest protocol version we still talk to
pub const MIN_PROTOCOL_VERSION: u32 = 100;

/// First protocol version that understands light broadcast
pub const LIGHT_BROADCAST_VERSION: u32 = 110;

bitflags::bitflags! {
    /// Services advertised in the handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Services: u64 {
        /// Serves blocks and headers
        const NETWORK = 1 << 0;
        /// Understands light transaction and block advertisements
        const LIGHT_BROADCAST = 1 << 1;
        /// Accepts gzip-compressed frames
        const COMPRESSION = 1 << 2;
    }
}

/// Pack a channel and protocol version into the advertised version
pub fn calc_channel_version(channel: u32, version: u32) -> u32 {
    (channel << 16) | (version & 0xFFFF)
}

/// Split an advertised version into `(channel, protocol_version)`
pub fn decode_channel_version(channel_version: u32) -> (u32, u32) {
    (channel_version >> 16, channel_version & 0xFFFF)
}

/// Check a remote's advertised version against our channel
///
/// Returns the remote's protocol version when compatible.
pub fn check_channel_version(our_channel: u32, remote: u32) -> Result<u32, P2pError> {
    let (channel, version) = decode_channel_version(remote);
    if channel != our_channel {
        return Err(P2pError::ChannelMismatch {
            ours: our_channel,
            theirs: channel,
        });
    }
    if version < MIN_PROTOCOL_VERSION {
        return Err(P2pError::VersionMismatch(version));
    }
    Ok(version)
}

/// Whether a peer at this protocol version can receive light broadcasts
pub fn supports_light_broadcast(protocol_version: u32) -> bool {
    protocol_version >= LIGHT_BROADCAST_VERSION
}

/// Services we advertise at the current version
pub fn local_services(compression: bool) -> Services {
    let mut services = Services::NETWORK | Services::LIGHT_BROADCAST;
    if compression {
        services |= Services::COMPRESSION;
    }
    services
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let v = calc_channel_version(3, PROTOCOL_VERSION);
        assert_eq!(decode_channel_version(v), (3, PROTOCOL_VERSION));
    }

    #[test]
    fn test_channel_mismatch() {
        let remote = calc_channel_version(2, PROTOCOL_VERSION);
        assert!(matches!(
            check_channel_version(1, remote),
            Err(P2pError::ChannelMismatch { ours: 1, theirs: 2 })
        ));
    }

    #[test]
    fn test_old_version_rejected() {
        let remote = calc_channel_version(1, MIN_PROTOCOL_VERSION - 1);
        assert!(matches!(
            check_channel_version(1, remote),
            Err(P2pError::VersionMismatch(_))
        ));
        let ok = calc_channel_version(1, MIN_PROTOCOL_VERSION);
        assert_eq!(check_channel_version(1, ok).unwrap(), MIN_PROTOCOL_VERSION);
    }

    #[test]
    fn test_light_broadcast_threshold() {
        assert!(!supports_light_broadcast(LIGHT_BROADCAST_VERSION - 1));
        assert!(supports_light_broadcast(LIGHT_BROADCAST_VERSION));
        assert!(supports_light_broadcast(PROTOCOL_VERSION));
    }

    #[test]
    fn test_services() {
        assert!(local_services(true).contains(Services::COMPRESSION));
        assert!(!local_services(false).contains(Services::COMPRESSION));
    }
}
