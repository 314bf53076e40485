//! Signed version handshake
//!
//! The dialer sends a [`VersionMessage`] signed with its identity key and
//! waits for a signed [`VersionAck`] echoing its nonce. The responder
//! verifies the dialer's signature, tells it which address it was seen
//! from, and either acknowledges or sends a [`RejectMessage`].
//!
//! The identity name of a peer is its verified public key in hex.

use crate::crypto::{public_key_from_hex, verify_signature, KeyPair};
use crate::network::connection::FramedConn;
use crate::network::error::P2pError;
use crate::network::message::{
    Envelope, Message, RejectCode, RejectMessage, VersionAck, VersionMessage,
};
use crate::network::netaddress::{NetAddress, PROBE_ID};
use crate::network::version::{check_channel_version, decode_channel_version, Services};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

/// Bound on the whole version exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted clock difference in a Version message
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 5 * 60;

/// Envelope id used for the Version request
const VERSION_ID: u64 = 1;

/// Envelope id used for the handshake answer
const ACK_ID: u64 = 2;

/// What the local side puts into its half of the handshake
#[derive(Debug, Clone)]
pub struct LocalHandshake {
    pub key: KeyPair,
    /// Our channel, to check the remote against
    pub channel: u32,
    /// Our advertised channel version
    pub channel_version: u32,
    pub services: Services,
    pub height: u64,
    /// Address we believe we are reachable at
    pub addr_from: NetAddress,
}

impl LocalHandshake {
    pub fn name(&self) -> String {
        self.key.public_key_hex()
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    /// Remote identity name
    pub name: String,
    pub channel_version: u32,
    pub protocol_version: u32,
    pub services: Services,
    pub height: u64,
    /// Address the remote is reachable at
    pub reachable: NetAddress,
    /// Address the remote saw us connect from (outbound only)
    pub observed: Option<NetAddress>,
}

fn version_payload(v: &VersionMessage) -> String {
    format!(
        "version|{}|{}|{}|{}|{}|{}|{}|{}",
        v.nonce,
        v.version,
        v.services.bits(),
        v.addr_from,
        v.addr_recv,
        v.height,
        v.timestamp,
        v.pubkey
    )
}

fn ack_payload(a: &VersionAck) -> String {
    format!(
        "ack|{}|{}|{}|{}|{}|{}",
        a.nonce,
        a.version,
        a.services.bits(),
        a.observed_addr,
        a.height,
        a.pubkey
    )
}

/// Check a hex signature by a hex public key over `payload`
pub fn verify_signed(pubkey: &str, payload: &str, signature: &str) -> Result<(), P2pError> {
    let public_key = public_key_from_hex(pubkey).map_err(|_| P2pError::InvalidSignature)?;
    let signature = hex::decode(signature).map_err(|_| P2pError::InvalidSignature)?;
    match verify_signature(&public_key, payload.as_bytes(), &signature) {
        Ok(true) => Ok(()),
        _ => Err(P2pError::InvalidSignature),
    }
}

/// Build and sign our Version message
pub fn build_version(
    local: &LocalHandshake,
    addr_recv: &NetAddress,
) -> Result<VersionMessage, P2pError> {
    let mut version = VersionMessage {
        nonce: rand::random(),
        version: local.channel_version,
        services: local.services,
        addr_from: local.addr_from.clone(),
        addr_recv: addr_recv.clone(),
        height: local.height,
        timestamp: chrono::Utc::now().timestamp(),
        pubkey: local.name(),
        signature: String::new(),
    };
    version.signature = hex::encode(local.key.sign(version_payload(&version).as_bytes())?);
    Ok(version)
}

/// Build and sign our answer to `version`
pub fn build_ack(
    local: &LocalHandshake,
    version: &VersionMessage,
    observed: &NetAddress,
) -> Result<VersionAck, P2pError> {
    let mut ack = VersionAck {
        nonce: version.nonce,
        version: local.channel_version,
        services: local.services,
        observed_addr: observed.clone(),
        height: local.height,
        pubkey: local.name(),
        signature: String::new(),
    };
    ack.signature = hex::encode(local.key.sign(ack_payload(&ack).as_bytes())?);
    Ok(ack)
}

/// Address the dialer is reachable at
///
/// A dialer that does not know its own IP advertises an unspecified one;
/// the observed IP is combined with its advertised port.
pub fn reachable_address(addr_from: &NetAddress, observed: &NetAddress) -> NetAddress {
    if addr_from.ip().is_unspecified() {
        NetAddress::new(observed.ip(), addr_from.port())
    } else {
        addr_from.clone()
    }
}

// =============================================================================
// Dialer side
// =============================================================================

/// Run the dialer's half of the handshake
pub async fn outbound(
    conn: &mut FramedConn,
    local: &LocalHandshake,
    remote: &NetAddress,
) -> Result<HandshakeResult, P2pError> {
    timeout(HANDSHAKE_TIMEOUT, outbound_inner(conn, local, remote))
        .await
        .map_err(|_| P2pError::Timeout(format!("handshake with {}", remote)))?
}

async fn outbound_inner(
    conn: &mut FramedConn,
    local: &LocalHandshake,
    remote: &NetAddress,
) -> Result<HandshakeResult, P2pError> {
    let version = build_version(local, remote)?;
    let nonce = version.nonce;
    conn.send(Envelope::request(VERSION_ID, Message::Version(version)))
        .await?;

    let reply = conn.next().await.ok_or(P2pError::Disconnected)??;
    let ack = match reply.message {
        Message::VersionAck(ack) => ack,
        Message::Reject(reject) => {
            return Err(P2pError::Rejected(format!(
                "{:?}: {}",
                reject.code, reject.reason
            )))
        }
        _ => return Err(P2pError::UnexpectedResponse("Version")),
    };

    if ack.nonce != nonce {
        return Err(P2pError::InvalidHandshake("nonce mismatch".into()));
    }
    verify_signed(&ack.pubkey, &ack_payload(&ack), &ack.signature)?;
    if ack.pubkey == local.name() {
        return Err(P2pError::SelfConnection);
    }
    let protocol_version = check_channel_version(local.channel, ack.version)?;

    Ok(HandshakeResult {
        name: ack.pubkey,
        channel_version: ack.version,
        protocol_version,
        services: ack.services,
        height: ack.height,
        reachable: remote.clone(),
        observed: Some(ack.observed_addr),
    })
}

// =============================================================================
// Responder side
// =============================================================================

/// Read and verify the dialer's Version
///
/// Compression probes sent before the Version are answered in place.
/// The caller decides whether to [`accept`] or [`reject`].
pub async fn read_version(
    conn: &mut FramedConn,
    local: &LocalHandshake,
    observed: SocketAddr,
) -> Result<VersionMessage, P2pError> {
    let version = timeout(HANDSHAKE_TIMEOUT, next_version(conn))
        .await
        .map_err(|_| P2pError::Timeout(format!("handshake with {}", observed)))??;

    verify_version(&version, local.channel)?;
    Ok(version)
}

async fn next_version(conn: &mut FramedConn) -> Result<VersionMessage, P2pError> {
    loop {
        let envelope = conn.next().await.ok_or(P2pError::Disconnected)??;
        match envelope.message {
            Message::Ping(nonce) if envelope.id == PROBE_ID => {
                conn.send(Envelope::reply(PROBE_ID, PROBE_ID, Message::Pong(nonce)))
                    .await?;
            }
            Message::Version(version) => return Ok(version),
            _ => return Err(P2pError::UnexpectedResponse("Version")),
        }
    }
}

/// Validate a received Version message
pub fn verify_version(version: &VersionMessage, our_channel: u32) -> Result<u32, P2pError> {
    verify_signed(&version.pubkey, &version_payload(version), &version.signature)?;

    let drift = (chrono::Utc::now().timestamp() - version.timestamp).abs();
    if drift > MAX_TIMESTAMP_DRIFT_SECS {
        return Err(P2pError::InvalidHandshake(format!(
            "timestamp off by {}s",
            drift
        )));
    }

    check_channel_version(our_channel, version.version)
}

/// Acknowledge a verified Version and describe the dialer
pub async fn accept(
    conn: &mut FramedConn,
    local: &LocalHandshake,
    version: &VersionMessage,
    observed: &NetAddress,
) -> Result<HandshakeResult, P2pError> {
    let ack = build_ack(local, version, observed)?;
    conn.send(Envelope::reply(ACK_ID, VERSION_ID, Message::VersionAck(ack)))
        .await?;
    Ok(describe_dialer(version, observed))
}

/// What a verified Version says about the dialer
pub fn describe_dialer(version: &VersionMessage, observed: &NetAddress) -> HandshakeResult {
    let (_, protocol_version) = decode_channel_version(version.version);
    HandshakeResult {
        name: version.pubkey.clone(),
        channel_version: version.version,
        protocol_version,
        services: version.services,
        height: version.height,
        reachable: reachable_address(&version.addr_from, observed),
        observed: None,
    }
}

/// Refuse a connection with a reason, then let the caller close it
pub async fn reject(conn: &mut FramedConn, code: RejectCode, reason: impl Into<String>) {
    let reject = RejectMessage {
        code,
        reason: reason.into(),
    };
    let send = conn.send(Envelope::reply(ACK_ID, VERSION_ID, Message::Reject(reject)));
    let _ = timeout(Duration::from_secs(1), send).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::MessageCodec;
    use crate::network::connection::BoxedStream;
    use crate::network::version::{calc_channel_version, local_services, PROTOCOL_VERSION};
    use tokio_util::codec::Framed;

    fn local(channel: u32, port: u16) -> LocalHandshake {
        LocalHandshake {
            key: KeyPair::generate(),
            channel,
            channel_version: calc_channel_version(channel, PROTOCOL_VERSION),
            services: local_services(false),
            height: 3,
            addr_from: NetAddress::parse(&format!("0.0.0.0:{}", port)).unwrap(),
        }
    }

    fn pair() -> (FramedConn, FramedConn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a: BoxedStream = Box::pin(a);
        let b: BoxedStream = Box::pin(b);
        (
            Framed::new(a, MessageCodec::default()),
            Framed::new(b, MessageCodec::default()),
        )
    }

    #[test]
    fn test_signed_version_verifies() {
        let local = local(1, 13802);
        let remote = NetAddress::parse("10.0.0.2:13802").unwrap();
        let version = build_version(&local, &remote).unwrap();
        assert_eq!(verify_version(&version, 1).unwrap(), PROTOCOL_VERSION);

        let mut forged = version.clone();
        forged.height = 1_000;
        assert!(matches!(
            verify_version(&forged, 1),
            Err(P2pError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_channel_refused() {
        let local = local(2, 13802);
        let remote = NetAddress::parse("10.0.0.2:13802").unwrap();
        let version = build_version(&local, &remote).unwrap();
        let err = verify_version(&version, 1).unwrap_err();
        assert!(err.is_version_error());
    }

    #[test]
    fn test_reachable_address_uses_observed_ip() {
        let advertised = NetAddress::parse("0.0.0.0:13900").unwrap();
        let observed = NetAddress::parse("203.0.113.9:51234").unwrap();
        assert_eq!(
            reachable_address(&advertised, &observed).to_string(),
            "203.0.113.9:13900"
        );

        let explicit = NetAddress::parse("198.51.100.1:13900").unwrap();
        assert_eq!(reachable_address(&explicit, &observed), explicit);
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let (mut dialer_conn, mut responder_conn) = pair();
        let dialer = local(1, 14000);
        let responder = local(1, 14001);
        let responder_addr = NetAddress::parse("127.0.0.1:14001").unwrap();
        let observed: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        let responder_name = responder.name();
        let serve = tokio::spawn(async move {
            let version = read_version(&mut responder_conn, &responder, observed)
                .await
                .unwrap();
            accept(
                &mut responder_conn,
                &responder,
                &version,
                &NetAddress::from_socket_addr(observed),
            )
            .await
            .unwrap()
        });

        let result = outbound(&mut dialer_conn, &dialer, &responder_addr)
            .await
            .unwrap();
        assert_eq!(result.name, responder_name);
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(result.observed.unwrap().to_string(), "127.0.0.1:50000");

        let served = serve.await.unwrap();
        assert_eq!(served.name, dialer.name());
        assert_eq!(served.reachable.to_string(), "127.0.0.1:14000");
    }

    #[tokio::test]
    async fn test_self_connection_detected() {
        let (mut dialer_conn, mut responder_conn) = pair();
        let me = local(1, 14000);
        let same = me.clone();
        let observed: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        tokio::spawn(async move {
            let version = read_version(&mut responder_conn, &same, observed).await.unwrap();
            let _ = accept(
                &mut responder_conn,
                &same,
                &version,
                &NetAddress::from_socket_addr(observed),
            )
            .await;
        });

        let remote = NetAddress::parse("127.0.0.1:14000").unwrap();
        let err = outbound(&mut dialer_conn, &me, &remote).await.unwrap_err();
        assert!(matches!(err, P2pError::SelfConnection));
    }

    #[tokio::test]
    async fn test_reject_surfaces_to_dialer() {
        let (mut dialer_conn, mut responder_conn) = pair();
        let dialer = local(1, 14000);

        tokio::spawn(async move {
            let _ = responder_conn.next().await;
            reject(&mut responder_conn, RejectCode::InboundFull, "inbound table full").await;
        });

        let remote = NetAddress::parse("127.0.0.1:14001").unwrap();
        let err = outbound(&mut dialer_conn, &dialer, &remote).await.unwrap_err();
        assert!(matches!(err, P2pError::Rejected(reason) if reason.contains("inbound table full")));
    }
}
