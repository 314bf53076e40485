//! Network addresses
//!
//! [`NetAddress`] is the canonical `ip:port` value used everywhere a peer
//! is named: address book keys, ban keys, dial targets. Equality and
//! ordering are over the canonical string only.
//!
//! Dialing goes through [`NetAddress::dial`]:
//! - the blacklist interceptor refuses banned targets before any I/O
//! - TCP connect is bounded by a timeout
//! - TLS (when configured) runs the mutual handshake and revocation check
//! - a compression probe detects peers that refuse compressed frames and
//!   re-dials them uncompressed

use crate::config::DEFAULT_PORT;
use crate::network::blacklist::BlackList;
use crate::network::codec::MessageCodec;
use crate::network::connection::{BoxedStream, FramedConn};
use crate::network::error::P2pError;
use crate::network::message::{Envelope, Message};
use crate::network::tls::{PeerCertificate, TlsCredentials};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Bound on TCP connect
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on the compression probe round trip
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Envelope id used by the compression probe
pub const PROBE_ID: u64 = 0;

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AddressError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid ip: {0}")]
    InvalidIp(String),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Cannot resolve {0}")]
    Resolve(String),
}

/// A peer address: IP, port and cached canonical string form
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetAddress {
    ip: IpAddr,
    port: u16,
    str: String,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let str = SocketAddr::new(ip, port).to_string();
        Self { ip, port, str }
    }

    /// Build from a socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// Parse `ip:port`, `[ipv6]:port` or a bare IP (default port)
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::InvalidAddress(address.to_string()));
        }

        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(Self::new(ip, DEFAULT_PORT));
        }

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidIp(address.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|_| AddressError::InvalidIp(host.to_string()))?;
        let port: u32 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
        if port > u16::MAX as u32 {
            return Err(AddressError::InvalidPort(port.to_string()));
        }

        Ok(Self::new(ip, port as u16))
    }

    /// Parse, falling back to DNS resolution for host names
    pub async fn resolve(address: &str) -> Result<Self, AddressError> {
        if let Ok(addr) = Self::parse(address) {
            return Ok(addr);
        }

        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_PORT)
        };
        let mut addrs = lookup_host(target.as_str())
            .await
            .map_err(|_| AddressError::Resolve(address.to_string()))?;
        addrs
            .next()
            .map(Self::from_socket_addr)
            .ok_or_else(|| AddressError::Resolve(address.to_string()))
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Canonical string form
    pub fn as_str(&self) -> &str {
        &self.str
    }

    /// Whether the address is reachable from the public internet
    pub fn is_public(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => {
                !(v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
                    || v4.is_documentation())
            }
            IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
        }
    }

    /// Open a framed connection to this address
    ///
    /// Also returns what the TLS handshake learned from the peer
    /// certificate, when TLS is on.
    pub async fn dial(
        &self,
        opts: &DialOptions,
        blacklist: &BlackList,
    ) -> Result<(FramedConn, Option<PeerCertificate>), P2pError> {
        dial_interceptor(blacklist, self)?;

        if opts.compression {
            let (mut conn, cert) = self.connect(opts, true).await?;
            match probe_compression(&mut conn).await {
                Ok(()) => return Ok((conn, cert)),
                Err(e) => {
                    log::debug!(
                        "Peer {} refused compressed frames ({}), re-dialing without",
                        self,
                        e
                    );
                }
            }
        }

        self.connect(opts, false).await
    }

    async fn connect(
        &self,
        opts: &DialOptions,
        compress: bool,
    ) -> Result<(FramedConn, Option<PeerCertificate>), P2pError> {
        let stream = timeout(opts.timeout, TcpStream::connect(self.socket_addr()))
            .await
            .map_err(|_| P2pError::Timeout(format!("dial {}", self)))??;
        stream.set_nodelay(true)?;

        let (stream, cert) = match &opts.tls {
            Some(creds) => creds.client_handshake(stream, self).await?,
            None => (Box::pin(stream) as BoxedStream, None),
        };

        Ok((Framed::new(stream, MessageCodec::new(compress)), cert))
    }
}

/// Transport parameters for an outbound dial
#[derive(Clone)]
pub struct DialOptions {
    /// Mutual TLS credentials, when TLS is enabled
    pub tls: Option<Arc<TlsCredentials>>,
    /// Try compressed frames first
    pub compression: bool,
    /// TCP connect bound
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            tls: None,
            compression: false,
            timeout: DIAL_TIMEOUT,
        }
    }
}

/// Refuse to dial banned or quarantined addresses
pub fn dial_interceptor(blacklist: &BlackList, addr: &NetAddress) -> Result<(), P2pError> {
    if blacklist.is_banned(addr.as_str()) {
        return Err(P2pError::Banned(addr.to_string()));
    }
    Ok(())
}

async fn probe_compression(conn: &mut FramedConn) -> Result<(), P2pError> {
    let nonce: u64 = rand::random();
    conn.send(Envelope::request(PROBE_ID, Message::Ping(nonce)))
        .await?;

    match timeout(PROBE_TIMEOUT, conn.next()).await {
        Ok(Some(Ok(reply))) => match reply.message {
            Message::Pong(n) if n == nonce => Ok(()),
            _ => Err(P2pError::UnexpectedResponse("Ping")),
        },
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Err(P2pError::Disconnected),
        Err(_) => Err(P2pError::Timeout("compression probe".to_string())),
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.str)
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetAddress({})", self.str)
    }
}

impl PartialEq for NetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.str == other.str
    }
}

impl Eq for NetAddress {}

impl Hash for NetAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.str.hash(state);
    }
}

impl PartialOrd for NetAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NetAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.str.cmp(&other.str)
    }
}

impl TryFrom<String> for NetAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NetAddress> for String {
    fn from(addr: NetAddress) -> Self {
        addr.str
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}
