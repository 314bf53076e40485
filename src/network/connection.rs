//! Connection transport and I/O tasks
//!
//! A connection is a framed stream over either plain TCP or a TLS
//! session. After the handshake it is split into a writer task draining
//! the peer's outbound queue and a reader task that completes pending
//! requests and forwards everything else to the node.

use crate::network::codec::MessageCodec;
use crate::network::message::Envelope;
use crate::network::peer::{Peer, PeerState};
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Bound on writing one frame to the socket
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream a connection runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased plain or TLS stream
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Framed connection carrying envelopes
pub type FramedConn = Framed<BoxedStream, MessageCodec>;

/// Events delivered from connection tasks to the node
#[derive(Debug)]
pub enum PeerEvent {
    /// A request or push from a registered peer
    Message(Arc<Peer>, Envelope),
    /// The connection ended
    Closed(Arc<Peer>),
}

/// Run the reader and writer tasks of a registered connection
pub fn spawn_connection(
    conn: FramedConn,
    peer: Arc<Peer>,
    mut outbound: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<PeerEvent>,
) {
    let (mut writer, mut reader) = conn.split();
    let cancel = peer.cancel_token().clone();

    {
        let peer = peer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = outbound.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                match timeout(WRITE_TIMEOUT, writer.send(envelope)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::warn!("Write to {} failed: {}", peer.addr(), e);
                        break;
                    }
                    Err(_) => {
                        log::warn!("Write to {} timed out", peer.addr());
                        break;
                    }
                }
            }
            peer.close();
            let _ = writer.close().await;
        });
    }

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    if let Some(to) = envelope.reply_to {
                        if !peer.complete(to, envelope.message) {
                            log::debug!("Unmatched reply {} from {}", to, peer.addr());
                        }
                        continue;
                    }
                    log::debug!(
                        "Received {} from {}",
                        envelope.message.type_name(),
                        peer.addr()
                    );
                    if events
                        .send(PeerEvent::Message(peer.clone(), envelope))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", peer.addr(), e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", peer.addr());
                    break;
                }
            }
        }

        peer.close();
        peer.set_state(PeerState::Closed);
        let _ = events.send(PeerEvent::Closed(peer)).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;
    use crate::network::peer::tests::params;
    use crate::network::version::PROTOCOL_VERSION;

    fn framed_pair() -> (FramedConn, FramedConn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a: BoxedStream = Box::pin(a);
        let b: BoxedStream = Box::pin(b);
        (
            Framed::new(a, MessageCodec::default()),
            Framed::new(b, MessageCodec::default()),
        )
    }

    #[tokio::test]
    async fn test_replies_complete_requests_and_pushes_become_events() {
        let (local, mut remote) = framed_pair();
        let (peer, rx) = Peer::channel(params("remote", 1, PROTOCOL_VERSION));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        spawn_connection(local, peer.clone(), rx, events_tx);

        let request = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.request(Message::GetMempoolSize, Duration::from_secs(2)).await })
        };

        let env = remote.next().await.unwrap().unwrap();
        assert_eq!(env.message, Message::GetMempoolSize);
        remote
            .send(Envelope::reply(1, env.id, Message::MempoolSize(5)))
            .await
            .unwrap();
        assert_eq!(request.await.unwrap().unwrap(), Message::MempoolSize(5));

        remote
            .send(Envelope::request(2, Message::GetAddr))
            .await
            .unwrap();
        match events_rx.recv().await.unwrap() {
            PeerEvent::Message(from, env) => {
                assert_eq!(from.name(), "remote");
                assert_eq!(env.message, Message::GetAddr);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_hangup_closes_peer() {
        let (local, remote) = framed_pair();
        let (peer, rx) = Peer::channel(params("remote", 1, PROTOCOL_VERSION));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        spawn_connection(local, peer.clone(), rx, events_tx);

        drop(remote);
        match events_rx.recv().await.unwrap() {
            PeerEvent::Closed(p) => assert!(p.is_closed()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(peer.state(), PeerState::Closed);
    }
}
