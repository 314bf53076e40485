//! Parallel block download
//!
//! A [`DownloadJob`] fetches a height range from a pool of peers:
//! - every height is one fetch task, assigned to a free peer
//! - a peer is busy until its fetch completes or times out
//! - a failed height goes back to the queue for another peer
//! - peers that keep failing (or disconnect) leave the rotation
//! - cancelling the job aborts every outstanding fetch

use crate::core::Block;
use crate::network::error::P2pError;
use crate::network::message::Message;
use crate::network::peer::Peer;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Bound on one block fetch
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures after which a peer leaves the rotation
pub const MAX_PEER_FAILURES: u32 = 3;

/// Attempts per height before it is reported as failed
pub const MAX_HEIGHT_ATTEMPTS: u32 = 5;

/// Most heights one job will take on
pub const MAX_DOWNLOAD_BLOCKS: u64 = 10_000;

/// Pause between checks while waiting for a free peer
const FREE_PEER_POLL: Duration = Duration::from_millis(100);

/// Checks before settling for fewer free peers than asked for
const FREE_PEER_RETRIES: u32 = 10;

/// Something that can serve blocks by height
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Stable identifier (peer identity name)
    fn id(&self) -> String;

    /// Whether the fetcher can no longer serve anything
    fn closed(&self) -> bool {
        false
    }

    /// Fetch the block at `height`
    async fn fetch_block(&self, height: u64, wait: Duration) -> Result<Block, P2pError>;
}

#[async_trait]
impl BlockFetcher for Peer {
    fn id(&self) -> String {
        self.name().to_string()
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }

    async fn fetch_block(&self, height: u64, wait: Duration) -> Result<Block, P2pError> {
        let reply = self
            .request(
                Message::GetBlocks {
                    start: height,
                    end: height,
                },
                wait,
            )
            .await?;
        match reply {
            Message::Blocks(blocks) => blocks
                .into_iter()
                .find(|b| b.height() == height)
                .ok_or_else(|| P2pError::DownloadFailed(format!("{} lacks block {}", self.addr(), height))),
            _ => Err(P2pError::UnexpectedResponse("GetBlocks")),
        }
    }
}

struct PeerSlot {
    fetcher: Arc<dyn BlockFetcher>,
    busy: bool,
    failures: u32,
}

/// Outcome of a download
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Fetched blocks in height order
    pub blocks: Vec<Block>,
    /// Heights nobody could serve
    pub failed: Vec<u64>,
    /// Peers dropped from the rotation
    pub removed_peers: Vec<String>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One download over a pool of peers
pub struct DownloadJob {
    peers: Mutex<HashMap<String, PeerSlot>>,
    freed: Notify,
    cancel: CancellationToken,
    concurrency: usize,
    fetch_timeout: Duration,
}

impl DownloadJob {
    pub fn new(fetchers: Vec<Arc<dyn BlockFetcher>>, concurrency: usize) -> Self {
        let peers = fetchers
            .into_iter()
            .map(|fetcher| {
                (
                    fetcher.id(),
                    PeerSlot {
                        fetcher,
                        busy: false,
                        failures: 0,
                    },
                )
            })
            .collect();
        Self {
            peers: Mutex::new(peers),
            freed: Notify::new(),
            cancel: CancellationToken::new(),
            concurrency: concurrency.max(1),
            fetch_timeout: FETCH_TIMEOUT,
        }
    }

    /// Override the per-fetch timeout
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Tie the job to an outer token, e.g. the node's
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the whole job
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn free_now(&self) -> Vec<Arc<dyn BlockFetcher>> {
        let Ok(mut peers) = self.peers.lock() else {
            return Vec::new();
        };
        peers.retain(|id, slot| {
            if slot.fetcher.closed() {
                log::info!("Download peer {} disconnected", id);
                return false;
            }
            true
        });
        peers
            .values()
            .filter(|slot| !slot.busy)
            .map(|slot| slot.fetcher.clone())
            .collect()
    }

    /// Free peers, waiting briefly if fewer than `min_count` are free
    ///
    /// Settles for fewer after a few checks. Fails with `NoPeers` once the
    /// rotation is empty.
    pub async fn get_free_peers(
        &self,
        min_count: usize,
    ) -> Result<Vec<Arc<dyn BlockFetcher>>, P2pError> {
        let mut free = Vec::new();
        for _ in 0..FREE_PEER_RETRIES {
            free = self.free_now();
            if free.len() >= min_count {
                return Ok(free);
            }
            if self.peer_count() == 0 {
                return Err(P2pError::NoPeers);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(P2pError::Cancelled),
                _ = self.freed.notified() => {}
                _ = tokio::time::sleep(FREE_PEER_POLL) => {}
            }
        }
        Ok(free)
    }

    pub fn set_busy(&self, id: &str) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(slot) = peers.get_mut(id) {
                slot.busy = true;
            }
        }
    }

    pub fn set_free(&self, id: &str) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(slot) = peers.get_mut(id) {
                slot.busy = false;
            }
        }
        self.freed.notify_waiters();
    }

    /// Take a peer out of the rotation
    pub fn remove_peer(&self, id: &str) -> bool {
        let removed = self
            .peers
            .lock()
            .map(|mut peers| peers.remove(id).is_some())
            .unwrap_or(false);
        self.freed.notify_waiters();
        removed
    }

    fn release_all(&self) {
        if let Ok(mut peers) = self.peers.lock() {
            for slot in peers.values_mut() {
                slot.busy = false;
            }
        }
    }

    /// Mark every peer free and clear failure counts
    pub fn reset_peers(&self) {
        if let Ok(mut peers) = self.peers.lock() {
            for slot in peers.values_mut() {
                slot.busy = false;
                slot.failures = 0;
            }
        }
        self.freed.notify_waiters();
    }

    /// Count a failure; returns true if the peer should leave the rotation
    fn record_failure(&self, id: &str) -> bool {
        let Ok(mut peers) = self.peers.lock() else {
            return true;
        };
        match peers.get_mut(id) {
            Some(slot) => {
                slot.failures += 1;
                slot.busy = false;
                slot.failures >= MAX_PEER_FAILURES
            }
            None => false,
        }
    }

    /// Fetch every height in `start..=end`
    pub async fn download(&self, start: u64, end: u64) -> Result<DownloadReport, P2pError> {
        if start > end {
            return Ok(DownloadReport::default());
        }
        if end - start >= MAX_DOWNLOAD_BLOCKS {
            return Err(P2pError::RangeTooLarge {
                start,
                end,
                max: MAX_DOWNLOAD_BLOCKS,
            });
        }
        log::info!(
            "Downloading blocks {}..={} from {} peers",
            start,
            end,
            self.peer_count()
        );

        let mut queue: VecDeque<u64> = (start..=end).collect();
        let mut attempts: HashMap<u64, u32> = HashMap::new();
        let mut blocks: BTreeMap<u64, Block> = BTreeMap::new();
        let mut report = DownloadReport::default();
        let mut tasks: JoinSet<(String, u64, Result<Block, P2pError>)> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                tasks.abort_all();
                return Err(P2pError::Cancelled);
            }

            // Hand queued heights to free peers
            if !queue.is_empty() && tasks.len() < self.concurrency {
                let free = if tasks.is_empty() {
                    // Nothing in flight, so nobody is really busy
                    self.release_all();
                    match self.get_free_peers(1).await {
                        Ok(free) => free,
                        Err(P2pError::NoPeers) => {
                            log::warn!("No peers left with {} heights queued", queue.len());
                            report.failed.extend(queue.drain(..));
                            break;
                        }
                        Err(e) => {
                            tasks.abort_all();
                            return Err(e);
                        }
                    }
                } else {
                    self.free_now()
                };

                for fetcher in free {
                    if tasks.len() >= self.concurrency {
                        break;
                    }
                    let Some(height) = queue.pop_front() else {
                        break;
                    };
                    let id = fetcher.id();
                    self.set_busy(&id);
                    *attempts.entry(height).or_insert(0) += 1;

                    let cancel = self.cancel.clone();
                    let wait = self.fetch_timeout;
                    tasks.spawn(async move {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => Err(P2pError::Cancelled),
                            res = timeout(wait, fetcher.fetch_block(height, wait)) => match res {
                                Ok(res) => res,
                                Err(_) => Err(P2pError::Timeout(format!("block {} from {}", height, id))),
                            },
                        };
                        (id, height, result)
                    });
                }
            }

            if tasks.is_empty() {
                if queue.is_empty() {
                    break;
                }
                continue;
            }

            let joined = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(P2pError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok((id, height, Ok(block)))) => {
                    self.set_free(&id);
                    blocks.insert(height, block);
                }
                Some(Ok((id, height, Err(e)))) => {
                    if matches!(e, P2pError::Cancelled) {
                        continue;
                    }
                    log::warn!("Fetching block {} from {} failed: {}", height, id, e);
                    let drop_peer = matches!(e, P2pError::Disconnected) || self.record_failure(&id);
                    if drop_peer && self.remove_peer(&id) {
                        log::info!("Removed {} from download rotation", id);
                        report.removed_peers.push(id);
                    } else {
                        self.set_free(&id);
                    }

                    if attempts.get(&height).copied().unwrap_or(0) >= MAX_HEIGHT_ATTEMPTS {
                        report.failed.push(height);
                    } else {
                        queue.push_front(height);
                    }
                }
                Some(Err(e)) => log::error!("Download task failed: {}", e),
                None => {}
            }
        }

        report.failed.sort_unstable();
        report.blocks = blocks.into_values().collect();
        log::info!(
            "Download finished: {} blocks, {} failed heights",
            report.blocks.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves a fixed set of heights, optionally failing first
    struct MockFetcher {
        id: String,
        heights: Vec<u64>,
        fail_first: AtomicU32,
        delay: Duration,
        served: AtomicU32,
    }

    impl MockFetcher {
        fn new(id: &str, heights: std::ops::RangeInclusive<u64>) -> Self {
            Self {
                id: id.to_string(),
                heights: heights.collect(),
                fail_first: AtomicU32::new(0),
                delay: Duration::from_millis(1),
                served: AtomicU32::new(0),
            }
        }

        fn failing(mut self, times: u32) -> Self {
            self.fail_first = AtomicU32::new(times);
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl BlockFetcher for MockFetcher {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn fetch_block(&self, height: u64, _wait: Duration) -> Result<Block, P2pError> {
            tokio::time::sleep(self.delay).await;
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(P2pError::Timeout(format!("block {}", height)));
            }
            if !self.heights.contains(&height) {
                return Err(P2pError::DownloadFailed(format!("no block {}", height)));
            }
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(Block::new(height, "0".repeat(64), vec![]))
        }
    }

    fn job(fetchers: Vec<Arc<MockFetcher>>, concurrency: usize) -> DownloadJob {
        let fetchers = fetchers
            .into_iter()
            .map(|f| f as Arc<dyn BlockFetcher>)
            .collect();
        DownloadJob::new(fetchers, concurrency)
    }

    #[tokio::test]
    async fn test_download_spreads_over_peers() {
        let a = Arc::new(MockFetcher::new("a", 1..=20));
        let b = Arc::new(MockFetcher::new("b", 1..=20));
        let report = job(vec![a.clone(), b.clone()], 4)
            .download(1, 20)
            .await
            .unwrap();

        assert!(report.is_complete());
        let heights: Vec<u64> = report.blocks.iter().map(|b| b.height()).collect();
        assert_eq!(heights, (1..=20).collect::<Vec<_>>());
        assert!(a.served.load(Ordering::SeqCst) > 0);
        assert!(b.served.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_failing_peer_removed_and_work_reassigned() {
        let good = Arc::new(MockFetcher::new("good", 1..=10));
        let bad = Arc::new(MockFetcher::new("bad", 1..=10).failing(u32::MAX));
        let report = job(vec![good, bad], 2).download(1, 10).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.blocks.len(), 10);
        assert_eq!(report.removed_peers, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_unservable_height_reported() {
        let a = Arc::new(MockFetcher::new("a", 1..=3));
        let b = Arc::new(MockFetcher::new("b", 1..=3));
        let report = job(vec![a, b], 2).download(1, 4).await.unwrap();

        assert_eq!(report.blocks.len(), 3);
        assert_eq!(report.failed, vec![4]);
    }

    #[tokio::test]
    async fn test_no_peers() {
        let report = job(vec![], 2).download(1, 2).await.unwrap();
        assert_eq!(report.failed, vec![1, 2]);

        let empty = job(vec![], 2);
        assert!(matches!(
            empty.get_free_peers(1).await,
            Err(P2pError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn test_oversized_range_refused() {
        let a = Arc::new(MockFetcher::new("a", 1..=3));
        let result = job(vec![a.clone()], 2).download(0, u64::MAX).await;
        let err = result.unwrap_err();
        assert!(matches!(err, P2pError::RangeTooLarge { .. }));
        assert_eq!(err.class(), crate::network::error::ErrorClass::ResourceExhausted);
        assert_eq!(a.served.load(Ordering::SeqCst), 0);

        // One past the limit
        assert!(matches!(
            job(vec![a.clone()], 2)
                .download(1, MAX_DOWNLOAD_BLOCKS + 1)
                .await,
            Err(P2pError::RangeTooLarge { .. })
        ));
        assert_eq!(a.served.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_free_peers_settles_for_fewer() {
        let j = job(
            vec![
                Arc::new(MockFetcher::new("a", 1..=1)),
                Arc::new(MockFetcher::new("b", 1..=1)),
            ],
            2,
        );
        j.set_busy("a");
        let free = j.get_free_peers(2).await.unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id(), "b");

        j.reset_peers();
        assert_eq!(j.get_free_peers(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_aborts_outstanding_fetches() {
        let slow = Arc::new(MockFetcher::new("slow", 1..=100).slow(Duration::from_secs(30)));
        let j = Arc::new(job(vec![slow.clone()], 4));
        let cancel = j.cancel_token();

        let handle = {
            let j = j.clone();
            tokio::spawn(async move { j.download(1, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(P2pError::Cancelled)));
        assert_eq!(slow.served.load(Ordering::SeqCst), 0);
    }
}
