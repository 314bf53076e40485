//! Ban list
//!
//! Time-bounded bans keyed by address. A ban on `ip:port` also bans the
//! bare IP so a peer cannot dodge it by reconnecting from another port.
//! Expired entries are treated as absent on every lookup and reaped
//! lazily.
//!
//! The list also remembers which address each peer identity last
//! connected from, for a while after it disconnects. When an identity
//! shows up from a different address inside that window, the new address
//! is quarantined for a short time instead of banned.

use crate::network::filter::TimedCache;
use crate::network::netaddress::NetAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Window over which protocol violations are counted
pub const VIOLATION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Violations inside the window that trigger a ban
pub const VIOLATION_BAN_THRESHOLD: u32 = 3;

/// Default ban length when none is given (24 hours)
pub const DEFAULT_BAN_SECS: u64 = 24 * 60 * 60;

/// Longest ban or quarantine; longer requests are clamped (10 years)
pub const MAX_BAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// How long an identity's last address is remembered after it leaves
pub const DEFAULT_IDENTITY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Identities remembered at once
const IDENTITY_HISTORY_SIZE: usize = 4096;

/// An active ban, as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanEntry {
    /// Banned address or IP
    pub addr: String,
    /// When the ban lapses
    pub expires_at: DateTime<Utc>,
    /// Whether this is an identity quarantine rather than a ban
    pub quarantine: bool,
}

#[derive(Debug, Clone, Copy)]
struct Expiry {
    at: Instant,
    quarantine: bool,
}

#[derive(Debug)]
struct ViolationWindow {
    started: Instant,
    count: u32,
}

/// Time-bounded ban list with an identity-to-address index
pub struct BlackList {
    bans: Mutex<HashMap<String, Expiry>>,
    identities: TimedCache<String, NetAddress>,
    violations: Mutex<HashMap<String, ViolationWindow>>,
    violation_window: Duration,
    ban_duration: Duration,
}

impl BlackList {
    pub fn new() -> Self {
        Self::with_ban_duration(Duration::from_secs(DEFAULT_BAN_SECS))
    }

    /// Create a list whose violation-triggered bans last `ban_duration`
    pub fn with_ban_duration(ban_duration: Duration) -> Self {
        Self {
            bans: Mutex::new(HashMap::new()),
            identities: TimedCache::new(IDENTITY_HISTORY_SIZE, DEFAULT_IDENTITY_WINDOW),
            violations: Mutex::new(HashMap::new()),
            violation_window: VIOLATION_WINDOW,
            ban_duration,
        }
    }

    /// Remember identities for `window` after they were last seen
    pub fn with_identity_window(mut self, window: Duration) -> Self {
        self.identities = TimedCache::new(IDENTITY_HISTORY_SIZE, window);
        self
    }

    /// Count violations over `window` instead of [`VIOLATION_WINDOW`]
    pub fn with_violation_window(mut self, window: Duration) -> Self {
        self.violation_window = window;
        self
    }

    /// Keys a ban on `addr` covers: the address itself and its bare IP
    fn ban_keys(addr: &str) -> Vec<String> {
        match NetAddress::parse(addr) {
            Ok(parsed) if addr.contains(':') && addr.parse::<std::net::IpAddr>().is_err() => {
                vec![parsed.to_string(), parsed.ip().to_string()]
            }
            Ok(parsed) => vec![parsed.ip().to_string()],
            Err(_) => vec![addr.to_string()],
        }
    }

    fn insert(&self, keys: Vec<String>, duration: Duration, quarantine: bool) {
        let at = deadline(duration);
        if let Ok(mut bans) = self.bans.lock() {
            for key in keys {
                let entry = bans.entry(key).or_insert(Expiry { at, quarantine });
                // Extend, never shorten; a hard ban wins over a quarantine
                if at > entry.at {
                    entry.at = at;
                }
                entry.quarantine &= quarantine;
            }
        }
    }

    /// Ban an address (and its IP) for `secs` seconds
    pub fn ban(&self, addr: &str, secs: u64) {
        self.ban_for(addr, Duration::from_secs(secs));
    }

    /// Ban an address (and its IP) for `duration`
    pub fn ban_for(&self, addr: &str, duration: Duration) {
        log::info!("Banning {} for {}s", addr, duration.as_secs());
        self.insert(Self::ban_keys(addr), duration, false);
    }

    /// Quarantine exactly this address (not its IP) for `duration`
    pub fn quarantine(&self, addr: &NetAddress, duration: Duration) {
        log::info!("Quarantining {} for {}s", addr, duration.as_secs());
        self.insert(vec![addr.to_string()], duration, true);
    }

    /// True iff an unexpired ban or quarantine covers `addr` or its IP
    pub fn is_banned(&self, addr: &str) -> bool {
        let now = Instant::now();
        let Ok(mut bans) = self.bans.lock() else {
            return false;
        };
        let mut banned = false;
        for key in Self::ban_keys(addr) {
            match bans.get(&key) {
                Some(expiry) if expiry.at > now => banned = true,
                Some(_) => {
                    bans.remove(&key);
                }
                None => {}
            }
        }
        banned
    }

    /// Remove a ban early; returns whether anything was removed
    pub fn unban(&self, addr: &str) -> bool {
        let Ok(mut bans) = self.bans.lock() else {
            return false;
        };
        let mut removed = false;
        for key in Self::ban_keys(addr) {
            removed |= bans.remove(&key).is_some();
        }
        if removed {
            log::info!("Unbanned {}", addr);
        }
        removed
    }

    /// Drop expired bans and stale violation windows
    ///
    /// Returns how many bans were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        if let Ok(mut violations) = self.violations.lock() {
            let window = self.violation_window;
            violations.retain(|_, w| now.duration_since(w.started) <= window);
        }
        let Ok(mut bans) = self.bans.lock() else {
            return 0;
        };
        let before = bans.len();
        bans.retain(|_, expiry| expiry.at > now);
        before - bans.len()
    }

    /// IPs with violations inside the current window
    pub fn tracked_violations(&self) -> usize {
        self.violations.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Active bans and quarantines
    pub fn bad_peers(&self) -> Vec<BanEntry> {
        let now = Instant::now();
        let wall = Utc::now();
        let Ok(bans) = self.bans.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<BanEntry> = bans
            .iter()
            .filter(|(_, expiry)| expiry.at > now)
            .map(|(addr, expiry)| BanEntry {
                addr: addr.clone(),
                expires_at: wall
                    + chrono::Duration::from_std(expiry.at - now)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                quarantine: expiry.quarantine,
            })
            .collect();
        entries.sort_by(|a, b| a.addr.cmp(&b.addr));
        entries
    }

    // =========================================================================
    // Identity index
    // =========================================================================

    /// Remember the address an identity connected from
    pub fn record_identity(&self, peer_id: &str, addr: NetAddress) {
        self.identities.insert(peer_id.to_string(), addr);
    }

    /// Last address seen for an identity, if seen inside the window
    pub fn lookup_identity(&self, peer_id: &str) -> Option<NetAddress> {
        self.identities.get(&peer_id.to_string())
    }

    /// Mark an identity as just gone; the window restarts from now
    pub fn release_identity(&self, peer_id: &str) {
        if let Some(addr) = self.lookup_identity(peer_id) {
            self.record_identity(peer_id, addr);
        }
    }

    // =========================================================================
    // Violation escalation
    // =========================================================================

    /// Count a protocol violation from `addr`
    ///
    /// Returns true when this violation tipped the address into a ban.
    pub fn record_violation(&self, addr: &NetAddress) -> bool {
        let key = addr.ip().to_string();
        let now = Instant::now();
        let count = {
            let Ok(mut violations) = self.violations.lock() else {
                return false;
            };
            let window = violations.entry(key.clone()).or_insert(ViolationWindow {
                started: now,
                count: 0,
            });
            if now.duration_since(window.started) > self.violation_window {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;
            let count = window.count;
            if count >= VIOLATION_BAN_THRESHOLD {
                violations.remove(&key);
            }
            count
        };

        if count >= VIOLATION_BAN_THRESHOLD {
            log::warn!("{} reached {} protocol violations", addr, count);
            self.ban_for(addr.as_str(), self.ban_duration);
            true
        } else {
            false
        }
    }
}

/// Expiry instant for a ban of `duration`, clamped to [`MAX_BAN_SECS`]
fn deadline(duration: Duration) -> Instant {
    let now = Instant::now();
    let duration = duration.min(Duration::from_secs(MAX_BAN_SECS));
    now.checked_add(duration)
        .or_else(|| now.checked_add(Duration::from_secs(DEFAULT_BAN_SECS)))
        .unwrap_or(now)
}

impl Default for BlackList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    #[test]
    fn test_ban_covers_ip_and_other_ports() {
        let list = BlackList::new();
        list.ban("10.0.0.1:13802", 60);

        assert!(list.is_banned("10.0.0.1:13802"));
        assert!(list.is_banned("10.0.0.1:9999"));
        assert!(list.is_banned("10.0.0.1"));
        assert!(!list.is_banned("10.0.0.2:13802"));
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let list = BlackList::new();
        list.ban_for("10.0.0.1:1", Duration::from_millis(50));
        assert!(list.is_banned("10.0.0.1:1"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!list.is_banned("10.0.0.1:1"));
        assert!(list.bad_peers().is_empty());
    }

    #[test]
    fn test_ban_extends_not_shortens() {
        let list = BlackList::new();
        list.ban("10.0.0.1:1", 3600);
        list.ban_for("10.0.0.1:1", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(list.is_banned("10.0.0.1:1"));
    }

    #[test]
    fn test_unban() {
        let list = BlackList::new();
        list.ban("10.0.0.1:1", 60);
        assert!(list.unban("10.0.0.1:1"));
        assert!(!list.is_banned("10.0.0.1:1"));
        assert!(!list.is_banned("10.0.0.1"));
        assert!(!list.unban("10.0.0.1:1"));
    }

    #[test]
    fn test_quarantine_is_address_only() {
        let list = BlackList::new();
        list.quarantine(&addr("10.0.0.1:1"), Duration::from_secs(60));
        assert!(list.is_banned("10.0.0.1:1"));
        assert!(!list.is_banned("10.0.0.1:2"));

        let entries = list.bad_peers();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].quarantine);
    }

    #[test]
    fn test_reap_expired() {
        let list = BlackList::new();
        list.ban_for("10.0.0.1:1", Duration::from_millis(1));
        list.ban("10.0.0.2:1", 60);
        std::thread::sleep(Duration::from_millis(5));
        // 10.0.0.1:1 and 10.0.0.1 expired
        assert_eq!(list.reap_expired(), 2);
        assert_eq!(list.bad_peers().len(), 2);
    }

    #[test]
    fn test_identity_index() {
        let list = BlackList::new();
        assert!(list.lookup_identity("peer").is_none());
        list.record_identity("peer", addr("1.2.3.4:5"));
        assert_eq!(list.lookup_identity("peer"), Some(addr("1.2.3.4:5")));
        list.record_identity("peer", addr("1.2.3.4:6"));
        assert_eq!(list.lookup_identity("peer"), Some(addr("1.2.3.4:6")));
    }

    #[tokio::test]
    async fn test_identity_outlives_release_until_window() {
        let list = BlackList::new().with_identity_window(Duration::from_millis(60));
        list.record_identity("peer", addr("1.2.3.4:5"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        list.release_identity("peer");
        tokio::time::sleep(Duration::from_millis(40)).await;
        // 80ms since recorded, 40ms since released
        assert_eq!(list.lookup_identity("peer"), Some(addr("1.2.3.4:5")));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(list.lookup_identity("peer").is_none());
        list.release_identity("peer");
        assert!(list.lookup_identity("peer").is_none());
    }

    #[test]
    fn test_huge_durations_are_clamped() {
        let list = BlackList::with_ban_duration(Duration::from_secs(u64::MAX));
        list.ban("10.1.2.3:1000", u64::MAX);
        list.ban_for("10.1.2.4:1000", Duration::MAX);
        list.quarantine(&addr("10.1.2.5:1000"), Duration::MAX);
        for _ in 0..VIOLATION_BAN_THRESHOLD {
            list.record_violation(&addr("10.1.2.6:1000"));
        }

        for banned in ["10.1.2.3:1000", "10.1.2.4:1", "10.1.2.5:1000", "10.1.2.6:1"] {
            assert!(list.is_banned(banned), "{} should be banned", banned);
        }
        let latest = Utc::now() + chrono::Duration::seconds(MAX_BAN_SECS as i64 + 60);
        assert!(list.bad_peers().iter().all(|e| e.expires_at <= latest));
    }

    #[tokio::test]
    async fn test_reap_drops_stale_violation_windows() {
        let list = BlackList::new().with_violation_window(Duration::from_millis(30));
        list.record_violation(&addr("10.0.0.1:1"));
        list.record_violation(&addr("10.0.0.2:1"));
        assert_eq!(list.tracked_violations(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        list.record_violation(&addr("10.0.0.2:1"));
        list.reap_expired();
        // 10.0.0.2 started a fresh window
        assert_eq!(list.tracked_violations(), 1);
    }

    #[test]
    fn test_violations_escalate_to_ban() {
        let list = BlackList::with_ban_duration(Duration::from_secs(60));
        let offender = addr("10.9.9.9:1000");

        for _ in 1..VIOLATION_BAN_THRESHOLD {
            assert!(!list.record_violation(&offender));
        }
        assert!(!list.is_banned(offender.as_str()));

        assert!(list.record_violation(&offender));
        assert!(list.is_banned(offender.as_str()));
        assert!(list.is_banned("10.9.9.9:2000"));
    }
}
