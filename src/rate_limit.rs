use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::config::LimiterConfig;
use crate::error::GateError;
use crate::metrics::{BLACKLIST_SIZE, TRACKED_ADDRESSES};

// Access entry - tracks knocks per IP inside the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub count: u32,
    pub last_access: Instant,
}

struct LimiterState {
    access: HashMap<String, AccessRecord>,
    // address -> true, same shape as the file on disk
    blacklist: BTreeMap<String, bool>,
}

/// Per-address knock limiter with a persistent blacklist.
///
/// A window is re-armed by every allowed knock. An address that reaches
/// `max_accesses` inside one window and knocks again is blacklisted for good.
/// All state sits behind one lock, and the blacklist file is written while
/// that lock is held.
pub struct Limiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Result<Self, GateError> {
        let blacklist = match &config.blacklist_path {
            Some(path) => load_blacklist(path)?,
            None => BTreeMap::new(),
        };

        if !blacklist.is_empty() {
            tracing::info!("Loaded {} blacklisted addresses", blacklist.len());
        }

        Ok(Self {
            config,
            state: Mutex::new(LimiterState {
                access: HashMap::new(),
                blacklist,
            }),
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.is_allowed_at(address, Instant::now())
    }

    pub fn is_allowed_at(&self, address: &str, now: Instant) -> bool {
        let mut state = self.lock();

        if state.blacklist.contains_key(address) {
            return false;
        }

        let max_accesses = self.config.max_accesses;
        let window = self.config.access_timeout;

        let Some(record) = state.access.get_mut(address) else {
            state.access.insert(
                address.to_string(),
                AccessRecord {
                    count: 1,
                    last_access: now,
                },
            );
            return true;
        };

        // window expired..? reset it
        if elapsed(record.last_access, now) >= window {
            record.count = 1;
            record.last_access = now;
            return true;
        }

        // under limit..? allow and re-arm
        if record.count < max_accesses {
            record.count += 1;
            record.last_access = now;
            return true;
        }

        // over limit - promote
        state.blacklist.insert(address.to_string(), true);
        BLACKLIST_SIZE.set(state.blacklist.len() as f64);
        tracing::warn!("Blacklisting {} after {} knocks within {:?}", address, max_accesses, window);
        if let Err(e) = self.persist(&state) {
            tracing::warn!(
                "Blacklist entry for {} is in memory only and will not survive a restart: {}",
                address,
                e
            );
        }
        false
    }

    #[cfg(test)]
    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.lock().blacklist.contains_key(address)
    }

    #[cfg(test)]
    pub fn record(&self, address: &str) -> Option<AccessRecord> {
        self.lock().access.get(address).copied()
    }

    pub fn blacklist_len(&self) -> usize {
        self.lock().blacklist.len()
    }

    pub fn tracked_len(&self) -> usize {
        self.lock().access.len()
    }

    // Drop records whose window is over; they behave like unseen addresses anyway
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let window = self.config.access_timeout;
        let mut state = self.lock();
        let before = state.access.len();
        state
            .access
            .retain(|_, record| elapsed(record.last_access, now) < window);
        before - state.access.len()
    }

    fn persist(&self, state: &LimiterState) -> Result<(), GateError> {
        let Some(path) = &self.config.blacklist_path else {
            return Ok(());
        };
        let data = serde_json::to_vec(&state.blacklist).map_err(|e| GateError::persistence(path, e))?;

        // a crash mid-write must leave the previous file intact
        let staging = staging_path(path);
        fs::write(&staging, data).map_err(|e| GateError::persistence(&staging, e))?;
        fs::rename(&staging, path).map_err(|e| GateError::persistence(path, e))
    }

    // A panic elsewhere must not take the gate down with it
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Sweeper - runs every window, forgets addresses that went quiet

pub async fn sweeper(limiter: Arc<Limiter>, every: Duration) {
    let mut interval = interval(every);

    tracing::info!("Access table sweeper started (interval: {:?})", every);

    loop {
        interval.tick().await;

        let removed = limiter.sweep_expired(Instant::now());
        if removed > 0 {
            tracing::debug!("Swept {} expired access records", removed);
        }

        TRACKED_ADDRESSES.set(limiter.tracked_len() as f64);
        BLACKLIST_SIZE.set(limiter.blacklist_len() as f64);
    }
}

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_blacklist(path: &Path) -> Result<BTreeMap<String, bool>, GateError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = fs::read(path).map_err(|e| GateError::persistence(path, e))?;
    let mut blacklist: BTreeMap<String, bool> =
        serde_json::from_slice(&data).map_err(|e| GateError::persistence(path, e))?;
    blacklist.retain(|_, listed| *listed);
    Ok(blacklist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn limiter(max_accesses: u32, window_secs: u64) -> Limiter {
        Limiter::new(LimiterConfig {
            max_accesses,
            access_timeout: Duration::from_secs(window_secs),
            blacklist_path: None,
        })
        .unwrap()
    }

    fn persistent(path: PathBuf) -> Limiter {
        Limiter::new(LimiterConfig {
            max_accesses: 1,
            access_timeout: Duration::from_secs(60),
            blacklist_path: Some(path),
        })
        .unwrap()
    }

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn test_counts_each_allowed_knock() {
        let limiter = limiter(5, 60);
        let t0 = Instant::now();

        for i in 1..=5 {
            assert!(limiter.is_allowed_at("10.0.0.1", at(t0, i as u64)), "knock {} should pass", i);
            assert_eq!(limiter.record("10.0.0.1").unwrap().count, i);
        }
        assert!(!limiter.is_blacklisted("10.0.0.1"));
    }

    #[test]
    fn test_burst_is_blacklisted_for_good() {
        // max 3 within 60s: t=0,10,20 pass, t=25 promotes, t=1000 still denied
        let limiter = limiter(3, 60);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", at(t0, 0)));
        assert!(limiter.is_allowed_at("A", at(t0, 10)));
        assert!(limiter.is_allowed_at("A", at(t0, 20)));
        assert_eq!(limiter.record("A").unwrap().count, 3);

        assert!(!limiter.is_allowed_at("A", at(t0, 25)));
        assert!(limiter.is_blacklisted("A"));

        assert!(!limiter.is_allowed_at("A", at(t0, 1000)));
        assert_eq!(limiter.blacklist_len(), 1);
    }

    #[test]
    fn test_expired_window_resets_count() {
        // max 2 within 5s: t=0 and t=10 both pass, never promoted
        let limiter = limiter(2, 5);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", at(t0, 0)));
        assert_eq!(limiter.record("A").unwrap().count, 1);
        assert!(limiter.is_allowed_at("A", at(t0, 10)));
        assert_eq!(limiter.record("A").unwrap().count, 1);
        assert!(!limiter.is_blacklisted("A"));
    }

    #[test]
    fn test_full_window_then_expiry_is_not_promoted() {
        let limiter = limiter(2, 5);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", at(t0, 0)));
        assert!(limiter.is_allowed_at("A", at(t0, 1)));
        // exactly one window after the last knock counts as expired
        assert!(limiter.is_allowed_at("A", at(t0, 6)));
        assert_eq!(limiter.record("A").unwrap().count, 1);
        assert!(!limiter.is_blacklisted("A"));
    }

    #[test]
    fn test_trickle_keeps_window_alive() {
        let limiter = limiter(3, 10);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", at(t0, 0)));
        assert!(limiter.is_allowed_at("A", at(t0, 9)));
        assert!(limiter.is_allowed_at("A", at(t0, 18)));
        // each knock re-armed the window, so this one is still inside it
        assert!(!limiter.is_allowed_at("A", at(t0, 27)));
    }

    #[test]
    fn test_addresses_are_independent() {
        let limiter = limiter(1, 60);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", t0));
        assert!(!limiter.is_allowed_at("A", at(t0, 1)));
        assert!(limiter.is_allowed_at("B", at(t0, 1)));
        assert_eq!(limiter.tracked_len(), 2);
    }

    #[test]
    fn test_blacklist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");

        let first = persistent(path.clone());
        assert!(first.is_allowed("192.0.2.7"));
        assert!(!first.is_allowed("192.0.2.7"));

        let raw: BTreeMap<String, bool> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.get("192.0.2.7"), Some(&true));

        let second = persistent(path);
        assert!(second.is_blacklisted("192.0.2.7"));
        assert!(!second.is_allowed("192.0.2.7"));
    }

    #[test]
    fn test_rewrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        // leftover from an interrupted write must not matter
        fs::write(staging_path(&path), "{\"192.0.2").unwrap();
        fs::write(&path, r#"{"198.51.100.1": true}"#).unwrap();

        let limiter = persistent(path.clone());
        assert!(limiter.is_allowed("192.0.2.7"));
        assert!(!limiter.is_allowed("192.0.2.7"));

        assert!(!staging_path(&path).exists());
        let raw: BTreeMap<String, bool> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 2);
        assert!(persistent(path).is_blacklisted("198.51.100.1"));
    }

    #[test]
    fn test_missing_file_is_empty_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = persistent(dir.path().join("absent.json"));
        assert_eq!(limiter.blacklist_len(), 0);
    }

    #[test]
    fn test_false_entries_are_not_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        fs::write(&path, r#"{"198.51.100.1": true, "198.51.100.2": false}"#).unwrap();

        let limiter = persistent(path);
        assert!(limiter.is_blacklisted("198.51.100.1"));
        assert!(!limiter.is_blacklisted("198.51.100.2"));
    }

    #[test]
    fn test_malformed_file_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        fs::write(&path, "not json").unwrap();

        let result = Limiter::new(LimiterConfig {
            max_accesses: 3,
            access_timeout: Duration::from_secs(60),
            blacklist_path: Some(path),
        });
        assert!(matches!(result, Err(GateError::Persistence { .. })));
    }

    #[test]
    fn test_write_failure_still_denies() {
        let dir = tempfile::tempdir().unwrap();
        // parent directory does not exist, so every write fails
        let limiter = persistent(dir.path().join("missing").join("blacklist.json"));

        assert!(limiter.is_allowed("A"));
        assert!(!limiter.is_allowed("A"));
        assert!(limiter.is_blacklisted("A"));
        assert!(!limiter.is_allowed("A"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let limiter = limiter(3, 10);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("old", t0));
        assert!(limiter.is_allowed_at("fresh", at(t0, 8)));

        assert_eq!(limiter.sweep_expired(at(t0, 12)), 1);
        assert!(limiter.record("old").is_none());
        assert!(limiter.record("fresh").is_some());
    }

    #[test]
    fn test_sweep_keeps_blacklist() {
        let limiter = limiter(1, 10);
        let t0 = Instant::now();

        assert!(limiter.is_allowed_at("A", t0));
        assert!(!limiter.is_allowed_at("A", at(t0, 1)));
        limiter.sweep_expired(at(t0, 100));
        assert_eq!(limiter.tracked_len(), 0);
        assert!(!limiter.is_allowed_at("A", at(t0, 100)));
    }

    #[test]
    fn test_concurrent_burst_promotes_once() {
        let limiter = Arc::new(limiter(10, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..5).filter(|_| limiter.is_allowed("A")).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 10);
        assert!(limiter.is_blacklisted("A"));
        assert_eq!(limiter.blacklist_len(), 1);
    }
}
