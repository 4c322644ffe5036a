//! Per-source alert throttle.
//!
//! Decides whether a no-helmet detection becomes an alert. Two named checks,
//! selected by `ThrottleStrategy`:
//!   - cooldown: at most one alert per source per cooldown window
//!   - fingerprint: a frame whose content hash was already alerted is never
//!     alerted again (per source, or across all sources with global scope)
//!
//! Each runner owns its `AlertThrottle`, so `&mut self` serializes all state
//! changes for one source. Only the global fingerprint set is shared, behind
//! a mutex, and its check-and-insert happens under a single lock.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{DedupScope, ThrottleConfig, ThrottleStrategy};
use crate::frame::{Detection, Fingerprint, LazyFingerprint};

/// Bounded FIFO set of recently alerted fingerprints.
#[derive(Debug)]
pub struct RecentFingerprints {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    seen: HashSet<Fingerprint>,
}

impl RecentFingerprints {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.seen.contains(fp)
    }

    /// Returns false if already present. Evicts the oldest entry when full.
    pub fn insert(&mut self, fp: Fingerprint) -> bool {
        if !self.seen.insert(fp) {
            return false;
        }
        self.order.push_back(fp);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub type SharedFingerprints = Arc<Mutex<RecentFingerprints>>;

/// Build the set shared by every source when dedup scope is global.
pub fn shared_fingerprints(cfg: &ThrottleConfig) -> Option<SharedFingerprints> {
    (cfg.dedup_scope == DedupScope::Global)
        .then(|| Arc::new(Mutex::new(RecentFingerprints::new(cfg.fingerprint_capacity))))
}

#[derive(Debug)]
enum FingerprintStore {
    Local(RecentFingerprints),
    Shared(SharedFingerprints),
}

impl FingerprintStore {
    /// Atomic check-and-insert.
    fn record_if_new(&mut self, fp: Fingerprint) -> bool {
        match self {
            Self::Local(set) => set.insert(fp),
            Self::Shared(shared) => {
                let mut set = shared.lock().unwrap_or_else(|p| p.into_inner());
                set.insert(fp)
            }
        }
    }
}

#[derive(Debug)]
pub struct AlertThrottle {
    source_id: String,
    strategy: ThrottleStrategy,
    cooldown: Duration,
    last_alert: Option<Instant>,
    fingerprints: FingerprintStore,
    admitted: u64,
    rejected: u64,
}

impl AlertThrottle {
    /// `shared` is only consulted for global dedup scope; pass the value
    /// from [`shared_fingerprints`] to every source.
    pub fn new(source_id: &str, cfg: &ThrottleConfig, shared: Option<SharedFingerprints>) -> Self {
        let fingerprints = match (cfg.dedup_scope, shared) {
            (DedupScope::Global, Some(set)) => FingerprintStore::Shared(set),
            _ => FingerprintStore::Local(RecentFingerprints::new(cfg.fingerprint_capacity)),
        };
        Self {
            source_id: source_id.to_string(),
            strategy: cfg.strategy,
            cooldown: Duration::from_secs(cfg.cooldown_seconds),
            last_alert: None,
            fingerprints,
            admitted: 0,
            rejected: 0,
        }
    }

    /// Decide on a detection seen in the frame behind `fingerprint`, now.
    /// The frame is hashed only when the cooldown passes and the strategy
    /// dedups by content.
    pub fn admit(&mut self, detection: &Detection, fingerprint: &mut LazyFingerprint<'_>) -> bool {
        let ok = self.admit_with(Instant::now(), || fingerprint.get());
        debug!(
            source = %self.source_id,
            label = %detection.label,
            confidence = detection.confidence,
            admitted = ok,
            "Throttle decision"
        );
        ok
    }

    /// Clock-explicit form of [`admit`](Self::admit). On rejection no state
    /// changes.
    pub fn admit_at(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        self.admit_with(now, || fingerprint)
    }

    fn admit_with(&mut self, now: Instant, fingerprint: impl FnOnce() -> Fingerprint) -> bool {
        if self.strategy.uses_cooldown() && self.in_cooldown(now) {
            self.rejected += 1;
            return false;
        }
        if self.strategy.uses_fingerprint() && !self.fingerprints.record_if_new(fingerprint()) {
            self.rejected += 1;
            return false;
        }
        self.last_alert = Some(now);
        self.admitted += 1;
        true
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        match self.last_alert {
            Some(last) => now.saturating_duration_since(last) <= self.cooldown,
            None => false,
        }
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
