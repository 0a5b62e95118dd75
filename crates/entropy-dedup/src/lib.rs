//! Cross-source deduplication filter.
//!
//! Answers "is this payload novel?" across all endpoints with bounded
//! memory. Backed by an LRU map so that a hit bumps the entry to
//! most-recent without touching any other bookkeeping; on overflow,
//! `max / 10` oldest entries are evicted in one batch rather than one
//! entry per insert, which amortises the cost of sustained saturation.

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::info;

/// Outcome of [`DedupFilter::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The fingerprint was not present; it has now been recorded.
    Novel,
    /// The fingerprint was already present and has been bumped to
    /// most-recent.
    Duplicate,
}

/// Point-in-time counters for the filter, suitable for stats logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub entries: usize,
    pub max_entries: usize,
    pub fill_percent: f64,
    pub evictions: u64,
    pub duplicates: u64,
    pub estimated_bytes: u64,
}

/// Per-entry memory heuristic used for `estimated_bytes` (fixed-width
/// 64-hex-character key plus map overhead).
const ESTIMATED_BYTES_PER_ENTRY: u64 = 100;

/// The global, bounded, insertion-ordered dedup membership set.
///
/// Only the single pipeline dispatcher is expected to call `observe` (see
/// the concurrency model in the top-level spec), so this type requires no
/// internal locking of its own.
pub struct DedupFilter {
    cache: LruCache<String, ()>,
    max_entries: usize,
    eviction_count: u64,
    duplicate_count: u64,
}

impl DedupFilter {
    /// Create a filter bounded at `max_entries`. A `max_entries` of zero is
    /// clamped to one so the batch-eviction math never divides into an
    /// unusable filter.
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        DedupFilter {
            cache: LruCache::unbounded(),
            max_entries,
            eviction_count: 0,
            duplicate_count: 0,
        }
    }

    /// SHA-256 hex digest of `payload` — the Fingerprint used as the
    /// filter's key.
    pub fn fingerprint(payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        hex::encode_digest(&digest)
    }

    /// Record `fingerprint`, returning whether it was novel or a duplicate.
    pub fn observe(&mut self, fingerprint: &str) -> Observation {
        if self.cache.get(fingerprint).is_some() {
            self.duplicate_count += 1;
            return Observation::Duplicate;
        }

        if self.cache.len() >= self.max_entries {
            let evict_count = (self.max_entries / 10).max(1);
            for _ in 0..evict_count {
                if self.cache.pop_lru().is_none() {
                    break;
                }
                self.eviction_count += 1;
            }
        }

        self.cache.put(fingerprint.to_owned(), ());
        Observation::Novel
    }

    /// Current counters.
    pub fn stats(&self) -> Stats {
        let entries = self.cache.len();
        Stats {
            entries,
            max_entries: self.max_entries,
            fill_percent: if self.max_entries > 0 {
                entries as f64 / self.max_entries as f64 * 100.0
            } else {
                0.0
            },
            evictions: self.eviction_count,
            duplicates: self.duplicate_count,
            estimated_bytes: entries as u64 * ESTIMATED_BYTES_PER_ENTRY,
        }
    }

    /// Discard all entries. Used by the Memory Governor is NOT wired here —
    /// the governor clears the Mixer's buffer instead (see `entropy-memory`);
    /// this method exists for completeness and explicit operator use.
    pub fn clear(&mut self) {
        self.cache.clear();
        info!("deduplication buffer cleared");
    }
}

// A tiny local hex encoder so this crate doesn't need to depend on the
// top-level `hex` crate just for one call site.
mod hex {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode_digest(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(DIGITS[(b >> 4) as usize] as char);
            out.push(DIGITS[(b & 0x0f) as usize] as char);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_reports_novel_then_duplicate() {
        let mut filter = DedupFilter::new(100);
        let fp = DedupFilter::fingerprint(b"hello");
        assert_eq!(filter.observe(&fp), Observation::Novel);
        assert_eq!(filter.observe(&fp), Observation::Duplicate);
        assert_eq!(filter.stats().duplicates, 1);
        assert_eq!(filter.stats().entries, 1);
    }

    #[test]
    fn all_duplicates_scenario_s2() {
        let mut filter = DedupFilter::new(1_000_000);
        let fp = DedupFilter::fingerprint(b"x");
        for _ in 0..100 {
            filter.observe(&fp);
        }
        let stats = filter.stats();
        assert_eq!(stats.duplicates, 99);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn overflow_eviction_scenario_s4() {
        // DEDUPLICATION_MAX_ENTRIES=100, inject 110 distinct payloads.
        let mut filter = DedupFilter::new(100);
        for i in 0..110 {
            let fp = DedupFilter::fingerprint(format!("payload-{i}").as_bytes());
            filter.observe(&fp);
        }
        let stats = filter.stats();
        assert_eq!(stats.entries, 100);
        assert_eq!(stats.evictions, 10);
    }

    #[test]
    fn fingerprint_is_stable_64_char_hex() {
        let fp = DedupFilter::fingerprint(b"abc");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Known SHA-256("abc") digest.
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bounded_after_any_sequence() {
        let mut filter = DedupFilter::new(50);
        for i in 0..5_000 {
            let fp = DedupFilter::fingerprint(format!("m{i}").as_bytes());
            filter.observe(&fp);
        }
        assert!(filter.stats().entries <= 50);
    }

    #[test]
    fn lru_hit_promotes_entry_so_it_survives_eviction() {
        let mut filter = DedupFilter::new(10);
        let fp0 = DedupFilter::fingerprint(b"oldest");
        filter.observe(&fp0);
        for i in 1..10 {
            filter.observe(&DedupFilter::fingerprint(format!("m{i}").as_bytes()));
        }
        // Touch the oldest entry so it becomes most-recent.
        filter.observe(&fp0);
        // Push past capacity; batch eviction removes max(1, 10/10) = 1 oldest.
        filter.observe(&DedupFilter::fingerprint(b"trigger-eviction"));
        assert_eq!(filter.observe(&fp0), Observation::Duplicate);
    }
}
