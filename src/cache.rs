//! Filter state cache: change detection and a bounded snapshot store.
//!
//! Every preview tick asks the cache "has the filter state changed since the
//! last frame was committed?". If not, the tick is a no-op. Answering that
//! cheaply and reliably is the whole point of this module.
//!
//! # Design
//!
//! ## State hashing
//!
//! [`state_hash`] normalizes any serializable value before hashing:
//!
//! - object keys are sorted,
//! - numbers are rounded to two decimals (so `10.0` and `10.004` hash equal),
//! - the canonical text is run through a 32-bit rolling hash (`h = h * 31 + c`,
//!   wrapping) and the absolute value is printed in base 36.
//!
//! Equal semantic states always hash equal. The hash is short and stable across
//! runs, which keeps exported snapshots comparable.
//!
//! Hashing can fail (non-finite numbers, values that refuse to serialize).
//! That never reaches the caller: [`FilterCache::hash`] substitutes a unique
//! time-based identifier, so the pipeline degrades to "always recompute"
//! instead of stalling on a stale hash. Failures are counted in [`CacheStats`].
//!
//! ## Snapshot store
//!
//! [`FilterCache::save_state`] keeps timestamped [`CacheEntry`] snapshots under
//! caller keys (the orchestrator uses `"current"`). Reads expire lazily:
//! an entry older than `max_age_ms` is removed and reported absent. Writes run
//! two-phase eviction: first every expired entry goes, then the oldest entries
//! (by timestamp, ties broken by insertion order) until at most `max_states`
//! remain.
//!
//! ## Export / import
//!
//! The store can be exported as a [`CacheSnapshot`] and restored later. The
//! format carries `version: "3.0"`; other versions are rejected on import.

use crate::config::CacheConfig;
use crate::imaging::FilterState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Version string written into exported snapshots.
pub const SNAPSHOT_VERSION: &str = "3.0";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cannot hash state: {0}")]
    Hash(String),
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version '{0}' (expected 3.0)")]
    UnsupportedVersion(String),
}

/// A stored filter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub filters: FilterState,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Insertion order, used to break timestamp ties during eviction.
    #[serde(default)]
    pub seq: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Change checks that found nothing to do.
    pub hits: u64,
    /// Change checks that required a render.
    pub misses: u64,
    pub evictions: u64,
    pub hash_failures: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unchanged, {} rendered ({} checks)",
            self.hits,
            self.misses,
            self.total()
        )?;
        if self.evictions > 0 {
            write!(f, ", {} evicted", self.evictions)?;
        }
        if self.hash_failures > 0 {
            write!(f, ", {} hash failures", self.hash_failures)?;
        }
        Ok(())
    }
}

/// Serializable backup of the snapshot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub timestamp: u64,
    pub version: String,
    pub states: Vec<(String, CacheEntry)>,
    pub stats: CacheStats,
    pub config: CacheConfig,
}

/// Normalize and hash a serializable state.
///
/// Fails on non-finite numbers and on values serde cannot represent.
pub fn state_hash<S: Serialize + ?Sized>(state: &S) -> Result<String, CacheError> {
    let value = serde_json::to_value(state).map_err(|e| CacheError::Hash(e.to_string()))?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    Ok(to_base36(rolling_hash(&canonical).unsigned_abs()))
}

/// Append the canonical form of `value`: sorted keys, numbers in hundredths.
fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<(), CacheError> {
    use serde_json::Value;
    match value {
        // serde_json maps non-finite floats to null.
        Value::Null => return Err(CacheError::Hash("null or non-finite value".into())),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let f = n
                .as_f64()
                .ok_or_else(|| CacheError::Hash(format!("unrepresentable number {n}")))?;
            let hundredths = (f * 100.0).round();
            if !hundredths.is_finite() {
                return Err(CacheError::Hash(format!("non-finite number {n}")));
            }
            out.push_str(&(hundredths as i64).to_string());
        }
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn rolling_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identifier that never equals any other, used when hashing fails.
fn unique_fallback_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("t{}-{}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Change detection plus a bounded, expiring snapshot store.
#[derive(Debug)]
pub struct FilterCache {
    config: CacheConfig,
    states: HashMap<String, CacheEntry>,
    last_applied: Option<String>,
    dirty: bool,
    next_seq: u64,
    stats: CacheStats,
}

impl FilterCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            last_applied: None,
            dirty: true,
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Hash a state, substituting a unique identifier on failure.
    pub fn hash<S: Serialize + ?Sized>(&mut self, state: &S) -> String {
        match state_hash(state) {
            Ok(h) => h,
            Err(e) => {
                self.stats.hash_failures += 1;
                warn!(error = %e, "state hash failed, forcing recompute");
                unique_fallback_id()
            }
        }
    }

    /// True when `state` differs from the last applied state, or the cache
    /// was invalidated since.
    pub fn has_changed<S: Serialize + ?Sized>(&mut self, state: &S) -> bool {
        let hash = self.hash(state);
        let changed = self.dirty || self.last_applied.as_deref() != Some(hash.as_str());
        if changed {
            self.stats.misses += 1;
        } else {
            self.stats.hits += 1;
        }
        changed
    }

    /// Record `state` as the one currently on screen.
    pub fn mark_applied<S: Serialize + ?Sized>(&mut self, state: &S) {
        let hash = self.hash(state);
        debug!(hash = %hash, "filter state applied");
        self.last_applied = Some(hash);
        self.dirty = false;
    }

    /// Force the next [`has_changed`](Self::has_changed) to report a change.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.last_applied.as_deref()
    }

    /// Store a snapshot under `key`, then evict.
    pub fn save_state(&mut self, key: &str, filters: &FilterState, metadata: serde_json::Value) {
        self.save_state_at(key, filters, metadata, now_ms());
    }

    pub fn save_state_at(
        &mut self,
        key: &str,
        filters: &FilterState,
        metadata: serde_json::Value,
        now: u64,
    ) {
        let entry = CacheEntry {
            hash: self.hash(filters),
            filters: *filters,
            timestamp: now,
            metadata,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.states.insert(key.to_string(), entry);
        self.evict_at(now);
    }

    /// Fetch a snapshot. Expired entries are removed and reported absent.
    pub fn get_state(&mut self, key: &str) -> Option<CacheEntry> {
        self.get_state_at(key, now_ms())
    }

    pub fn get_state_at(&mut self, key: &str, now: u64) -> Option<CacheEntry> {
        let expired = self.is_expired(self.states.get(key)?, now);
        if expired {
            self.states.remove(key);
            self.stats.evictions += 1;
            return None;
        }
        self.states.get(key).cloned()
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.states.remove(key)
    }

    /// Drop every snapshot and forget the applied state.
    pub fn clear(&mut self) {
        self.states.clear();
        self.last_applied = None;
        self.dirty = true;
    }

    /// Run eviction without inserting anything.
    pub fn cleanup(&mut self) {
        self.evict_at(now_ms());
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.states.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) > self.config.max_age_ms
    }

    fn evict_at(&mut self, now: u64) {
        let before = self.states.len();
        let max_age = self.config.max_age_ms;
        self.states
            .retain(|_, e| now.saturating_sub(e.timestamp) <= max_age);

        let overflow = self.states.len().saturating_sub(self.config.max_states);
        if overflow > 0 {
            let mut by_age: Vec<(u64, u64, String)> = self
                .states
                .iter()
                .map(|(k, e)| (e.timestamp, e.seq, k.clone()))
                .collect();
            by_age.sort();
            for (_, _, key) in by_age.into_iter().take(overflow) {
                self.states.remove(&key);
            }
        }

        let evicted = (before - self.states.len()) as u64;
        if evicted > 0 {
            self.stats.evictions += evicted;
            debug!(evicted, remaining = self.states.len(), "cache eviction");
        }
    }

    /// Snapshot the store for backup.
    pub fn export(&self) -> CacheSnapshot {
        let mut states: Vec<(String, CacheEntry)> = self
            .states
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        states.sort_by_key(|(_, e)| (e.timestamp, e.seq));
        CacheSnapshot {
            timestamp: now_ms(),
            version: SNAPSHOT_VERSION.to_string(),
            states,
            stats: self.stats,
            config: self.config.clone(),
        }
    }

    /// Replace the store with a snapshot's entries and counters.
    ///
    /// The cache keeps its own config; imported entries are evicted against it.
    pub fn import(&mut self, snapshot: CacheSnapshot) -> Result<(), CacheError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::UnsupportedVersion(snapshot.version));
        }
        self.states.clear();
        for (key, mut entry) in snapshot.states {
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.states.insert(key, entry);
        }
        self.stats = snapshot.stats;
        self.evict_at(now_ms());
        Ok(())
    }

    pub fn export_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    pub fn import_json(&mut self, json: &str) -> Result<(), CacheError> {
        let snapshot: CacheSnapshot = serde_json::from_str(json)?;
        self.import(snapshot)
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::FilterKind;
    use serde_json::json;

    fn state(brightness: f64) -> FilterState {
        FilterState::default().with(FilterKind::Brightness, brightness)
    }

    fn small_cache(max_states: usize) -> FilterCache {
        FilterCache::new(CacheConfig {
            max_states,
            max_age_ms: 1_000,
        })
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    #[test]
    fn hash_is_deterministic() {
        let s = state(12.5).with(FilterKind::Sepia, 40.0);
        assert_eq!(state_hash(&s).unwrap(), state_hash(&s).unwrap());
    }

    #[test]
    fn hash_tolerates_float_noise() {
        let a = state(10.0).with(FilterKind::Contrast, -20.0);
        let b = state(10.004).with(FilterKind::Contrast, -19.996);
        assert_eq!(state_hash(&a).unwrap(), state_hash(&b).unwrap());
    }

    #[test]
    fn hash_distinguishes_real_changes() {
        assert_ne!(state_hash(&state(10.0)).unwrap(), state_hash(&state(10.5)).unwrap());
    }

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(state_hash(&a).unwrap(), state_hash(&b).unwrap());
    }

    #[test]
    fn hash_is_base36() {
        let h = state_hash(&state(33.0)).unwrap();
        assert!(!h.is_empty());
        assert!(h.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn rolling_hash_and_base36_basics() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn non_finite_state_fails_to_hash() {
        assert!(matches!(
            state_hash(&state(f64::NAN)),
            Err(CacheError::Hash(_))
        ));
    }

    #[test]
    fn hash_failure_degrades_to_unique_ids() {
        let mut cache = FilterCache::default();
        let bad = state(f64::INFINITY);
        let a = cache.hash(&bad);
        let b = cache.hash(&bad);
        assert_ne!(a, b);
        assert_eq!(cache.stats().hash_failures, 2);

        cache.mark_applied(&bad);
        assert!(cache.has_changed(&bad));
    }

    // =========================================================================
    // Change detection
    // =========================================================================

    #[test]
    fn fresh_cache_reports_change() {
        let mut cache = FilterCache::default();
        assert!(cache.has_changed(&FilterState::default()));
    }

    #[test]
    fn mark_applied_then_unchanged() {
        let mut cache = FilterCache::default();
        let s = state(20.0);
        cache.mark_applied(&s);
        assert!(!cache.has_changed(&s));
        assert!(cache.has_changed(&state(21.0)));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn invalidate_forces_change() {
        let mut cache = FilterCache::default();
        let s = state(20.0);
        cache.mark_applied(&s);
        cache.invalidate();
        assert!(cache.has_changed(&s));
        cache.mark_applied(&s);
        assert!(!cache.has_changed(&s));
    }

    // =========================================================================
    // Snapshot store
    // =========================================================================

    #[test]
    fn save_and_get_state() {
        let mut cache = small_cache(10);
        cache.save_state_at("current", &state(5.0), json!({"source": "test"}), 100);
        let entry = cache.get_state_at("current", 200).unwrap();
        assert_eq!(entry.filters, state(5.0));
        assert_eq!(entry.metadata["source"], "test");
        assert_eq!(entry.hash, state_hash(&state(5.0)).unwrap());
    }

    #[test]
    fn get_state_expires_lazily() {
        let mut cache = small_cache(10);
        cache.save_state_at("current", &state(5.0), json!(null), 100);
        assert!(cache.get_state_at("current", 1_100).is_some());
        assert!(cache.get_state_at("current", 1_101).is_none());
        assert!(!cache.contains_key("current"));
    }

    #[test]
    fn eviction_keeps_most_recent() {
        let mut cache = small_cache(5);
        for i in 0..8u64 {
            cache.save_state_at(&format!("k{i}"), &state(i as f64), json!(null), 10);
        }
        assert_eq!(cache.len(), 5);
        for i in 3..8 {
            assert!(cache.contains_key(&format!("k{i}")), "k{i} should survive");
        }
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn eviction_drops_expired_first() {
        let mut cache = small_cache(5);
        cache.save_state_at("old", &state(1.0), json!(null), 0);
        cache.save_state_at("new", &state(2.0), json!(null), 5_000);
        assert!(!cache.contains_key("old"));
        assert!(cache.contains_key("new"));
    }

    #[test]
    fn clear_resets_applied_state() {
        let mut cache = small_cache(5);
        let s = state(1.0);
        cache.save_state_at("current", &s, json!(null), 0);
        cache.mark_applied(&s);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.last_applied().is_none());
        assert!(cache.has_changed(&s));
    }

    // =========================================================================
    // Export / import
    // =========================================================================

    #[test]
    fn export_import_restores_entries() {
        let mut cache = FilterCache::default();
        cache.save_state("current", &state(7.0), json!({"n": 1}));
        cache.save_state("preset:warm", &state(3.0), json!(null));
        let json = cache.export_json().unwrap();

        let mut restored = FilterCache::default();
        restored.import_json(&json).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.get_state("current").unwrap().filters,
            state(7.0)
        );
    }

    #[test]
    fn export_format_has_version_and_pairs() {
        let mut cache = FilterCache::default();
        cache.save_state("current", &state(7.0), json!(null));
        let value: serde_json::Value = serde_json::from_str(&cache.export_json().unwrap()).unwrap();
        assert_eq!(value["version"], "3.0");
        assert_eq!(value["states"][0][0], "current");
        assert!(value["states"][0][1]["hash"].is_string());
        assert!(value["config"]["max_states"].is_number());
    }

    #[test]
    fn import_rejects_other_versions() {
        let mut snapshot = FilterCache::default().export();
        snapshot.version = "2.0".into();
        let err = FilterCache::default().import(snapshot).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedVersion(v) if v == "2.0"));
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats {
            hits: 3,
            misses: 2,
            evictions: 1,
            hash_failures: 0,
        };
        assert_eq!(stats.to_string(), "3 unchanged, 2 rendered (5 checks), 1 evicted");
    }
}
