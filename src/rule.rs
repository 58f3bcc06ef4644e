//! Single-window sliding-log engine.
//!
//! One `Rule` enforces "at most `limit` admissions per `window`" across all
//! visitors. Per-visitor state lives in a dense pool of deadline rings; a
//! concurrent index maps each visitor to its slot, and a free-set tracks
//! slots available for reuse. Structural changes (slot contents, free-set,
//! pool length, index updates) are serialized by one mutex; the index alone
//! answers lock-free lookups for iteration.
//!
//! Lock order is always mutex → index shard: index iterators are drained to a
//! `Vec` before the mutex is taken, and index reads under the mutex are
//! point lookups.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock;
use crate::key::Key;
use crate::ring::{DeadlineRing, RingFull};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Slot storage: the ring pool plus the indices currently unowned.
///
/// Every pool index is either in `free` or mapped by the visitor index, so
/// `free.len() + index.len() == slots.len()` holds between operations.
struct SlotPool {
    slots: Vec<DeadlineRing>,
    free: HashSet<usize>,
}

impl SlotPool {
    /// Hand out a slot for `key`: reuse a free one (reset under the new
    /// owner) or grow the pool by one.
    fn acquire(&mut self, key: &Key, limit: usize) -> usize {
        if let Some(&slot) = self.free.iter().next() {
            self.free.remove(&slot);
            self.slots[slot].reset(key.clone());
            slot
        } else {
            self.slots.push(DeadlineRing::new(limit, Some(key.clone())));
            self.slots.len() - 1
        }
    }
}

/// One (window, limit) rule across all visitors.
pub(crate) struct Rule {
    pub(crate) window: Duration,
    pub(crate) window_ns: i64,
    pub(crate) limit: usize,
    pub(crate) expected_visitors: usize,
    pub(crate) cleanup_interval: Duration,
    index: DashMap<Key, usize>,
    pool: Mutex<SlotPool>,
    sweeping: AtomicBool,
}

impl Rule {
    /// Build a rule, normalizing degenerate parameters: a zero limit becomes
    /// one, a zero visitor estimate falls back to the limit, and the sweep
    /// interval is `window / 100` clamped to `[1 s, 60 s]`.
    pub(crate) fn new(window: Duration, limit: usize, expected_visitors: usize) -> Self {
        let limit = limit.max(1);
        let expected_visitors = if expected_visitors == 0 {
            limit
        } else {
            expected_visitors
        };
        let cleanup_interval = (window / 100).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);

        let mut slots = Vec::with_capacity(expected_visitors);
        let mut free = HashSet::with_capacity(expected_visitors);
        for i in 0..expected_visitors {
            slots.push(DeadlineRing::new(limit, None));
            free.insert(i);
        }

        Self {
            window,
            window_ns: window.as_nanos() as i64,
            limit,
            expected_visitors,
            cleanup_interval,
            index: DashMap::new(),
            pool: Mutex::new(SlotPool { slots, free }),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Record one admission for `key` if the window still has room.
    pub(crate) fn allow_visit(&self, key: &Key) -> bool {
        let now = clock::now_ns();
        let deadline = now + self.window_ns;
        let mut pool = self.pool.lock();

        if let Some(slot) = self.index.get(key).map(|e| *e.value()) {
            let ring = &mut pool.slots[slot];
            ring.expire(now);
            return ring.push(deadline).is_ok();
        }

        // First admission for this visitor in the current window.
        let slot = pool.acquire(key, self.limit);
        self.index.insert(key.clone(), slot);
        pool.slots[slot]
            .push(deadline)
            .expect("freshly acquired ring has room");
        true
    }

    /// Admissions still available to `key` in the current window.
    pub(crate) fn remaining(&self, key: &Key) -> usize {
        let now = clock::now_ns();
        let mut pool = self.pool.lock();
        match self.index.get(key).map(|e| *e.value()) {
            Some(slot) => {
                let ring = &mut pool.slots[slot];
                ring.expire(now);
                ring.free()
            }
            None => self.limit,
        }
    }

    /// Forget `key` entirely; its slot returns to the free-set and is reset
    /// when handed out again.
    pub(crate) fn manual_clear(&self, key: &Key) {
        let mut pool = self.pool.lock();
        if let Some((_, slot)) = self.index.remove(key) {
            if slot < pool.slots.len() {
                pool.free.insert(slot);
            }
        }
    }

    pub(crate) fn manual_clear_all(&self) {
        let keys: Vec<Key> = self.index.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.manual_clear(&key);
        }
    }

    /// Re-insert an admission with its original deadline. Used only when
    /// restoring a snapshot; the deadline is stored as-is.
    pub(crate) fn add_from_backup(&self, key: &Key, deadline: i64) -> Result<(), RingFull> {
        let mut pool = self.pool.lock();
        if let Some(slot) = self.index.get(key).map(|e| *e.value()) {
            return pool.slots[slot].push(deadline);
        }
        let slot = pool.acquire(key, self.limit);
        self.index.insert(key.clone(), slot);
        pool.slots[slot].push(deadline)
    }

    /// One sweep-and-compact cycle. Skipped when the previous cycle is still
    /// running.
    pub(crate) fn sweep_cycle(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.delete_expired_once();
        self.gc();
        self.sweeping.store(false, Ordering::Release);
    }

    /// Evict expired admissions and reclaim slots whose visitors went idle.
    ///
    /// The mutex is taken once per visitor so admission traffic interleaves
    /// with a long sweep. The mapping is re-read under the lock; a concurrent
    /// compaction may have moved the slot since the iteration snapshot.
    pub(crate) fn delete_expired_once(&self) {
        let entries: Vec<Key> = self.index.iter().map(|e| e.key().clone()).collect();
        for key in entries {
            let now = clock::now_ns();
            let mut pool = self.pool.lock();
            let Some(slot) = self.index.get(&key).map(|e| *e.value()) else {
                continue;
            };
            if slot >= pool.slots.len() {
                self.index.remove(&key);
                continue;
            }
            let ring = &mut pool.slots[slot];
            ring.expire(now);
            if ring.used() == 0 {
                self.index.remove(&key);
                pool.free.insert(slot);
            }
        }
    }

    /// Shrink the pool after a traffic spike: when it has grown past twice
    /// the visitor estimate and live slots are outnumbered two-to-one by free
    /// ones, rebuild at `max(expected, 2 · live)` with live rings packed into
    /// a dense prefix.
    pub(crate) fn gc(&self) {
        let mut pool = self.pool.lock();
        let total = pool.slots.len();
        let used = total - pool.free.len();
        if total < 2 * self.expected_visitors {
            return;
        }
        if used * 2 >= pool.free.len() {
            return;
        }

        let new_len = if used < self.expected_visitors {
            self.expected_visitors
        } else {
            used * 2
        };

        let live: Vec<(Key, usize)> = self
            .index
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut slots = Vec::with_capacity(new_len);
        for (key, old_slot) in &live {
            let ring = std::mem::replace(&mut pool.slots[*old_slot], DeadlineRing::new(0, None));
            slots.push(ring);
            self.index.insert(key.clone(), slots.len() - 1);
        }
        let mut free = HashSet::with_capacity(new_len - slots.len());
        for i in slots.len()..new_len {
            slots.push(DeadlineRing::new(self.limit, None));
            free.insert(i);
        }
        pool.slots = slots;
        pool.free = free;

        tracing::debug!(from = total, to = new_len, live = live.len(), "compacted slot pool");
    }

    /// Number of visitors with live admissions, after driving one sweep.
    pub(crate) fn current_online_count(&self) -> usize {
        self.delete_expired_once();
        self.index.len()
    }

    /// Keys currently indexed, in no particular order.
    pub(crate) fn online_keys(&self) -> Vec<Key> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }

    /// Per-visitor deadline runs for the snapshot writer.
    ///
    /// Each visitor is read under one mutex acquisition: the mapping is
    /// re-validated (slot in range, ring owner matches) and the ring is
    /// drained through its copy cursors so live entries stay put.
    pub(crate) fn snapshot_records(&self) -> Vec<(Key, Vec<i64>)> {
        let entries: Vec<Key> = self.index.iter().map(|e| e.key().clone()).collect();
        let mut records = Vec::with_capacity(entries.len());
        for key in entries {
            let mut pool = self.pool.lock();
            let Some(slot) = self.index.get(&key).map(|e| *e.value()) else {
                continue;
            };
            let Some(ring) = pool.slots.get_mut(slot) else {
                continue;
            };
            if ring.owner() != Some(&key) {
                continue;
            }
            ring.snapshot_begin();
            let mut deadlines = Vec::with_capacity(ring.snapshot_len());
            while let Some(d) = ring.snapshot_next() {
                deadlines.push(d);
            }
            records.push((key, deadlines));
        }
        records
    }

    #[cfg(test)]
    fn pool_len(&self) -> usize {
        self.pool.lock().slots.len()
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.pool.lock().free.len()
    }

    #[cfg(test)]
    fn indexed_len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn assert_accounting(rule: &Rule) {
        assert_eq!(rule.free_len() + rule.indexed_len(), rule.pool_len());
    }

    #[test]
    fn zero_limit_clamps_to_one() {
        let rule = Rule::new(Duration::from_secs(10), 0, 0);
        assert_eq!(rule.limit, 1);
        assert_eq!(rule.expected_visitors, 1);
        assert!(rule.allow_visit(&Key::from("a")));
        assert!(!rule.allow_visit(&Key::from("a")));
    }

    #[test]
    fn zero_estimate_falls_back_to_limit() {
        let rule = Rule::new(Duration::from_secs(10), 7, 0);
        assert_eq!(rule.expected_visitors, 7);
        assert_eq!(rule.pool_len(), 7);
        assert_eq!(rule.free_len(), 7);
    }

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(
            Rule::new(Duration::from_secs(10), 1, 0).cleanup_interval,
            Duration::from_secs(1)
        );
        assert_eq!(
            Rule::new(Duration::from_secs(3600), 1, 0).cleanup_interval,
            Duration::from_secs(36)
        );
        assert_eq!(
            Rule::new(Duration::from_secs(9000), 1, 0).cleanup_interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn limit_is_enforced_within_the_window() {
        let rule = Rule::new(Duration::from_secs(10), 2, 0);
        let key = Key::from("a");
        assert!(rule.allow_visit(&key));
        assert!(rule.allow_visit(&key));
        assert!(!rule.allow_visit(&key));
        assert_eq!(rule.remaining(&key), 0);
        assert_accounting(&rule);
    }

    #[test]
    fn admissions_recover_after_the_window_passes() {
        let rule = Rule::new(Duration::from_millis(50), 2, 0);
        let key = Key::from("a");
        assert!(rule.allow_visit(&key));
        assert!(rule.allow_visit(&key));
        assert!(!rule.allow_visit(&key));
        sleep(Duration::from_millis(60));
        assert!(rule.allow_visit(&key));
        assert_eq!(rule.remaining(&key), 1);
    }

    #[test]
    fn remaining_for_unknown_visitor_is_the_limit() {
        let rule = Rule::new(Duration::from_secs(10), 5, 0);
        assert_eq!(rule.remaining(&Key::from("nobody")), 5);
    }

    #[test]
    fn sweep_reclaims_idle_slots() {
        let rule = Rule::new(Duration::from_millis(50), 2, 4);
        for name in ["a", "b", "c"] {
            assert!(rule.allow_visit(&Key::from(name)));
        }
        assert_eq!(rule.indexed_len(), 3);
        sleep(Duration::from_millis(60));
        rule.delete_expired_once();
        assert_eq!(rule.indexed_len(), 0);
        assert_eq!(rule.free_len(), 4);
        assert_accounting(&rule);
    }

    #[test]
    fn sweep_keeps_live_visitors() {
        let rule = Rule::new(Duration::from_secs(10), 2, 4);
        rule.allow_visit(&Key::from("live"));
        rule.delete_expired_once();
        assert_eq!(rule.indexed_len(), 1);
        assert_eq!(rule.remaining(&Key::from("live")), 1);
    }

    #[test]
    fn pool_grows_past_the_estimate_and_reuses_freed_slots() {
        let rule = Rule::new(Duration::from_millis(50), 1, 2);
        for i in 0..5i64 {
            assert!(rule.allow_visit(&Key::from(i)));
        }
        assert_eq!(rule.pool_len(), 5);
        assert_accounting(&rule);

        sleep(Duration::from_millis(60));
        rule.delete_expired_once();
        assert_eq!(rule.free_len(), 5);

        // freed slots are reused before the pool grows again
        assert!(rule.allow_visit(&Key::from("fresh")));
        assert_eq!(rule.pool_len(), 5);
        assert_accounting(&rule);
    }

    #[test]
    fn compaction_shrinks_back_to_the_estimate() {
        let rule = Rule::new(Duration::from_millis(50), 5, 10);
        for i in 0..1000i64 {
            assert!(rule.allow_visit(&Key::from(i)));
        }
        assert_eq!(rule.pool_len(), 1000);
        sleep(Duration::from_millis(60));
        rule.sweep_cycle();
        assert_eq!(rule.pool_len(), 10);
        assert_eq!(rule.free_len(), 10);
        assert_accounting(&rule);
    }

    #[test]
    fn compaction_packs_live_visitors_densely() {
        let rule = Rule::new(Duration::from_millis(80), 2, 2);
        for i in 0..40i64 {
            assert!(rule.allow_visit(&Key::from(i)));
        }
        sleep(Duration::from_millis(90));
        // keep two visitors live past the others' expiry
        rule.allow_visit(&Key::from("x"));
        rule.allow_visit(&Key::from("y"));
        rule.delete_expired_once();
        rule.gc();

        // 2 live, pool rebuilt at max(expected, 2 * live) = 4
        assert_eq!(rule.indexed_len(), 2);
        assert_eq!(rule.pool_len(), 4);
        assert_accounting(&rule);
        assert_eq!(rule.remaining(&Key::from("x")), 1);
        assert_eq!(rule.remaining(&Key::from("y")), 1);
    }

    #[test]
    fn compaction_leaves_small_pools_alone() {
        let rule = Rule::new(Duration::from_millis(50), 1, 100);
        rule.allow_visit(&Key::from("a"));
        sleep(Duration::from_millis(60));
        rule.sweep_cycle();
        // pool never exceeded 2 * expected, so no rebuild
        assert_eq!(rule.pool_len(), 100);
    }

    #[test]
    fn manual_clear_releases_the_slot_and_resets_on_reuse() {
        let rule = Rule::new(Duration::from_secs(10), 2, 1);
        let key = Key::from("a");
        assert!(rule.allow_visit(&key));
        assert!(rule.allow_visit(&key));
        assert!(!rule.allow_visit(&key));

        rule.manual_clear(&key);
        assert_eq!(rule.indexed_len(), 0);
        assert_accounting(&rule);

        // the slot is handed out again behaviorally empty
        assert!(rule.allow_visit(&key));
        assert_eq!(rule.remaining(&key), 1);
    }

    #[test]
    fn backup_restore_keeps_raw_deadlines() {
        let rule = Rule::new(Duration::from_secs(10), 3, 0);
        let key = Key::from("a");
        let now = clock::now_ns();

        rule.add_from_backup(&key, now + 1_000_000_000).unwrap();
        rule.add_from_backup(&key, now + 2_000_000_000).unwrap();
        assert_eq!(rule.remaining(&key), 1);

        // a deadline already in the past is dropped by the next expiry pass
        let other = Key::from("b");
        rule.add_from_backup(&other, now - 1).unwrap();
        assert_eq!(rule.remaining(&other), 3);
    }

    #[test]
    fn backup_restore_fails_once_the_ring_is_full() {
        let rule = Rule::new(Duration::from_secs(10), 2, 0);
        let key = Key::from("a");
        let now = clock::now_ns();
        rule.add_from_backup(&key, now + 1).unwrap();
        rule.add_from_backup(&key, now + 2).unwrap();
        assert!(rule.add_from_backup(&key, now + 3).is_err());
    }

    #[test]
    fn snapshot_records_match_live_state() {
        let rule = Rule::new(Duration::from_secs(10), 3, 0);
        rule.allow_visit(&Key::from("a"));
        rule.allow_visit(&Key::from("a"));
        rule.allow_visit(&Key::from("b"));

        let mut records = rule.snapshot_records();
        records.sort_by_key(|(k, _)| k.to_string());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, Key::from("a"));
        assert_eq!(records[0].1.len(), 2);
        assert!(records[0].1.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(records[1].0, Key::from("b"));
        assert_eq!(records[1].1.len(), 1);

        // reading for the snapshot consumed nothing
        assert_eq!(rule.remaining(&Key::from("a")), 1);
    }
}
