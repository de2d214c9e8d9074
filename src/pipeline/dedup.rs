// =============================================================================
// Trade-ID dedup cache
// =============================================================================
//
// Bounded set of recently admitted trade IDs. Once it grows past `max_ids`
// it is cut down to `max_ids / 2` in one step.
//
// Two eviction policies:
//   - Insertion: forget the oldest-inserted IDs. Correct for any ID scheme.
//   - Sorted:    keep the largest half in sorted order (numeric when every ID
//                is an integer, lexical otherwise). Only approximates
//                "keep most recent" when IDs grow monotonically.
// =============================================================================

use std::collections::{HashSet, VecDeque};

use crate::runtime_config::DedupEviction;
use crate::types::RawTrade;

pub struct TradeIdCache {
    ids: HashSet<String>,
    /// Insertion order of `ids`.
    order: VecDeque<String>,
    max_ids: usize,
    eviction: DedupEviction,
}

impl TradeIdCache {
    pub fn new(max_ids: usize, eviction: DedupEviction) -> Self {
        Self {
            ids: HashSet::with_capacity(max_ids + 1),
            order: VecDeque::with_capacity(max_ids + 1),
            max_ids,
            eviction,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`; returns `true` if it had not been seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.ids.len() > self.max_ids {
            self.truncate();
        }
        true
    }

    /// Split `batch` into newly seen trades, returning them with the number
    /// of duplicates dropped.
    pub fn admit(&mut self, batch: Vec<RawTrade>) -> (Vec<RawTrade>, usize) {
        let total = batch.len();
        let fresh: Vec<RawTrade> = batch.into_iter().filter(|t| self.insert(&t.id)).collect();
        let dupes = total - fresh.len();
        (fresh, dupes)
    }

    fn truncate(&mut self) {
        let keep = self.max_ids / 2;
        match self.eviction {
            DedupEviction::Insertion => {
                while self.order.len() > keep {
                    if let Some(old) = self.order.pop_front() {
                        self.ids.remove(&old);
                    }
                }
            }
            DedupEviction::Sorted => {
                let mut all: Vec<String> = self.order.drain(..).collect();
                sort_ids(&mut all);
                let kept = all.split_off(all.len().saturating_sub(keep));
                self.ids = kept.iter().cloned().collect();
                self.order = kept.into();
            }
        }
    }
}

/// Numeric order when every ID parses as an integer, lexical otherwise.
fn sort_ids(ids: &mut [String]) {
    if ids.iter().all(|id| id.parse::<u128>().is_ok()) {
        ids.sort_by_key(|id| id.parse::<u128>().unwrap_or_default());
    } else {
        ids.sort();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::trade;

    #[test]
    fn same_id_admitted_once_across_batches() {
        let mut cache = TradeIdCache::new(5000, DedupEviction::Insertion);
        let (first, d1) = cache.admit(vec![
            trade("ETH/USDT", "1", 0, 1.0, 1.0),
            trade("ETH/USDT", "2", 0, 1.0, 1.0),
        ]);
        let (second, d2) = cache.admit(vec![
            trade("ETH/USDT", "2", 0, 1.0, 1.0),
            trade("ETH/USDT", "3", 0, 1.0, 1.0),
        ]);
        assert_eq!(first.len(), 2);
        assert_eq!(d1, 0);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "3");
        assert_eq!(d2, 1);
    }

    #[test]
    fn duplicate_within_one_batch() {
        let mut cache = TradeIdCache::new(10, DedupEviction::Insertion);
        let (fresh, dupes) = cache.admit(vec![
            trade("ETH/USDT", "9", 0, 1.0, 1.0),
            trade("ETH/USDT", "9", 0, 1.0, 1.0),
        ]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(dupes, 1);
    }

    #[test]
    fn insertion_eviction_bounds_size_and_keeps_newest() {
        let mut cache = TradeIdCache::new(5000, DedupEviction::Insertion);
        for i in 0..=5000 {
            cache.insert(&format!("id-{i}"));
        }
        assert!(cache.len() <= 2500);
        assert!(cache.contains("id-5000"));
        assert!(!cache.contains("id-0"));
    }

    #[test]
    fn sorted_eviction_keeps_largest_numeric_ids() {
        let mut cache = TradeIdCache::new(5000, DedupEviction::Sorted);
        // Insert in reverse so insertion order and numeric order disagree.
        for i in (0..=5000).rev() {
            cache.insert(&i.to_string());
        }
        assert!(cache.len() <= 2500);
        assert!(cache.contains("5000"));
        assert!(cache.contains("2501"));
        assert!(!cache.contains("9"));
    }

    #[test]
    fn sorted_eviction_uses_numeric_not_lexical_order() {
        let mut ids: Vec<String> = ["10", "9", "100"].iter().map(|s| s.to_string()).collect();
        sort_ids(&mut ids);
        assert_eq!(ids, vec!["9", "10", "100"]);

        let mut mixed: Vec<String> = ["b", "a", "10"].iter().map(|s| s.to_string()).collect();
        sort_ids(&mut mixed);
        assert_eq!(mixed, vec!["10", "a", "b"]);
    }

    #[test]
    fn cache_keeps_working_after_many_truncations() {
        let mut cache = TradeIdCache::new(100, DedupEviction::Insertion);
        for i in 0..1000 {
            assert!(cache.insert(&i.to_string()));
            assert!(cache.len() <= 100);
        }
        assert!(!cache.insert("999"));
    }
}
