//! Garbage collection of the cache table.
//!
//! Collection runs in three passes: expired entries, entries larger than the
//! per-entry limit, then entries by ascending hit count until the store is
//! back under its low watermark. Checked-out entries are never touched.

use super::freshness::is_expired;
use super::table::CacheTable;

/// Size limits that drive collection, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcBudget {
    pub total_size: u64,
    /// Space reserved for directories and the index.
    pub folder_size: u64,
    /// Free space to leave behind once collection starts.
    pub gc_buffer: u64,
    pub max_entry_size: u64,
}

impl GcBudget {
    /// Whether a store of `current_size` bytes is over budget.
    pub fn needs_gc(&self, current_size: u64) -> bool {
        current_size.saturating_add(self.folder_size) > self.total_size
    }

    /// The size collection shrinks the store to.
    pub fn target(&self) -> u64 {
        self.total_size.saturating_sub(self.gc_buffer.saturating_add(self.folder_size))
    }
}

/// What one collection removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub expired: usize,
    pub oversized: usize,
    pub by_hits: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.expired + self.oversized + self.by_hits
    }
}

impl CacheTable {
    /// Remove every unlocked entry that is stale at `now`.
    pub fn delete_expired(&mut self, now: i64) -> usize {
        self.sweep(|entry| is_expired(&entry.fields(), now))
    }

    /// Remove every unlocked entry larger than `max_entry_size` bytes.
    pub fn delete_oversized(&mut self, max_entry_size: u64) -> usize {
        self.sweep(|entry| entry.size() > max_entry_size)
    }

    /// Remove unlocked entries with `hits <= threshold`, raising the
    /// threshold one sweep at a time until the store is at most `target`
    /// bytes or nothing removable is left.
    pub fn delete_by_hits(&mut self, target: u64) -> usize {
        let mut removed = 0;
        let mut threshold = 0;

        while self.current_size() > target {
            // Sweeps below the coldest unlocked entry would remove nothing.
            let Some(coldest) = self.entries().filter(|e| !e.is_in_use()).map(|e| e.hits()).min() else {
                break;
            };
            threshold = threshold.max(coldest);
            removed += self.sweep(|entry| entry.hits() <= threshold);
            threshold += 1;
        }
        removed
    }

    /// Run a full collection at `now`.
    ///
    /// The expiration pass always runs unless `expire_ignored` is set; the
    /// size passes only run while the store is over budget.
    pub fn collect(&mut self, budget: &GcBudget, now: i64, expire_ignored: bool) -> GcReport {
        let mut report = GcReport::default();

        if !expire_ignored {
            report.expired = self.delete_expired(now);
        }
        if budget.needs_gc(self.current_size()) {
            report.oversized = self.delete_oversized(budget.max_entry_size);
        }
        if budget.needs_gc(self.current_size()) {
            report.by_hits = self.delete_by_hits(budget.target());
        }

        tracing::debug!(
            expired = report.expired,
            oversized = report.oversized,
            by_hits = report.by_hits,
            current_size = self.current_size(),
            "Cache garbage collection finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheEntry, EntryFields, PinnedEntry};
    use crate::cache::hash::bucket_hash;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    fn add(table: &mut CacheTable, url: &str, size: usize, hits: u64, lifetime: i64) -> Arc<CacheEntry> {
        let (mut file, path) = table.create_location(bucket_hash(url)).unwrap();
        file.write_all(&vec![b'x'; size]).unwrap();
        let fields = EntryFields { freshness_lifetime: lifetime, response_time: NOW, ..Default::default() };
        let entry = Arc::new(CacheEntry::new(url, path, size as u64, fields));
        for _ in 0..hits {
            entry.record_hit();
        }
        table.insert(entry.clone());
        entry
    }

    #[test]
    fn test_expiration_pass() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let stale = add(&mut table, "http://x/stale", 10, 0, 10);
        add(&mut table, "http://x/fresh", 10, 0, 1000);

        assert_eq!(table.delete_expired(NOW + 100), 1);
        assert!(table.find("http://x/stale").is_none());
        assert!(table.find("http://x/fresh").is_some());
        assert!(!stale.cachename().exists());
    }

    #[test]
    fn test_expiration_skips_checked_out() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let stale = add(&mut table, "http://x/stale", 10, 0, 10);

        let pin = PinnedEntry::new(stale.clone());
        assert_eq!(table.delete_expired(NOW + 100), 0);
        assert!(stale.cachename().exists());
        drop(pin);
        assert_eq!(table.delete_expired(NOW + 100), 1);
    }

    #[test]
    fn test_oversized_pass() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        add(&mut table, "http://x/big", 5000, 9, 1000);
        add(&mut table, "http://x/small", 10, 0, 1000);

        assert_eq!(table.delete_oversized(1000), 1);
        assert!(table.find("http://x/small").is_some());
    }

    #[test]
    fn test_hits_pass_removes_coldest_first() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let block = table.disk_space(1);
        for (i, hits) in [0u64, 5, 1, 7, 3].iter().enumerate() {
            add(&mut table, &format!("http://x/{i}"), 10, *hits, 1000);
        }

        let removed = table.delete_by_hits(2 * block);
        assert_eq!(removed, 3);
        assert!(table.current_size() <= 2 * block);
        let mut left: Vec<u64> = table.entries().map(|e| e.hits()).collect();
        left.sort();
        assert_eq!(left, vec![5, 7]);
    }

    #[test]
    fn test_hits_pass_terminates_when_everything_locked() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let a = add(&mut table, "http://x/a", 10, 0, 1000);
        let b = add(&mut table, "http://x/b", 10, 3, 1000);
        let _pins = (PinnedEntry::new(a), PinnedEntry::new(b));

        assert_eq!(table.delete_by_hits(0), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_collect_converges_below_target() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let block = table.disk_space(1);
        for i in 0..20u64 {
            add(&mut table, &format!("http://x/{i}"), 10, i % 4, 1000);
        }
        add(&mut table, "http://x/stale", 10, 50, 1);

        let budget = GcBudget { total_size: 10 * block, folder_size: block, gc_buffer: block, max_entry_size: block };
        let report = table.collect(&budget, NOW + 10, false);
        assert_eq!(report.expired, 1);
        assert_eq!(report.oversized, 0);
        assert!(report.by_hits > 0);
        assert!(table.current_size() <= budget.target());
    }

    #[test]
    fn test_collect_respects_expire_ignored() {
        let dir = TempDir::new().unwrap();
        let mut table = CacheTable::new(dir.path());
        let block = table.disk_space(1);
        add(&mut table, "http://x/stale", 10, 0, 1);

        let budget = GcBudget { total_size: 100 * block, folder_size: block, gc_buffer: block, max_entry_size: block };
        let report = table.collect(&budget, NOW + 10, true);
        assert_eq!(report.total(), 0);
        assert_eq!(table.len(), 1);
    }
}
