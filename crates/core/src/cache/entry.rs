//! Cache entries and the per-entry locking protocol.
//!
//! An entry's identity (URL, hash, body file, size) is fixed when it is
//! created. Its validators and timing fields live behind an entry-local
//! reader/writer lock so a `304` revalidation can overwrite them in place.
//!
//! Every holder of an entry lock first *pins* the entry, which increments the
//! entry's in-use counter. Pins are only created by the table while the
//! structural lock is held, and the table never deletes an entry whose
//! counter is non-zero.

use super::index::IndexRecord;
use super::hash::bucket_hash;
use parking_lot::RawRwLock;
use parking_lot::RwLock;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Suffix appended to a body file name to get its metadata file.
pub const META_SUFFIX: &str = ".meta";

/// Validators and timing fields of a cached response.
///
/// All times are seconds since the Unix epoch; `None` means the header was
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFields {
    pub etag: Option<String>,
    /// Last-Modified.
    pub lm: Option<i64>,
    pub expires: Option<i64>,
    pub date: Option<i64>,
    /// Age header, in seconds.
    pub age: Option<i64>,
    /// Cache-Control max-age, in seconds.
    pub max_age: Option<i64>,

    pub freshness_lifetime: i64,
    pub response_time: i64,
    pub corrected_initial_age: i64,

    pub must_revalidate: bool,
    /// Computed from the response headers at store time; never persisted.
    pub no_cache: bool,
}

/// One cached (URL -> response) mapping.
#[derive(Debug)]
pub struct CacheEntry {
    url: String,
    hash: usize,
    cachename: PathBuf,
    size: u64,
    range: bool,
    hits: AtomicU64,
    readers: AtomicUsize,
    fields: Arc<RwLock<EntryFields>>,
}

impl CacheEntry {
    /// Create an entry for a body already written to `cachename`.
    pub fn new(url: impl Into<String>, cachename: PathBuf, size: u64, fields: EntryFields) -> Self {
        let url = url.into();
        let hash = bucket_hash(&url);
        Self {
            url,
            hash,
            cachename,
            size,
            range: false,
            hits: AtomicU64::new(0),
            readers: AtomicUsize::new(0),
            fields: Arc::new(RwLock::new(fields)),
        }
    }

    /// Rebuild an entry from its persisted index record.
    pub fn from_record(record: IndexRecord) -> Self {
        let fields = EntryFields {
            etag: record.etag,
            lm: record.lm,
            expires: record.expires,
            freshness_lifetime: record.freshness_lifetime,
            response_time: record.response_time,
            corrected_initial_age: record.corrected_initial_age,
            must_revalidate: record.must_revalidate,
            ..Default::default()
        };
        Self {
            url: record.url,
            hash: record.hash,
            cachename: PathBuf::from(record.cachename),
            size: record.size,
            range: record.range,
            hits: AtomicU64::new(record.hits),
            readers: AtomicUsize::new(0),
            fields: Arc::new(RwLock::new(fields)),
        }
    }

    /// Snapshot the persisted fields of this entry.
    ///
    /// Only waits if a writer currently holds the entry lock; queued writers
    /// do not block it.
    pub fn to_record(&self) -> IndexRecord {
        let fields = self.fields.read_recursive();
        IndexRecord {
            url: self.url.clone(),
            cachename: self.cachename.to_string_lossy().into_owned(),
            etag: fields.etag.clone(),
            lm: fields.lm,
            expires: fields.expires,
            size: self.size,
            range: self.range,
            hash: self.hash,
            hits: self.hits(),
            freshness_lifetime: fields.freshness_lifetime,
            response_time: fields.response_time,
            corrected_initial_age: fields.corrected_initial_age,
            must_revalidate: fields.must_revalidate,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hash(&self) -> usize {
        self.hash
    }

    /// Path of the body file.
    pub fn cachename(&self) -> &Path {
        &self.cachename
    }

    /// Path of the metadata (headers) file.
    pub fn meta_path(&self) -> PathBuf {
        meta_path_for(&self.cachename)
    }

    /// Size of the body in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Acquire)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of pins (checkouts, lookups in progress) on this entry.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn is_in_use(&self) -> bool {
        self.readers() > 0
    }

    /// Copy of the current validators and timing fields.
    pub fn fields(&self) -> EntryFields {
        self.fields.read_recursive().clone()
    }
}

pub(crate) fn meta_path_for(cachename: &Path) -> PathBuf {
    let mut name = cachename.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// An entry that cannot be deleted while this value is alive.
#[derive(Debug)]
pub(crate) struct PinnedEntry {
    entry: Arc<CacheEntry>,
}

impl PinnedEntry {
    /// Must only be called while the table's structural lock is held.
    pub(crate) fn new(entry: Arc<CacheEntry>) -> Self {
        entry.readers.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    pub(crate) fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Block until the entry can be read.
    ///
    /// The read is recursive: it does not queue behind a waiting writer, so
    /// a thread already holding a read guard on this entry can take another.
    pub(crate) fn read(self) -> EntryReadGuard {
        let guard = self.entry.fields.read_arc_recursive();
        EntryReadGuard { guard, pin: self }
    }

    /// Block until the entry can be modified exclusively.
    pub(crate) fn write(self) -> EntryWriteGuard {
        let guard = self.entry.fields.write_arc();
        EntryWriteGuard { guard, pin: self }
    }
}

impl Drop for PinnedEntry {
    fn drop(&mut self) {
        self.entry.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared access to an entry's fields. Dropping it releases the lock and
/// then the pin.
#[derive(Debug)]
pub struct EntryReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, EntryFields>,
    pin: PinnedEntry,
}

impl EntryReadGuard {
    pub fn entry(&self) -> &CacheEntry {
        self.pin.entry()
    }
}

impl Deref for EntryReadGuard {
    type Target = EntryFields;

    fn deref(&self) -> &EntryFields {
        &self.guard
    }
}

/// Exclusive access to an entry's fields.
#[derive(Debug)]
pub struct EntryWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, EntryFields>,
    pin: PinnedEntry,
}

impl EntryWriteGuard {
    pub fn entry(&self) -> &CacheEntry {
        self.pin.entry()
    }
}

impl Deref for EntryWriteGuard {
    type Target = EntryFields;

    fn deref(&self) -> &EntryFields {
        &self.guard
    }
}

impl DerefMut for EntryWriteGuard {
    fn deref_mut(&mut self) -> &mut EntryFields {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(url: &str) -> Arc<CacheEntry> {
        let fields = EntryFields { etag: Some("\"abc\"".into()), lm: Some(1_000), ..Default::default() };
        Arc::new(CacheEntry::new(url, PathBuf::from("/tmp/dods-cache/97/dodsAbCdEf"), 512, fields))
    }

    #[test]
    fn test_new_entry_defaults() {
        let entry = make_entry("a");
        assert_eq!(entry.hash(), 97);
        assert_eq!(entry.hits(), 0);
        assert_eq!(entry.readers(), 0);
        assert!(!entry.is_in_use());
        assert_eq!(entry.meta_path(), PathBuf::from("/tmp/dods-cache/97/dodsAbCdEf.meta"));
    }

    #[test]
    fn test_pin_counts_readers() {
        let entry = make_entry("http://example.com/a");
        let first = PinnedEntry::new(entry.clone()).read();
        let second = PinnedEntry::new(entry.clone()).read();
        assert_eq!(entry.readers(), 2);
        assert_eq!(first.etag.as_deref(), Some("\"abc\""));
        drop(first);
        assert_eq!(entry.readers(), 1);
        drop(second);
        assert!(!entry.is_in_use());
    }

    #[test]
    fn test_write_guard_updates_fields() {
        let entry = make_entry("http://example.com/a");
        {
            let mut guard = PinnedEntry::new(entry.clone()).write();
            guard.must_revalidate = true;
            guard.etag = None;
            assert_eq!(guard.entry().readers(), 1);
        }
        let fields = entry.fields();
        assert!(fields.must_revalidate);
        assert!(fields.etag.is_none());
        assert_eq!(entry.readers(), 0);
    }

    #[test]
    fn test_record_round_trip() {
        let entry = make_entry("http://example.com/a");
        entry.record_hit();
        entry.record_hit();
        let record = entry.to_record();
        assert_eq!(record.hits, 2);
        assert_eq!(record.size, 512);

        let restored = CacheEntry::from_record(record.clone());
        assert_eq!(restored.to_record(), record);
    }
}
