//! The in-memory hash table over the on-disk store.
//!
//! [`CacheTable`] is only ever accessed with the cache's structural lock
//! held. It owns every [`CacheEntry`], the running size of the store and the
//! body/metadata files on disk.

use super::entry::{CacheEntry, PinnedEntry, meta_path_for};
use super::hash::{TABLE_SIZE, bucket_hash};
use super::index::{IndexRecord, read_index, write_index};
use crate::Error;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const INDEX_FILE: &str = ".index";

/// Prefix of body file names.
pub const BODY_PREFIX: &str = "dods";

const DEFAULT_BLOCK_SIZE: u64 = 4096;

#[derive(Debug)]
pub struct CacheTable {
    root: PathBuf,
    buckets: Vec<Vec<Arc<CacheEntry>>>,
    current_size: u64,
    new_entries: u32,
    block_size: u64,
}

#[cfg(unix)]
fn block_size_of(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).map(|m| m.blksize()).ok().filter(|b| *b > 0).unwrap_or(DEFAULT_BLOCK_SIZE)
}

#[cfg(not(unix))]
fn block_size_of(_path: &Path) -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to delete cache file");
    }
}

impl CacheTable {
    /// An empty table for the cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let block_size = block_size_of(&root);
        Self { root, buckets: vec![Vec::new(); TABLE_SIZE], current_size: 0, new_entries: 0, block_size }
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Bytes of disk the entries occupy, each body rounded up to whole blocks.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Entries inserted since the index was last written.
    pub fn new_entries(&self) -> u32 {
        self.new_entries
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// On-disk footprint of a body of `size` bytes.
    pub fn disk_space(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size) * self.block_size
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.buckets.iter().flatten()
    }

    /// Add an entry. The caller has already removed any entry for the same
    /// URL.
    pub fn insert(&mut self, entry: Arc<CacheEntry>) {
        self.current_size += self.disk_space(entry.size());
        self.new_entries += 1;
        self.buckets[entry.hash()].push(entry);
    }

    pub fn find(&self, url: &str) -> Option<&Arc<CacheEntry>> {
        self.find_by_hash(bucket_hash(url), url)
    }

    /// Look up `url` in bucket `hash` only.
    pub fn find_by_hash(&self, hash: usize, url: &str) -> Option<&Arc<CacheEntry>> {
        self.buckets.get(hash)?.iter().find(|e| e.url() == url)
    }

    /// Pin the entry for `url` so it survives until the pin is dropped.
    ///
    /// An entry whose body file has disappeared (deleted by another process
    /// sharing the directory) is evicted and treated as absent.
    pub(crate) fn pin(&mut self, url: &str) -> Option<PinnedEntry> {
        let entry = self.find(url)?.clone();
        if !entry.cachename().exists() {
            if !entry.is_in_use() {
                tracing::debug!("Evicting {} whose body file is gone", url);
                self.detach(&entry);
            }
            return None;
        }
        Some(PinnedEntry::new(entry))
    }

    /// Remove the entry for `url`, deleting its files.
    ///
    /// Returns `false` if there was no entry and [`Error::EntryInUse`] if the
    /// entry is checked out.
    pub fn remove(&mut self, url: &str) -> Result<bool, Error> {
        let Some(entry) = self.find(url).cloned() else {
            return Ok(false);
        };
        if entry.is_in_use() {
            return Err(Error::EntryInUse(url.to_string()));
        }
        self.detach(&entry);
        self.delete_files(&entry);
        Ok(true)
    }

    /// Take an entry out of its bucket and the size accounting.
    fn detach(&mut self, entry: &Arc<CacheEntry>) {
        let bucket = &mut self.buckets[entry.hash()];
        let before = bucket.len();
        bucket.retain(|e| !Arc::ptr_eq(e, entry));
        if bucket.len() < before {
            self.current_size = self.current_size.saturating_sub(self.disk_space(entry.size()));
        }
    }

    fn delete_files(&self, entry: &CacheEntry) {
        remove_if_present(entry.cachename());
        remove_if_present(&entry.meta_path());
    }

    /// Remove every unlocked entry matching `doomed`, returning how many
    /// were removed.
    pub(crate) fn sweep(&mut self, doomed: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            bucket.retain(|entry| {
                if !entry.is_in_use() && doomed(entry.as_ref()) {
                    removed.push(entry.clone());
                    false
                } else {
                    true
                }
            });
        }
        for entry in &removed {
            self.current_size = self.current_size.saturating_sub(self.disk_space(entry.size()));
            tracing::debug!("Deleting cache entry {}", entry.url());
            self.delete_files(entry);
        }
        removed.len()
    }

    /// Number of entries currently pinned.
    pub fn checked_out(&self) -> usize {
        self.entries().filter(|e| e.is_in_use()).count()
    }

    /// Delete every entry and the index file.
    ///
    /// Fails without touching anything if any entry is checked out.
    pub fn delete_all(&mut self) -> Result<(), Error> {
        let busy = self.checked_out();
        if busy > 0 {
            return Err(Error::Busy(busy));
        }
        for entry in self.buckets.iter().flatten() {
            self.delete_files(entry);
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.current_size = 0;
        self.new_entries = 0;

        let index = self.index_path();
        match fs::remove_file(&index) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("deleting index {}", index.display()), e)),
        }
    }

    /// Allocate a uniquely named body file in the directory for `hash`.
    pub fn create_location(&self, hash: usize) -> Result<(File, PathBuf), Error> {
        let dir = self.root.join(hash.to_string());
        fs::create_dir_all(&dir).map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;

        let tmp = tempfile::Builder::new()
            .prefix(BODY_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| Error::io(format!("creating body file in {}", dir.display()), e))?;
        tmp.keep().map_err(|e| Error::io(format!("keeping body file in {}", dir.display()), e.error))
    }

    /// Add the records of `records` whose hash is consistent and whose body
    /// file still exists. A record for a URL already in the table replaces
    /// the local entry only if that entry is unpinned and its body file is
    /// gone (another process replaced it). Returns the number added.
    fn merge_records(&mut self, records: Vec<IndexRecord>) -> usize {
        let mut added = 0;
        for record in records {
            if record.hash != bucket_hash(&record.url) {
                tracing::warn!(url = %record.url, hash = record.hash, "Skipping index entry with a bad hash");
                continue;
            }
            if !Path::new(&record.cachename).exists() {
                continue;
            }
            if let Some(local) = self.find_by_hash(record.hash, &record.url).cloned() {
                if local.is_in_use() || local.cachename().exists() {
                    continue;
                }
                tracing::debug!("Replacing {} with the entry from the shared index", local.url());
                self.detach(&local);
            }
            let entry = Arc::new(CacheEntry::from_record(record));
            self.current_size += self.disk_space(entry.size());
            self.buckets[entry.hash()].push(entry);
            added += 1;
        }
        added
    }

    fn read_records(&self) -> Result<Vec<IndexRecord>, Error> {
        let (records, errors) = read_index(&self.index_path())?;
        for error in errors {
            tracing::warn!(error = %error, "Skipping malformed index line");
        }
        Ok(records)
    }

    /// Read the index file into the table.
    pub fn load_index(&mut self) -> Result<usize, Error> {
        let records = self.read_records()?;
        let added = self.merge_records(records);
        self.new_entries = 0;
        tracing::debug!("Loaded {} entries from {}", added, self.index_path().display());
        Ok(added)
    }

    /// Pick up entries another process wrote to the shared index. Entries
    /// already known locally are left alone.
    pub fn reload_index(&mut self) -> Result<usize, Error> {
        let records = self.read_records()?;
        Ok(self.merge_records(records))
    }

    /// Rewrite the index file with every live entry, first dropping
    /// unpinned entries whose body another process deleted and merging in
    /// entries added by other processes since the index was last read.
    pub fn write_index(&mut self) -> Result<(), Error> {
        let dangling = self.sweep(|entry| !entry.cachename().exists());
        if dangling > 0 {
            tracing::debug!("Dropped {} entries whose body files are gone", dangling);
        }
        let merged = self.reload_index()?;
        if merged > 0 {
            tracing::debug!("Merged {} entries from the shared index", merged);
        }

        let records: Vec<IndexRecord> = self.entries().map(|e| e.to_record()).collect();
        write_index(&self.index_path(), &records)?;
        self.new_entries = 0;
        Ok(())
    }

    /// Body and metadata files under the hash directories that no entry
    /// references.
    pub fn orphans(&self) -> Result<Vec<PathBuf>, Error> {
        let mut orphans = Vec::new();
        let read_dir = |dir: &Path| fs::read_dir(dir).map_err(|e| Error::io(format!("listing {}", dir.display()), e));

        for dir_entry in read_dir(&self.root)? {
            let dir_entry = dir_entry.map_err(|e| Error::io(format!("listing {}", self.root.display()), e))?;
            let Some(hash) = dir_entry.file_name().to_str().and_then(|n| n.parse::<usize>().ok()) else {
                continue;
            };
            if hash >= TABLE_SIZE || !dir_entry.path().is_dir() {
                continue;
            }

            for file in read_dir(&dir_entry.path())? {
                let path = file.map_err(|e| Error::io(format!("listing {}", dir_entry.path().display()), e))?.path();
                let referenced = self.buckets[hash]
                    .iter()
                    .any(|e| e.cachename() == path || meta_path_for(e.cachename()) == path);
                if !referenced {
                    orphans.push(path);
                }
            }
        }
        Ok(orphans)
    }
}
