//! The cache protocol: store, look up, validate, revalidate, release and
//! purge.
//!
//! Locking order is always the structural mutex, then the process lock
//! file. Entry locks are taken only after the structural mutex has been
//! released, so a reader blocked on an entry never stalls the table.

use super::checkout::CachedResponse;
use super::entry::{CacheEntry, EntryFields, PinnedEntry, meta_path_for};
use super::freshness::{RequestControl, compute_timing};
use super::gc::GcReport;
use super::hash::bucket_hash;
use super::headers::{apply_response_headers, filter_hop_by_hop, format_http_date, merge_headers};
use super::index::is_single_field;
use super::lock::ProcessLock;
use super::policy::{CachePolicy, DisconnectedMode};
use super::table::CacheTable;
use crate::Error;
use crate::config::CacheConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, SystemTime};
use url::Url;

/// Files younger than this are never treated as orphans; they may belong to
/// a store that has not inserted its entry yet.
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

static INSTANCES: LazyLock<Mutex<HashMap<PathBuf, Weak<Cache>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Current time in seconds since the Unix epoch.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Whether responses for `url` may be cached: HTTP(S) only, no whitespace
/// or control characters (the URL is an index field), and no credentials in
/// the URL unless `cache_protected`.
pub fn is_cacheable_url(url: &str, cache_protected: bool) -> bool {
    if !is_single_field(url) {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    cache_protected || (parsed.username().is_empty() && parsed.password().is_none())
}

fn read_metadata(path: &Path) -> Result<Vec<String>, Error> {
    let contents = fs::read_to_string(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    Ok(contents.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
}

fn write_metadata(path: &Path, headers: &[String]) -> Result<(), Error> {
    let context = || format!("writing {}", path.display());
    let mut writer = BufWriter::new(File::create(path).map_err(|e| Error::io(context(), e))?);
    for line in headers {
        writeln!(writer, "{line}").map_err(|e| Error::io(context(), e))?;
    }
    writer.flush().map_err(|e| Error::io(context(), e))
}

fn discard(body: &Path) {
    for path in [body.to_path_buf(), meta_path_for(body)] {
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete unused cache file");
        }
    }
}

/// A disk-persisted HTTP/1.1 response cache.
///
/// One `Cache` owns one directory. Several `Cache` values (in this or other
/// processes) may share a directory; they coordinate through the lock file
/// and the shared index.
#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    table: Mutex<CacheTable>,
    policy: RwLock<CachePolicy>,
    lock: ProcessLock,
}

impl Cache {
    /// Open (creating if needed) the cache directory named by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Init`] if the directory or its lock file cannot be set up.
    pub fn open(config: &CacheConfig) -> Result<Self, Error> {
        config.validate()?;

        let root = config.cache_root.clone();
        fs::create_dir_all(&root).map_err(|e| Error::Init(format!("cannot create {}: {e}", root.display())))?;
        let lock = ProcessLock::acquire(&root)?;

        let mut table = CacheTable::new(&root);
        {
            let _shared = lock.shared()?;
            table.load_index()?;
        }

        tracing::info!(root = %root.display(), entries = table.len(), "Opened HTTP cache");
        Ok(Self { root, table: Mutex::new(table), policy: RwLock::new(CachePolicy::from_config(config)), lock })
    }

    /// The process-wide cache for the directory named by `config`.
    ///
    /// The first call for a directory opens it; later calls return the
    /// same instance for as long as it is alive, regardless of the rest of
    /// `config`.
    pub fn instance(config: &CacheConfig) -> Result<Arc<Cache>, Error> {
        fs::create_dir_all(&config.cache_root)
            .map_err(|e| Error::Init(format!("cannot create {}: {e}", config.cache_root.display())))?;
        let root = fs::canonicalize(&config.cache_root)
            .map_err(|e| Error::Init(format!("cannot resolve {}: {e}", config.cache_root.display())))?;

        let mut instances = INSTANCES.lock();
        instances.retain(|_, cache| cache.strong_count() > 0);
        if let Some(cache) = instances.get(&root).and_then(Weak::upgrade) {
            return Ok(cache);
        }

        let config = CacheConfig { cache_root: root.clone(), ..config.clone() };
        let cache = Arc::new(Cache::open(&config)?);
        instances.insert(root, Arc::downgrade(&cache));
        Ok(cache)
    }

    pub fn cache_root(&self) -> &Path {
        &self.root
    }

    /// Whether this process created the cache's lock file.
    pub fn is_initializer(&self) -> bool {
        self.lock.is_initializer()
    }

    /// Bytes of disk used by cached bodies.
    pub fn current_size(&self) -> u64 {
        self.table.lock().current_size()
    }

    /// Number of entries in the in-memory table.
    pub fn entry_count(&self) -> usize {
        self.table.lock().len()
    }

    fn policy(&self) -> CachePolicy {
        self.policy.read().clone()
    }

    /// Pin the entry for `url`, reloading the shared index once if it is
    /// not known locally.
    fn lookup(&self, url: &str) -> Result<PinnedEntry, Error> {
        let mut table = self.table.lock();
        let _shared = self.lock.shared()?;

        if let Some(pinned) = table.pin(url) {
            return Ok(pinned);
        }
        if table.reload_index()? > 0
            && let Some(pinned) = table.pin(url)
        {
            tracing::debug!("Found {} after reloading the shared index", url);
            return Ok(pinned);
        }
        Err(Error::CacheMiss(url.to_string()))
    }

    /// Store a response received for a request made at `request_time`.
    ///
    /// Returns `false` without storing when the cache is disabled, the URL
    /// is not cacheable or the response forbids caching or is too large. A
    /// previous entry for `url` is always replaced or removed.
    ///
    /// # Errors
    ///
    /// [`Error::EntryInUse`] if the previous entry is checked out, and
    /// [`Error::Io`] if the body or metadata cannot be written.
    pub fn store<R: Read>(&self, url: &str, request_time: i64, headers: &[String], mut body: R) -> Result<bool, Error> {
        let policy = self.policy();
        if !policy.enabled || !is_cacheable_url(url, policy.cache_protected) {
            return Ok(false);
        }

        let mut fields = EntryFields::default();
        apply_response_headers(&mut fields, headers, policy.max_entry_size);
        compute_timing(&mut fields, request_time, now(), policy.default_expiration);

        if fields.no_cache {
            tracing::debug!("Not caching {}: response forbids it", url);
            self.remove(url)?;
            return Ok(false);
        }

        let (file, cachename) = {
            let table = self.table.lock();
            table.create_location(bucket_hash(url))?
        };

        let written = Self::write_response(file, &cachename, headers, &mut body);
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                discard(&cachename);
                return Err(e);
            }
        };
        if size > policy.max_entry_size {
            tracing::debug!("Not caching {}: {} bytes exceeds the entry limit", url, size);
            discard(&cachename);
            self.remove(url)?;
            return Ok(false);
        }

        let mut table = self.table.lock();
        let _exclusive = self.lock.exclusive()?;
        if let Err(e) = table.remove(url) {
            discard(&cachename);
            return Err(e);
        }
        table.insert(Arc::new(CacheEntry::new(url, cachename, size, fields)));
        tracing::debug!("Stored {} ({} bytes)", url, size);

        if table.new_entries() >= policy.dump_frequency {
            let budget = policy.budget();
            if budget.needs_gc(table.current_size()) {
                table.collect(&budget, now(), policy.expire_ignored);
            }
            table.write_index()?;
        }
        Ok(true)
    }

    fn write_response(file: File, cachename: &Path, headers: &[String], body: &mut impl Read) -> Result<u64, Error> {
        let context = || format!("writing {}", cachename.display());
        let mut writer = BufWriter::new(file);
        let size = io::copy(body, &mut writer).map_err(|e| Error::io(context(), e))?;
        writer.flush().map_err(|e| Error::io(context(), e))?;

        write_metadata(&meta_path_for(cachename), &filter_hop_by_hop(headers))?;
        Ok(size)
    }

    /// Remove the entry for `url`, if any.
    fn remove(&self, url: &str) -> Result<bool, Error> {
        let mut table = self.table.lock();
        let _exclusive = self.lock.exclusive()?;
        table.remove(url)
    }

    /// Check out the cached response for `url`: its headers and an open
    /// body. Counts as a hit.
    ///
    /// Lookups of the same URL from the thread holding the checkout do not
    /// block, even while [`Cache::update_response`] is waiting for it.
    ///
    /// # Errors
    ///
    /// [`Error::CacheMiss`] if `url` is not cached and [`Error::Io`] if its
    /// files cannot be read.
    pub fn get_cached_response(&self, url: &str) -> Result<CachedResponse, Error> {
        self.checkout(url, true)
    }

    /// Like [`Cache::get_cached_response`] without reading the stored
    /// headers; [`CachedResponse::headers`] is empty.
    pub fn get_cached_response_body(&self, url: &str) -> Result<CachedResponse, Error> {
        self.checkout(url, false)
    }

    fn checkout(&self, url: &str, with_headers: bool) -> Result<CachedResponse, Error> {
        let guard = self.lookup(url)?.read();
        let entry = guard.entry();

        let headers = if with_headers { read_metadata(&entry.meta_path())? } else { Vec::new() };
        let body = File::open(entry.cachename())
            .map_err(|e| Error::io(format!("opening {}", entry.cachename().display()), e))?;
        entry.record_hit();

        tracing::debug!("Cache hit for {} ({} hits)", url, entry.hits());
        Ok(CachedResponse::new(headers, body, guard))
    }

    /// Release a checked-out response.
    pub fn release_cached_response(&self, response: CachedResponse) {
        tracing::debug!("Releasing {}", response.url());
        drop(response);
    }

    /// Whether the cached response for `url` can be used without
    /// revalidation.
    pub fn is_valid(&self, url: &str) -> Result<bool, Error> {
        self.is_valid_at(url, now())
    }

    /// [`Cache::is_valid`] evaluated at `now`.
    pub fn is_valid_at(&self, url: &str, now: i64) -> Result<bool, Error> {
        let (always_validate, request) = {
            let policy = self.policy.read();
            (policy.always_validate, policy.request.clone())
        };
        if always_validate {
            return Ok(false);
        }

        let guard = self.lookup(url)?.read();
        if guard.must_revalidate {
            return Ok(false);
        }
        Ok(request.is_fresh(&guard, now))
    }

    /// Whether `url` has an entry in the cache.
    pub fn is_url_in_cache(&self, url: &str) -> Result<bool, Error> {
        match self.lookup(url) {
            Ok(_) => Ok(true),
            Err(Error::CacheMiss(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Headers for a conditional GET revalidating `url`:
    /// `If-None-Match` from the ETag, then `If-Modified-Since` from
    /// Last-Modified, else max-age, else Expires.
    pub fn get_conditional_request_headers(&self, url: &str) -> Result<Vec<String>, Error> {
        let guard = self.lookup(url)?.read();
        let mut headers = Vec::new();

        if let Some(etag) = &guard.etag {
            headers.push(format!("If-None-Match: {etag}"));
        }
        if let Some(since) = guard.lm.or(guard.max_age).or(guard.expires) {
            headers.push(format!("If-Modified-Since: {}", format_http_date(since)));
        }
        Ok(headers)
    }

    /// Merge the headers of a `304 Not Modified` into the entry for `url`
    /// and recompute its freshness.
    ///
    /// Waits for outstanding checkouts of `url` to be released, so it must
    /// not be called while holding one.
    pub fn update_response(&self, url: &str, request_time: i64, headers: &[String]) -> Result<(), Error> {
        let policy = self.policy();
        let mut guard = self.lookup(url)?.write();

        // The Date and Age of the superseded response do not apply.
        guard.date = None;
        guard.age = None;
        apply_response_headers(&mut guard, headers, policy.max_entry_size);
        compute_timing(&mut guard, request_time, now(), policy.default_expiration);

        let meta = guard.entry().meta_path();
        let stored = read_metadata(&meta)?;
        write_metadata(&meta, &merge_headers(&stored, headers))?;

        tracing::debug!("Revalidated {}", url);
        Ok(())
    }

    /// Delete every entry and the index.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if any response is checked out; nothing is deleted.
    pub fn purge_cache(&self) -> Result<(), Error> {
        let mut table = self.table.lock();
        let _exclusive = self.lock.exclusive()?;
        table.delete_all()?;
        tracing::info!(root = %self.root.display(), "Purged HTTP cache");
        Ok(())
    }

    /// Collect garbage now and rewrite the index.
    pub fn garbage_collect(&self) -> Result<GcReport, Error> {
        let policy = self.policy();
        let mut table = self.table.lock();
        let _exclusive = self.lock.exclusive()?;
        let report = table.collect(&policy.budget(), now(), policy.expire_ignored);
        table.write_index()?;
        Ok(report)
    }

    /// Collect garbage only if the store is over budget.
    fn collect_if_needed(&self) -> Result<(), Error> {
        let policy = self.policy();
        let budget = policy.budget();
        let mut table = self.table.lock();
        if !budget.needs_gc(table.current_size()) {
            return Ok(());
        }
        let _exclusive = self.lock.exclusive()?;
        table.collect(&budget, now(), policy.expire_ignored);
        table.write_index()
    }

    /// Delete files under the hash directories that no entry references.
    /// Returns how many files were deleted.
    pub fn remove_orphans(&self) -> Result<usize, Error> {
        let mut table = self.table.lock();
        let _exclusive = self.lock.exclusive()?;
        table.reload_index()?;

        let cutoff = SystemTime::now().checked_sub(ORPHAN_GRACE).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for path in table.orphans()? {
            let old_enough = fs::metadata(&path).and_then(|m| m.modified()).is_ok_and(|modified| modified < cutoff);
            if !old_enough {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete orphaned cache file"),
            }
        }
        tracing::info!(removed, "Removed orphaned cache files");
        Ok(removed)
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.policy.write().enabled = enabled;
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.policy.read().enabled
    }

    /// Set the total cache size in megabytes (at least 5). Shrinking the
    /// cache collects garbage right away if it no longer fits.
    pub fn set_max_size(&self, size_mb: u64) -> Result<(), Error> {
        let shrunk = {
            let mut policy = self.policy.write();
            let old = policy.total_size;
            policy.set_max_size_mb(size_mb);
            policy.total_size < old
        };
        if shrunk { self.collect_if_needed() } else { Ok(()) }
    }

    /// Total cache size in megabytes.
    pub fn get_max_size(&self) -> u64 {
        self.policy.read().total_size / crate::config::MEGABYTE
    }

    /// Set the largest cacheable response in megabytes. Returns `false`,
    /// changing nothing, if the size is zero or does not fit in the cache.
    pub fn set_max_entry_size(&self, size_mb: u64) -> Result<bool, Error> {
        let (accepted, shrunk) = {
            let mut policy = self.policy.write();
            let old = policy.max_entry_size;
            let accepted = policy.set_max_entry_size_mb(size_mb);
            (accepted, policy.max_entry_size < old)
        };
        if shrunk {
            self.collect_if_needed()?;
        }
        Ok(accepted)
    }

    /// Largest cacheable response in megabytes.
    pub fn get_max_entry_size(&self) -> u64 {
        self.policy.read().max_entry_size / crate::config::MEGABYTE
    }

    /// Freshness lifetime, in seconds, of responses without expiration
    /// information.
    pub fn set_default_expiration(&self, secs: i64) {
        self.policy.write().default_expiration = secs.max(0);
    }

    pub fn get_default_expiration(&self) -> i64 {
        self.policy.read().default_expiration
    }

    pub fn set_always_validate(&self, validate: bool) {
        self.policy.write().always_validate = validate;
    }

    pub fn get_always_validate(&self) -> bool {
        self.policy.read().always_validate
    }

    pub fn set_expire_ignored(&self, ignored: bool) {
        self.policy.write().expire_ignored = ignored;
    }

    pub fn is_expire_ignored(&self) -> bool {
        self.policy.read().expire_ignored
    }

    pub fn set_cache_protected(&self, protected: bool) {
        self.policy.write().cache_protected = protected;
    }

    pub fn get_cache_protected(&self) -> bool {
        self.policy.read().cache_protected
    }

    pub fn set_disconnected_mode(&self, mode: DisconnectedMode) {
        self.policy.write().disconnected = mode;
    }

    pub fn get_disconnected_mode(&self) -> DisconnectedMode {
        self.policy.read().disconnected
    }

    /// Set request-side `Cache-Control` overrides from header lines.
    /// `no-cache`/`no-store` disable the cache.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] if a line is not a well-formed
    /// `Cache-Control` header; the previous overrides stay in effect.
    pub fn set_cache_control(&self, lines: &[String]) -> Result<(), Error> {
        let request = RequestControl::parse(lines)?;
        let mut policy = self.policy.write();
        if request.no_cache {
            policy.enabled = false;
        }
        policy.request = request;
        policy.cache_control = lines.to_vec();
        Ok(())
    }

    /// The lines last passed to [`Cache::set_cache_control`].
    pub fn get_cache_control(&self) -> Vec<String> {
        self.policy.read().cache_control.clone()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let policy = self.policy.get_mut().clone();
        let table = self.table.get_mut();
        let result = self.lock.exclusive().and_then(|_exclusive| {
            let budget = policy.budget();
            if budget.needs_gc(table.current_size()) {
                table.collect(&budget, now(), policy.expire_ignored);
            }
            table.write_index()
        });
        if let Err(e) = result {
            tracing::warn!(root = %self.root.display(), error = %e, "Failed to write cache index on shutdown");
        }
    }
}
