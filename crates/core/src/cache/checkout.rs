//! Checked-out cached responses.

use super::entry::EntryReadGuard;
use crate::Error;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// A cached response held open for reading.
///
/// While this value is alive the entry cannot be removed, replaced or
/// purged, and revalidation of the same URL waits for it. Dropping it (or
/// passing it to [`Cache::release_cached_response`](super::Cache::release_cached_response))
/// releases the entry.
#[derive(Debug)]
pub struct CachedResponse {
    headers: Vec<String>,
    body: File,
    guard: EntryReadGuard,
}

impl CachedResponse {
    pub(crate) fn new(headers: Vec<String>, body: File, guard: EntryReadGuard) -> Self {
        Self { headers, body, guard }
    }

    pub fn url(&self) -> &str {
        self.guard.entry().url()
    }

    /// The stored response headers, hop-by-hop headers excluded.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    /// Path of the body file.
    pub fn body_path(&self) -> &Path {
        self.guard.entry().cachename()
    }

    /// Size of the body in bytes.
    pub fn size(&self) -> u64 {
        self.guard.entry().size()
    }

    /// Hit count of the entry, this checkout included.
    pub fn hits(&self) -> u64 {
        self.guard.entry().hits()
    }

    /// Read the rest of the body.
    pub fn read_body(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::with_capacity(usize::try_from(self.size()).unwrap_or_default());
        self.body
            .read_to_end(&mut body)
            .map_err(|e| Error::io(format!("reading {}", self.body_path().display()), e))?;
        Ok(body)
    }
}

impl Read for CachedResponse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}
