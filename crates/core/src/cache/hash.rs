//! Bucket hash for cache URLs.
//!
//! The hash is persisted in the index and re-checked on load, so it must be
//! stable across processes, platforms and releases.

/// Number of buckets in the cache table. A prime keeps typical URL sets from
/// clustering.
pub const TABLE_SIZE: usize = 1499;

/// Compute the bucket for a URL: `h = h * 3 + byte`, reduced modulo
/// [`TABLE_SIZE`] at every step.
pub fn bucket_hash(url: &str) -> usize {
    url.bytes().fold(0usize, |hash, byte| (hash * 3 + byte as usize) % TABLE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stability() {
        let hash1 = bucket_hash("http://test.opendap.org/data/nc/fnoc1.nc.das");
        let hash2 = bucket_hash("http://test.opendap.org/data/nc/fnoc1.nc.das");
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(bucket_hash(""), 0);
        assert_eq!(bucket_hash("a"), 97);
        // (97 * 3 + 98) % 1499
        assert_eq!(bucket_hash("ab"), 389);
    }

    #[test]
    fn test_hash_in_range() {
        for url in ["http://example.com/", "https://example.com/a/very/long/path?with=query&and=more", "x"] {
            assert!(bucket_hash(url) < TABLE_SIZE);
        }
    }

    #[test]
    fn test_hash_different_urls() {
        assert_ne!(bucket_hash("http://example.com/a"), bucket_hash("http://example.com/b"));
    }
}
