//! The cache index file: one line per entry, thirteen whitespace-separated
//! fields terminated by `\r\n`:
//!
//! ```text
//! url cachename etag lm expires size range hash hits freshness_lifetime response_time corrected_initial_age must_revalidate
//! ```
//!
//! Absent times are written as `-1`, flags as `0`/`1`, and an absent ETag
//! as the `@cache@` sentinel so the field count stays fixed.

use crate::Error;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

const EMPTY_ETAG: &str = "@cache@";
const FIELD_COUNT: usize = 13;

/// The persisted form of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub url: String,
    pub cachename: String,
    pub etag: Option<String>,
    pub lm: Option<i64>,
    pub expires: Option<i64>,
    pub size: u64,
    pub range: bool,
    pub hash: usize,
    pub hits: u64,
    pub freshness_lifetime: i64,
    pub response_time: i64,
    pub corrected_initial_age: i64,
    pub must_revalidate: bool,
}

fn time_field(value: Option<i64>) -> i64 {
    value.unwrap_or(-1)
}

fn flag_field(value: bool) -> char {
    if value { '1' } else { '0' }
}

/// Whether `value` is a non-empty token with no whitespace or control
/// characters, so it stays one field of one line.
pub fn is_single_field(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

impl IndexRecord {
    /// Encode this record as one index line, terminator included.
    ///
    /// An ETag containing whitespace cannot be represented and is written
    /// as absent. A URL or cache name that would split into more fields,
    /// or into more lines, is refused.
    pub fn to_line(&self) -> Result<String, Error> {
        for (name, value) in [("url", &self.url), ("cachename", &self.cachename)] {
            if !is_single_field(value) {
                return Err(Error::InvalidInput(format!("{name} cannot be written to the index: {value:?}")));
            }
        }

        let etag = self
            .etag
            .as_deref()
            .filter(|e| !e.is_empty() && !e.contains(char::is_whitespace))
            .unwrap_or(EMPTY_ETAG);
        Ok(format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {}\r\n",
            self.url,
            self.cachename,
            etag,
            time_field(self.lm),
            time_field(self.expires),
            self.size,
            flag_field(self.range),
            self.hash,
            self.hits,
            self.freshness_lifetime,
            self.response_time,
            self.corrected_initial_age,
            flag_field(self.must_revalidate),
        ))
    }

    /// Decode one index line. `line_no` is only used for error messages.
    pub fn parse(line: &str, line_no: usize) -> Result<Self, Error> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            return Err(Error::IndexParse {
                line: line_no,
                reason: format!("expected {FIELD_COUNT} fields, found {}", fields.len()),
            });
        }

        let int = |idx: usize, name: &str| -> Result<i64, Error> {
            fields[idx]
                .parse::<i64>()
                .map_err(|_| Error::IndexParse { line: line_no, reason: format!("{name} is not an integer: {}", fields[idx]) })
        };
        let unsigned = |idx: usize, name: &str| -> Result<u64, Error> {
            fields[idx]
                .parse::<u64>()
                .map_err(|_| Error::IndexParse { line: line_no, reason: format!("{name} is not a count: {}", fields[idx]) })
        };
        let flag = |idx: usize, name: &str| -> Result<bool, Error> {
            match fields[idx] {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(Error::IndexParse { line: line_no, reason: format!("{name} is not 0 or 1: {other}") }),
            }
        };
        let time = |idx: usize, name: &str| -> Result<Option<i64>, Error> {
            int(idx, name).map(|v| (v >= 0).then_some(v))
        };

        let etag = match fields[2] {
            EMPTY_ETAG => None,
            etag => Some(etag.to_string()),
        };
        let hash = usize::try_from(unsigned(7, "hash")?)
            .map_err(|_| Error::IndexParse { line: line_no, reason: "hash out of range".to_string() })?;

        Ok(IndexRecord {
            url: fields[0].to_string(),
            cachename: fields[1].to_string(),
            etag,
            lm: time(3, "lm")?,
            expires: time(4, "expires")?,
            size: unsigned(5, "size")?,
            range: flag(6, "range")?,
            hash,
            hits: unsigned(8, "hits")?,
            freshness_lifetime: int(9, "freshness_lifetime")?,
            response_time: int(10, "response_time")?,
            corrected_initial_age: int(11, "corrected_initial_age")?,
            must_revalidate: flag(12, "must_revalidate")?,
        })
    }
}

/// Parse a whole index, returning the good records and the errors of the
/// lines that were skipped. Blank lines are ignored.
pub fn parse_index(contents: &str) -> (Vec<IndexRecord>, Vec<Error>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match IndexRecord::parse(line, idx + 1) {
            Ok(record) => records.push(record),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

/// Read the index at `path`. A missing file is an empty index.
pub fn read_index(path: &Path) -> Result<(Vec<IndexRecord>, Vec<Error>), Error> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(parse_index(&contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok((Vec::new(), Vec::new())),
        Err(e) => Err(Error::io(format!("reading index {}", path.display()), e)),
    }
}

/// Truncate and rewrite the index at `path`.
pub fn write_index<'a>(path: &Path, records: impl IntoIterator<Item = &'a IndexRecord>) -> Result<(), Error> {
    let context = || format!("writing index {}", path.display());

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::io(context(), e))?;
    let mut writer = BufWriter::new(file);

    for record in records {
        let line = match record.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unwritable index record");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).map_err(|e| Error::io(context(), e))?;
    }
    writer.flush().map_err(|e| Error::io(context(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> IndexRecord {
        IndexRecord {
            url: "http://test.opendap.org/data/nc/fnoc1.nc.das".to_string(),
            cachename: "/tmp/dods-cache/1012/dodsQx3b9a".to_string(),
            etag: Some("\"2kbo1-412-3bc898d0\"".to_string()),
            lm: Some(784111777),
            expires: None,
            size: 1042,
            range: false,
            hash: 1012,
            hits: 3,
            freshness_lifetime: 86400,
            response_time: 1_700_000_000,
            corrected_initial_age: 2,
            must_revalidate: true,
        }
    }

    #[test]
    fn test_line_format() {
        let line = sample().to_line().unwrap();
        assert_eq!(
            line,
            "http://test.opendap.org/data/nc/fnoc1.nc.das /tmp/dods-cache/1012/dodsQx3b9a \"2kbo1-412-3bc898d0\" \
             784111777 -1 1042 0 1012 3 86400 1700000000 2 1\r\n"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let record = sample();
        let parsed = IndexRecord::parse(&record.to_line().unwrap(), 1).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_empty_etag_sentinel() {
        let record = IndexRecord { etag: None, ..sample() };
        let line = record.to_line().unwrap();
        assert!(line.contains(" @cache@ "));
        assert_eq!(IndexRecord::parse(&line, 1).unwrap().etag, None);

        let record = IndexRecord { etag: Some("W/\"a b\"".to_string()), ..sample() };
        assert_eq!(IndexRecord::parse(&record.to_line().unwrap(), 1).unwrap().etag, None);
    }

    #[test]
    fn test_refuses_fields_that_split() {
        for url in ["http://x/a b", "http://x/a\r\nhttp://x/b /etc/passwd", "http://x/a\tb", ""] {
            let record = IndexRecord { url: url.to_string(), ..sample() };
            assert!(matches!(record.to_line(), Err(Error::InvalidInput(_))), "{url:?}");
        }
        let record = IndexRecord { cachename: "/tmp/dods cache/1012/dodsQx".to_string(), ..sample() };
        assert!(matches!(record.to_line(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_write_skips_unwritable_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".index");
        let forged = IndexRecord {
            url: "http://x/a\nhttp://x/b /victim @cache@ -1 -1 8 0 1 0 86400 0 0 0\nx".to_string(),
            ..sample()
        };
        write_index(&path, [&forged, &sample()]).unwrap();

        let (records, errors) = read_index(&path).unwrap();
        assert!(errors.is_empty());
        assert_eq!(records, vec![sample()]);
    }

    #[test]
    fn test_malformed_lines() {
        let err = IndexRecord::parse("http://x/a /tmp/a @cache@ -1 -1", 4).unwrap_err();
        assert!(matches!(err, Error::IndexParse { line: 4, .. }));

        let line = sample().to_line().unwrap().replace(" 1042 ", " big ");
        assert!(matches!(IndexRecord::parse(&line, 2), Err(Error::IndexParse { line: 2, .. })));
    }

    #[test]
    fn test_parse_index_skips_bad_lines() {
        let contents = format!("{}garbage line\r\n\r\n{}", sample().to_line().unwrap(), sample().to_line().unwrap());
        let (records, errors) = parse_index(&contents);
        assert_eq!(records.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::IndexParse { line: 2, .. }));
    }

    #[test]
    fn test_read_missing_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let (records, errors) = read_index(&dir.path().join(".index")).unwrap();
        assert!(records.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".index");
        let second = IndexRecord { url: "http://x/b".to_string(), hits: 0, ..sample() };
        write_index(&path, [&sample(), &second]).unwrap();

        let (records, errors) = read_index(&path).unwrap();
        assert!(errors.is_empty());
        assert_eq!(records, vec![sample(), second]);

        write_index(&path, Vec::<&IndexRecord>::new()).unwrap();
        assert!(read_index(&path).unwrap().0.is_empty());
    }
}
