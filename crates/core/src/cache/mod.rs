//! Disk-persisted HTTP/1.1 response cache.
//!
//! Responses are stored under a cache root directory:
//!
//! - `<root>/.index`: one line per entry, rewritten after garbage collection
//!   and every few stores
//! - `<root>/.lock`: coordinates processes sharing the directory
//! - `<root>/<hash>/dods*`: response bodies, each with a `.meta` file holding
//!   the response headers
//!
//! The table is guarded by a structural lock held only for lookups and
//! mutations; each entry has its own reader/writer lock so many readers can
//! hold checked-out responses at once.

pub mod checkout;
pub mod entry;
pub mod freshness;
pub mod gc;
pub mod hash;
pub mod headers;
pub mod index;
pub mod lock;
pub mod policy;
pub mod store;
pub mod table;

pub use crate::Error;

pub use checkout::CachedResponse;
pub use entry::{CacheEntry, EntryFields};
pub use freshness::{MaxStale, RequestControl};
pub use gc::{GcBudget, GcReport};
pub use policy::{CachePolicy, DisconnectedMode};
pub use store::{Cache, is_cacheable_url, now};
pub use table::CacheTable;
