//! Content cache subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyAndCache request:
//!     key.rs: CacheKey (method, scheme, authority, path+query)
//!     → store.rs lookup()
//!         hit  → entry.rs to_response() (304 or full, origin marker)
//!         miss → store.rs begin_capture() → capture.rs CacheWriteHandle
//!
//! While the forwarder streams the backend response:
//!     on_response_headers() (status, directives.rs, size, Expires)
//!     → on_body_chunk() per chunk, after the client got it
//!     → commit() on completion / abort() on failure or disconnect
//!
//! Background:
//!     run_maintenance() → sweep(): expired first, then size/recency
//!     weighted eviction down to the memory budget
//! ```
//!
//! # Design Decisions
//! - Capture is best-effort: every rejection is silent
//! - Entries are immutable and shared through `Arc`; readers get cheap
//!   `Bytes` views of the stored chunks
//! - Lookups and commits are async so an out-of-process store can replace
//!   this one without changing call sites

pub mod capture;
pub mod directives;
pub mod entry;
pub mod key;
pub mod store;

pub use capture::{strip_validators, CacheWriteHandle, CaptureRejection};
pub use directives::CacheDirectives;
pub use entry::{is_hop_by_hop_header, CacheEntry, CACHE_ORIGIN_HEADER};
pub use key::CacheKey;
pub use store::{CachePolicy, CacheStatsSnapshot, ContentCache, SweepReport};
