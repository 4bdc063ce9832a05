//! Stored responses and how they are served back.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures_util::stream;

use crate::clock;

/// Diagnostic header added to every response served from the cache.
pub const CACHE_ORIGIN_HEADER: HeaderName = HeaderName::from_static("x-cache-origin");

/// Chunks at least this large are kept as received instead of copied.
pub const DIRECT_CHUNK_THRESHOLD: usize = 16 * 1024;

/// Headers never stored with an entry.
const STRIPPED_HEADERS: [HeaderName; 3] = [header::ETAG, header::ACCEPT_RANGES, header::EXPIRES];

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` only has meaning for a single connection.
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// One immutable body chunk and the allocator it is accounted to.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    data: Bytes,
    direct: bool,
}

impl StoredChunk {
    /// Small chunks are copied onto the heap so they do not pin the larger
    /// receive buffer they were sliced from; large chunks are shared as-is.
    pub fn from_received(chunk: &Bytes) -> Self {
        if chunk.len() >= DIRECT_CHUNK_THRESHOLD {
            Self {
                data: chunk.clone(),
                direct: true,
            }
        } else {
            Self {
                data: Bytes::copy_from_slice(chunk),
                direct: false,
            }
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }
}

/// A cached response. Never mutated after insertion, apart from the
/// access timestamp.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) chunks: Vec<StoredChunk>,
    pub(crate) heap_bytes: u64,
    pub(crate) direct_bytes: u64,
    pub(crate) last_modified: SystemTime,
    pub(crate) created: SystemTime,
    pub(crate) expires: SystemTime,
    pub(crate) expires_header: HeaderValue,
    pub(crate) last_access_ms: AtomicU64,
}

impl CacheEntry {
    /// Store-side header filter: drops validators, range support, the
    /// original `Expires` and hop-by-hop headers.
    pub fn storable_headers(headers: &HeaderMap) -> HeaderMap {
        let mut stored = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if STRIPPED_HEADERS.contains(name)
                || is_hop_by_hop_header(name)
                || *name == header::CONTENT_LENGTH
            {
                continue;
            }
            stored.append(name.clone(), value.clone());
        }
        stored
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn body_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.data.len() as u64).sum()
    }

    pub fn heap_bytes(&self) -> u64 {
        self.heap_bytes
    }

    pub fn direct_bytes(&self) -> u64 {
        self.direct_bytes
    }

    pub fn footprint(&self) -> u64 {
        self.heap_bytes + self.direct_bytes
    }

    /// Body as one contiguous buffer (copies).
    pub fn body(&self) -> Bytes {
        let mut body = Vec::with_capacity(self.body_len() as usize);
        for chunk in &self.chunks {
            body.extend_from_slice(&chunk.data);
        }
        Bytes::from(body)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires <= now
    }

    pub(crate) fn touch(&self) {
        self.last_access_ms.store(clock::now_millis(), Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    fn origin_marker(&self) -> HeaderValue {
        let value = format!("hit; created={}", clock::format_http_date(self.created));
        HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("hit"))
    }

    fn last_modified_header(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&clock::format_http_date(self.last_modified)).ok()
    }

    /// Whether a client `If-Modified-Since` lets us answer 304.
    ///
    /// Compared at whole-second resolution, the precision of HTTP dates.
    pub fn not_modified_since(&self, if_modified_since: SystemTime) -> bool {
        clock::whole_seconds(if_modified_since) >= clock::whole_seconds(self.last_modified)
    }

    /// Build the client response for a hit.
    ///
    /// With a satisfied `If-Modified-Since` this is an empty 304 carrying
    /// only `Last-Modified`, `Expires` and the origin marker. Otherwise the
    /// stored status, headers and chunks are served; the chunks are shared
    /// views of the stored buffers.
    pub fn to_response(&self, if_modified_since: Option<SystemTime>) -> Response<Body> {
        if let Some(since) = if_modified_since {
            if self.not_modified_since(since) {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NOT_MODIFIED;
                let headers = response.headers_mut();
                if let Some(last_modified) = self.last_modified_header() {
                    headers.insert(header::LAST_MODIFIED, last_modified);
                }
                headers.insert(header::EXPIRES, self.expires_header.clone());
                headers.insert(CACHE_ORIGIN_HEADER, self.origin_marker());
                return response;
            }
        }

        let chunks: Vec<Result<Bytes, Infallible>> =
            self.chunks.iter().map(|c| Ok(c.data.clone())).collect();
        let mut response = Response::new(Body::from_stream(stream::iter(chunks)));
        *response.status_mut() = self.status;

        *response.headers_mut() = self.headers.clone();
        let headers = response.headers_mut();
        headers.insert(header::EXPIRES, self.expires_header.clone());
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body_len()));
        headers.insert(CACHE_ORIGIN_HEADER, self.origin_marker());
        response
    }
}
