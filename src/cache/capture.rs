//! Recording a backend response while it streams to the client.

use std::sync::atomic::AtomicU64;
use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;

use crate::cache::directives::CacheDirectives;
use crate::cache::entry::{CacheEntry, StoredChunk};
use crate::cache::key::CacheKey;
use crate::clock;

/// Request validators removed from the backend request while capturing,
/// so the backend always returns a full representation (RFC 7234 §4.3.4).
pub const CLIENT_VALIDATORS: [HeaderName; 5] = [
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
];

/// Remove every client validator from `headers`.
pub fn strip_validators(headers: &mut HeaderMap) {
    for name in CLIENT_VALIDATORS {
        headers.remove(name);
    }
}

/// Whether every `Vary` dimension is already part of the [`CacheKey`].
fn vary_is_keyed(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::VARY)
        .iter()
        .all(|value| match value.to_str() {
            Ok(value) => value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .all(|name| name.eq_ignore_ascii_case(header::ACCEPT_ENCODING.as_str())),
            Err(_) => false,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    AwaitingHeaders,
    Recording,
    Aborted,
}

/// Reasons a capture stops. Never surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRejection {
    Status,
    Directives,
    DeclaredTooLarge,
    BadExpires,
    BodyTooLarge,
    /// The response varies on a request header the key does not carry.
    Vary,
}

/// In-progress capture of one response, owned by the forwarding task.
#[derive(Debug)]
pub struct CacheWriteHandle {
    key: CacheKey,
    max_file_size: u64,
    default_ttl: Duration,
    state: CaptureState,
    rejection: Option<CaptureRejection>,
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<StoredChunk>,
    heap_bytes: u64,
    direct_bytes: u64,
    started: SystemTime,
    expires: Option<SystemTime>,
    expires_header: Option<HeaderValue>,
    synthesized_expires: bool,
    last_modified: Option<SystemTime>,
}

impl CacheWriteHandle {
    pub(crate) fn new(key: CacheKey, max_file_size: u64, default_ttl: Duration) -> Self {
        Self {
            key,
            max_file_size,
            default_ttl,
            state: CaptureState::AwaitingHeaders,
            rejection: None,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            heap_bytes: 0,
            direct_bytes: 0,
            started: SystemTime::now(),
            expires: None,
            expires_header: None,
            synthesized_expires: false,
            last_modified: None,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Still recording (or waiting for headers).
    pub fn is_active(&self) -> bool {
        self.state != CaptureState::Aborted
    }

    pub fn rejection(&self) -> Option<CaptureRejection> {
        self.rejection
    }

    fn reject(&mut self, reason: CaptureRejection) -> bool {
        self.state = CaptureState::Aborted;
        self.rejection = Some(reason);
        self.chunks.clear();
        false
    }

    /// Decide from the response head whether to keep recording.
    pub fn on_response_headers(&mut self, status: StatusCode, headers: &HeaderMap) -> bool {
        if self.state != CaptureState::AwaitingHeaders {
            return false;
        }

        if !status.is_success() || status == StatusCode::PARTIAL_CONTENT {
            return self.reject(CaptureRejection::Status);
        }

        if CacheDirectives::from_headers(headers).forbids_storage() {
            return self.reject(CaptureRejection::Directives);
        }

        if !vary_is_keyed(headers) {
            return self.reject(CaptureRejection::Vary);
        }

        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if matches!(declared, Some(len) if len > self.max_file_size) {
            return self.reject(CaptureRejection::DeclaredTooLarge);
        }

        match headers.get(header::EXPIRES) {
            Some(value) => {
                let parsed = value.to_str().ok().and_then(clock::parse_http_date);
                match parsed {
                    Some(expires) if expires > self.started => {
                        self.expires = Some(expires);
                        self.expires_header = Some(value.clone());
                    }
                    _ => return self.reject(CaptureRejection::BadExpires),
                }
            }
            None => {
                let expires = self.started + self.default_ttl;
                let value = HeaderValue::from_str(&clock::format_http_date(expires))
                    .unwrap_or(HeaderValue::from_static("0"));
                self.expires = Some(expires);
                self.expires_header = Some(value);
                self.synthesized_expires = true;
            }
        }

        self.last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(clock::parse_http_date);

        self.status = status;
        self.headers = CacheEntry::storable_headers(headers);
        self.state = CaptureState::Recording;
        true
    }

    /// The `Expires` value the client should see when the backend sent none.
    pub fn synthesized_expires(&self) -> Option<&HeaderValue> {
        if self.synthesized_expires && self.is_active() {
            self.expires_header.as_ref()
        } else {
            None
        }
    }

    /// Append a chunk. Returns false once the capture has been abandoned.
    pub fn on_body_chunk(&mut self, chunk: &Bytes) -> bool {
        if self.state != CaptureState::Recording {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }

        let total = self.heap_bytes + self.direct_bytes + chunk.len() as u64;
        if total > self.max_file_size {
            tracing::debug!(key = %self.key, size = total, "Capture exceeded max file size");
            return self.reject(CaptureRejection::BodyTooLarge);
        }

        let stored = StoredChunk::from_received(chunk);
        if stored.is_direct() {
            self.direct_bytes += chunk.len() as u64;
        } else {
            self.heap_bytes += chunk.len() as u64;
        }
        self.chunks.push(stored);
        true
    }

    /// Turn a completed capture into an entry.
    pub(crate) fn finish(self) -> Option<(CacheKey, CacheEntry)> {
        if self.state != CaptureState::Recording {
            return None;
        }
        let expires = self.expires?;
        let expires_header = self.expires_header?;
        let created = SystemTime::now();
        let entry = CacheEntry {
            status: self.status,
            headers: self.headers,
            chunks: self.chunks,
            heap_bytes: self.heap_bytes,
            direct_bytes: self.direct_bytes,
            last_modified: self.last_modified.unwrap_or(created),
            created,
            expires,
            expires_header,
            last_access_ms: AtomicU64::new(clock::unix_millis(created)),
        };
        Some((self.key, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn handle(max: u64) -> CacheWriteHandle {
        CacheWriteHandle::new(
            CacheKey::new(Method::GET, false, "example.com", "/"),
            max,
            Duration::from_secs(60),
        )
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn vary_outside_the_key_is_not_captured() {
        for vary in ["Accept-Language", "accept-encoding, Cookie", "*"] {
            let mut h = handle(100);
            assert!(!h.on_response_headers(StatusCode::OK, &headers(&[("vary", vary)])), "{vary}");
            assert_eq!(h.rejection(), Some(CaptureRejection::Vary));
        }
        let mut h = handle(100);
        assert!(h.on_response_headers(StatusCode::OK, &headers(&[("vary", "Accept-Encoding")])));
    }

    #[test]
    fn rejects_uncacheable_statuses() {
        for status in [StatusCode::NOT_FOUND, StatusCode::PARTIAL_CONTENT, StatusCode::FOUND] {
            let mut h = handle(100);
            assert!(!h.on_response_headers(status, &HeaderMap::new()));
            assert_eq!(h.rejection(), Some(CaptureRejection::Status));
        }
        assert!(handle(100).on_response_headers(StatusCode::NO_CONTENT, &HeaderMap::new()));
    }

    #[test]
    fn content_length_boundary() {
        let mut equal = handle(10);
        assert!(equal.on_response_headers(StatusCode::OK, &headers(&[("content-length", "10")])));

        let mut over = handle(10);
        assert!(!over.on_response_headers(StatusCode::OK, &headers(&[("content-length", "11")])));
        assert_eq!(over.rejection(), Some(CaptureRejection::DeclaredTooLarge));
    }

    #[test]
    fn chunked_body_over_limit_aborts() {
        let mut h = handle(8);
        assert!(h.on_response_headers(StatusCode::OK, &HeaderMap::new()));
        assert!(h.on_body_chunk(&Bytes::from_static(b"12345")));
        assert!(!h.on_body_chunk(&Bytes::from_static(b"6789")));
        assert!(!h.is_active());
        assert!(h.finish().is_none());
    }

    #[test]
    fn synthesizes_expires_only_when_missing() {
        let mut h = handle(100);
        assert!(h.on_response_headers(StatusCode::OK, &HeaderMap::new()));
        assert!(h.synthesized_expires().is_some());

        let future = clock::format_http_date(SystemTime::now() + Duration::from_secs(3600));
        let mut h = handle(100);
        assert!(h.on_response_headers(StatusCode::OK, &headers(&[("expires", &future)])));
        assert!(h.synthesized_expires().is_none());
        let (_, entry) = h.finish().unwrap();
        assert_eq!(entry.expires_header, future.as_str());
    }

    #[test]
    fn unparseable_expires_is_not_cached() {
        let mut h = handle(100);
        assert!(!h.on_response_headers(StatusCode::OK, &headers(&[("expires", "-1")])));
        assert_eq!(h.rejection(), Some(CaptureRejection::BadExpires));
    }

    #[test]
    fn last_modified_defaults_to_creation() {
        let mut h = handle(100);
        assert!(h.on_response_headers(StatusCode::OK, &HeaderMap::new()));
        assert!(h.on_body_chunk(&Bytes::from_static(b"abc")));
        let (_, entry) = h.finish().unwrap();
        assert_eq!(entry.last_modified, entry.created);
        assert_eq!(entry.heap_bytes, 3);
        assert_eq!(entry.direct_bytes, 0);
    }

    #[test]
    fn strips_all_validators() {
        let mut h = headers(&[
            ("if-match", "\"a\""),
            ("if-none-match", "\"b\""),
            ("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("if-unmodified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("if-range", "\"c\""),
            ("accept", "*/*"),
        ]);
        strip_validators(&mut h);
        assert_eq!(h.len(), 1);
    }
}
