//! `Cache-Control` / `Pragma` parsing.
//!
//! Directive names are case-insensitive and whitespace around `=` is
//! ignored, so `Max-Age = 0` and `max-age=0` mean the same thing.

use axum::http::{header, HeaderMap};

/// The directives relevant to storing and sharing a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub public: bool,
    pub max_age: Option<u64>,
}

impl CacheDirectives {
    /// Merge every `Cache-Control` and `Pragma` value in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        let values = headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .chain(headers.get_all(header::PRAGMA).iter());

        for value in values {
            if let Ok(value) = value.to_str() {
                directives.merge(value);
            }
        }
        directives
    }

    /// Parse a single header value.
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();
        directives.merge(value);
        directives
    }

    fn merge(&mut self, value: &str) {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"').trim())),
                None => (part, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "no-store" => self.no_store = true,
                // `no-cache="field"` restricts fields only; still treat as revalidate.
                "no-cache" => self.no_cache = true,
                "private" => self.private = true,
                "public" => self.public = true,
                "max-age" => {
                    // An unparseable max-age is treated as already stale.
                    let seconds = arg.and_then(|a| a.parse::<u64>().ok()).unwrap_or(0);
                    self.max_age = Some(self.max_age.map_or(seconds, |m| m.min(seconds)));
                }
                _ => {}
            }
        }
    }

    /// Whether a response carrying these directives must not be stored.
    pub fn forbids_storage(&self) -> bool {
        self.no_store || self.no_cache || self.private || self.max_age == Some(0)
    }
}
