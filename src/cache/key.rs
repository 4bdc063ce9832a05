//! Cache keys.

use std::fmt;

use axum::http::{header, HeaderMap, Method, Uri};

/// Identity of a cacheable resource.
///
/// Two requests with the same method, scheme, authority, path+query and
/// `Accept-Encoding` map to the same entry. The scheme is always part of the
/// key so a response fetched over TLS is never served to a plain-HTTP
/// request or vice versa. `Accept-Encoding` is forwarded to the backend, so
/// it is the one negotiated dimension the key carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    secure: bool,
    authority: String,
    path_and_query: String,
    accept_encoding: String,
}

impl CacheKey {
    pub fn new(
        method: Method,
        secure: bool,
        authority: impl AsRef<str>,
        path_and_query: impl Into<String>,
    ) -> Self {
        let path_and_query = path_and_query.into();
        Self {
            method,
            secure,
            authority: authority.as_ref().trim().to_ascii_lowercase(),
            path_and_query: if path_and_query.is_empty() {
                "/".to_string()
            } else {
                path_and_query
            },
            accept_encoding: String::new(),
        }
    }

    /// Same key for clients that sent `accept_encoding`.
    pub fn with_accept_encoding(mut self, accept_encoding: &str) -> Self {
        self.accept_encoding = normalize_list(accept_encoding);
        self
    }

    /// Key for an inbound request. The authority is the `Host` header,
    /// falling back to the URI authority for absolute-form requests.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap, secure: bool) -> Self {
        let authority = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let accept_encoding = headers
            .get_all(header::ACCEPT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        Self::new(method.clone(), secure, authority, path_and_query).with_accept_encoding(&accept_encoding)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    pub fn accept_encoding(&self) -> &str {
        &self.accept_encoding
    }
}

/// Lowercase, trim and drop empty items of a comma-separated header value.
fn normalize_list(value: &str) -> String {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(
            f,
            "{} {}://{}{}",
            self.method, scheme, self.authority, self.path_and_query
        )?;
        if !self.accept_encoding.is_empty() {
            write!(f, " [{}]", self.accept_encoding)?;
        }
        Ok(())
    }
}
