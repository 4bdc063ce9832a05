//! Static resources and generic status pages.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;

/// A fully rendered non-proxied response.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Renders every non-proxied terminal response.
pub trait StaticContent: Send + Sync {
    /// Render `resource` with `status`, or the generic page for `status`
    /// when no resource is given. A missing resource renders as 404.
    fn render_page(&self, status: StatusCode, resource: Option<&str>) -> RenderedPage;
}

#[derive(Debug, Clone)]
struct Resource {
    content_type: &'static str,
    body: Bytes,
}

fn content_type_for(name: &str) -> &'static str {
    let file = name.rsplit('/').next().unwrap_or(name);
    let ext = file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        None => "text/plain; charset=utf-8",
        Some(_) => "application/octet-stream",
    }
}

fn generic_body(status: StatusCode) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.as_u16(),
    )
}

/// In-memory resource table plus generic pages.
#[derive(Debug, Default)]
pub struct StaticPages {
    resources: HashMap<String, Resource>,
}

impl StaticPages {
    /// Generic pages only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload every file under `root`. Resource ids are paths relative to
    /// `root` with `/` separators, e.g. `.well-known/acme-challenge/token`.
    pub fn load_dir(root: &Path) -> io::Result<Self> {
        let mut pages = Self::new();
        pages.load_tree(root, root)?;
        tracing::info!(root = %root.display(), resources = pages.resources.len(), "Static resources loaded");
        Ok(pages)
    }

    fn load_tree(&mut self, root: &Path, dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.load_tree(root, &path)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            self.insert(id, fs::read(&path)?);
        }
        Ok(())
    }

    pub fn insert(&mut self, id: impl Into<String>, body: impl Into<Bytes>) {
        let id = id.into();
        let content_type = content_type_for(&id);
        self.resources.insert(
            id.trim_start_matches('/').to_string(),
            Resource {
                content_type,
                body: body.into(),
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id.trim_start_matches('/'))
    }

    fn generic(status: StatusCode) -> RenderedPage {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        RenderedPage {
            status,
            headers,
            body: Bytes::from(generic_body(status)),
        }
    }
}

impl StaticContent for StaticPages {
    fn render_page(&self, status: StatusCode, resource: Option<&str>) -> RenderedPage {
        let Some(id) = resource else {
            return Self::generic(status);
        };
        match self.resources.get(id.trim_start_matches('/')) {
            Some(found) => {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(found.content_type));
                RenderedPage {
                    status,
                    headers,
                    body: found.body.clone(),
                }
            }
            // An error page whose resource is missing still renders with its status.
            None if !status.is_success() => Self::generic(status),
            None => Self::generic(StatusCode::NOT_FOUND),
        }
    }
}
