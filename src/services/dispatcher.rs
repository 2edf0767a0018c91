//! Origin selection, content-kind selection and cache-key construction.
//!
//! Everything here is a pure function of the request: no I/O, no config
//! lookups, no state. The path is percent-decoded exactly once, up front, and
//! both classifications work from that single decoded value.

use crate::{
    models::{
        params::{CacheParams, ImageParams},
        request::RequestDescriptor,
        selection::{ContentKind, Origin},
    },
    services::mime::mime_for_path,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::Url;

/// Characters `encodeURIComponent` leaves alone.
const COMPONENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Outcome of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub origin: Origin,
    pub content: ContentKind,
    pub cache_key: String,
}

/// Classify the request and derive its cache key.
pub fn dispatch(request: &RequestDescriptor) -> Dispatch {
    let decoded = percent_decode_str(request.url.path())
        .decode_utf8_lossy()
        .into_owned();

    let origin = select_origin(&decoded);
    let content = match &origin {
        // The embedded URL is already parsed; its path is not decoded again.
        Origin::GenericUrl(url) => select_content_kind(url.path(), &request.url),
        Origin::ObjectStorage => select_content_kind(&decoded, &request.url),
    };
    let cache_key = build_cache_key(&request.url, &origin, &content);

    Dispatch {
        origin,
        content,
        cache_key,
    }
}

/// A decoded path that is itself an absolute `http(s)` URL selects the
/// generic URL origin; anything else is an object key.
pub fn select_origin(decoded_path: &str) -> Origin {
    let candidate = decoded_path.strip_prefix('/').unwrap_or(decoded_path);
    match Url::parse(candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {
            Origin::GenericUrl(url)
        }
        _ => Origin::ObjectStorage,
    }
}

/// Image when the extension resolves to `image/*`, opaque otherwise.
/// Transform parameters always come from the inbound request's query.
pub fn select_content_kind(path: &str, request_url: &Url) -> ContentKind {
    match mime_for_path(path) {
        Some(mime) if mime.starts_with("image/") => ContentKind::Image {
            mime,
            params: ImageParams::from_url(request_url),
        },
        mime => ContentKind::Opaque { mime },
    }
}

/// Replace the query of `request_url` with the canonical parameter string.
///
/// Origin parameters are merged first so content-kind parameters win on
/// collision. Keys come out sorted; values are component-encoded.
pub fn build_cache_key(request_url: &Url, origin: &Origin, content: &ContentKind) -> String {
    let mut merged: CacheParams = origin.cache_params();
    merged.extend(content.cache_params());

    let query = merged
        .iter()
        .map(|(key, value)| format!("{}={}", key, utf8_percent_encode(value, COMPONENT_ENCODE_SET)))
        .collect::<Vec<_>>()
        .join("&");

    let mut url = request_url.clone();
    url.set_fragment(None);
    if query.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&query));
    }
    url.to_string()
}
