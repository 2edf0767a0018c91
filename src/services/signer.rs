//! AWS Signature Version 4 for outgoing object-storage requests.
//!
//! The canonical request format:
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n\n
//! SignedHeaders\n
//! HashedPayload
//! ```
//!
//! Bodies are never signed (`UNSIGNED-PAYLOAD`); the proxy only issues GETs.

use crate::{config::AppConfig, models::upstream::SignedRequest};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash sent and signed for every request.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

static X_AMZ_DATE: HeaderName = HeaderName::from_static("x-amz-date");
static X_AMZ_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-amz-content-sha256");

/// Headers forwarded but left out of `SignedHeaders`. Intermediaries are
/// free to rewrite these, `range` included.
const UNSIGNED_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "x-amzn-trace-id",
    "user-agent",
    "expect",
    "presigned-expires",
    "range",
];

/// RFC 3986 unreserved characters survive; everything else is encoded.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Signs requests with one access key pair for one region/service.
#[derive(Clone)]
pub struct SigV4Signer {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    service: String,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl SigV4Signer {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    /// Signer for the configured bucket's `s3` service.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            cfg.access_key_id.clone(),
            cfg.secret_access_key.clone(),
            cfg.storage_region.clone(),
            "s3",
        )
    }

    pub fn sign(&self, method: Method, url: Url, headers: HeaderMap) -> SignedRequest {
        self.sign_at(method, url, headers, Utc::now())
    }

    /// Sign as of `now`. Adds `host`, `x-amz-date`, `x-amz-content-sha256`
    /// and `authorization`; any incoming `authorization` is replaced.
    pub fn sign_at(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = &amz_date[..8];

        headers.remove(header::AUTHORIZATION);
        if let Ok(host) = HeaderValue::from_str(&host_header(&url)) {
            headers.insert(header::HOST, host);
        }
        if let Ok(value) = HeaderValue::from_str(&amz_date) {
            headers.insert(X_AMZ_DATE.clone(), value);
        }
        if !headers.contains_key(&X_AMZ_CONTENT_SHA256) {
            headers.insert(
                X_AMZ_CONTENT_SHA256.clone(),
                HeaderValue::from_static(UNSIGNED_PAYLOAD),
            );
        }

        let payload_hash = headers
            .get(&X_AMZ_CONTENT_SHA256)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(UNSIGNED_PAYLOAD)
            .to_string();

        let pairs: Vec<(&str, &str)> = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        let mut signed: Vec<&str> = pairs
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !UNSIGNED_HEADERS.contains(name))
            .collect();
        signed.sort_unstable();
        signed.dedup();

        let canonical_request = build_canonical_request(
            method.as_str(),
            url.path(),
            &canonical_query_string(&url),
            &pairs,
            &signed,
            &payload_hash,
        );
        tracing::trace!(canonical_request, "built canonical request");

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = build_string_to_sign(&amz_date, &scope, &canonical_hash);
        let signing_key =
            derive_signing_key(&self.secret_access_key, date, &self.region, &self.service);
        let signature = compute_signature(&signing_key, &string_to_sign);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key_id,
            scope,
            signed.join(";"),
            signature
        );
        if let Ok(value) = HeaderValue::from_str(&authorization) {
            headers.insert(header::AUTHORIZATION, value);
        }

        SignedRequest {
            method,
            url,
            headers,
        }
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Assemble the canonical request from its parts.
pub fn build_canonical_request(
    method: &str,
    path: &str,
    canonical_query: &str,
    headers: &[(&str, &str)],
    signed_headers: &[&str],
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n\n{}\n{}",
        method,
        canonical_uri(path),
        canonical_query,
        canonical_headers(headers, signed_headers),
        signed_headers.join(";"),
        payload_hash
    )
}

/// Decode then re-encode each path segment so already-escaped keys are not
/// escaped twice. Slashes are kept.
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, URI_ENCODE_SET).to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Query pairs decoded, strictly re-encoded, sorted by key then value.
pub fn canonical_query_string(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                utf8_percent_encode(&k, URI_ENCODE_SET).to_string(),
                utf8_percent_encode(&v, URI_ENCODE_SET).to_string(),
            )
        })
        .collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// `name:value` lines for the signed headers, lowercased and sorted. Repeated
/// headers are comma-joined; values are trimmed with inner runs of
/// whitespace collapsed.
pub fn canonical_headers(headers: &[(&str, &str)], signed_headers: &[&str]) -> String {
    let mut header_map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = collapse_whitespace(value.trim());
        header_map
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let mut sorted: Vec<&str> = signed_headers.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .filter_map(|name| header_map.get(*name).map(|value| format!("{}:{}", name, value)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_string_to_sign(timestamp: &str, scope: &str, canonical_hash: &str) -> String {
    format!("{}\n{}\n{}\n{}", ALGORITHM, timestamp, scope, canonical_hash)
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
pub fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn collapse_whitespace(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut prev_was_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
            }
            prev_was_space = true;
        } else {
            result.push(ch);
            prev_was_space = false;
        }
    }
    result
}
