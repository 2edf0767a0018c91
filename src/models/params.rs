//! Recognized transform parameters and the cache parameters they produce.

use std::collections::BTreeMap;
use url::Url;

/// Flat parameter mapping contributed to the cache key.
/// `BTreeMap` keeps keys in code-point order, which is the key order we need.
pub type CacheParams = BTreeMap<String, String>;

/// Smallest accepted width/height.
pub const MIN_DIMENSION: u32 = 10;
/// Largest accepted width/height.
pub const MAX_DIMENSION: u32 = 6000;

/// Pure validation for one query parameter; `None` drops the parameter.
pub type ParamFilter = fn(&str) -> Option<u32>;

/// Query parameters the image handler understands. Anything else is ignored.
pub const IMAGE_PARAM_FILTERS: &[(&str, ParamFilter)] = &[
    ("w", filter_size), // width
    ("h", filter_size), // height
];

/// Validated transform parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ImageParams {
    /// Extract recognized parameters from the query string.
    ///
    /// Unknown names are skipped; for duplicated names the last valid value wins.
    pub fn from_url(url: &Url) -> Self {
        let mut values: BTreeMap<&'static str, u32> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            let Some((known, filter)) = IMAGE_PARAM_FILTERS
                .iter()
                .find(|(candidate, _)| *candidate == name.as_ref())
            else {
                continue;
            };
            if let Some(parsed) = filter(value.as_ref()) {
                values.insert(*known, parsed);
            }
        }

        Self {
            width: values.get("w").copied(),
            height: values.get("h").copied(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none()
    }

    pub fn cache_params(&self) -> CacheParams {
        let mut params = CacheParams::new();
        if let Some(w) = self.width {
            params.insert("w".to_string(), w.to_string());
        }
        if let Some(h) = self.height {
            params.insert("h".to_string(), h.to_string());
        }
        params
    }
}

/// Parse a size and clamp it into `[MIN_DIMENSION, MAX_DIMENSION]`.
pub fn filter_size(value: &str) -> Option<u32> {
    let parsed = parse_leading_int(value)?;
    let clamped = parsed.clamp(i64::from(MIN_DIMENSION), i64::from(MAX_DIMENSION));
    u32::try_from(clamped).ok()
}

/// Lenient integer parse: optional whitespace and sign, then leading digits.
/// Trailing characters are ignored (`"800px"` is 800); no digits means `None`.
fn parse_leading_int(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let digits: &str = {
        let end = rest
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(rest.len());
        &rest[..end]
    };
    if digits.is_empty() {
        return None;
    }

    let magnitude = digits.bytes().fold(0i64, |acc, b| {
        acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}
