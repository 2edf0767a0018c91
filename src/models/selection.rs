//! The two per-request choices made by the dispatcher.

use super::params::{CacheParams, ImageParams};
use url::Url;

/// Where the raw bytes come from. Exactly one is active per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Signed fetch from the configured S3-compatible bucket.
    ObjectStorage,
    /// The decoded path was itself an absolute URL.
    GenericUrl(Url),
}

impl Origin {
    /// Parameters this origin adds to the cache key. Neither origin adds any
    /// today; the hook stays so a new origin only has to fill it in.
    pub fn cache_params(&self) -> CacheParams {
        match self {
            Origin::ObjectStorage | Origin::GenericUrl(_) => CacheParams::new(),
        }
    }
}

/// What happens to the fetched bytes, decided by the path's MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    /// `image/*`: resize/crop according to `params`.
    Image {
        mime: &'static str,
        params: ImageParams,
    },
    /// Everything else is passed through untouched.
    Opaque { mime: Option<&'static str> },
}

impl ContentKind {
    pub fn cache_params(&self) -> CacheParams {
        match self {
            ContentKind::Image { params, .. } => params.cache_params(),
            ContentKind::Opaque { .. } => CacheParams::new(),
        }
    }

    /// Parameters for the transform engine, when there is anything to do.
    pub fn transform_params(&self) -> Option<ImageParams> {
        match self {
            ContentKind::Image { params, .. } if !params.is_empty() => Some(*params),
            _ => None,
        }
    }

    /// MIME type resolved from the extension table, if any.
    pub fn mime(&self) -> Option<&'static str> {
        match self {
            ContentKind::Image { mime, .. } => Some(*mime),
            ContentKind::Opaque { mime } => *mime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_contributes_nothing() {
        let kind = ContentKind::Opaque {
            mime: Some("application/pdf"),
        };
        assert!(kind.cache_params().is_empty());
        assert!(kind.transform_params().is_none());
        assert_eq!(kind.mime(), Some("application/pdf"));
    }

    #[test]
    fn test_image_contributes_sizes() {
        let kind = ContentKind::Image {
            mime: "image/png",
            params: ImageParams {
                width: Some(120),
                height: None,
            },
        };
        let params = kind.cache_params();
        assert_eq!(params.get("w").map(String::as_str), Some("120"));
        assert!(!params.contains_key("h"));
        assert_eq!(kind.transform_params().and_then(|p| p.width), Some(120));
    }

    #[test]
    fn test_image_without_sizes_has_nothing_to_transform() {
        let kind = ContentKind::Image {
            mime: "image/png",
            params: ImageParams::default(),
        };
        assert!(kind.transform_params().is_none());
    }

    #[test]
    fn test_origins_contribute_nothing() {
        let url = Url::parse("https://example.com/a.png").unwrap();
        assert!(Origin::GenericUrl(url).cache_params().is_empty());
        assert!(Origin::ObjectStorage.cache_params().is_empty());
    }
}
