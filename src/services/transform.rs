//! Resize and center-crop for image content.
//!
//! Geometry is planned up front from the natural size and the requested
//! `w`/`h` ([`plan`]); the engine then resizes, crops and re-encodes in the
//! source format.

use crate::{config::AppConfig, errors::TransformError, models::params::ImageParams};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader, imageops::FilterType};
use std::io::Cursor;

/// Upper bound on the intermediate (pre-crop) image.
pub const MAX_RESIZE_PIXELS: u64 = 100_000_000;

/// Smallest natural ratio used in the geometry; keeps slivers finite.
const MIN_RATIO: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Resize target plus the optional crop applied afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub resize_width: u32,
    pub resize_height: u32,
    pub crop: Option<CropRect>,
}

impl Geometry {
    /// Final output size.
    pub fn output(&self) -> (u32, u32) {
        match self.crop {
            Some(c) => (c.width, c.height),
            None => (self.resize_width, self.resize_height),
        }
    }

    fn pixels(&self) -> u64 {
        u64::from(self.resize_width) * u64::from(self.resize_height)
    }
}

/// Round to two decimal places, half away from zero.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_px(value: f64) -> u32 {
    // `as` saturates for out-of-range floats.
    (value.round() as u32).max(1)
}

/// Work out resize and crop for an image of `natural` size.
///
/// Returns `None` when no size was requested.
pub fn plan(natural: (u32, u32), params: &ImageParams) -> Option<Geometry> {
    let (nat_w, nat_h) = (natural.0.max(1), natural.1.max(1));
    let ratio = round2(f64::from(nat_w) / f64::from(nat_h)).max(MIN_RATIO);

    let geometry = match (params.width, params.height) {
        (None, None) => return None,
        (Some(w), None) => Geometry {
            resize_width: w,
            resize_height: round_px(f64::from(w) / ratio),
            crop: None,
        },
        (None, Some(h)) => Geometry {
            resize_width: round_px(f64::from(h) * ratio),
            resize_height: h,
            crop: None,
        },
        (Some(w), Some(h)) => {
            let target_ratio = round2(f64::from(w) / f64::from(h));
            if ratio > target_ratio {
                // Wider than asked: match height, trim the sides.
                let resize_width = round_px(f64::from(h) * ratio).max(w);
                Geometry {
                    resize_width,
                    resize_height: h,
                    crop: Some(centered(resize_width, w, h, true)),
                }
            } else if ratio < target_ratio {
                // Taller than asked: match width, trim top and bottom.
                let resize_height = round_px(f64::from(w) / ratio).max(h);
                Geometry {
                    resize_width: w,
                    resize_height,
                    crop: Some(centered(resize_height, w, h, false)),
                }
            } else {
                Geometry {
                    resize_width: w,
                    resize_height: h,
                    crop: None,
                }
            }
        }
    };
    Some(geometry)
}

/// A `w`×`h` window centered along the axis that overflows.
fn centered(resized: u32, w: u32, h: u32, horizontal: bool) -> CropRect {
    let target = if horizontal { w } else { h };
    let overflow = resized.saturating_sub(target);
    let offset = ((f64::from(overflow) / 2.0).round() as u32).min(overflow);
    if horizontal {
        CropRect {
            x: offset,
            y: 0,
            width: w,
            height: h,
        }
    } else {
        CropRect {
            x: 0,
            y: offset,
            width: w,
            height: h,
        }
    }
}

/// Decodes, resizes, crops and re-encodes image bytes.
#[derive(Debug, Clone, Copy)]
pub struct TransformEngine {
    filter: FilterType,
}

impl TransformEngine {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.resize_filter.filter_type())
    }

    /// Apply `params` to `input`. With no size requested the input comes back
    /// untouched, without a decode.
    pub fn apply(&self, input: Bytes, params: &ImageParams) -> Result<Bytes, TransformError> {
        if params.is_empty() {
            return Ok(input);
        }

        let (img, format) = decode_with_format(&input)?;
        let Some(geometry) = plan((img.width(), img.height()), params) else {
            return Ok(input);
        };
        if geometry.pixels() > MAX_RESIZE_PIXELS {
            return Err(TransformError::TooLarge {
                width: geometry.resize_width,
                height: geometry.resize_height,
            });
        }

        let mut out = img.resize_exact(geometry.resize_width, geometry.resize_height, self.filter);
        if let Some(c) = geometry.crop {
            out = out.crop_imm(c.x, c.y, c.width, c.height);
        }
        tracing::debug!(
            natural = ?(img.width(), img.height()),
            output = ?geometry.output(),
            ?format,
            "image transformed"
        );

        encode(&out, format).map(Bytes::from)
    }
}

fn decode_with_format(input: &[u8]) -> Result<(DynamicImage, ImageFormat), TransformError> {
    let reader = ImageReader::new(Cursor::new(input))
        .with_guessed_format()
        .map_err(|e| TransformError::UnprocessableImage(format!("failed to guess format: {e}")))?;

    let format = reader
        .format()
        .ok_or_else(|| TransformError::UnprocessableImage("unrecognized image format".to_string()))?;

    let img = reader
        .decode()
        .map_err(|e| TransformError::UnprocessableImage(format!("decode failed: {e}")))?;

    Ok((img, format))
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TransformError> {
    let mut buf = Cursor::new(Vec::new());
    let result = match format {
        // No alpha in JPEG.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, format),
        ImageFormat::WebP if !matches!(img, DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_)) => {
            DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut buf, format)
        }
        _ => img.write_to(&mut buf, format),
    };
    result.map_err(|e| TransformError::EncodeFailed(format!("{format:?} encode failed: {e}")))?;
    Ok(buf.into_inner())
}
