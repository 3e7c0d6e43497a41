//! Image derivative presets and the on-demand derivative cache.
//!
//! A preset is a (width, height, crop) descriptor with a compact reversible
//! encoding: `hex(width)-hex(height)` plus `-c` when cropping. Derivatives
//! are materialized lazily under
//! `{cache_root}/{preset}/{group?}/{file_name}`, so the deterministic path
//! doubles as the cache key and invalidating a preset is a directory delete.

use std::io::Cursor;
use std::sync::Arc;

use exif::{In, Tag};
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

use crate::object_store::{ObjectStore, ObjectStoreError};

/// Fallback bound for derivative dimensions; deployments can lower or raise
/// it via `MAX_IMAGE_DIMENSION`.
pub const MAX_DIMENSION: u32 = 3000;

#[derive(Debug, Error)]
pub enum DerivativeError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Storage error: {0}")]
    Store(#[from] ObjectStoreError),
}

/// A resize/crop transformation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePreset {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: bool,
}

impl ImagePreset {
    pub fn new(width: Option<u32>, height: Option<u32>, crop: bool) -> Self {
        Self { width, height, crop }
    }
}

fn validate_dimensions(width: Option<u32>, height: Option<u32>, crop: bool, max: u32) -> bool {
    if width.is_none() && height.is_none() {
        return false;
    }
    if crop && (width.is_none() || height.is_none()) {
        return false;
    }
    for dim in [width, height].into_iter().flatten() {
        if dim == 0 || dim > max {
            return false;
        }
    }
    true
}

/// Encode a preset name from width, height and crop data. Returns None for
/// invalid combinations (no dimensions, crop with a missing dimension, a
/// dimension outside `1..=max`).
pub fn encode_name_with_max(
    width: Option<u32>,
    height: Option<u32>,
    crop: bool,
    max: u32,
) -> Option<String> {
    if !validate_dimensions(width, height, crop, max) {
        return None;
    }
    let w = width.map(|w| format!("{w:x}")).unwrap_or_default();
    let h = height.map(|h| format!("{h:x}")).unwrap_or_default();
    let c = if crop { "-c" } else { "" };
    Some(format!("{w}-{h}{c}"))
}

pub fn encode_name(width: Option<u32>, height: Option<u32>, crop: bool) -> Option<String> {
    encode_name_with_max(width, height, crop, MAX_DIMENSION)
}

fn parse_hex_segment(segment: &str) -> Option<Option<u32>> {
    if segment.is_empty() {
        return Some(None);
    }
    // Strict lowercase hex; from_str_radix alone would admit uppercase and
    // a leading '+'.
    if !segment.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        return None;
    }
    u32::from_str_radix(segment, 16).ok().map(Some)
}

/// Decode an encoded preset name. Malformed or out-of-range names yield
/// None, never an error.
pub fn decode_name_with_max(name: &str, max: u32) -> Option<ImagePreset> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let crop = match parts.get(2) {
        Some(&"c") => true,
        Some(_) => return None,
        None => false,
    };
    let width = parse_hex_segment(parts[0])?;
    let height = parse_hex_segment(parts[1])?;
    if !validate_dimensions(width, height, crop, max) {
        return None;
    }
    Some(ImagePreset::new(width, height, crop))
}

pub fn decode_name(name: &str) -> Option<ImagePreset> {
    decode_name_with_max(name, MAX_DIMENSION)
}

/// Produces and serves cached image variants from the public blob store.
pub struct DerivativeCache {
    store: Arc<dyn ObjectStore>,
    cache_root: String,
    max_dimension: u32,
}

impl DerivativeCache {
    pub fn new(store: Arc<dyn ObjectStore>, cache_root: String, max_dimension: u32) -> Self {
        Self {
            store,
            cache_root,
            max_dimension,
        }
    }

    /// Decode a preset name against the configured dimension bound.
    pub fn decode(&self, name: &str) -> Option<ImagePreset> {
        decode_name_with_max(name, self.max_dimension)
    }

    /// Derivative path for a source file:
    /// `{cache_root}/{preset}/{group?}/{file_name}`. The preset becomes a
    /// top-level subdirectory so invalidation-by-preset is a directory
    /// delete.
    pub fn dst_path(&self, source_rel: &str, preset: &ImagePreset) -> Option<String> {
        let preset_name = encode_name_with_max(
            preset.width,
            preset.height,
            preset.crop,
            self.max_dimension,
        )?;
        Some(format!("{}/{preset_name}/{source_rel}", self.cache_root))
    }

    /// Materialize the derivative for a public source file. Returns false
    /// (non-fatal) when the source is missing, undecodable, or the
    /// destination is not writable.
    pub async fn execute_for_file(
        &self,
        source_rel: &str,
        preset: &ImagePreset,
        overwrite_source: bool,
    ) -> Result<bool, DerivativeError> {
        if !self.store.exists(source_rel).await? {
            return Ok(false);
        }
        let Some(dst_path) = (if overwrite_source {
            Some(source_rel.to_string())
        } else {
            self.dst_path(source_rel, preset)
        }) else {
            return Ok(false);
        };

        let data = self.store.get(source_rel).await?;
        let output = match transform(&data, preset) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(source = %source_rel, error = %e, "Failed to transform image");
                return Ok(false);
            }
        };

        if let Err(e) = self.store.put(&dst_path, output.into()).await {
            tracing::warn!(dst = %dst_path, error = %e, "Failed to write derivative");
            return Ok(false);
        }
        Ok(true)
    }

    /// Ensure a derivative exists, materializing it on first request.
    /// Returns the derivative path when it is servable. Concurrent callers
    /// may both regenerate; the output path is deterministic and the
    /// content identical, so last-writer-wins is harmless.
    pub async fn ensure(
        &self,
        source_rel: &str,
        preset: &ImagePreset,
    ) -> Result<Option<String>, DerivativeError> {
        let Some(dst_path) = self.dst_path(source_rel, preset) else {
            return Ok(None);
        };
        if !self.store.exists(&dst_path).await? {
            self.execute_for_file(source_rel, preset, false).await?;
        }
        if self.store.exists(&dst_path).await? {
            Ok(Some(dst_path))
        } else {
            Ok(None)
        }
    }

    /// Drop the cached derivatives of one group across every preset.
    /// Returns the number of preset directories touched.
    pub async fn invalidate_group(&self, group: &str) -> Result<u64, DerivativeError> {
        let mut removed = 0;
        for preset_dir in self.store.list_dirs(&self.cache_root).await? {
            let preset_path = format!("{}/{preset_dir}", self.cache_root);
            if self.store.list_dirs(&preset_path).await?.iter().any(|d| d == group) {
                self.store
                    .delete_prefix(&format!("{preset_path}/{group}"))
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Decode, orient, resize or crop, and re-encode in the source format.
fn transform(data: &[u8], preset: &ImagePreset) -> Result<Vec<u8>, image::ImageError> {
    let format = image::guess_format(data)?;
    let img = image::load_from_memory_with_format(data, format)?;
    let img = apply_orientation(img, exif_orientation(data));

    let out = if preset.crop {
        // validate_dimensions guarantees both are present when cropping
        let (w, h) = (preset.width.unwrap_or(1), preset.height.unwrap_or(1));
        img.resize_to_fill(w, h, FilterType::Lanczos3)
    } else {
        let w = preset.width.unwrap_or(u32::MAX);
        let h = preset.height.unwrap_or(u32::MAX);
        img.resize(w, h, FilterType::Lanczos3)
    };

    let mut buf = Vec::new();
    out.write_to(&mut Cursor::new(&mut buf), format)?;
    Ok(buf)
}

/// EXIF orientation value, defaulting to 1 (upright) when absent.
fn exif_orientation(data: &[u8]) -> u32 {
    let mut cursor = Cursor::new(data);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|meta| {
            meta.get_field(Tag::Orientation, In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
