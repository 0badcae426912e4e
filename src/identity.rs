//! Content Identity - Hash-Based File Identity
//!
//! Two uploads with identical bytes collapse to one identity, independent of
//! filename or drop location.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Compute SHA-256 hash of bytes, return hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Broad class of a source file. Layered design files arrive with their
/// background already isolated and skip the removal step entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    LayeredDesign,
    FlatRaster,
}

impl FileKind {
    /// Classify by extension. PSD and TIFF masters come out of the design
    /// tooling; everything else is treated as a flat raster.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("psd") | Some("tif") | Some("tiff") => FileKind::LayeredDesign,
            _ => FileKind::FlatRaster,
        }
    }
}

/// Stable identity and size metadata for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentIdentity {
    pub content_hash: String,
    pub size_bytes: u64,
    pub kind: FileKind,
    /// Present only when the bytes decode as an image.
    pub pixel_dimensions: Option<(u32, u32)>,
}

impl ContentIdentity {
    /// Pure function over path + bytes. Dimension probing reads only the
    /// header, never the full pixel data.
    pub fn compute(path: &Path, bytes: &[u8]) -> Self {
        let dimensions = image::load_from_memory(bytes)
            .ok()
            .map(|img| (img.width(), img.height()));

        Self {
            content_hash: sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            kind: FileKind::from_path(path),
            pixel_dimensions: dimensions,
        }
    }

    pub fn longest_side(&self) -> Option<u32> {
        self.pixel_dimensions.map(|(w, h)| w.max(h))
    }
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
