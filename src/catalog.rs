//! Render Spec Catalog - Declarative Output Contracts
//!
//! The catalog is the full list of derivative artifacts produced for every
//! approved file. It is loaded once at startup, validated eagerly, and never
//! mutated afterwards; a malformed entry is a startup failure, not a runtime
//! surprise. Reload requires restart.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Catalog requires engine >= {required}, current is {current}")]
    EngineVersionMismatch { required: String, current: String },

    #[error("Duplicate spec entry name: {0}")]
    DuplicateName(String),

    #[error("Spec entry '{name}' is invalid: {reason}")]
    InvalidEntry { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Lossless raster family.
    Png,
    /// Lossy raster family, encoded at a fixed quality factor.
    Jpeg,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Png => "png",
            ContainerFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// Opaque RGB; any source transparency must be resolved by a fill.
    Opaque,
    /// RGB with alpha channel preserved.
    Alpha,
}

/// Exactly one resize behavior is active per entry; the untagged `None`
/// variant passes the source through at native resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResizeMode {
    None,
    /// Scale preserving aspect ratio so the longer dimension equals `target`.
    FitLongest { target: u32 },
    /// Scale to exactly `width`x`height` when the canvas extent matches;
    /// otherwise preserve aspect ratio with the longest side capped.
    FitBoth { width: u32, height: u32 },
}

impl Default for ResizeMode {
    fn default() -> Self {
        ResizeMode::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayIcon {
    pub path: PathBuf,
    /// Offset from the canvas origin (top-left).
    #[serde(default = "default_icon_offset")]
    pub offset: (u32, u32),
}

fn default_icon_offset() -> (u32, u32) {
    (15, 15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSpecEntry {
    pub name: String,
    pub container_format: ContainerFormat,
    pub dpi: u32,
    pub color_mode: ColorMode,
    #[serde(default)]
    pub background_fill: Option<[u8; 3]>,
    #[serde(default)]
    pub resize_mode: ResizeMode,
    #[serde(default)]
    pub canvas_extent: Option<(u32, u32)>,
    #[serde(default)]
    pub border_inset: (u32, u32),
    #[serde(default)]
    pub overlay_icon: Option<OverlayIcon>,
    #[serde(default)]
    pub overlay_watermark: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RenderSpecEntry {
    fn validate(&self) -> Result<(), CatalogError> {
        let fail = |reason: String| CatalogError::InvalidEntry {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(fail("entry name must not be empty".into()));
        }
        if self.dpi == 0 {
            return Err(fail("dpi must be positive".into()));
        }

        let (bx, by) = self.border_inset;
        match self.resize_mode {
            ResizeMode::FitLongest { target } if target == 0 => {
                return Err(fail("fit_longest target must be positive".into()));
            }
            ResizeMode::FitBoth { width, height } if width == 0 || height == 0 => {
                return Err(fail("fit_both dimensions must be positive".into()));
            }
            _ => {}
        }

        if let Some((cw, ch)) = self.canvas_extent {
            if cw <= bx * 2 || ch <= by * 2 {
                return Err(fail(format!(
                    "canvas {}x{} leaves no content area inside border inset {}x{}",
                    cw, ch, bx, by
                )));
            }
            match self.resize_mode {
                ResizeMode::FitBoth { width, height } => {
                    if cw < width + bx * 2 || ch < height + by * 2 {
                        return Err(fail(format!(
                            "canvas {}x{} cannot hold {}x{} plus twice the border inset",
                            cw, ch, width, height
                        )));
                    }
                }
                ResizeMode::FitLongest { target } => {
                    if (cw - bx * 2).max(ch - by * 2) < target {
                        return Err(fail(format!(
                            "canvas {}x{} cannot hold longest side {} plus twice the border inset",
                            cw, ch, target
                        )));
                    }
                }
                ResizeMode::None => {}
            }
        }

        // Padding an opaque canvas or flattening for JPEG needs a defined
        // fill color; anything else would be a silent flatten-to-black.
        if self.color_mode == ColorMode::Opaque
            && self.background_fill.is_none()
            && (self.canvas_extent.is_some() || self.border_inset != (0, 0))
        {
            return Err(fail(
                "opaque color mode with canvas padding requires a background fill".into(),
            ));
        }
        if self.container_format == ContainerFormat::Jpeg && self.color_mode == ColorMode::Alpha {
            return Err(fail("jpeg cannot carry an alpha channel".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSpec {
    pub catalog_version: String,
    #[serde(default = "default_min_engine")]
    pub engine_min_version: String,
    pub entries: Vec<RenderSpecEntry>,
}

fn default_min_engine() -> String {
    "1.0.0".to_string()
}

impl RenderSpec {
    /// Load and validate the catalog from a JSON file. Any violation aborts
    /// the load; a partially valid catalog is never served.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        let spec: RenderSpec = serde_json::from_str(&content)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_entries(entries: Vec<RenderSpecEntry>) -> Result<Self, CatalogError> {
        let spec = RenderSpec {
            catalog_version: "1.0.0".to_string(),
            engine_min_version: default_min_engine(),
            entries,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let engine = semver::Version::parse(ENGINE_VERSION).map_err(|_| {
            CatalogError::EngineVersionMismatch {
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            }
        })?;
        let required = semver::Version::parse(&self.engine_min_version).map_err(|_| {
            CatalogError::EngineVersionMismatch {
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            }
        })?;
        if engine < required {
            return Err(CatalogError::EngineVersionMismatch {
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.name.clone()) {
                return Err(CatalogError::DuplicateName(entry.name.clone()));
            }
            entry.validate()?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RenderSpecEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries eligible for rendering, in catalog order.
    pub fn enabled_entries(&self) -> impl Iterator<Item = &RenderSpecEntry> {
        self.entries.iter().filter(|e| e.enabled)
    }
}
