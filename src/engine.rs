//! Format Rendering Engine - One Spec Entry, One Artifact
//!
//! CRITICAL: render is pure with respect to its inputs. No shared mutable
//! state between invocations, so spec entries for one file may render on as
//! many workers as the pool allows.
//!
//! The transformation order is fixed: resize, canvas placement (border inset
//! applied to the content area before centering), alpha flatten, icon
//! overlay, watermark overlay, DPI stamp + encode.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::{ColorMode, ContainerFormat, OverlayIcon, RenderSpecEntry, ResizeMode};
use crate::dpi::{stamp_jpeg_dpi, stamp_png_dpi, DpiError};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Overlay asset not found: {0}")]
    OverlayAssetMissing(PathBuf),

    #[error("Overlay asset unreadable: {path}: {source}")]
    OverlayAssetUnreadable {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Spec '{0}' flattens transparency into an opaque mode without a background fill")]
    AlphaWithoutFill(String),

    #[error("Encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Metadata stamping failed: {0}")]
    Stamp(#[from] DpiError),
}

/// One encoded output artifact.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub struct FormatRenderingEngine {
    assets_dir: PathBuf,
}

impl FormatRenderingEngine {
    pub fn new(assets_dir: PathBuf) -> Self {
        Self { assets_dir }
    }

    /// Render one spec entry against a decoded source image.
    pub fn render(
        &self,
        source: &DynamicImage,
        entry: &RenderSpecEntry,
    ) -> Result<RenderedArtifact, RenderError> {
        let rgba = source.to_rgba8();
        let source_has_alpha = has_transparency(&rgba);

        // Step 1: resize target per mode.
        let (src_w, src_h) = rgba.dimensions();
        let scaled = match entry.resize_mode {
            ResizeMode::None => (src_w, src_h),
            ResizeMode::FitLongest { target } => fit_longest(src_w, src_h, target),
            ResizeMode::FitBoth { width, height } => {
                if entry.canvas_extent == Some((width, height)) {
                    // Exact stretch is only honored when the canvas pins the
                    // output size; otherwise aspect ratio wins.
                    (width, height)
                } else {
                    fit_longest(src_w, src_h, width.max(height))
                }
            }
        };

        // Steps 2+3: the border inset shrinks the content area before
        // centering, never the canvas.
        let (bx, by) = entry.border_inset;
        let canvas_size = entry.canvas_extent.unwrap_or(scaled);
        let content_area = (
            canvas_size.0.saturating_sub(bx * 2).max(1),
            canvas_size.1.saturating_sub(by * 2).max(1),
        );
        let final_dims = contain(scaled, content_area);

        let padded = canvas_size != final_dims;
        if entry.color_mode == ColorMode::Opaque
            && entry.background_fill.is_none()
            && (source_has_alpha || padded)
        {
            // Step 4 precondition: a catalog that validates cleanly cannot
            // reach this with padding, but an alpha-carrying source can.
            return Err(RenderError::AlphaWithoutFill(entry.name.clone()));
        }

        let resized = if final_dims == (src_w, src_h) {
            rgba
        } else {
            imageops::resize(&rgba, final_dims.0, final_dims.1, FilterType::Lanczos3)
        };

        let background = match entry.background_fill {
            Some([r, g, b]) => Rgba([r, g, b, 255]),
            None => Rgba([0, 0, 0, 0]),
        };
        let mut canvas = RgbaImage::from_pixel(canvas_size.0, canvas_size.1, background);
        let x = (canvas_size.0 - final_dims.0) / 2;
        let y = (canvas_size.1 - final_dims.1) / 2;
        imageops::overlay(&mut canvas, &resized, x as i64, y as i64);

        // Step 5: icon first, watermark full-bleed on top.
        if let Some(icon) = &entry.overlay_icon {
            self.composite_icon(&mut canvas, icon)?;
        }
        if let Some(watermark) = &entry.overlay_watermark {
            self.composite_watermark(&mut canvas, watermark)?;
        }

        // Step 6: encode and stamp DPI.
        let bytes = encode(&canvas, entry)?;
        Ok(RenderedArtifact {
            bytes,
            width: canvas_size.0,
            height: canvas_size.1,
        })
    }

    fn composite_icon(&self, canvas: &mut RgbaImage, icon: &OverlayIcon) -> Result<(), RenderError> {
        let img = self.load_overlay(&icon.path)?;
        imageops::overlay(canvas, &img, icon.offset.0 as i64, icon.offset.1 as i64);
        Ok(())
    }

    fn composite_watermark(&self, canvas: &mut RgbaImage, path: &Path) -> Result<(), RenderError> {
        let img = self.load_overlay(path)?;
        let (cw, ch) = canvas.dimensions();
        let full_bleed = if img.dimensions() == (cw, ch) {
            img
        } else {
            imageops::resize(&img, cw, ch, FilterType::Lanczos3)
        };
        imageops::overlay(canvas, &full_bleed, 0, 0);
        Ok(())
    }

    fn load_overlay(&self, path: &Path) -> Result<RgbaImage, RenderError> {
        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.assets_dir.join(path)
        };
        let bytes = fs::read(&full_path)
            .map_err(|_| RenderError::OverlayAssetMissing(full_path.clone()))?;
        let img = image::load_from_memory(&bytes).map_err(|source| {
            RenderError::OverlayAssetUnreadable {
                path: full_path,
                source,
            }
        })?;
        Ok(img.to_rgba8())
    }
}

/// Remove fully transparent borders before rendering. Applied once per file
/// ahead of the batch so every entry sees the same cropped content.
pub fn trim_transparent(img: &DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if pixel[3] > 0 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x || min_y > max_y {
        // Fully transparent; leave untouched.
        return DynamicImage::ImageRgba8(rgba);
    }
    if (min_x, min_y) == (0, 0) && (max_x, max_y) == (w - 1, h - 1) {
        return DynamicImage::ImageRgba8(rgba);
    }
    DynamicImage::ImageRgba8(rgba).crop_imm(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

fn has_transparency(img: &RgbaImage) -> bool {
    img.pixels().any(|p| p[3] < 255)
}

/// Aspect-preserving scale so the longer dimension equals `target`; the
/// other dimension rounds to nearest.
fn fit_longest(w: u32, h: u32, target: u32) -> (u32, u32) {
    if w == 0 || h == 0 {
        return (w, h);
    }
    if w >= h {
        let scaled_h = ((h as u64 * target as u64 + w as u64 / 2) / w as u64).max(1) as u32;
        (target, scaled_h)
    } else {
        let scaled_w = ((w as u64 * target as u64 + h as u64 / 2) / h as u64).max(1) as u32;
        (scaled_w, target)
    }
}

/// Shrink `dims` (preserving aspect ratio) until it fits inside `bounds`.
/// Never enlarges.
fn contain(dims: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (w, h) = dims;
    let (bw, bh) = bounds;
    if w <= bw && h <= bh {
        return dims;
    }
    let scaled_by_width = (bw, ((h as u64 * bw as u64 + w as u64 / 2) / w as u64).max(1) as u32);
    if scaled_by_width.1 <= bh {
        scaled_by_width
    } else {
        (((w as u64 * bh as u64 + h as u64 / 2) / h as u64).max(1) as u32, bh)
    }
}

fn encode(canvas: &RgbaImage, entry: &RenderSpecEntry) -> Result<Vec<u8>, RenderError> {
    let (w, h) = canvas.dimensions();
    let mut buf = Vec::new();

    match entry.container_format {
        ContainerFormat::Png => {
            let encoder = image::codecs::png::PngEncoder::new(&mut buf);
            match entry.color_mode {
                ColorMode::Alpha => {
                    encoder.write_image(canvas.as_raw(), w, h, ExtendedColorType::Rgba8)?;
                }
                ColorMode::Opaque => {
                    let rgb = DynamicImage::ImageRgba8(canvas.clone()).to_rgb8();
                    encoder.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)?;
                }
            }
            Ok(stamp_png_dpi(&buf, entry.dpi)?)
        }
        ContainerFormat::Jpeg => {
            // Fixed quality factor for the lossy family.
            let rgb = DynamicImage::ImageRgba8(canvas.clone()).to_rgb8();
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85);
            encoder.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)?;
            Ok(stamp_jpeg_dpi(&buf, entry.dpi)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RenderSpecEntry;

    fn engine() -> FormatRenderingEngine {
        FormatRenderingEngine::new(PathBuf::from("/nonexistent-assets"))
    }

    fn entry(name: &str) -> RenderSpecEntry {
        RenderSpecEntry {
            name: name.to_string(),
            container_format: ContainerFormat::Png,
            dpi: 300,
            color_mode: ColorMode::Alpha,
            background_fill: None,
            resize_mode: ResizeMode::None,
            canvas_extent: None,
            border_inset: (0, 0),
            overlay_icon: None,
            overlay_watermark: None,
            enabled: true,
        }
    }

    fn source(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([200, 40, 40, 255])))
    }

    #[test]
    fn fit_longest_rounds_other_axis() {
        assert_eq!(fit_longest(3000, 2000, 1500), (1500, 1000));
        assert_eq!(fit_longest(2000, 3000, 1500), (1000, 1500));
        assert_eq!(fit_longest(1000, 1, 500), (500, 1));
    }

    #[test]
    fn contain_never_enlarges() {
        assert_eq!(contain((100, 50), (200, 200)), (100, 50));
        assert_eq!(contain((400, 200), (200, 200)), (200, 100));
        assert_eq!(contain((200, 400), (200, 200)), (100, 200));
    }

    #[test]
    fn canvas_extent_pins_output_dimensions() {
        let mut e = entry("canvas");
        e.resize_mode = ResizeMode::FitLongest { target: 400 };
        e.canvas_extent = Some((600, 500));
        e.background_fill = Some([255, 255, 255]);
        e.color_mode = ColorMode::Opaque;

        for (w, h) in [(3000, 1000), (1000, 3000), (100, 100)] {
            let artifact = engine().render(&source(w, h), &e).unwrap();
            assert_eq!((artifact.width, artifact.height), (600, 500));
            let decoded = image::load_from_memory(&artifact.bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (600, 500));
        }
    }

    #[test]
    fn fit_longest_without_canvas_bounds_longest_side() {
        let mut e = entry("web");
        e.resize_mode = ResizeMode::FitLongest { target: 800 };

        let artifact = engine().render(&source(3001, 997), &e).unwrap();
        assert_eq!(artifact.width.max(artifact.height), 800);
    }

    #[test]
    fn border_inset_keeps_content_off_edges() {
        let mut e = entry("bordered");
        e.resize_mode = ResizeMode::FitLongest { target: 420 };
        e.canvas_extent = Some((500, 500));
        e.border_inset = (40, 40);
        e.background_fill = Some([255, 255, 255]);
        e.color_mode = ColorMode::Opaque;

        let artifact = engine().render(&source(2000, 2000), &e).unwrap();
        let decoded = image::load_from_memory(&artifact.bytes).unwrap().to_rgb8();

        // Everything within the inset margin must be fill color.
        for x in 0..500u32 {
            for y in 0..500u32 {
                if x < 40 || x >= 460 || y < 40 || y >= 460 {
                    assert_eq!(decoded.get_pixel(x, y), &image::Rgb([255, 255, 255]));
                }
            }
        }
        // Content actually present inside the frame.
        assert_eq!(decoded.get_pixel(250, 250), &image::Rgb([200, 40, 40]));
    }

    #[test]
    fn fit_both_stretches_only_with_matching_canvas() {
        let mut e = entry("stretch");
        e.resize_mode = ResizeMode::FitBoth {
            width: 300,
            height: 300,
        };
        e.canvas_extent = Some((300, 300));
        let artifact = engine().render(&source(600, 200), &e).unwrap();
        let decoded = image::load_from_memory(&artifact.bytes).unwrap().to_rgba8();
        // Stretched edge-to-edge: corners carry content, not padding.
        assert_eq!(decoded.get_pixel(0, 0)[3], 255);
        assert_eq!(decoded.get_pixel(299, 299), &Rgba([200, 40, 40, 255]));

        // Without the matching canvas, aspect ratio is preserved.
        let mut e2 = entry("no_stretch");
        e2.resize_mode = ResizeMode::FitBoth {
            width: 300,
            height: 300,
        };
        let artifact = engine().render(&source(600, 200), &e2).unwrap();
        assert_eq!((artifact.width, artifact.height), (300, 100));
    }

    #[test]
    fn opaque_without_fill_rejects_transparent_source() {
        let mut e = entry("flat");
        e.color_mode = ColorMode::Opaque;

        let transparent = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            10,
            10,
            Rgba([10, 10, 10, 128]),
        ));
        let err = engine().render(&transparent, &e).unwrap_err();
        assert!(matches!(err, RenderError::AlphaWithoutFill(_)));

        // A fully opaque source converts fine without a fill.
        assert!(engine().render(&source(10, 10), &e).is_ok());
    }

    #[test]
    fn missing_overlay_asset_fails_entry() {
        let mut e = entry("branded");
        e.overlay_icon = Some(OverlayIcon {
            path: PathBuf::from("missing_icon.png"),
            offset: (15, 15),
        });
        let err = engine().render(&source(100, 100), &e).unwrap_err();
        assert!(matches!(err, RenderError::OverlayAssetMissing(_)));
    }

    #[test]
    fn watermark_covers_full_canvas_without_icon() {
        let dir = tempfile::tempdir().unwrap();
        let wm_path = dir.path().join("wm.png");
        let wm = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 255, 255]));
        DynamicImage::ImageRgba8(wm).save(&wm_path).unwrap();

        let mut e = entry("watermarked");
        e.overlay_watermark = Some(wm_path);

        let engine = FormatRenderingEngine::new(dir.path().to_path_buf());
        let artifact = engine.render(&source(1000, 1000), &e).unwrap();
        let decoded = image::load_from_memory(&artifact.bytes).unwrap().to_rgba8();

        // Opaque watermark scaled full-bleed: every sampled pixel is
        // watermark blue, no icon artifact anywhere.
        for (x, y) in [(0, 0), (999, 0), (0, 999), (999, 999), (500, 500)] {
            assert_eq!(decoded.get_pixel(x, y), &Rgba([0, 0, 255, 255]));
        }
    }

    #[test]
    fn jpeg_output_is_opaque_and_stamped() {
        let mut e = entry("print");
        e.container_format = ContainerFormat::Jpeg;
        e.color_mode = ColorMode::Opaque;
        e.background_fill = Some([255, 255, 255]);
        e.dpi = 240;

        let artifact = engine().render(&source(64, 64), &e).unwrap();
        assert_eq!(&artifact.bytes[..2], &[0xFF, 0xD8]);
        let at = artifact
            .bytes
            .windows(5)
            .position(|w| w == b"JFIF\0")
            .unwrap();
        let density = u16::from_be_bytes([artifact.bytes[at + 8], artifact.bytes[at + 9]]);
        assert_eq!(density, 240);
    }

    #[test]
    fn trim_transparent_crops_to_content() {
        let mut img = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));
        for x in 3..=6 {
            for y in 2..=5 {
                img.put_pixel(x, y, Rgba([9, 9, 9, 255]));
            }
        }
        let trimmed = trim_transparent(&DynamicImage::ImageRgba8(img));
        assert_eq!((trimmed.width(), trimmed.height()), (4, 4));

        // Fully transparent input is returned as-is.
        let blank = DynamicImage::ImageRgba8(RgbaImage::new(5, 5));
        let out = trim_transparent(&blank);
        assert_eq!((out.width(), out.height()), (5, 5));
    }
}
