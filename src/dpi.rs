//! DPI Metadata Stamping
//!
//! Writes the catalog DPI value into already-encoded artifacts so print
//! tooling picks up the intended physical size. Pixels are never resampled;
//! this is informational metadata only.
//!
//! PNG carries it as a `pHYs` chunk (pixels per meter), JPEG as the JFIF
//! APP0 density fields (dots per inch).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpiError {
    #[error("Not a PNG stream")]
    NotPng,

    #[error("Not a JPEG stream")]
    NotJpeg,

    #[error("Truncated image stream")]
    Truncated,
}

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Insert a `pHYs` chunk directly after IHDR. The encoder never emits one,
/// so no duplicate handling is needed.
pub fn stamp_png_dpi(png: &[u8], dpi: u32) -> Result<Vec<u8>, DpiError> {
    if png.len() < 33 || png[..8] != PNG_SIGNATURE {
        return Err(DpiError::NotPng);
    }
    // IHDR is mandated to be the first chunk: 4 length + 4 type + 13 data
    // + 4 CRC, ending at byte 33.
    let ihdr_len = u32::from_be_bytes([png[8], png[9], png[10], png[11]]) as usize;
    if &png[12..16] != b"IHDR" {
        return Err(DpiError::NotPng);
    }
    let insert_at = 8 + 4 + 4 + ihdr_len + 4;
    if png.len() < insert_at {
        return Err(DpiError::Truncated);
    }

    let ppm = pixels_per_meter(dpi);
    let mut chunk_body = Vec::with_capacity(13);
    chunk_body.extend_from_slice(b"pHYs");
    chunk_body.extend_from_slice(&ppm.to_be_bytes());
    chunk_body.extend_from_slice(&ppm.to_be_bytes());
    chunk_body.push(1); // unit: meter

    let mut out = Vec::with_capacity(png.len() + 21);
    out.extend_from_slice(&png[..insert_at]);
    out.extend_from_slice(&9u32.to_be_bytes());
    out.extend_from_slice(&chunk_body);
    out.extend_from_slice(&crc32(&chunk_body).to_be_bytes());
    out.extend_from_slice(&png[insert_at..]);
    Ok(out)
}

/// Patch the JFIF APP0 density fields in place, or insert a fresh APP0
/// segment after SOI when the encoder wrote none.
pub fn stamp_jpeg_dpi(jpeg: &[u8], dpi: u32) -> Result<Vec<u8>, DpiError> {
    if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return Err(DpiError::NotJpeg);
    }
    let density = dpi.min(u16::MAX as u32) as u16;

    // Walk marker segments looking for an existing JFIF APP0.
    let mut pos = 2usize;
    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            break;
        }
        let marker = jpeg[pos + 1];
        // SOS: entropy-coded data follows, stop scanning.
        if marker == 0xDA {
            break;
        }
        let seg_len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if seg_len < 2 || pos + 2 + seg_len > jpeg.len() {
            return Err(DpiError::Truncated);
        }
        if marker == 0xE0 && seg_len >= 14 && &jpeg[pos + 4..pos + 9] == b"JFIF\0" {
            let mut out = jpeg.to_vec();
            out[pos + 11] = 1; // density unit: dots per inch
            out[pos + 12..pos + 14].copy_from_slice(&density.to_be_bytes());
            out[pos + 14..pos + 16].copy_from_slice(&density.to_be_bytes());
            return Ok(out);
        }
        pos += 2 + seg_len;
    }

    // No JFIF header present: splice a minimal APP0 right after SOI.
    let mut segment = Vec::with_capacity(18);
    segment.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    segment.extend_from_slice(b"JFIF\0");
    segment.extend_from_slice(&[0x01, 0x01]); // version 1.1
    segment.push(1); // density unit: dots per inch
    segment.extend_from_slice(&density.to_be_bytes());
    segment.extend_from_slice(&density.to_be_bytes());
    segment.extend_from_slice(&[0x00, 0x00]); // no thumbnail

    let mut out = Vec::with_capacity(jpeg.len() + segment.len());
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&segment);
    out.extend_from_slice(&jpeg[2..]);
    Ok(out)
}

fn pixels_per_meter(dpi: u32) -> u32 {
    // 1 inch = 0.0254 m; round to nearest.
    ((dpi as u64 * 10_000 + 127) / 254) as u32
}

// Bitwise CRC-32 (zlib polynomial). Chunk bodies are 13 bytes; a table
// buys nothing here.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}
