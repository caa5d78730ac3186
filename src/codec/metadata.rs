//! Header-level metadata extraction.
//!
//! Reads only what is needed to name the container and report its stored
//! dimensions; no pixel data is decoded here.

use std::io::Cursor;

use exif::{In, Reader, Tag};
use image::ImageReader;
use tracing::{debug, trace};

use super::{svg, FormatTag, VideoContainer};
use crate::error::LoadError;
use crate::orientation::Orientation;

/// Placeholder dimension for containers whose size could not be parsed.
pub const UNKNOWN_DIMENSION: u32 = 0;

/// Upper bound accepted for a parsed video dimension.
const MAX_VIDEO_DIMENSION: u32 = 65536;

/// Identify the container format from magic bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<FormatTag> {
    if let Some(format) = image::guess_format(bytes)
        .ok()
        .and_then(FormatTag::from_image_format)
    {
        return Some(format);
    }
    if svg::looks_like_svg(bytes) {
        return Some(FormatTag::Svg);
    }
    sniff_video(bytes).map(FormatTag::Video)
}

fn sniff_video(bytes: &[u8]) -> Option<VideoContainer> {
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some(VideoContainer::Mp4);
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(VideoContainer::Matroska);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"AVI " {
        return Some(VideoContainer::Avi);
    }
    None
}

/// Dimensions as stored in the container, before orientation.
pub fn stored_dimensions(bytes: &[u8], format: FormatTag) -> Result<(u32, u32), LoadError> {
    match format {
        FormatTag::Svg => svg::intrinsic_size(bytes),
        FormatTag::Video(container) => Ok(video_dimensions(bytes, container)),
        _ => raster_dimensions(bytes, format),
    }
}

fn raster_dimensions(bytes: &[u8], format: FormatTag) -> Result<(u32, u32), LoadError> {
    let mut reader = ImageReader::new(Cursor::new(bytes));
    if let Some(image_format) = format.image_format() {
        reader.set_format(image_format);
    }
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| LoadError::Decode(e.to_string()))?;
    trace!(width, height, %format, "Read raster dimensions");
    Ok((width, height))
}

/// EXIF orientation embedded in the container, if present and valid.
pub fn exif_orientation(bytes: &[u8]) -> Option<Orientation> {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(e) => {
            trace!(error = %e, "No readable EXIF data");
            return None;
        }
    };
    let code = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))?;
    let orientation = Orientation::from_exif(code);
    if orientation.is_none() {
        debug!(code, "Ignoring out-of-range EXIF orientation");
    }
    orientation
}

fn video_dimensions(bytes: &[u8], container: VideoContainer) -> (u32, u32) {
    let parsed = match container {
        VideoContainer::Mp4 => parse_mp4_dimensions(bytes),
        VideoContainer::Matroska => parse_matroska_dimensions(bytes),
        VideoContainer::Avi => parse_avi_dimensions(bytes),
    };
    match parsed {
        Some((w, h)) => (w, h),
        None => {
            debug!(?container, "Could not parse video dimensions");
            (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION)
        }
    }
}

fn plausible(width: u32, height: u32) -> bool {
    width > 0 && height > 0 && width < MAX_VIDEO_DIMENSION && height < MAX_VIDEO_DIMENSION
}

fn be_u16(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 2)
        .map(|b| u32::from(u16::from_be_bytes([b[0], b[1]])))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_i32(data: &[u8], at: usize) -> Option<i32> {
    data.get(at..at + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// MP4/MOV: the `tkhd` box stores width and height as 16.16 fixed point at
/// offset 76 (version 0) or 88 (version 1) from the box type. Falls back to
/// the visual sample entry in `stsd`.
fn parse_mp4_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    for i in 0..data.len().saturating_sub(4) {
        if &data[i..i + 4] != b"tkhd" {
            continue;
        }
        let offset = if data.get(i + 4) == Some(&0) {
            i + 76
        } else {
            i + 88
        };
        if let (Some(w), Some(h)) = (be_u32(data, offset), be_u32(data, offset + 4)) {
            let (width, height) = (w >> 16, h >> 16);
            // Audio tracks carry a zero-sized tkhd; keep looking.
            if plausible(width, height) {
                trace!(width, height, "MP4 tkhd dimensions");
                return Some((width, height));
            }
        }
    }

    for i in 0..data.len().saturating_sub(4) {
        let tag = &data[i..i + 4];
        if tag == b"avc1" || tag == b"hvc1" || tag == b"mp4v" || tag == b"vp09" {
            if let (Some(width), Some(height)) = (be_u16(data, i + 28), be_u16(data, i + 30)) {
                if plausible(width, height) {
                    trace!(width, height, "MP4 sample entry dimensions");
                    return Some((width, height));
                }
            }
        }
    }
    None
}

/// Reads an EBML variable-length integer, returning (value, encoded length).
fn read_vint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    let bytes = data.get(..len)?;
    let mut value = u64::from(first) & ((1u64 << (8 - len)) - 1);
    for &b in &bytes[1..] {
        value = (value << 8) | u64::from(b);
    }
    Some((value, len))
}

/// Matroska/WebM: PixelWidth (0xB0) and PixelHeight (0xBA) elements of the
/// video track. Pattern search rather than a full EBML walk.
fn parse_matroska_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let read_uint_element = |at: usize| -> Option<u32> {
        let (size, size_len) = read_vint(data.get(at..)?)?;
        if size == 0 || size > 4 {
            return None;
        }
        let start = at + size_len;
        let payload = data.get(start..start + size as usize)?;
        let value = payload.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        (value > 0 && value < MAX_VIDEO_DIMENSION).then_some(value)
    };

    let mut width = None;
    let mut height = None;
    for i in 0..data.len() {
        match data[i] {
            0xB0 if width.is_none() => width = read_uint_element(i + 1),
            0xBA if height.is_none() => height = read_uint_element(i + 1),
            _ => {}
        }
        if let (Some(w), Some(h)) = (width, height) {
            trace!(w, h, "Matroska dimensions");
            return Some((w, h));
        }
    }
    None
}

/// AVI: BITMAPINFOHEADER inside the `strf` chunk; biWidth at +4, biHeight at
/// +8 (negative for top-down bitmaps).
fn parse_avi_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    for i in 0..data.len().saturating_sub(4) {
        if &data[i..i + 4] != b"strf" {
            continue;
        }
        let header = i + 8;
        if let (Some(w), Some(h)) = (le_i32(data, header + 4), le_i32(data, header + 8)) {
            let (width, height) = (w.unsigned_abs(), h.unsigned_abs());
            if plausible(width, height) {
                trace!(width, height, "AVI dimensions");
                return Some((width, height));
            }
        }
    }
    None
}
