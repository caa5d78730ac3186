//! Pixel decoding.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, GrayImage, RgbImage, RgbaImage};
use jpeg_decoder::PixelFormat;
use tracing::{debug, trace};

use super::{FormatKind, FormatTag, ImageCodec};
use crate::error::LoadError;
use crate::orientation::Orientation;

/// Decode a raster stream as stored. GIFs yield their first frame.
pub fn decode_image(bytes: &[u8], format: FormatTag) -> Result<DynamicImage, LoadError> {
    let decode_err = |e: image::ImageError| LoadError::Decode(e.to_string());

    if format == FormatTag::Gif {
        let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(decode_err)?;
        let frame = decoder
            .into_frames()
            .next()
            .ok_or_else(|| LoadError::Decode("GIF has no frames".into()))?
            .map_err(decode_err)?;
        return Ok(DynamicImage::ImageRgba8(frame.into_buffer()));
    }

    let image_format = format
        .image_format()
        .ok_or_else(|| LoadError::Decode(format!("{} is not a raster format", format)))?;
    image::load_from_memory_with_format(bytes, image_format).map_err(decode_err)
}

/// Decode a JPEG at `target` size (stored coordinates).
///
/// The decoder drops DCT coefficients to produce the smallest 1/1 to 1/8
/// scale that still covers `target`; that output is then resized to exactly
/// `target`. CMYK and 16-bit streams are decoded at full size and resized.
pub fn decode_jpeg_scaled(bytes: &[u8], target: (u32, u32)) -> Result<DynamicImage, LoadError> {
    let decode_err = |e: jpeg_decoder::Error| LoadError::Decode(e.to_string());
    let short_buffer = || LoadError::Decode("JPEG decoder returned a short buffer".into());
    let clamp = |v: u32| u16::try_from(v.max(1)).unwrap_or(u16::MAX);

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
    decoder.read_info().map_err(decode_err)?;
    let (width, height) = decoder
        .scale(clamp(target.0), clamp(target.1))
        .map_err(decode_err)?;
    let pixels = decoder.decode().map_err(decode_err)?;
    let pixel_format = decoder
        .info()
        .map(|info| info.pixel_format)
        .ok_or_else(|| LoadError::Decode("JPEG header missing".into()))?;
    let (width, height) = (u32::from(width), u32::from(height));
    trace!(?target, width, height, ?pixel_format, "Scaled JPEG decode");

    let image = match pixel_format {
        PixelFormat::RGB24 => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, pixels).ok_or_else(short_buffer)?,
        ),
        PixelFormat::L8 => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, pixels).ok_or_else(short_buffer)?,
        ),
        _ => decode_image(bytes, FormatTag::Jpeg)?,
    };

    if (image.width(), image.height()) == target {
        Ok(image)
    } else {
        Ok(image.resize_exact(target.0, target.1, FilterType::Triangle))
    }
}

/// Target size for a reduced-resolution decode, in stored (un-rotated)
/// coordinates.
pub fn scaled_target(raw_size: (u32, u32), inverted_zoom: u32) -> Option<(u32, u32)> {
    if inverted_zoom <= 1 {
        return None;
    }
    let (w, h) = raw_size;
    Some(((w / inverted_zoom).max(1), (h / inverted_zoom).max(1)))
}

/// Decode `bytes` into an orientation-corrected RGBA buffer.
///
/// When `inverted_zoom` is above 1 and the codec can decode at a reduced size,
/// that size is requested directly; otherwise the full resolution is decoded.
pub fn decode_pixels(
    codec: &dyn ImageCodec,
    bytes: &[u8],
    format: FormatTag,
    raw_size: (u32, u32),
    orientation: Orientation,
    inverted_zoom: u32,
) -> Result<RgbaImage, LoadError> {
    if format.kind() != FormatKind::Raster {
        return Err(LoadError::Decode(format!("{} has no pixel data", format)));
    }

    let target = if codec.supports_scaled_decode(format) {
        scaled_target(raw_size, inverted_zoom)
    } else {
        None
    };
    trace!(%format, inverted_zoom, ?target, "Decoding pixels");

    let decoded = codec.decode(bytes, format, target)?;
    let oriented = orientation.apply(decoded);
    debug!(
        width = oriented.width(),
        height = oriented.height(),
        %format,
        "Decoded image"
    );
    Ok(oriented.into_rgba8())
}
