//! Format sniffing and pixel decoding.
//!
//! This module provides:
//! - `ImageCodec` - the decoder capability the loading machine consumes
//! - `ImageRsCodec` - default implementation on top of the `image` crate,
//!   `jpeg-decoder` for reduced-size JPEG previews, `kamadak-exif` for
//!   orientation and `resvg` for vector documents
//! - `probe_metadata` / `decode_pixels` - the metadata probe and pixel decoder
//!   steps run by background tasks

pub mod decoder;
pub mod jpeg;
pub mod metadata;
pub mod probe;
pub mod svg;

use std::fmt;

use image::{DynamicImage, ImageFormat};

use crate::error::LoadError;
use crate::orientation::Orientation;

pub use decoder::decode_pixels;
pub use jpeg::JpegContent;
pub use probe::{probe_metadata, ProbeResult};

/// Video containers recognized well enough to report dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoContainer {
    Mp4,
    Matroska,
    Avi,
}

/// Detected container format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Tiff,
    Svg,
    Video(VideoContainer),
}

/// Which family of specialization a format ends up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Raster,
    Vector,
    Opaque,
}

impl FormatTag {
    pub fn kind(self) -> FormatKind {
        match self {
            FormatTag::Svg => FormatKind::Vector,
            FormatTag::Video(_) => FormatKind::Opaque,
            _ => FormatKind::Raster,
        }
    }

    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(FormatTag::Jpeg),
            ImageFormat::Png => Some(FormatTag::Png),
            ImageFormat::Gif => Some(FormatTag::Gif),
            ImageFormat::WebP => Some(FormatTag::WebP),
            ImageFormat::Bmp => Some(FormatTag::Bmp),
            ImageFormat::Tiff => Some(FormatTag::Tiff),
            _ => None,
        }
    }

    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            FormatTag::Jpeg => Some(ImageFormat::Jpeg),
            FormatTag::Png => Some(ImageFormat::Png),
            FormatTag::Gif => Some(ImageFormat::Gif),
            FormatTag::WebP => Some(ImageFormat::WebP),
            FormatTag::Bmp => Some(ImageFormat::Bmp),
            FormatTag::Tiff => Some(ImageFormat::Tiff),
            FormatTag::Svg | FormatTag::Video(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Jpeg => "jpeg",
            FormatTag::Png => "png",
            FormatTag::Gif => "gif",
            FormatTag::WebP => "webp",
            FormatTag::Bmp => "bmp",
            FormatTag::Tiff => "tiff",
            FormatTag::Svg => "svg",
            FormatTag::Video(VideoContainer::Mp4) => "mp4",
            FormatTag::Video(VideoContainer::Matroska) => "matroska",
            FormatTag::Video(VideoContainer::Avi) => "avi",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a codec reports about a byte stream without decoding pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub format: FormatTag,
    /// Size as stored, before any orientation is applied.
    pub size: (u32, u32),
}

/// Decoder capability used by the loading machine.
pub trait ImageCodec: Send + Sync {
    /// Identify the container and its stored dimensions.
    fn probe(&self, bytes: &[u8]) -> Result<FormatInfo, LoadError>;

    /// Orientation recorded in embedded metadata, if any.
    fn embedded_orientation(&self, bytes: &[u8]) -> Option<Orientation>;

    /// Whether `decode` can produce a reduced size directly.
    fn supports_scaled_decode(&self, _format: FormatTag) -> bool {
        false
    }

    /// Decode pixels as stored (no orientation applied). `target` is a reduced
    /// size request, only honored when `supports_scaled_decode` is true.
    fn decode(
        &self,
        bytes: &[u8],
        format: FormatTag,
        target: Option<(u32, u32)>,
    ) -> Result<DynamicImage, LoadError>;
}

/// Default codec backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageRsCodec;

impl ImageCodec for ImageRsCodec {
    fn probe(&self, bytes: &[u8]) -> Result<FormatInfo, LoadError> {
        let format = metadata::sniff_format(bytes).ok_or(LoadError::FormatUnrecognized)?;
        let size = metadata::stored_dimensions(bytes, format)?;
        Ok(FormatInfo { format, size })
    }

    fn embedded_orientation(&self, bytes: &[u8]) -> Option<Orientation> {
        metadata::exif_orientation(bytes)
    }

    fn supports_scaled_decode(&self, format: FormatTag) -> bool {
        format == FormatTag::Jpeg
    }

    fn decode(
        &self,
        bytes: &[u8],
        format: FormatTag,
        target: Option<(u32, u32)>,
    ) -> Result<DynamicImage, LoadError> {
        match target {
            Some(target) if format == FormatTag::Jpeg => {
                decoder::decode_jpeg_scaled(bytes, target)
            }
            _ => decoder::decode_image(bytes, format),
        }
    }
}
