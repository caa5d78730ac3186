//! Implementations a document switches to once loading is done.

use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use resvg::usvg;
use tracing::debug;

use super::DocumentImpl;
use crate::codec::{svg, FormatKind, FormatTag, JpegContent};
use crate::error::LoadError;
use crate::orientation::Orientation;

/// Pick the implementation for a format whose metadata is known.
///
/// JPEG streams keep their raw content for lossless edits; other raster
/// formats only keep pixels. Vector documents keep the parsed tree and video
/// containers keep nothing but their bytes.
pub(crate) fn specialize(
    format: FormatTag,
    data: Arc<[u8]>,
    jpeg: Option<JpegContent>,
) -> Result<DocumentImpl, LoadError> {
    let imp = match (format.kind(), jpeg) {
        (FormatKind::Vector, _) => DocumentImpl::Vector(VectorLoaded::new(data)?),
        (FormatKind::Opaque, _) => DocumentImpl::Opaque(OpaqueLoaded::new(format, data)),
        (FormatKind::Raster, Some(content)) => DocumentImpl::Jpeg(JpegLoaded::new(content)),
        (FormatKind::Raster, None) => DocumentImpl::Raster(RasterLoaded::new(format)),
    };
    debug!(%format, kind = ?imp.kind(), "Specialized document");
    Ok(imp)
}

/// Result of an orientation change on a loaded raster document.
pub(crate) struct Transformed {
    pub image: RgbaImage,
    /// New effective orientation, for formats that track one.
    pub orientation: Option<Orientation>,
    pub modified: bool,
}

/// A decoded raster image of any format other than JPEG.
#[derive(Debug)]
pub struct RasterLoaded {
    format: FormatTag,
    /// Orientation changes applied since load.
    applied: Orientation,
}

impl RasterLoaded {
    fn new(format: FormatTag) -> Self {
        Self {
            format,
            applied: Orientation::Normal,
        }
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    /// Rotate or flip the pixels. There is no lossless path, so the buffer is
    /// rewritten.
    pub(crate) fn apply_transform(&mut self, image: &RgbaImage, change: Orientation) -> Transformed {
        self.applied = self.applied.then(change);
        Transformed {
            image: change.apply_rgba(image),
            orientation: None,
            modified: self.applied != Orientation::Normal,
        }
    }
}

/// A decoded JPEG together with its raw stream.
#[derive(Debug)]
pub struct JpegLoaded {
    content: JpegContent,
}

impl JpegLoaded {
    fn new(content: JpegContent) -> Self {
        Self { content }
    }

    pub fn content(&self) -> &JpegContent {
        &self.content
    }

    pub fn orientation(&self) -> Orientation {
        self.content.orientation()
    }

    /// Compose `change` into the stored orientation. The compressed stream is
    /// untouched; only the displayed buffer is re-oriented.
    pub(crate) fn apply_transform(&mut self, image: &RgbaImage, change: Orientation) -> Transformed {
        self.content.transform(change);
        Transformed {
            image: change.apply_rgba(image),
            orientation: Some(self.content.orientation()),
            modified: self.content.is_modified(),
        }
    }
}

/// An SVG document, rasterized on demand.
pub struct VectorLoaded {
    data: Arc<[u8]>,
    tree: usvg::Tree,
}

impl VectorLoaded {
    fn new(data: Arc<[u8]>) -> Result<Self, LoadError> {
        let tree = svg::parse_tree(&data)?;
        Ok(Self { data, tree })
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn size(&self) -> (u32, u32) {
        let size = self.tree.size().to_int_size();
        (size.width(), size.height())
    }

    pub fn render(&self, zoom: f64) -> Result<RgbaImage, LoadError> {
        svg::render(&self.tree, zoom)
    }
}

impl fmt::Debug for VectorLoaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorLoaded")
            .field("bytes", &self.data.len())
            .field("size", &self.size())
            .finish()
    }
}

/// A container we can identify but not decode.
#[derive(Debug)]
pub struct OpaqueLoaded {
    format: FormatTag,
    data: Arc<[u8]>,
}

impl OpaqueLoaded {
    fn new(format: FormatTag, data: Arc<[u8]>) -> Self {
        Self { format, data }
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }
}
