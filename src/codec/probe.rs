//! Metadata probe: format, natural size and orientation of a byte stream.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{FormatTag, ImageCodec, JpegContent};
use crate::error::LoadError;
use crate::orientation::Orientation;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub format: FormatTag,
    /// Size as stored, before orientation. Scaled decodes are computed from it.
    pub raw_size: (u32, u32),
    /// Size as displayed.
    pub size: (u32, u32),
    pub orientation: Orientation,
    /// Present for JPEG streams.
    pub jpeg: Option<JpegContent>,
}

/// Sniff the container, read its dimensions and any embedded orientation.
///
/// A missing or unreadable orientation is not an error and leaves the image
/// unrotated. For JPEG streams the frame header is parsed as well and its
/// transposed size wins over the decoder's stored size.
pub fn probe_metadata(codec: &dyn ImageCodec, data: &Arc<[u8]>) -> Result<ProbeResult, LoadError> {
    let info = codec.probe(data)?;
    let embedded = codec.embedded_orientation(data);
    let orientation = embedded.unwrap_or_default();

    let (size, jpeg) = if info.format == FormatTag::Jpeg {
        let content = JpegContent::from_data(Arc::clone(data), embedded)?;
        if content.raw_size() != info.size {
            warn!(
                header = ?content.raw_size(),
                decoder = ?info.size,
                "JPEG frame header disagrees with decoder"
            );
        }
        (content.size(), Some(content))
    } else {
        (orientation.oriented_size(info.size), None)
    };

    debug!(format = %info.format, ?size, ?orientation, "Probed metadata");
    Ok(ProbeResult {
        format: info.format,
        raw_size: info.size,
        size,
        orientation,
        jpeg,
    })
}
