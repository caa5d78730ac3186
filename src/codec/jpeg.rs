//! Raw JPEG content kept alongside the decoded pixels.
//!
//! Holding on to the original stream lets a JPEG document change its
//! orientation losslessly: only the orientation tag changes, never the
//! compressed scan data.

use std::sync::Arc;

use tracing::trace;

use crate::error::LoadError;
use crate::orientation::Orientation;

const SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Debug, Clone)]
pub struct JpegContent {
    data: Arc<[u8]>,
    /// Frame size from the SOF header, as stored.
    raw_size: (u32, u32),
    /// Orientation found in the stream.
    embedded_orientation: Orientation,
    /// Orientation after lossless edits.
    orientation: Orientation,
    has_exif: bool,
}

impl JpegContent {
    /// Parse the frame header. Fails when the stream has no SOI marker or no
    /// frame header before the scan data.
    pub fn from_data(
        data: Arc<[u8]>,
        orientation: Option<Orientation>,
    ) -> Result<Self, LoadError> {
        let raw_size = frame_size(&data)?;
        trace!(?raw_size, ?orientation, "Parsed JPEG frame header");
        let embedded = orientation.unwrap_or_default();
        Ok(Self {
            data,
            raw_size,
            embedded_orientation: embedded,
            orientation: embedded,
            has_exif: orientation.is_some(),
        })
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn raw_size(&self) -> (u32, u32) {
        self.raw_size
    }

    /// Displayed size: the frame size transposed when the orientation swaps axes.
    pub fn size(&self) -> (u32, u32) {
        self.orientation.oriented_size(self.raw_size)
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn embedded_orientation(&self) -> Orientation {
        self.embedded_orientation
    }

    pub fn has_exif(&self) -> bool {
        self.has_exif
    }

    /// Apply `change` on top of the current orientation.
    pub fn transform(&mut self, change: Orientation) {
        self.orientation = self.orientation.then(change);
    }

    pub fn is_modified(&self) -> bool {
        self.orientation != self.embedded_orientation
    }
}

fn frame_size(data: &[u8]) -> Result<(u32, u32), LoadError> {
    let invalid = |what: &str| LoadError::Decode(format!("Invalid JPEG stream: {}", what));

    if !data.starts_with(&SOI) {
        return Err(invalid("missing SOI marker"));
    }

    let mut pos = 2;
    loop {
        // Skip fill bytes before the marker code
        while data.get(pos) == Some(&0xFF) && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if data.get(pos) != Some(&0xFF) {
            return Err(invalid("expected marker"));
        }
        let marker = *data.get(pos + 1).ok_or_else(|| invalid("truncated marker"))?;
        pos += 2;

        match marker {
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            0xD9 | 0xDA => return Err(invalid("no frame header before scan")),
            _ => {}
        }

        let length = data
            .get(pos..pos + 2)
            .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
            .ok_or_else(|| invalid("truncated segment"))?;
        if length < 2 {
            return Err(invalid("bad segment length"));
        }

        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let header = data
                .get(pos + 3..pos + 7)
                .ok_or_else(|| invalid("truncated frame header"))?;
            let height = u32::from(u16::from_be_bytes([header[0], header[1]]));
            let width = u32::from(u16::from_be_bytes([header[2], header[3]]));
            return Ok((width, height));
        }

        pos += length;
    }
}
