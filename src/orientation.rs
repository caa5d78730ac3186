//! EXIF orientation handling.
//!
//! An orientation is stored as a mirror flag plus a number of clockwise quarter
//! turns, applied in that order (mirror first). The eight EXIF codes map onto
//! the eight combinations, which makes composition a closed operation.

use image::{imageops, DynamicImage, RgbaImage};
use tracing::warn;

use crate::error::OrientationError;

/// EXIF orientation tag values (0x0112).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90,
    Transverse,
    Rotate270,
}

/// Mirror + rotation decomposition of an orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    /// Flip horizontally before rotating.
    pub mirror: bool,
    /// Clockwise quarter turns, 0..=3.
    pub quarter_turns: u8,
}

impl Orientation {
    pub const ALL: [Orientation; 8] = [
        Orientation::Normal,
        Orientation::FlipHorizontal,
        Orientation::Rotate180,
        Orientation::FlipVertical,
        Orientation::Transpose,
        Orientation::Rotate90,
        Orientation::Transverse,
        Orientation::Rotate270,
    ];

    /// Map an EXIF orientation code. Values outside 1..=8 are not orientations.
    pub fn from_exif(code: u32) -> Option<Self> {
        match code {
            1 => Some(Orientation::Normal),
            2 => Some(Orientation::FlipHorizontal),
            3 => Some(Orientation::Rotate180),
            4 => Some(Orientation::FlipVertical),
            5 => Some(Orientation::Transpose),
            6 => Some(Orientation::Rotate90),
            7 => Some(Orientation::Transverse),
            8 => Some(Orientation::Rotate270),
            _ => None,
        }
    }

    pub fn exif_code(self) -> u16 {
        match self {
            Orientation::Normal => 1,
            Orientation::FlipHorizontal => 2,
            Orientation::Rotate180 => 3,
            Orientation::FlipVertical => 4,
            Orientation::Transpose => 5,
            Orientation::Rotate90 => 6,
            Orientation::Transverse => 7,
            Orientation::Rotate270 => 8,
        }
    }

    pub fn transform(self) -> Transform {
        let (mirror, quarter_turns) = match self {
            Orientation::Normal => (false, 0),
            Orientation::Rotate90 => (false, 1),
            Orientation::Rotate180 => (false, 2),
            Orientation::Rotate270 => (false, 3),
            Orientation::FlipHorizontal => (true, 0),
            Orientation::Transverse => (true, 1),
            Orientation::FlipVertical => (true, 2),
            Orientation::Transpose => (true, 3),
        };
        Transform {
            mirror,
            quarter_turns,
        }
    }

    pub fn from_transform(transform: Transform) -> Self {
        match (transform.mirror, transform.quarter_turns % 4) {
            (false, 0) => Orientation::Normal,
            (false, 1) => Orientation::Rotate90,
            (false, 2) => Orientation::Rotate180,
            (false, _) => Orientation::Rotate270,
            (true, 0) => Orientation::FlipHorizontal,
            (true, 1) => Orientation::Transverse,
            (true, 2) => Orientation::FlipVertical,
            (true, _) => Orientation::Transpose,
        }
    }

    /// The orientation equivalent to applying `self` and then `next`.
    pub fn then(self, next: Orientation) -> Orientation {
        let a = self.transform();
        let b = next.transform();
        // Mirroring reverses the direction of any rotation applied before it.
        let carried = if b.mirror {
            (4 - a.quarter_turns) % 4
        } else {
            a.quarter_turns
        };
        Orientation::from_transform(Transform {
            mirror: a.mirror ^ b.mirror,
            quarter_turns: (carried + b.quarter_turns) % 4,
        })
    }

    /// Whether displaying with this orientation exchanges width and height.
    pub fn swaps_dimensions(self) -> bool {
        self.transform().quarter_turns % 2 == 1
    }

    /// Size after orientation, given the stored (un-rotated) size.
    pub fn oriented_size(self, (width, height): (u32, u32)) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Clockwise rotation angle in degrees, for consumers that can only rotate.
    pub fn rotation_angle(self) -> Result<u16, OrientationError> {
        let t = self.transform();
        if t.mirror {
            return Err(OrientationError::Unsupported(self.exif_code()));
        }
        Ok(u16::from(t.quarter_turns) * 90)
    }

    /// Like `rotation_angle`, but mirrored orientations degrade to no rotation.
    pub fn rotation_angle_or_zero(self) -> u16 {
        match self.rotation_angle() {
            Ok(angle) => angle,
            Err(e) => {
                warn!(orientation = ?self, "{}", e);
                0
            }
        }
    }

    pub fn apply(self, img: DynamicImage) -> DynamicImage {
        let t = self.transform();
        let img = if t.mirror { img.fliph() } else { img };
        match t.quarter_turns {
            1 => img.rotate90(),
            2 => img.rotate180(),
            3 => img.rotate270(),
            _ => img,
        }
    }

    pub fn apply_rgba(self, img: &RgbaImage) -> RgbaImage {
        let t = self.transform();
        let mirrored;
        let src = if t.mirror {
            mirrored = imageops::flip_horizontal(img);
            &mirrored
        } else {
            img
        };
        match t.quarter_turns {
            1 => imageops::rotate90(src),
            2 => imageops::rotate180(src),
            3 => imageops::rotate270(src),
            _ => src.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn marker_image() -> RgbaImage {
        // 3x2, every pixel distinct
        RgbaImage::from_fn(3, 2, |x, y| Rgba([(x * 40) as u8, (y * 90) as u8, 7, 255]))
    }

    #[test]
    fn test_exif_codes_round_trip() {
        for o in Orientation::ALL {
            assert_eq!(Orientation::from_exif(u32::from(o.exif_code())), Some(o));
        }
        assert_eq!(Orientation::from_exif(0), None);
        assert_eq!(Orientation::from_exif(9), None);
    }

    #[test]
    fn test_transpose_swaps_coordinates() {
        let src = marker_image();
        let out = Orientation::Transpose.apply_rgba(&src);
        assert_eq!(out.dimensions(), (2, 3));
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(out.get_pixel(y, x), src.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_transverse_mapping() {
        let src = marker_image();
        let out = Orientation::Transverse.apply_rgba(&src);
        let (w, h) = src.dimensions();
        for y in 0..h {
            for x in 0..w {
                assert_eq!(out.get_pixel(h - 1 - y, w - 1 - x), src.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_then_matches_sequential_application() {
        let src = marker_image();
        for a in Orientation::ALL {
            for b in Orientation::ALL {
                let sequential = b.apply_rgba(&a.apply_rgba(&src));
                let composed = a.then(b).apply_rgba(&src);
                assert_eq!(sequential, composed, "{:?} then {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_dynamic_and_rgba_paths_agree() {
        let src = marker_image();
        for o in Orientation::ALL {
            let dynamic = o.apply(DynamicImage::ImageRgba8(src.clone())).to_rgba8();
            assert_eq!(dynamic, o.apply_rgba(&src));
        }
    }

    #[test]
    fn test_rotation_angles() {
        assert_eq!(Orientation::Normal.rotation_angle(), Ok(0));
        assert_eq!(Orientation::Rotate90.rotation_angle(), Ok(90));
        assert_eq!(Orientation::Rotate180.rotation_angle(), Ok(180));
        assert_eq!(Orientation::Rotate270.rotation_angle(), Ok(270));
        assert_eq!(
            Orientation::FlipVertical.rotation_angle(),
            Err(OrientationError::Unsupported(4))
        );
        assert_eq!(Orientation::Transpose.rotation_angle_or_zero(), 0);
    }

    #[test]
    fn test_oriented_size() {
        assert_eq!(Orientation::Rotate90.oriented_size((40, 30)), (30, 40));
        assert_eq!(Orientation::Transverse.oriented_size((40, 30)), (30, 40));
        assert_eq!(Orientation::FlipVertical.oriented_size((40, 30)), (40, 30));
    }
}
