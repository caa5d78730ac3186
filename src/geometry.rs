//! Integer rectangles and disjoint rectangle sets used by the scaler.

/// Coordinates closer than this to an integer are treated as that integer when
/// computing containing rectangles, so `100 * 0.3` does not grow a pixel.
const SNAP_EPSILON: f64 = 1e-9;

/// Axis-aligned integer rectangle. Empty when either side is not positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Floating point rectangle, used for zoomed coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, clamp_i32(width), clamp_i32(height))
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width as u64 * self.height as u64
        }
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            Rect::default()
        } else {
            Rect::new(x, y, right - x, bottom - y)
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// The parts of `self` not covered by `other`, as at most four disjoint bands.
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let overlap = self.intersect(other);
        if overlap.is_empty() {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        }

        let mut pieces = Vec::with_capacity(4);
        // Full-width band above the overlap
        if overlap.y > self.y {
            pieces.push(Rect::new(self.x, self.y, self.width, overlap.y - self.y));
        }
        // Left and right of the overlap, limited to its rows
        if overlap.x > self.x {
            pieces.push(Rect::new(self.x, overlap.y, overlap.x - self.x, overlap.height));
        }
        if overlap.right() < self.right() {
            pieces.push(Rect::new(
                overlap.right(),
                overlap.y,
                self.right() - overlap.right(),
                overlap.height,
            ));
        }
        // Full-width band below the overlap
        if overlap.bottom() < self.bottom() {
            pieces.push(Rect::new(
                self.x,
                overlap.bottom(),
                self.width,
                self.bottom() - overlap.bottom(),
            ));
        }
        pieces
    }

    pub fn to_f(&self) -> RectF {
        RectF::new(
            f64::from(self.x),
            f64::from(self.y),
            f64::from(self.width),
            f64::from(self.height),
        )
    }
}

impl RectF {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn scaled(&self, factor: f64) -> RectF {
        RectF::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Smallest integer rectangle covering this one: floor the top-left corner,
    /// ceil the bottom-right corner.
    pub fn containing_rect(&self) -> Rect {
        if !(self.width > 0.0 && self.height > 0.0) {
            return Rect::default();
        }
        let left = snapped(self.x).floor();
        let top = snapped(self.y).floor();
        let right = snapped(self.x + self.width).ceil();
        let bottom = snapped(self.y + self.height).ceil();
        let left = saturate(left);
        let top = saturate(top);
        Rect::new(
            left,
            top,
            saturate(right).saturating_sub(left),
            saturate(bottom).saturating_sub(top),
        )
    }
}

fn snapped(value: f64) -> f64 {
    let rounded = value.round();
    if (value - rounded).abs() < SNAP_EPSILON {
        rounded
    } else {
        value
    }
}

fn saturate(value: f64) -> i32 {
    value.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// A set of pairwise disjoint rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Union `rect` into the region, keeping the stored rectangles disjoint.
    /// Returns the parts of `rect` that were not already covered.
    pub fn add(&mut self, rect: Rect) -> Vec<Rect> {
        let fresh = self.uncovered(rect);
        self.rects.extend_from_slice(&fresh);
        fresh
    }

    pub fn add_region(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add(*rect);
        }
    }

    /// Parts of `rect` outside the region.
    pub fn uncovered(&self, rect: Rect) -> Vec<Rect> {
        if rect.is_empty() {
            return Vec::new();
        }
        let mut remaining = vec![rect];
        for existing in &self.rects {
            remaining = remaining
                .iter()
                .flat_map(|piece| piece.subtract(existing))
                .collect();
            if remaining.is_empty() {
                break;
            }
        }
        remaining
    }

    pub fn subtract(&mut self, rect: &Rect) {
        self.rects = self
            .rects
            .iter()
            .flat_map(|existing| existing.subtract(rect))
            .collect();
    }

    pub fn intersected(&self, rect: &Rect) -> Region {
        Region {
            rects: self
                .rects
                .iter()
                .map(|r| r.intersect(rect))
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }
}
