//! Integer and floating point geometry used for surface placement
//!
//! Positions and sizes are in buffer pixels unless a method says otherwise.

/// A point in surface or layer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero or negative
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of pixels covered
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width as usize * self.height as usize
        }
    }
}

/// An integer rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_origin_size(origin: Point, size: Size) -> Self {
        Self::new(origin.x, origin.y, size.width, size.height)
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Check if a point is inside the rectangle
    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// Intersection of two rectangles, empty (zero sized) when disjoint
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            return Rect::new(x, y, 0, 0);
        }
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Rectangle moved by the given offset
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// A floating point rectangle, used for viewport sources
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RectF {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<Rect> for RectF {
    fn from(rect: Rect) -> Self {
        RectF::new(
            rect.x as f64,
            rect.y as f64,
            rect.width as f64,
            rect.height as f64,
        )
    }
}

/// A rectilinear 2-D transform: axis-aligned scale followed by translation
///
/// Rotations and shears cannot be expressed by sub-surfaces and are rejected
/// by [`Transform2D::from_matrix`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2D {
    pub scale_x: f64,
    pub scale_y: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform2D {
    pub const IDENTITY: Transform2D = Transform2D {
        scale_x: 1.0,
        scale_y: 1.0,
        translate_x: 0.0,
        translate_y: 0.0,
    };

    pub fn translation(x: f64, y: f64) -> Self {
        Self {
            translate_x: x,
            translate_y: y,
            ..Self::IDENTITY
        }
    }

    pub fn scale(scale_x: f64, scale_y: f64) -> Self {
        Self {
            scale_x,
            scale_y,
            ..Self::IDENTITY
        }
    }

    /// Build from an affine matrix `[a b c d tx ty]`
    ///
    /// Returns `None` for anything that is not rectilinear with a positive
    /// scale (flips are carried separately on the layer).
    pub fn from_matrix(m: [f64; 6]) -> Option<Self> {
        let [a, b, c, d, tx, ty] = m;
        if b != 0.0 || c != 0.0 || a <= 0.0 || d <= 0.0 {
            return None;
        }
        Some(Self {
            scale_x: a,
            scale_y: d,
            translate_x: tx,
            translate_y: ty,
        })
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Apply the transform to a rectangle, snapping the result outward to
    /// whole pixels
    pub fn map_rect(&self, rect: Rect) -> Rect {
        let x0 = rect.x as f64 * self.scale_x + self.translate_x;
        let y0 = rect.y as f64 * self.scale_y + self.translate_y;
        let x1 = rect.right() as f64 * self.scale_x + self.translate_x;
        let y1 = rect.bottom() as f64 * self.scale_y + self.translate_y;
        let left = x0.min(x1).floor() as i32;
        let top = y0.min(y1).floor() as i32;
        let right = x0.max(x1).ceil() as i32;
        let bottom = y0.max(y1).ceil() as i32;
        Rect::new(left, top, right - left, bottom - top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersect() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 25, 100, 100);
        assert_eq!(a.intersect(&b), Rect::new(50, 25, 50, 75));

        let c = Rect::new(200, 200, 10, 10);
        assert!(a.intersect(&c).is_empty());
    }

    #[test]
    fn test_rect_contains() {
        let rect = Rect::new(10, 10, 20, 20);
        assert!(rect.contains(10, 10));
        assert!(!rect.contains(30, 30));
    }

    #[test]
    fn test_transform_rejects_rotation() {
        assert!(Transform2D::from_matrix([0.0, 1.0, -1.0, 0.0, 0.0, 0.0]).is_none());
        assert!(Transform2D::from_matrix([-1.0, 0.0, 0.0, 1.0, 0.0, 0.0]).is_none());
        assert!(Transform2D::from_matrix([2.0, 0.0, 0.0, 2.0, 5.0, 5.0]).is_some());
    }

    #[test]
    fn test_transform_map_rect() {
        let t = Transform2D {
            scale_x: 2.0,
            scale_y: 0.5,
            translate_x: 10.0,
            translate_y: 4.0,
        };
        let mapped = t.map_rect(Rect::new(0, 0, 64, 64));
        assert_eq!(mapped, Rect::new(10, 4, 128, 32));
        assert_eq!(Transform2D::IDENTITY.map_rect(mapped), mapped);
    }
}
