//! Shared geometry types
//!
//! Rectangles in root coordinates and the per-side insets a frame adds around
//! its client.

/// Window geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Geometry with the origin at (0, 0)
    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Grow this rectangle outwards by `insets`
    pub fn expand(&self, insets: Insets) -> Self {
        Self {
            x: self.x - insets.left as i32,
            y: self.y - insets.top as i32,
            width: self.width + insets.horizontal(),
            height: self.height + insets.vertical(),
        }
    }
}

/// Border thickness on each side of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Insets {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl Insets {
    pub fn uniform(size: u32) -> Self {
        Self {
            left: size,
            right: size,
            top: size,
            bottom: size,
        }
    }

    pub fn horizontal(&self) -> u32 {
        self.left + self.right
    }

    pub fn vertical(&self) -> u32 {
        self.top + self.bottom
    }
}
