//! Render target dimensions.

use crate::error::{Error, Result};
use std::fmt;

/// Width and height of a render target or presentation surface, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// Create a new extent.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if both dimensions are non-zero.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Number of pixels covered.
    #[inline]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width divided by height; zero for an invalid extent.
    pub fn aspect_ratio(self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }

    /// Return `self` if drawable, otherwise an `InvalidExtent` error.
    pub const fn validated(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(Error::InvalidExtent {
                width: self.width,
                height: self.height,
            })
        }
    }

    /// Prefer `self`, falling back to `fallback` when `self` has a zero side.
    #[inline]
    pub const fn or(self, fallback: Self) -> Self {
        if self.is_valid() {
            self
        } else {
            fallback
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Extent {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(Extent::new(800, 600).is_valid());
        assert!(!Extent::new(0, 600).is_valid());
        assert!(!Extent::default().is_valid());
        assert_eq!(
            Extent::new(0, 10).validated(),
            Err(Error::InvalidExtent {
                width: 0,
                height: 10
            })
        );
    }

    #[test]
    fn fallback_prefers_valid_extent() {
        let current = Extent::new(1920, 1080);
        assert_eq!(Extent::default().or(current), current);
        assert_eq!(Extent::new(640, 480).or(current), Extent::new(640, 480));
    }

    #[test]
    fn display_and_area() {
        let extent = Extent::from((1920, 1080));
        assert_eq!(extent.to_string(), "1920x1080");
        assert_eq!(extent.area(), 2_073_600);
        assert!((extent.aspect_ratio() - 16.0 / 9.0).abs() < 1e-6);
    }
}
