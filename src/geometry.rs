//! Rectangle types shared by tiles and selections (§3).

use crate::error::{PxError, Result};
use crate::format::PixelFormat;

/// A pixel-space rectangle: either a producer's owned [`Tile`] or a
/// consumer's requested subregion ([`crate::consumer::ConsumerSelection`]).
///
/// All four fields are in pixels, non-negative, and (when validated against
/// a global image) fit entirely inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// X offset in pixels from the global image's left edge.
    pub offset_x: u32,
    /// Y offset in pixels from the global image's top edge.
    pub offset_y: u32,
}

impl Rect {
    /// Creates a new rectangle.
    #[must_use]
    pub fn new(width: u32, height: u32, offset_x: u32, offset_y: u32) -> Self {
        Self { width, height, offset_x, offset_y }
    }

    /// Validates that this rectangle lies entirely inside a
    /// `global_width x global_height` image and, for `Dxt1`, that its size
    /// and offset are 4-pixel aligned in both dimensions.
    pub fn validate(&self, global_width: u32, global_height: u32, format: PixelFormat) -> Result<()> {
        if self.offset_x.saturating_add(self.width) > global_width
            || self.offset_y.saturating_add(self.height) > global_height
        {
            return Err(PxError::InvalidGeometry(format!(
                "rectangle {self:?} exceeds global image bounds {global_width}x{global_height}"
            )));
        }
        if format.is_block_compressed()
            && (self.width % 4 != 0
                || self.height % 4 != 0
                || self.offset_x % 4 != 0
                || self.offset_y % 4 != 0)
        {
            return Err(PxError::InvalidGeometry(format!(
                "DXT1 rectangle {self:?} is not 4-pixel aligned"
            )));
        }
        Ok(())
    }
}
