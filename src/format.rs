//! Pixel format and data type definitions (§3, §4.5).
//!
//! `PixelFormat` and `PixelDataType` together determine the bits-per-pixel
//! of a tile via [`bits_per_pixel`], from which tile and selection byte
//! lengths are derived everywhere else in the crate.

use crate::error::{PxError, Result};

/// How each pixel's channels are laid out.
///
/// `YUV444`, `YUV422`, and `YUV420` are reserved by the wire format (they
/// have assigned enum discriminants so a mixed-version fabric can at least
/// recognize them) but are not implemented by this core; see spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelFormat {
    /// Red, green, blue, alpha.
    Rgba = 0,
    /// Red, green, blue.
    Rgb = 1,
    /// Single luminance channel.
    GrayScale = 2,
    /// Reserved, not implemented.
    Yuv444 = 3,
    /// Reserved, not implemented.
    Yuv422 = 4,
    /// Reserved, not implemented.
    Yuv420 = 5,
    /// 4x4-block compressed true color, 4 bits/pixel, `Uint8` data only.
    Dxt1 = 6,
}

impl PixelFormat {
    /// Decodes a format from its wire discriminant (one byte, §6.1).
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Rgba),
            1 => Ok(Self::Rgb),
            2 => Ok(Self::GrayScale),
            3 => Ok(Self::Yuv444),
            4 => Ok(Self::Yuv422),
            5 => Ok(Self::Yuv420),
            6 => Ok(Self::Dxt1),
            other => Err(PxError::Protocol(format!("unknown pixel format byte {other}"))),
        }
    }

    /// Encodes the format as its wire discriminant.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// True for the block-compressed format, which drives the special
    /// byte-coordinate math in [`crate::redistribution`].
    #[must_use]
    pub fn is_block_compressed(self) -> bool {
        matches!(self, Self::Dxt1)
    }
}

/// The scalar storage type of each pixel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelDataType {
    /// Unsigned 8-bit.
    U8 = 0,
    /// Unsigned 16-bit.
    U16 = 1,
    /// Unsigned 32-bit.
    U32 = 2,
    /// Unsigned 64-bit.
    U64 = 3,
    /// Signed 8-bit.
    I8 = 4,
    /// Signed 16-bit.
    I16 = 5,
    /// Signed 32-bit.
    I32 = 6,
    /// Signed 64-bit.
    I64 = 7,
    /// IEEE-754 single precision.
    F32 = 8,
    /// IEEE-754 double precision.
    F64 = 9,
}

impl PixelDataType {
    /// Decodes a data type from its wire discriminant (one byte, §6.1).
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::U8),
            1 => Ok(Self::U16),
            2 => Ok(Self::U32),
            3 => Ok(Self::U64),
            4 => Ok(Self::I8),
            5 => Ok(Self::I16),
            6 => Ok(Self::I32),
            7 => Ok(Self::I64),
            8 => Ok(Self::F32),
            9 => Ok(Self::F64),
            other => Err(PxError::Protocol(format!("unknown pixel data type byte {other}"))),
        }
    }

    /// Encodes the data type as its wire discriminant.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Size in bytes of one scalar of this type.
    #[must_use]
    pub fn size_bytes(self) -> u32 {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// Bits per pixel for a `(format, data_type)` pair (§4.5's format table).
///
/// `Dxt1` is fixed at 4 bits/pixel regardless of `data_type` (the original
/// requires `data_type == Uint8` for `Dxt1`; callers should validate that
/// separately via [`validate_format`]). The `YUV*` variants are reserved
/// and return 0, matching the original's empty `switch` arms.
#[must_use]
pub fn bits_per_pixel(format: PixelFormat, data_type: PixelDataType) -> u32 {
    match format {
        PixelFormat::GrayScale => data_type.size_bytes() * 8,
        PixelFormat::Rgb => 3 * data_type.size_bytes() * 8,
        PixelFormat::Rgba => 4 * data_type.size_bytes() * 8,
        PixelFormat::Dxt1 => 4,
        PixelFormat::Yuv444 | PixelFormat::Yuv422 | PixelFormat::Yuv420 => 0,
    }
}

/// Validates that a `(format, data_type)` pair is supported by this core.
///
/// `Dxt1` requires `Uint8` storage; the reserved `YUV*` formats are never
/// supported, regardless of data type.
pub fn validate_format(format: PixelFormat, data_type: PixelDataType) -> Result<()> {
    let unsupported = matches!(
        format,
        PixelFormat::Yuv444 | PixelFormat::Yuv422 | PixelFormat::Yuv420
    ) || (format == PixelFormat::Dxt1 && data_type != PixelDataType::U8);

    if unsupported {
        Err(PxError::UnsupportedFormat(format, data_type))
    } else {
        Ok(())
    }
}

/// Tile byte length: `ceil(width * height * bits_per_pixel / 8)` (§4.5).
#[must_use]
pub fn tile_byte_length(width: u32, height: u32, format: PixelFormat, data_type: PixelDataType) -> u32 {
    let bpp = bits_per_pixel(format, data_type) as u64;
    let bits = width as u64 * height as u64 * bpp;
    ((bits + 7) / 8) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_u8_is_four_bytes_per_pixel() {
        assert_eq!(bits_per_pixel(PixelFormat::Rgba, PixelDataType::U8), 32);
        assert_eq!(tile_byte_length(16, 16, PixelFormat::Rgba, PixelDataType::U8), 16 * 16 * 4);
    }

    #[test]
    fn grayscale_u16_is_two_bytes_per_pixel() {
        assert_eq!(bits_per_pixel(PixelFormat::GrayScale, PixelDataType::U16), 16);
        assert_eq!(tile_byte_length(10, 10, PixelFormat::GrayScale, PixelDataType::U16), 200);
    }

    #[test]
    fn dxt1_is_four_bits_per_pixel() {
        assert_eq!(bits_per_pixel(PixelFormat::Dxt1, PixelDataType::U8), 4);
        // 8x8 DXT1 = 8*8*4/8 = 32 bytes = two 4x4 blocks of 8 bytes... actually
        // four blocks of 8 bytes each for an 8x8 region.
        assert_eq!(tile_byte_length(8, 8, PixelFormat::Dxt1, PixelDataType::U8), 32);
    }

    #[test]
    fn dxt1_requires_u8() {
        assert!(validate_format(PixelFormat::Dxt1, PixelDataType::F32).is_err());
        assert!(validate_format(PixelFormat::Dxt1, PixelDataType::U8).is_ok());
    }

    #[test]
    fn yuv_formats_are_unsupported() {
        assert!(validate_format(PixelFormat::Yuv420, PixelDataType::U8).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        for b in 0..=6u8 {
            let fmt = PixelFormat::from_wire(b).unwrap();
            assert_eq!(fmt.to_wire(), b);
        }
        for b in 0..=9u8 {
            let dt = PixelDataType::from_wire(b).unwrap();
            assert_eq!(dt.to_wire(), b);
        }
    }
}
