//! Error types for the pixel-streaming fabric.

use std::io;
use thiserror::Error;

/// Result type for pxstream operations.
pub type Result<T> = std::result::Result<T, PxError>;

/// Errors that can occur while bootstrapping, streaming, or redistributing
/// pixels across the producer/consumer fabric.
#[derive(Debug, Error)]
pub enum PxError {
    /// I/O error occurred on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A framed message did not have the expected length or shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No port in the configured `[port_min, port_max]` range could be bound.
    #[error("could not bind to any port in range {0}..={1}")]
    PortRangeExhausted(u16, u16),

    /// The consumer-group size embedded in the handshake did not match the
    /// producer group's size.
    #[error("handshake consumer-group size mismatch: producer group has {expected} ranks, handshake reported {actual}")]
    ConsumerGroupMismatch {
        /// Size of the producer group.
        expected: u32,
        /// Size reported by the handshake.
        actual: u32,
    },

    /// The requested pixel format / data type combination is not supported
    /// by the format table (see §4.5).
    #[error("unsupported pixel format/data-type combination: {0:?}/{1:?}")]
    UnsupportedFormat(crate::format::PixelFormat, crate::format::PixelDataType),

    /// A `Tile` or `ConsumerSelection` rectangle is invalid: out of bounds,
    /// or not aligned to the format's block granularity (DXT1 requires
    /// 4-pixel alignment on offsets and sizes).
    #[error("invalid rectangle: {0}")]
    InvalidGeometry(String),

    /// The remote peer closed the connection before a framed message could
    /// be completed.
    #[error("connection closed")]
    ConnectionClosed,
}
