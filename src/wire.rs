//! Fixed-layout wire encoding for the bootstrap, handshake, and per-frame
//! control messages (§4.1, §4.2, §6.1).
//!
//! Each function here encodes or decodes exactly one logical message; the
//! message boundary itself (length-delimiting) is the job of
//! [`crate::net::MessageStream`], not this module.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PxError, Result};
use crate::format::{PixelDataType, PixelFormat};

/// Per-frame tag: a `NEXT_FRAME` message is about to follow with the tile
/// bytes (§4.2).
pub const TAG_NEXT_FRAME: u8 = 1;
/// Per-frame tag: the stream has ended, no further frames will be sent.
pub const TAG_FINISHED: u8 = 2;
/// Per-frame tag: acknowledgement that a tile was received.
pub const TAG_ACK: u8 = 255;

/// Wire value for little-endian.
pub const ENDIAN_LITTLE: u8 = 0;
/// Wire value for big-endian.
pub const ENDIAN_BIG: u8 = 1;

/// This process's native endianness, encoded the way §4.1's `endianness`
/// field expects it.
///
/// The original C++ implementation derives this (and cross-checks IEEE-754
/// float representation) at runtime; Rust's target is known at compile
/// time, so `cfg!(target_endian = ...)` gives the same answer without a
/// runtime probe. See DESIGN.md for the full rationale.
#[must_use]
pub fn native_endianness() -> u8 {
    if cfg!(target_endian = "big") { ENDIAN_BIG } else { ENDIAN_LITTLE }
}

/// Encodes the IPv4 address list sent as bootstrap message 2 (§6.1):
/// big-endian packed IPv4, 4 bytes per producer rank.
#[must_use]
pub fn encode_ip_list(addrs: &[[u8; 4]]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(addrs.len() * 4);
    for a in addrs {
        buf.put_slice(a);
    }
    buf.to_vec()
}

/// Decodes a bootstrap IPv4 address list. The number of producer ranks is
/// derived from the payload length (`len / 4`), exactly as the original
/// consumer bootstrap does, since at this point in the handshake the
/// consumer does not yet know `P`.
pub fn decode_ip_list(payload: &[u8]) -> Result<Vec<[u8; 4]>> {
    if payload.len() % 4 != 0 {
        return Err(PxError::Protocol(format!(
            "ip address list length {} is not a multiple of 4",
            payload.len()
        )));
    }
    Ok(payload.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]).collect())
}

/// Encodes the port list sent as bootstrap message 3 (§6.1): network
/// (big-endian) `u16` per producer rank.
#[must_use]
pub fn encode_port_list(ports: &[u16]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ports.len() * 2);
    for p in ports {
        buf.put_u16(*p);
    }
    buf.to_vec()
}

/// Decodes a bootstrap port list.
pub fn decode_port_list(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(PxError::Protocol(format!(
            "port list length {} is not a multiple of 2",
            payload.len()
        )));
    }
    let mut buf = payload;
    let mut out = Vec::with_capacity(payload.len() / 2);
    while buf.has_remaining() {
        out.push(buf.get_u16());
    }
    Ok(out)
}

/// Encodes a `u32` field in network byte order (bootstrap messages 4/5).
#[must_use]
pub fn encode_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decodes a network-byte-order `u32` field.
pub fn decode_u32_be(payload: &[u8]) -> Result<u32> {
    if payload.len() != 4 {
        return Err(PxError::Protocol(format!("expected 4 bytes for u32, got {}", payload.len())));
    }
    let mut buf = payload;
    Ok(buf.get_u32())
}

/// Assembles the 13-byte consumer-to-producer handshake (§4.1, §6.1):
/// `num_producer_ranks` (4 bytes, network order), `lead_consumer_id`
/// (8 bytes, network order), `consumer_endianness` (1 byte).
///
/// `num_producer_ranks` is the size of the *producer* group the consumer
/// learned from the bootstrap directory's ip/port list length, not the
/// consumer group's own size (mirrors the original's `_num_remote_ranks`);
/// the producer validates it against its own rank count (see
/// `producer::Producer::on_receive`).
#[must_use]
pub fn encode_handshake(num_producer_ranks: u32, lead_consumer_id: u64, consumer_endianness: u8) -> [u8; 13] {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_u32(num_producer_ranks);
    buf.put_u64(lead_consumer_id);
    buf.put_u8(consumer_endianness);
    let mut out = [0u8; 13];
    out.copy_from_slice(&buf);
    out
}

/// Decoded fields of a consumer handshake.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    /// Size of the *producer* group, as the consumer learned it from the
    /// bootstrap directory (not the consumer group's own size).
    pub num_producer_ranks: u32,
    /// `(lead_local_ipv4 << 32) | lead_local_port` identifying the lead
    /// consumer rank's bootstrap connection.
    pub lead_consumer_id: u64,
    /// The consumer's reported endianness (§4.1's `ENDIAN_*` constants).
    pub consumer_endianness: u8,
}

/// Decodes and validates the 13-byte handshake payload.
pub fn decode_handshake(payload: &[u8]) -> Result<Handshake> {
    if payload.len() != 13 {
        return Err(PxError::Protocol(format!("expected 13-byte handshake, got {} bytes", payload.len())));
    }
    let mut buf = payload;
    let num_producer_ranks = buf.get_u32();
    let lead_consumer_id = buf.get_u64();
    let consumer_endianness = buf.get_u8();
    Ok(Handshake { num_producer_ranks, lead_consumer_id, consumer_endianness })
}

/// Assembles the 16-byte producer geometry reply (§4.1): `local_width`,
/// `local_height`, `offset_x`, `offset_y`, each a 4-byte integer in the
/// *producer's host byte order* — an intentional, documented wire-format
/// wart (see spec.md §4.1 and DESIGN.md).
#[must_use]
pub fn encode_geometry_reply(width: u32, height: u32, offset_x: u32, offset_y: u32) -> [u8; 16] {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32_ne(width);
    buf.put_u32_ne(height);
    buf.put_u32_ne(offset_x);
    buf.put_u32_ne(offset_y);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

/// Tile geometry decoded from a producer's geometry reply.
#[derive(Debug, Clone, Copy)]
pub struct TileGeometry {
    /// Tile width in pixels.
    pub width: u32,
    /// Tile height in pixels.
    pub height: u32,
    /// X offset in pixels within the global image.
    pub offset_x: u32,
    /// Y offset in pixels within the global image.
    pub offset_y: u32,
}

/// Decodes the 16-byte geometry reply, in the sender's host byte order.
pub fn decode_geometry_reply(payload: &[u8]) -> Result<TileGeometry> {
    if payload.len() != 16 {
        return Err(PxError::Protocol(format!("expected 16-byte geometry reply, got {} bytes", payload.len())));
    }
    let mut buf = payload;
    Ok(TileGeometry {
        width: buf.get_u32_ne(),
        height: buf.get_u32_ne(),
        offset_x: buf.get_u32_ne(),
        offset_y: buf.get_u32_ne(),
    })
}

/// Decodes the `pixel_format` / `pixel_data_type` pair (bootstrap messages
/// 6/7), each a single byte enum.
pub fn decode_format_pair(format_byte: u8, dtype_byte: u8) -> Result<(PixelFormat, PixelDataType)> {
    Ok((PixelFormat::from_wire(format_byte)?, PixelDataType::from_wire(dtype_byte)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let raw = encode_handshake(4, 0x1234_5678_9abc, ENDIAN_LITTLE);
        let decoded = decode_handshake(&raw).unwrap();
        assert_eq!(decoded.num_producer_ranks, 4);
        assert_eq!(decoded.lead_consumer_id, 0x1234_5678_9abc);
        assert_eq!(decoded.consumer_endianness, ENDIAN_LITTLE);
    }

    #[test]
    fn geometry_reply_roundtrip_is_host_order() {
        let raw = encode_geometry_reply(16, 32, 4, 8);
        let decoded = decode_geometry_reply(&raw).unwrap();
        assert_eq!(decoded.width, 16);
        assert_eq!(decoded.height, 32);
        assert_eq!(decoded.offset_x, 4);
        assert_eq!(decoded.offset_y, 8);
    }

    #[test]
    fn ip_and_port_list_roundtrip() {
        let addrs = vec![[127, 0, 0, 1], [10, 0, 0, 2]];
        let encoded = encode_ip_list(&addrs);
        assert_eq!(decode_ip_list(&encoded).unwrap(), addrs);

        let ports = vec![5000u16, 5001, 65535];
        let encoded = encode_port_list(&ports);
        assert_eq!(decode_port_list(&encoded).unwrap(), ports);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(decode_handshake(&[0u8; 12]).is_err());
        assert!(decode_geometry_reply(&[0u8; 15]).is_err());
        assert!(decode_u32_be(&[0u8; 3]).is_err());
    }
}
