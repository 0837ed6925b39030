//! Consumer engine (§4.1, §4.2, §5): discovers the producer fleet, opens
//! one connection per assigned producer, runs a reader thread per
//! connection into a double-buffered pixel list, and exposes a
//! synchronous per-frame `Read`/`FillSelection` pair.
//!
//! The reader-thread/main-thread handshake is the one piece of this crate
//! that is deliberately *not* modeled on the teacher's `tokio` tasks: the
//! spec pins down a blocking, condvar-driven protocol (`M`, `CV_start`,
//! `CV_done`, `begin_read`, `read_finished_count`) as a testable property
//! (§5, §8 invariants 3/5), so this module builds it directly on
//! `std::sync::{Mutex, Condvar}` rather than an async runtime.

use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::error::{PxError, Result};
use crate::format::{tile_byte_length, validate_format, PixelDataType, PixelFormat};
use crate::geometry::Rect;
use crate::group::{allgather, GroupComm};
use crate::net::MessageStream;
use crate::redistribution::{to_byte_rect, ByteRect, RedistributionDescriptor};
use crate::wire;

/// Directory bootstrapped from the lead producer and broadcast across the
/// consumer group (§4.1's seven-message exchange).
#[derive(Debug, Clone)]
struct FleetDirectory {
    producer_ips: Vec<[u8; 4]>,
    producer_ports: Vec<u16>,
    global_width: u32,
    global_height: u32,
    format: PixelFormat,
    data_type: PixelDataType,
}

impl FleetDirectory {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.producer_ips.len() as u32).to_be_bytes());
        buf.extend_from_slice(&wire::encode_ip_list(&self.producer_ips));
        buf.extend_from_slice(&wire::encode_port_list(&self.producer_ports));
        buf.extend_from_slice(&self.global_width.to_be_bytes());
        buf.extend_from_slice(&self.global_height.to_be_bytes());
        buf.push(self.format.to_wire());
        buf.push(self.data_type.to_wire());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(PxError::Protocol("fleet directory payload truncated".into()));
        }
        let p = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let mut pos = 4;
        let ip_len = p * 4;
        let producer_ips = wire::decode_ip_list(&buf[pos..pos + ip_len])?;
        pos += ip_len;
        let port_len = p * 2;
        let producer_ports = wire::decode_port_list(&buf[pos..pos + port_len])?;
        pos += port_len;
        let global_width = wire::decode_u32_be(&buf[pos..pos + 4])?;
        pos += 4;
        let global_height = wire::decode_u32_be(&buf[pos..pos + 4])?;
        pos += 4;
        let (format, data_type) = wire::decode_format_pair(buf[pos], buf[pos + 1])?;
        Ok(Self { producer_ips, producer_ports, global_width, global_height, format, data_type })
    }
}

/// Per-producer connection state: the tile geometry this producer
/// reported, and the connection's slot index in the pixel list.
struct ConnectionInfo {
    tile: Rect,
    tile_byte_len: usize,
}

struct SlotPair {
    buffers: [Vec<u8>; 2],
}

struct SharedState {
    begin_read: Vec<bool>,
    read_finished_count: usize,
    finished: usize,
    num_connections: usize,
    back_is_index1: bool,
}

struct Shared {
    state: Mutex<SharedState>,
    cv_start: Condvar,
    cv_done: Condvar,
}

fn advance_frame_locked(state: &mut SharedState) {
    state.read_finished_count = 0;
    for b in &mut state.begin_read {
        *b = true;
    }
    state.back_is_index1 = !state.back_is_index1;
}

/// The consumer role of the fabric (§6.2).
pub struct Consumer {
    group: Box<dyn GroupComm>,
    directory: FleetDirectory,
    connections: Vec<ConnectionInfo>,
    slots: Vec<Arc<Mutex<SlotPair>>>,
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<()>>,
}

/// Computes the half-open range of producer ranks consumer rank `r`
/// connects to, out of `num_producers` total (§4.1's connection
/// assignment formula).
fn producer_range(rank: usize, num_consumers: usize, num_producers: usize) -> std::ops::Range<usize> {
    let base = num_producers / num_consumers;
    let remainder = num_producers % num_consumers;
    let start = rank * base + remainder.min(rank);
    let extra = usize::from(rank < remainder);
    start..(start + base + extra)
}

const HANDSHAKE_BROADCAST_TAG: u32 = 0xC0;
const DIRECTORY_BROADCAST_TAG: u32 = 0xD1;
const CHUNK_ALLGATHER_TAG: u32 = 0xC4;
const SELECTION_ALLGATHER_TAG: u32 = 0xC5;

impl Consumer {
    /// Connects to the lead producer at `(host, port)`, completes the
    /// bootstrap/handshake protocol for every producer this rank is
    /// assigned, and starts one reader thread per connection.
    pub fn new(host: IpAddr, port: u16, group: Box<dyn GroupComm>) -> Result<Self> {
        let rank = group.rank();
        let num_consumers = group.size();

        let mut lead_connection = if rank == 0 { Some(MessageStream::connect((host, port))?) } else { None };

        let directory = if rank == 0 {
            let stream = lead_connection.as_mut().expect("lead connection present on rank 0");
            let endianness = stream.recv()?;
            if endianness.len() != 1 {
                return Err(PxError::Protocol("bootstrap endianness message must be 1 byte".into()));
            }
            let ip_msg = stream.recv()?;
            let producer_ips = wire::decode_ip_list(&ip_msg)?;
            let port_msg = stream.recv()?;
            let producer_ports = wire::decode_port_list(&port_msg)?;
            let global_width = wire::decode_u32_be(&stream.recv()?)?;
            let global_height = wire::decode_u32_be(&stream.recv()?)?;
            let format_msg = stream.recv()?;
            let dtype_msg = stream.recv()?;
            let (format, data_type) = wire::decode_format_pair(format_msg[0], dtype_msg[0])?;
            if producer_ips.len() != producer_ports.len() {
                return Err(PxError::Protocol("bootstrap ip/port list length mismatch".into()));
            }
            validate_format(format, data_type)?;
            FleetDirectory { producer_ips, producer_ports, global_width, global_height, format, data_type }
        } else {
            FleetDirectory { producer_ips: vec![], producer_ports: vec![], global_width: 0, global_height: 0, format: PixelFormat::Rgba, data_type: PixelDataType::U8 }
        };

        let encoded = if rank == 0 { directory.encode() } else { Vec::new() };
        let broadcasted = group.broadcast(0, DIRECTORY_BROADCAST_TAG, encoded)?;
        let directory = FleetDirectory::decode(&broadcasted)?;

        let num_producers = directory.producer_ips.len();
        let range = producer_range(rank, num_consumers, num_producers);

        let mut streams = Vec::with_capacity(range.len());
        for producer_idx in range.clone() {
            if producer_idx == 0 {
                if let Some(stream) = lead_connection.take() {
                    streams.push(stream);
                    continue;
                }
            }
            let addr = (IpAddr::from(directory.producer_ips[producer_idx]), directory.producer_ports[producer_idx]);
            streams.push(MessageStream::connect(addr)?);
        }

        // Only rank 0 knows the lead connection's local address (it is the
        // bootstrap connection it dialed at the top of this function); every
        // other rank receives bytes[0..12) unchanged via the broadcast below
        // and only fills in its own endianness byte (§4.1).
        let handshake_base = if rank == 0 {
            let lead_local = streams
                .first()
                .ok_or_else(|| PxError::Protocol("lead consumer holds no producer connections".into()))?
                .local_addr()?;
            let lead_ipv4 = match lead_local.ip() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => return Err(PxError::Protocol("pxstream requires an IPv4 bind address".into())),
            };
            let lead_id = (u64::from(u32::from(lead_ipv4))) << 32 | u64::from(lead_local.port());
            // §4.1/§6.1: the handshake's first field is the *producer*
            // group's size (mirrors client.cpp's `_num_remote_ranks`,
            // which the producer validates against its own rank count),
            // not the consumer group's size.
            wire::encode_handshake(num_producers as u32, lead_id, 0).to_vec()
        } else {
            Vec::new()
        };
        let handshake_base = group.broadcast(0, HANDSHAKE_BROADCAST_TAG, handshake_base)?;
        let mut handshake = handshake_base;
        handshake[12] = wire::native_endianness();

        let mut connections = Vec::with_capacity(streams.len());
        for stream in &mut streams {
            stream.send(&handshake)?;
        }
        for stream in &mut streams {
            let reply = stream.recv()?;
            let geometry = wire::decode_geometry_reply(&reply)?;
            let tile = Rect::new(geometry.width, geometry.height, geometry.offset_x, geometry.offset_y);
            tile.validate(directory.global_width, directory.global_height, directory.format)?;
            let tile_byte_len =
                tile_byte_length(tile.width, tile.height, directory.format, directory.data_type) as usize;
            connections.push(ConnectionInfo { tile, tile_byte_len });
        }

        let num_connections = connections.len();
        let slots: Vec<Arc<Mutex<SlotPair>>> = connections
            .iter()
            .map(|c| Arc::new(Mutex::new(SlotPair { buffers: [vec![0u8; c.tile_byte_len], vec![0u8; c.tile_byte_len]] })))
            .collect();

        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                begin_read: vec![false; num_connections],
                read_finished_count: num_connections,
                finished: 0,
                num_connections,
                back_is_index1: false,
            }),
            cv_start: Condvar::new(),
            cv_done: Condvar::new(),
        });

        let mut readers = Vec::with_capacity(streams.len());
        for (i, stream) in streams.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let slot = Arc::clone(&slots[i]);
            let tile_byte_len = connections[i].tile_byte_len;
            readers.push(thread::spawn(move || reader_loop(i, stream, shared, slot, tile_byte_len)));
        }

        {
            let mut st = shared.state.lock().expect("consumer shared mutex poisoned");
            advance_frame_locked(&mut st);
        }
        shared.cv_start.notify_all();

        debug!("consumer rank {rank} bootstrapped with {num_connections} producer connections");

        Ok(Self { group, directory, connections, slots, shared, readers })
    }

    /// The global image's pixel dimensions.
    #[must_use]
    pub fn global_dimensions(&self) -> (u32, u32) {
        (self.directory.global_width, self.directory.global_height)
    }

    /// The negotiated pixel format.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.directory.format
    }

    /// The negotiated pixel data type.
    #[must_use]
    pub fn pixel_data_type(&self) -> PixelDataType {
        self.directory.data_type
    }

    /// Builds the redistribution plan for `selection` by exchanging chunk
    /// and selection geometry across the consumer group (§4.3).
    pub fn create_global_pixel_selection(&self, selection: Rect) -> Result<RedistributionDescriptor> {
        selection.validate(self.directory.global_width, self.directory.global_height, self.directory.format)?;
        let bytes_per_pixel = crate::format::bits_per_pixel(self.directory.format, self.directory.data_type) / 8;

        let my_chunk_rects: Vec<ByteRect> = self
            .connections
            .iter()
            .map(|c| to_byte_rect(c.tile, self.directory.format, bytes_per_pixel, self.directory.global_height))
            .collect();
        let my_selection = to_byte_rect(selection, self.directory.format, bytes_per_pixel, self.directory.global_height);

        let mut packed_chunks = Vec::new();
        packed_chunks.extend_from_slice(&(my_chunk_rects.len() as u32).to_be_bytes());
        for rect in &my_chunk_rects {
            packed_chunks.extend_from_slice(&rect.to_bytes());
        }
        let gathered_chunks = allgather(self.group.as_ref(), CHUNK_ALLGATHER_TAG, packed_chunks)?;
        let all_chunk_rects: Vec<Vec<ByteRect>> =
            gathered_chunks.iter().map(|buf| unpack_byte_rects(buf)).collect::<Result<_>>()?;

        let gathered_selections = allgather(self.group.as_ref(), SELECTION_ALLGATHER_TAG, my_selection.to_bytes().to_vec())?;
        let all_selections: Vec<ByteRect> =
            gathered_selections.iter().map(|buf| ByteRect::from_bytes(buf)).collect::<Result<_>>()?;

        RedistributionDescriptor::build(self.group.as_ref(), &my_chunk_rects, &all_chunk_rects, &all_selections)
    }

    /// Blocks until every reader thread has finished the in-flight frame,
    /// then flips the double buffer and signals readers to begin the
    /// next one (§4.2).
    pub fn read(&self) -> Result<()> {
        let mut st = self.shared.state.lock().expect("consumer shared mutex poisoned");
        st = self
            .shared
            .cv_done
            .wait_while(st, |s| s.read_finished_count != s.num_connections)
            .expect("consumer shared condvar poisoned");
        advance_frame_locked(&mut st);
        drop(st);
        self.shared.cv_start.notify_all();
        Ok(())
    }

    /// Runs the redistribution plan over the current front buffer,
    /// writing exactly `desc.output_len()` bytes into `out`.
    pub fn fill_selection(&self, desc: &RedistributionDescriptor, out: &mut [u8]) -> Result<()> {
        let front_index = {
            let st = self.shared.state.lock().expect("consumer shared mutex poisoned");
            usize::from(!st.back_is_index1)
        };

        let mut pixels = Vec::new();
        for slot in &self.slots {
            let guard = slot.lock().expect("consumer pixel slot mutex poisoned");
            pixels.extend_from_slice(&guard.buffers[front_index]);
        }

        desc.fill(self.group.as_ref(), &pixels, out)
    }

    /// True once every connection has observed `TAG_FINISHED`.
    #[must_use]
    pub fn server_finished(&self) -> bool {
        let st = self.shared.state.lock().expect("consumer shared mutex poisoned");
        st.finished == st.num_connections
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

fn unpack_byte_rects(buf: &[u8]) -> Result<Vec<ByteRect>> {
    if buf.len() < 4 {
        return Err(PxError::Protocol("chunk list payload truncated".into()));
    }
    let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut out = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        out.push(ByteRect::from_bytes(&buf[pos..pos + 16])?);
        pos += 16;
    }
    Ok(out)
}

fn reader_loop(
    index: usize,
    mut stream: MessageStream,
    shared: Arc<Shared>,
    slot: Arc<Mutex<SlotPair>>,
    tile_byte_len: usize,
) {
    loop {
        let back_index = {
            let mut st = shared.state.lock().expect("consumer shared mutex poisoned");
            st = shared
                .cv_start
                .wait_while(st, |s| !s.begin_read[index])
                .expect("consumer shared condvar poisoned");
            st.begin_read[index] = false;
            usize::from(st.back_is_index1)
        };

        let mut terminal = false;
        match stream.recv() {
            Ok(tag) if tag.len() == 1 && tag[0] == wire::TAG_NEXT_FRAME => match stream.recv() {
                Ok(payload) => {
                    if payload.len() != tile_byte_len {
                        warn!(
                            "consumer reader {index}: expected {tile_byte_len}-byte tile, got {} bytes",
                            payload.len()
                        );
                    }
                    let n = payload.len().min(tile_byte_len);
                    let mut guard = slot.lock().expect("consumer pixel slot mutex poisoned");
                    guard.buffers[back_index][..n].copy_from_slice(&payload[..n]);
                    drop(guard);
                    if let Err(e) = stream.send(&[wire::TAG_ACK]) {
                        warn!("consumer reader {index}: failed to send ack: {e}");
                    }
                }
                Err(e) => {
                    warn!("consumer reader {index}: failed to read tile payload: {e}");
                    terminal = true;
                }
            },
            Ok(tag) if tag.len() == 1 && tag[0] == wire::TAG_FINISHED => {
                terminal = true;
            }
            Ok(other) => {
                warn!("consumer reader {index}: unexpected {}-byte tag message", other.len());
            }
            Err(PxError::ConnectionClosed) => {
                terminal = true;
            }
            Err(e) => {
                warn!("consumer reader {index}: read error: {e}");
                terminal = true;
            }
        }

        {
            let mut st = shared.state.lock().expect("consumer shared mutex poisoned");
            if terminal {
                st.finished += 1;
            }
            st.read_finished_count += 1;
            shared.cv_done.notify_all();
        }

        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_range_splits_evenly() {
        assert_eq!(producer_range(0, 2, 4), 0..2);
        assert_eq!(producer_range(1, 2, 4), 2..4);
    }

    #[test]
    fn producer_range_distributes_remainder_to_low_ranks() {
        // 5 producers, 2 consumers: rank 0 gets 3, rank 1 gets 2.
        assert_eq!(producer_range(0, 2, 5), 0..3);
        assert_eq!(producer_range(1, 2, 5), 3..5);
    }

    #[test]
    fn producer_range_single_consumer_takes_everything() {
        assert_eq!(producer_range(0, 1, 4), 0..4);
    }
}
