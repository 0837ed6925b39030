//! Producer engine (§4.1, §4.2, §4.4): accepts consumer connections,
//! answers the bootstrap directory, advances frames, and enforces stream
//! behavior.
//!
//! Single-threaded per process, as §5 requires: every public method here
//! either returns immediately or blocks draining [`net::Server`] events on
//! the calling thread. There is no background worker thread — the
//! "blocking `WaitForNextEvent`" the spec describes *is* the call stack of
//! `Listen`/`AdvanceToNextFrame`/`Finalize`.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use log::{debug, info, warn};
use rand::seq::SliceRandom;

use crate::error::{PxError, Result};
use crate::format::{tile_byte_length, validate_format, PixelDataType, PixelFormat};
use crate::group::GroupComm;
use crate::net::{ClientHandle, Endpoint, SendTicket, Server, ServerEvent};
use crate::wire::{self, TAG_FINISHED, TAG_NEXT_FRAME};

/// How `AdvanceToNextFrame` treats connections that have not yet acked
/// the current frame (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBehavior {
    /// Block until every `Streaming` connection has acked.
    WaitForAll,
    /// Return immediately; unacked connections may receive two frames
    /// back-to-back. Producer-only — see DESIGN.md for why this fabric
    /// does not ship a matching consumer mode (§9's open question).
    DropFrames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Handshake,
    Streaming,
    Finished,
}

struct Connection {
    handle: ClientHandle,
    id: u64,
    state: ConnState,
    ready_to_advance: bool,
    consumer_endianness: u8,
    pending_geometry_ticket: Option<SendTicket>,
}

/// Connection map keyed by endpoint identity, preserving insertion order
/// so `Write` iterates deterministically across runs (§9).
#[derive(Default)]
struct ConnectionRegistry {
    order: Vec<Endpoint>,
    by_endpoint: HashMap<Endpoint, Connection>,
}

impl ConnectionRegistry {
    fn insert(&mut self, endpoint: Endpoint, conn: Connection) {
        if !self.by_endpoint.contains_key(&endpoint) {
            self.order.push(endpoint.clone());
        }
        self.by_endpoint.insert(endpoint, conn);
    }

    fn remove(&mut self, endpoint: &str) {
        if self.by_endpoint.remove(endpoint).is_some() {
            self.order.retain(|e| e != endpoint);
        }
    }

    fn get_mut(&mut self, endpoint: &str) -> Option<&mut Connection> {
        self.by_endpoint.get_mut(endpoint)
    }

    fn iter_in_order(&self) -> impl Iterator<Item = &Connection> {
        self.order.iter().filter_map(move |e| self.by_endpoint.get(e))
    }

    fn streaming_count(&self) -> usize {
        self.iter_in_order().filter(|c| c.state == ConnState::Streaming).count()
    }
}

/// One producer process's local geometry, set via `SetGlobalImageSize`
/// etc. before `Listen`.
#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    global_width: u32,
    global_height: u32,
    local_width: u32,
    local_height: u32,
    offset_x: u32,
    offset_y: u32,
}

/// The producer role of the fabric (§6.2).
pub struct Producer {
    group: Box<dyn GroupComm>,
    server: Server,
    registry: ConnectionRegistry,
    geometry: Geometry,
    format: Option<(PixelFormat, PixelDataType)>,
    frame: Option<Bytes>,
    behavior: StreamBehavior,
    next_client_id: u64,
    fleet_directory: Option<FleetDirectory>,
}

/// Directory of every producer rank's (ip, port), held only on the lead
/// rank (§9's "rank 0 specialness factored as a role predicate").
struct FleetDirectory {
    ips: Vec<[u8; 4]>,
    ports: Vec<u16>,
}

impl Producer {
    /// Binds this process's listener to a random port in
    /// `[port_min, port_max]` on `iface` (Fisher-Yates shuffled, retried on
    /// `AddrInUse`), then reports `(ip, port)` to rank 0 via group gather.
    pub fn new(iface: IpAddr, port_min: u16, port_max: u16, group: Box<dyn GroupComm>) -> Result<Self> {
        let server = bind_with_retry(iface, port_min, port_max)?;
        let local_addr = server.local_addr();
        let ip_bytes = match local_addr.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => return Err(PxError::Protocol("pxstream requires an IPv4 bind address".into())),
        };

        let mut report = Vec::with_capacity(6);
        report.extend_from_slice(&ip_bytes);
        report.extend_from_slice(&local_addr.port().to_be_bytes());

        let fleet_directory = if group.rank() == 0 {
            let gathered = group.gather(0, GATHER_TAG, report)?.expect("root always gets Some from gather");
            let mut ips = Vec::with_capacity(gathered.len());
            let mut ports = Vec::with_capacity(gathered.len());
            for entry in gathered {
                if entry.len() != 6 {
                    return Err(PxError::Protocol("fleet directory entry must be 6 bytes".into()));
                }
                ips.push([entry[0], entry[1], entry[2], entry[3]]);
                ports.push(u16::from_be_bytes([entry[4], entry[5]]));
            }
            Some(FleetDirectory { ips, ports })
        } else {
            group.gather(0, GATHER_TAG, report)?;
            None
        };

        info!("producer rank {} bound to {local_addr}", group.rank());

        Ok(Self {
            group,
            server,
            registry: ConnectionRegistry::default(),
            geometry: Geometry::default(),
            format: None,
            frame: None,
            behavior: StreamBehavior::WaitForAll,
            next_client_id: 0,
            fleet_directory,
        })
    }

    /// Sets the global and local pixel format (§3). Must be called before
    /// `Listen`.
    pub fn set_image_format(&mut self, format: PixelFormat, data_type: PixelDataType) -> Result<()> {
        validate_format(format, data_type)?;
        self.format = Some((format, data_type));
        Ok(())
    }

    /// Sets the global image's pixel dimensions.
    pub fn set_global_image_size(&mut self, width: u32, height: u32) {
        self.geometry.global_width = width;
        self.geometry.global_height = height;
    }

    /// Sets this process's tile size, in pixels.
    pub fn set_local_image_size(&mut self, width: u32, height: u32) {
        self.geometry.local_width = width;
        self.geometry.local_height = height;
    }

    /// Sets this process's tile offset within the global image, in pixels.
    pub fn set_local_image_offset(&mut self, x: u32, y: u32) {
        self.geometry.offset_x = x;
        self.geometry.offset_y = y;
    }

    /// The lead producer's advertised IPv4 address, or `None` on non-lead
    /// ranks.
    #[must_use]
    pub fn master_ip_address(&self) -> Option<IpAddr> {
        if self.group.rank() == 0 {
            Some(self.server.local_addr().ip())
        } else {
            None
        }
    }

    /// The lead producer's bound port, or `None` on non-lead ranks.
    #[must_use]
    pub fn master_port(&self) -> Option<u16> {
        if self.group.rank() == 0 {
            Some(self.server.local_addr().port())
        } else {
            None
        }
    }

    /// Drains the event queue, processing `Connect`/`Handshake`/`Ack`
    /// transitions, until at least `initial_wait_count` connections have
    /// reached `Streaming` (§4.1's `num_connections` gate).
    ///
    /// Returns `Err(PxError::ConsumerGroupMismatch)` — a fatal,
    /// group-abort condition (§7) — if a connecting consumer's reported
    /// producer-rank count disagrees with this producer group's size.
    pub fn listen(&mut self, behavior: StreamBehavior, initial_wait_count: usize) -> Result<()> {
        self.behavior = behavior;
        while self.registry.streaming_count() < initial_wait_count {
            let event = self.server.wait_for_next_event()?;
            self.handle_event(event)?;
        }
        debug!(
            "producer rank {} listening: {} streaming connections (wanted >= {initial_wait_count})",
            self.group.rank(),
            self.registry.streaming_count()
        );
        Ok(())
    }

    /// Records the tile to send on the next `Write`. The buffer must stay
    /// valid (it is reference-counted via [`Bytes`], so in practice this
    /// just means "don't let the last clone drop") until the following
    /// `SetFrameImage` or `Finalize`.
    pub fn set_frame_image(&mut self, buf: Bytes) {
        self.frame = Some(buf);
    }

    /// Sends `TAG_NEXT_FRAME` followed by the current tile to every
    /// `Streaming` connection, clearing `ready_to_advance` on each.
    pub fn write(&mut self) -> Result<()> {
        let frame = self
            .frame
            .clone()
            .ok_or_else(|| PxError::Protocol("Write called before SetFrameImage".into()))?;

        if let Some((format, data_type)) = self.format {
            let expected =
                tile_byte_length(self.geometry.local_width, self.geometry.local_height, format, data_type) as usize;
            if frame.len() != expected {
                warn!(
                    "producer rank {}: frame buffer is {} bytes, tile geometry expects {expected}",
                    self.group.rank(),
                    frame.len()
                );
            }
        }

        let endpoints: Vec<Endpoint> = self
            .registry
            .iter_in_order()
            .filter(|c| c.state == ConnState::Streaming)
            .map(|c| c.handle.endpoint().to_string())
            .collect();

        for endpoint in endpoints {
            if let Some(conn) = self.registry.get_mut(&endpoint) {
                conn.handle.send(Bytes::from_static(&[TAG_NEXT_FRAME]))?;
                conn.handle.send(frame.clone())?;
                conn.ready_to_advance = false;
            }
        }
        Ok(())
    }

    /// Advances the frame counter according to `behavior` (§4.2).
    pub fn advance_to_next_frame(&mut self) -> Result<()> {
        match self.behavior {
            StreamBehavior::WaitForAll => {
                while !self.all_streaming_ready() {
                    let event = self.server.wait_for_next_event()?;
                    self.handle_event(event)?;
                }
            }
            StreamBehavior::DropFrames => {
                while let Some(event) = self.server.try_next_event() {
                    self.handle_event(event)?;
                }
            }
        }
        Ok(())
    }

    fn all_streaming_ready(&self) -> bool {
        self.registry.iter_in_order().filter(|c| c.state == ConnState::Streaming).all(|c| c.ready_to_advance)
    }

    /// Waits for any straggling `TAG_ACK`s still in flight from the
    /// previous frame, sends `TAG_FINISHED` to every connection, then
    /// joins a group barrier (§4.2).
    pub fn finalize(&mut self) -> Result<()> {
        // Block (as `AdvanceToNextFrame`'s `WaitForAll` does) until every
        // Streaming connection's prior-frame ack has been accounted for,
        // so `TAG_FINISHED` is never interleaved with a straggling
        // `TAG_NEXT_FRAME`'s ack on the same connection.
        while !self.all_streaming_ready() {
            let event = self.server.wait_for_next_event()?;
            self.handle_event(event)?;
        }

        let endpoints: Vec<Endpoint> = self
            .registry
            .iter_in_order()
            .filter(|c| c.state == ConnState::Streaming)
            .map(|c| c.handle.endpoint().to_string())
            .collect();

        for endpoint in &endpoints {
            if let Some(conn) = self.registry.get_mut(endpoint) {
                conn.handle.send(Bytes::from_static(&[TAG_FINISHED]))?;
                conn.state = ConnState::Finished;
            }
        }

        while let Some(event) = self.server.try_next_event() {
            self.handle_event(event)?;
        }

        self.group.barrier();
        info!("producer rank {} finalized", self.group.rank());
        Ok(())
    }

    fn handle_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Connect { endpoint, handle } => self.on_connect(endpoint, handle),
            ServerEvent::ReceiveBinary { endpoint, data } => self.on_receive(endpoint, data),
            ServerEvent::SendFinished { endpoint, ticket } => self.on_send_finished(&endpoint, ticket),
            ServerEvent::Disconnect { endpoint } => {
                debug!("producer rank {}: {endpoint} disconnected", self.group.rank());
                self.registry.remove(&endpoint);
                self.server.forget(&endpoint);
                Ok(())
            }
        }
    }

    fn on_connect(&mut self, endpoint: Endpoint, handle: ClientHandle) -> Result<()> {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.registry.insert(
            endpoint.clone(),
            Connection {
                handle: handle.clone(),
                id,
                state: ConnState::Connecting,
                ready_to_advance: true,
                consumer_endianness: wire::native_endianness(),
                pending_geometry_ticket: None,
            },
        );

        if self.group.rank() == 0 {
            let directory = self.fleet_directory.as_ref().expect("lead rank always holds a fleet directory");
            let (format, data_type) = self
                .format
                .ok_or_else(|| PxError::Protocol("SetImageFormat must be called before accepting connections".into()))?;

            handle.send(Bytes::from_static(&[wire::native_endianness()]))?;
            handle.send(Bytes::from(wire::encode_ip_list(&directory.ips)))?;
            handle.send(Bytes::from(wire::encode_port_list(&directory.ports)))?;
            handle.send(Bytes::from(wire::encode_u32_be(self.geometry.global_width).to_vec()))?;
            handle.send(Bytes::from(wire::encode_u32_be(self.geometry.global_height).to_vec()))?;
            handle.send(Bytes::from(vec![format.to_wire()]))?;
            handle.send(Bytes::from(vec![data_type.to_wire()]))?;
            debug!("producer rank 0: sent bootstrap directory to {endpoint}");
        }
        Ok(())
    }

    fn on_receive(&mut self, endpoint: Endpoint, data: Vec<u8>) -> Result<()> {
        let rank = self.group.rank();
        let producer_group_size = self.group.size() as u32;
        let Some(conn) = self.registry.get_mut(&endpoint) else {
            warn!("producer rank {rank}: received data from unknown endpoint {endpoint}");
            return Ok(());
        };

        match conn.state {
            ConnState::Connecting => {
                let handshake = match wire::decode_handshake(&data) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("producer rank {rank}: malformed handshake from {endpoint}: {e}");
                        self.registry.remove(&endpoint);
                        return Ok(());
                    }
                };
                if handshake.num_producer_ranks != producer_group_size {
                    self.registry.remove(&endpoint);
                    let err = PxError::ConsumerGroupMismatch {
                        expected: producer_group_size,
                        actual: handshake.num_producer_ranks,
                    };
                    warn!("producer rank {rank}: rejecting {endpoint}: {err}");
                    return Err(err);
                }
                if handshake.consumer_endianness != wire::native_endianness() {
                    warn!(
                        "producer rank {rank}: endianness mismatch with {endpoint} (consumer reports {}, we are {}); bytes will transit unchanged",
                        handshake.consumer_endianness,
                        wire::native_endianness()
                    );
                }

                let conn = self.registry.get_mut(&endpoint).expect("looked up above");
                conn.id = handshake.lead_consumer_id;
                conn.consumer_endianness = handshake.consumer_endianness;
                conn.state = ConnState::Handshake;

                let geometry_reply = wire::encode_geometry_reply(
                    self.geometry.local_width,
                    self.geometry.local_height,
                    self.geometry.offset_x,
                    self.geometry.offset_y,
                );
                let ticket = conn.handle.send(Bytes::from(geometry_reply.to_vec()))?;
                conn.pending_geometry_ticket = Some(ticket);
                Ok(())
            }
            ConnState::Streaming => {
                if data.len() == 1 && data[0] == wire::TAG_ACK {
                    conn.ready_to_advance = true;
                } else {
                    warn!("producer rank {rank}: unexpected {} byte(s) from {endpoint} while streaming", data.len());
                }
                Ok(())
            }
            ConnState::Handshake | ConnState::Finished => {
                warn!("producer rank {rank}: unexpected data from {endpoint} in state {:?}", conn.state);
                Ok(())
            }
        }
    }

    fn on_send_finished(&mut self, endpoint: &str, ticket: SendTicket) -> Result<()> {
        if let Some(conn) = self.registry.get_mut(endpoint) {
            if conn.state == ConnState::Handshake && conn.pending_geometry_ticket == Some(ticket) {
                conn.state = ConnState::Streaming;
                conn.ready_to_advance = true;
                conn.pending_geometry_ticket = None;
                debug!("producer: {endpoint} (client id {}) entered Streaming", conn.id);
            }
        }
        Ok(())
    }
}

const GATHER_TAG: u32 = 0xF1EE_D1CC;

fn bind_with_retry(iface: IpAddr, port_min: u16, port_max: u16) -> Result<Server> {
    let mut ports: Vec<u16> = (port_min..=port_max).collect();
    ports.shuffle(&mut rand::thread_rng());
    for port in ports {
        match Server::bind(iface, port) {
            Ok(server) => return Ok(server),
            Err(PxError::Io(e)) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(PxError::PortRangeExhausted(port_min, port_max))
}
