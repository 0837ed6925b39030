//! Message-framed TCP transport (§6.3).
//!
//! Neither side of this fabric speaks a raw byte stream: every logical
//! message (a bootstrap field, a handshake, a tag byte, a tile payload) is
//! delivered whole or not at all. [`MessageStream`] provides that guarantee
//! over a plain [`TcpStream`] with a 4-byte big-endian length prefix; the
//! rest of the crate never touches a socket directly.
//!
//! [`Server`] adapts this into the event queue §6.3 asks for — `Connect`,
//! `ReceiveBinary`, `SendFinished`, `Disconnect` — backed by one reader
//! thread per accepted connection and a single `mpsc` channel the engine
//! drains with [`Server::wait_for_next_event`]. This mirrors the teacher's
//! `tokio` connection-per-task model, just with OS threads and blocking
//! I/O, since the spec's state machine is defined in terms of a blocking
//! per-connection reader (§4.2, §9).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::error::{PxError, Result};

/// Opaque handle returned by [`ClientHandle::send`], delivered back on the
/// matching [`ServerEvent::SendFinished`].
///
/// The original identifies a completed send by the buffer pointer it was
/// given; Rust's ownership model makes that pointer meaningless once the
/// buffer has potentially moved or been freed, so this fabric mints a
/// monotonically increasing ticket per send instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTicket(u64);

/// A stable string identity for a connected peer (§6.3's "endpoint
/// string"), used to key the producer's/consumer's per-connection state.
pub type Endpoint = String;

/// Events delivered by [`Server::wait_for_next_event`].
pub enum ServerEvent {
    /// A new peer connected; `handle` can be used to send to it.
    Connect { endpoint: Endpoint, handle: ClientHandle },
    /// A peer sent a complete framed message.
    ReceiveBinary { endpoint: Endpoint, data: Vec<u8> },
    /// A previously enqueued send completed.
    SendFinished { endpoint: Endpoint, ticket: SendTicket },
    /// A peer's connection closed or errored.
    Disconnect { endpoint: Endpoint },
}

/// A length-delimited message stream over a [`TcpStream`].
///
/// Used directly by consumer-side code (which dials out and does not need
/// the full event queue); [`Server`] uses one internally per accepted
/// connection.
pub struct MessageStream {
    stream: TcpStream,
}

impl MessageStream {
    /// Connects to `addr` and disables Nagle's algorithm, matching the
    /// low-latency framing this protocol assumes (small control messages
    /// must not be coalesced with the tile payload that follows them).
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// This endpoint's remote peer address, used as its [`Endpoint`] string.
    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        Ok(self.stream.peer_addr()?.to_string())
    }

    /// Local bound address (§4.1's `GetMasterPort`/`GetMasterIpAddress`).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Sends one complete message: a 4-byte big-endian length prefix
    /// followed by `payload`.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| PxError::Protocol("message exceeds 4 GiB frame limit".into()))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    /// Blocks until one complete message has arrived, returning its
    /// payload. Returns [`PxError::ConnectionClosed`] on a clean EOF
    /// between messages.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PxError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self { stream: self.stream.try_clone()? })
    }
}

/// A handle a producer or consumer engine uses to send to one connected
/// peer (§6.3's per-client `Send(buf, len, copy_mode)`).
///
/// `Bytes` already gives cheap (reference-counted) cloning, so unlike the
/// original there is no separate `CopyMode` parameter: callers pass
/// whatever `Bytes` they already hold (a tile's backing buffer, a tiny
/// control message) and cloning or copying is an implementation detail
/// `Bytes` resolves for them. See DESIGN.md.
#[derive(Clone)]
pub struct ClientHandle {
    endpoint: Endpoint,
    writer: Arc<Mutex<MessageStream>>,
    events: Sender<ServerEvent>,
    next_ticket: Arc<AtomicU64>,
}

impl ClientHandle {
    /// Sends `payload` to this peer, then enqueues the matching
    /// `SendFinished` event once the write completes.
    pub fn send(&self, payload: Bytes) -> Result<SendTicket> {
        let mut writer = self.writer.lock().expect("client writer mutex poisoned");
        writer.send(&payload)?;
        let ticket = SendTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let _ = self.events.send(ServerEvent::SendFinished { endpoint: self.endpoint.clone(), ticket });
        Ok(ticket)
    }

    /// The endpoint identity this handle sends to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// A listening server that fans connection activity into a single event
/// queue (§6.3).
pub struct Server {
    listener_addr: SocketAddr,
    events_tx: Sender<ServerEvent>,
    events_rx: Receiver<ServerEvent>,
    writers: Arc<Mutex<HashMap<Endpoint, Arc<Mutex<MessageStream>>>>>,
}

impl Server {
    /// Binds the first free port in `[port_min, port_max]` on `bind_addr`,
    /// matching the bootstrap port-scan behavior of §4.1 (callers apply
    /// the Fisher-Yates shuffle to the range before calling this; see
    /// `producer::bind_with_retry`).
    pub fn bind(bind_addr: std::net::IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((bind_addr, port))?;
        let listener_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel();
        let writers: Arc<Mutex<HashMap<Endpoint, Arc<Mutex<MessageStream>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_tx = events_tx.clone();
        let accept_writers = Arc::clone(&writers);
        thread::spawn(move || accept_loop(listener, accept_tx, accept_writers));

        Ok(Self { listener_addr, events_tx, events_rx, writers })
    }

    /// The address this server is actually bound to (port resolved if 0
    /// was requested).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    /// Blocks until the next event is available.
    pub fn wait_for_next_event(&self) -> Result<ServerEvent> {
        self.events_rx.recv().map_err(|_| PxError::ConnectionClosed)
    }

    /// Returns the next event if one is already queued, without blocking.
    /// Used by `DropFrames`/`Finalize` to drain stragglers without waiting
    /// on a peer that may never respond.
    pub fn try_next_event(&self) -> Option<ServerEvent> {
        self.events_rx.try_recv().ok()
    }

    /// A sender clonable into reader threads or tests that want to inject
    /// synthetic events; not used by normal engine code.
    #[must_use]
    pub fn events_sender(&self) -> Sender<ServerEvent> {
        self.events_tx.clone()
    }

    /// Drops the writer half for `endpoint`, if present. Engines call this
    /// after handling a `Disconnect` event to release the socket.
    pub fn forget(&self, endpoint: &str) {
        self.writers.lock().expect("server writers mutex poisoned").remove(endpoint);
    }
}

fn accept_loop(
    listener: TcpListener,
    events_tx: Sender<ServerEvent>,
    writers: Arc<Mutex<HashMap<Endpoint, Arc<Mutex<MessageStream>>>>>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept() failed, server socket shutting down: {e}");
                return;
            }
        };
        let endpoint = peer.to_string();
        let stream = match MessageStream::from_stream(stream) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to prepare accepted connection from {endpoint}: {e}");
                continue;
            }
        };
        let reader = match stream.try_clone() {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to clone accepted connection from {endpoint}: {e}");
                continue;
            }
        };
        let writer = Arc::new(Mutex::new(stream));
        writers.lock().expect("server writers mutex poisoned").insert(endpoint.clone(), Arc::clone(&writer));

        let handle = ClientHandle {
            endpoint: endpoint.clone(),
            writer,
            events: events_tx.clone(),
            next_ticket: Arc::new(AtomicU64::new(0)),
        };
        debug!("accepted connection from {endpoint}");
        if events_tx.send(ServerEvent::Connect { endpoint: endpoint.clone(), handle }).is_err() {
            return;
        }

        let reader_tx = events_tx.clone();
        thread::spawn(move || reader_loop(endpoint, reader, reader_tx));
    }
}

fn reader_loop(endpoint: Endpoint, mut reader: MessageStream, events_tx: Sender<ServerEvent>) {
    loop {
        match reader.recv() {
            Ok(data) => {
                trace!("received {} bytes from {endpoint}", data.len());
                if events_tx.send(ServerEvent::ReceiveBinary { endpoint: endpoint.clone(), data }).is_err() {
                    return;
                }
            }
            Err(PxError::ConnectionClosed) => {
                debug!("{endpoint} disconnected");
                let _ = events_tx.send(ServerEvent::Disconnect { endpoint });
                return;
            }
            Err(e) => {
                warn!("read error from {endpoint}: {e}");
                let _ = events_tx.send(ServerEvent::Disconnect { endpoint });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_stream_roundtrips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ms = MessageStream::from_stream(stream).unwrap();
            let msg = ms.recv().unwrap();
            ms.send(&msg).unwrap();
        });

        let mut client = MessageStream::connect(addr).unwrap();
        client.send(b"hello fabric").unwrap();
        let echoed = client.recv().unwrap();
        assert_eq!(echoed, b"hello fabric");
        server.join().unwrap();
    }

    #[test]
    fn server_emits_connect_and_receive_events() {
        let server = Server::bind("127.0.0.1".parse().unwrap(), 0).unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut c = MessageStream::connect(addr).unwrap();
            c.send(b"ping").unwrap();
            c
        });

        let connect = server.wait_for_next_event().unwrap();
        let handle = match connect {
            ServerEvent::Connect { handle, .. } => handle,
            _ => panic!("expected Connect event first"),
        };

        let receive = server.wait_for_next_event().unwrap();
        match receive {
            ServerEvent::ReceiveBinary { data, .. } => assert_eq!(data, b"ping"),
            _ => panic!("expected ReceiveBinary event second"),
        }

        handle.send(Bytes::from_static(b"pong")).unwrap();
        let send_finished = server.wait_for_next_event().unwrap();
        assert!(matches!(send_finished, ServerEvent::SendFinished { .. }));

        client.join().unwrap();
    }
}
