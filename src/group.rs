//! Collective and point-to-point communication primitive abstracting the
//! "external group library" spec.md §5/§9 leaves unspecified.
//!
//! Both fleets (the producer group and, internally, the consumer group's
//! redistribution exchange) need exactly four operations: broadcast,
//! gather, barrier, and tagged point-to-point send/receive. [`GroupComm`]
//! is that contract; [`LocalGroup`] is an in-process implementation over
//! OS threads, grounded on the per-pair-channel fleet construction in
//! Timely Dataflow's `process` allocator (`allocator_process.rs`'s
//! `new_vector`), adapted from byte-stream channels to a tagged rendezvous
//! so FillSelection's many concurrent chunk transfers don't need one
//! channel per chunk.
//!
//! A real deployment swaps `LocalGroup` for a thin wrapper over whatever
//! collective-communication substrate the host application already uses
//! (the spec deliberately treats this as a pluggable collaborator, not
//! part of the wire protocol); `GroupComm` is the seam that substitution
//! happens at.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use crate::error::{PxError, Result};

/// A rank's view of a fixed-size process group providing broadcast,
/// gather, barrier, and tagged point-to-point transfer.
///
/// All operations are blocking. Tags disambiguate concurrent transfers
/// between the same pair of ranks (the redistribution descriptor tags
/// each chunk transfer by its chunk index, §5's strided point-to-point
/// requirement).
pub trait GroupComm: Send + Sync {
    /// This process's rank within the group, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocks until every rank has called `barrier`.
    fn barrier(&self);

    /// Sends `data` to `dest`, tagged with `tag`. `dest` must eventually
    /// call [`GroupComm::recv`] with a matching `tag`.
    fn send(&self, dest: usize, tag: u32, data: Vec<u8>) -> Result<()>;

    /// Blocks until a message tagged `tag` has arrived from `src`, and
    /// returns its payload.
    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>>;

    /// Broadcasts `data` from `root` to every rank (including `root`
    /// itself, which gets back exactly what it sent). Non-root callers'
    /// `data` argument is ignored.
    fn broadcast(&self, root: usize, tag: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.rank() == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, tag, data.clone())?;
                }
            }
            Ok(data)
        } else {
            self.recv(root, tag)
        }
    }

    /// Gathers one payload per rank at `root`, ordered by rank. Returns
    /// `None` on non-root callers.
    fn gather(&self, root: usize, tag: u32, local: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut out = Vec::with_capacity(self.size());
            for src in 0..self.size() {
                if src == root {
                    out.push(local.clone());
                } else {
                    out.push(self.recv(src, tag)?);
                }
            }
            Ok(Some(out))
        } else {
            self.send(root, tag, local)?;
            Ok(None)
        }
    }
}

type Inbox = Mutex<HashMap<(usize, u32), VecDeque<Vec<u8>>>>;

struct Shared {
    size: usize,
    inboxes: Vec<Inbox>,
    condvars: Vec<Condvar>,
    barrier: Barrier,
}

/// An in-process [`GroupComm`] implementation: every rank is an OS thread
/// (or the calling thread, for a group of size one) inside the same
/// process, exchanging messages through shared inboxes rather than a
/// network.
pub struct LocalGroup {
    shared: Arc<Shared>,
    rank: usize,
}

impl LocalGroup {
    /// Builds one [`LocalGroup`] handle per rank of a `size`-rank fleet,
    /// index `i` of the returned vector being rank `i`'s handle. Mirrors
    /// `ProcessBuilder::new_vector`'s "build the whole fleet's channels up
    /// front, then hand each participant its slice" shape.
    #[must_use]
    pub fn new_fleet(size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            size,
            inboxes: (0..size).map(|_| Mutex::new(HashMap::new())).collect(),
            condvars: (0..size).map(|_| Condvar::new()).collect(),
            barrier: Barrier::new(size),
        });
        (0..size).map(|rank| Self { shared: Arc::clone(&shared), rank }).collect()
    }
}

impl GroupComm for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn send(&self, dest: usize, tag: u32, data: Vec<u8>) -> Result<()> {
        if dest >= self.shared.size {
            return Err(PxError::Protocol(format!("send to out-of-range rank {dest}")));
        }
        let mut inbox = self.shared.inboxes[dest].lock().expect("group inbox mutex poisoned");
        inbox.entry((self.rank, tag)).or_default().push_back(data);
        drop(inbox);
        self.shared.condvars[dest].notify_all();
        Ok(())
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        if src >= self.shared.size {
            return Err(PxError::Protocol(format!("recv from out-of-range rank {src}")));
        }
        let mut inbox = self.shared.inboxes[self.rank].lock().expect("group inbox mutex poisoned");
        loop {
            if let Some(queue) = inbox.get_mut(&(src, tag)) {
                if let Some(data) = queue.pop_front() {
                    return Ok(data);
                }
            }
            inbox = self.shared.condvars[self.rank]
                .wait(inbox)
                .expect("group inbox condvar poisoned");
        }
    }
}

/// Gathers one variable-length payload per rank to every rank (an
/// "allgather"), built out of [`GroupComm::gather`] + [`GroupComm::broadcast`]
/// since the trait does not need a dedicated primitive for it. Used by
/// `CreateGlobalPixelSelection` to learn every consumer rank's owned
/// chunks and wanted selection before building the redistribution plan.
pub fn allgather(group: &dyn GroupComm, tag: u32, local: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let gathered = group.gather(0, tag, local)?;
    let packed = if let Some(all) = gathered {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(all.len() as u32).to_be_bytes());
        for entry in &all {
            buf.extend_from_slice(&(entry.len() as u32).to_be_bytes());
            buf.extend_from_slice(entry);
        }
        buf
    } else {
        Vec::new()
    };

    let broadcasted = group.broadcast(0, tag.wrapping_add(1), packed)?;
    unpack_length_prefixed(&broadcasted)
}

fn unpack_length_prefixed(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    if buf.len() < 4 {
        return Err(PxError::Protocol("allgather payload truncated".into()));
    }
    let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut pos = 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < pos + 4 {
            return Err(PxError::Protocol("allgather payload truncated".into()));
        }
        let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if buf.len() < pos + len {
            return Err(PxError::Protocol("allgather payload truncated".into()));
        }
        out.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_delivers_in_tag_order() {
        let mut handles = LocalGroup::new_fleet(2);
        let sender = handles.remove(0);
        let receiver = handles.remove(0);

        let t = thread::spawn(move || {
            sender.send(1, 7, vec![1, 2, 3]).unwrap();
            sender.send(1, 8, vec![4, 5]).unwrap();
        });
        assert_eq!(receiver.recv(0, 8).unwrap(), vec![4, 5]);
        assert_eq!(receiver.recv(0, 7).unwrap(), vec![1, 2, 3]);
        t.join().unwrap();
    }

    #[test]
    fn broadcast_and_gather_roundtrip() {
        let fleet = LocalGroup::new_fleet(3);
        let handles: Vec<_> = fleet;
        let threads: Vec<_> = handles
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let value = g.broadcast(0, 1, if g.rank() == 0 { vec![42] } else { vec![] }).unwrap();
                    assert_eq!(value, vec![42]);
                    let gathered = g.gather(0, 2, vec![g.rank() as u8]).unwrap();
                    if g.rank() == 0 {
                        assert_eq!(gathered, Some(vec![vec![0], vec![1], vec![2]]));
                    } else {
                        assert_eq!(gathered, None);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn allgather_delivers_every_ranks_payload_to_everyone() {
        let fleet = LocalGroup::new_fleet(3);
        let threads: Vec<_> = fleet
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let local = vec![g.rank() as u8; g.rank() + 1];
                    let all = allgather(&g, 10, local).unwrap();
                    assert_eq!(all, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }
}
