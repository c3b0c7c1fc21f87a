// In-process mesh substrate.
//
// One bounded lock-free ring per worker endpoint. A full ring refuses the
// send, which is the backpressure signal the send stash recovers from.
// Pushes from one producer stay in order, so delivery is FIFO per
// source/destination pair.

use crate::transport::Bundle;
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Counters over all endpoints of the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub accepted: u64,
    pub refused: u64,
    pub delivered: u64,
}

/// The full-cluster message fabric: `num_servers × workers_per_server`
/// bounded receive rings.
pub struct MeshTransport {
    num_servers: usize,
    workers_per_server: usize,
    queues: Vec<ArrayQueue<Bytes>>,
    accepted: AtomicU64,
    refused: AtomicU64,
    delivered: AtomicU64,
}

impl MeshTransport {
    pub fn new(num_servers: usize, workers_per_server: usize, capacity: usize) -> Arc<Self> {
        let queues = (0..num_servers * workers_per_server)
            .map(|_| ArrayQueue::new(capacity))
            .collect();
        Arc::new(Self {
            num_servers,
            workers_per_server,
            queues,
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        })
    }

    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// The endpoint handle for worker `(sid, tid)`.
    pub fn adaptor(self: &Arc<Self>, sid: usize, tid: usize) -> Adaptor {
        debug_assert!(sid < self.num_servers && tid < self.workers_per_server);
        Adaptor {
            sid,
            tid,
            mesh: Arc::clone(self),
        }
    }

    fn queue(&self, sid: usize, tid: usize) -> &ArrayQueue<Bytes> {
        &self.queues[sid * self.workers_per_server + tid]
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// A worker's endpoint on the mesh: best-effort send to any worker plus
/// non-blocking receive from the own ring.
pub struct Adaptor {
    sid: usize,
    tid: usize,
    mesh: Arc<MeshTransport>,
}

impl Adaptor {
    pub fn sid(&self) -> usize {
        self.sid
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Post a bundle to `(dst_sid, dst_tid)`. `false` means the destination
    /// ring is full; retry later.
    pub fn send(&self, dst_sid: usize, dst_tid: usize, bundle: &Bundle) -> bool {
        let frame = bundle.encode();
        match self.mesh.queue(dst_sid, dst_tid).push(frame) {
            Ok(()) => {
                self.mesh.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.mesh.refused.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Non-blocking receive from the own ring. A frame that fails to parse
    /// is dropped with a log line; the substrate guarantees integrity, so
    /// this only fires across incompatible builds.
    pub fn try_recv(&self) -> Option<Bundle> {
        let frame = self.mesh.queue(self.sid, self.tid).pop()?;
        self.mesh.delivered.fetch_add(1, Ordering::Relaxed);
        match Bundle::decode(&frame) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(sid = self.sid, tid = self.tid, "dropping bad frame: {}", e);
                None
            }
        }
    }

    /// Messages currently queued for this endpoint.
    pub fn backlog(&self) -> usize {
        self.mesh.queue(self.sid, self.tid).len()
    }
}
