//! Master-side replication state: the registry of live replica links and
//! the fan-out of serialized writes.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;
use tracing::{debug, info};

/// Replication id reported by INFO and FULLRESYNC; fixed for the lifetime
/// of the instance.
pub(crate) const REPLICATION_ID: &str = "6f1c2a9b4e8d03775a61c0ffee5b12d9a4e3c801";

struct ReplicaPeer {
    session: u64,
    stream: TcpStream,
}

/// Connections that completed PSYNC. Propagation happens under the lock so
/// every replica observes writes in master-serialization order.
pub(crate) struct ReplicaRegistry {
    peers: Mutex<Vec<ReplicaPeer>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, session: u64, stream: TcpStream) {
        info!("session {} registered as a replica", session);
        let mut peers = self.peers.lock().unwrap();
        peers.push(ReplicaPeer { session, stream });
    }

    pub fn remove(&self, session: u64) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|peer| peer.session != session);
    }

    /// send one serialized command frame to every registered replica;
    /// peers whose socket fails are dropped
    pub fn propagate(&self, frame: &[u8]) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain_mut(|peer| match peer.stream.write_all(frame) {
            Ok(()) => true,
            Err(error) => {
                debug!("dropping replica session {}: {}", peer.session, error);
                false
            }
        });
    }
}
