//! The typed storage engines and the shared `Store` that owns them.

pub(crate) mod geo;
pub(crate) mod kv;
pub(crate) mod list;
pub(crate) mod snapshot;
pub(crate) mod sorted_set;
pub(crate) mod stream;

use crate::config::Config;
use crate::network::replication::ReplicaRegistry;
use crate::protocol::Frame;
use crate::pubsub::PubSub;
use std::sync::Arc;

pub(crate) use snapshot::Snapshot;

/// Capability set every typed engine exposes to the dispatcher.
///
/// `cmd` arrives uppercased; argument bytes are untouched.
pub(crate) trait Engine {
    /// whether this engine handles the command
    fn owns(&self, cmd: &str) -> bool;

    /// whether the command mutates state and must be propagated to replicas
    fn is_write(&self, cmd: &str) -> bool {
        let _ = cmd;
        false
    }

    /// the name `TYPE` reports for keys living in this engine
    fn type_name(&self) -> &'static str;

    /// whether the key currently exists in this engine
    fn has_key(&self, key: &str) -> bool;

    /// execute the command and produce the reply frame; may suspend the
    /// calling session thread (BLPOP, XREAD BLOCK)
    fn handle(&self, cmd: &str, args: &[String]) -> Frame;
}

/// Resolve negative-from-end range indices against a collection of `len`
/// items and clamp to bounds; `None` means the selection is empty.
pub(crate) fn clamp_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { start + len } else { start };
    let mut stop = if stop < 0 { stop + len } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Process-wide state: every engine, the pub/sub registry, and the startup
/// snapshot. Created once by the server and shared with each session.
pub(crate) struct Store {
    pub config: Config,
    pub kv: kv::KvEngine,
    pub lists: list::ListEngine,
    pub streams: stream::StreamEngine,
    pub zsets: sorted_set::ZSetEngine,
    pub pubsub: PubSub,
    pub replicas: ReplicaRegistry,
}

impl Store {
    pub fn new(config: Config, snapshot: Snapshot) -> Self {
        Self {
            config,
            kv: kv::KvEngine::new(Arc::new(snapshot)),
            lists: list::ListEngine::new(),
            streams: stream::StreamEngine::new(),
            zsets: sorted_set::ZSetEngine::new(),
            pubsub: PubSub::new(),
            replicas: ReplicaRegistry::new(),
        }
    }

    /// true unless this instance was started as a replica of some master
    pub fn is_master(&self) -> bool {
        self.config.replicaof.is_none()
    }
}
