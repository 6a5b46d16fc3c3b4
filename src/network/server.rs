//! The accept loop: one dedicated thread per connection, a shared `Store`,
//! and (on a replica) the replication bootstrap.

use super::replica;
use super::session::{next_session_id, Session};
use crate::config::Config;
use crate::storage::{Snapshot, Store};
use crate::Result;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// The data-store server: binds at construction, serves on [`Server::run`]
pub struct Server {
    listener: TcpListener,
    store: Arc<Store>,
}

impl Server {
    /// Bind the listening socket and load the startup snapshot. Binding
    /// here keeps bind failures separable from serve-time errors.
    pub fn new(config: Config) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let snapshot = Snapshot::load(&config.snapshot_path());
        let store = Arc::new(Store::new(config, snapshot));
        Ok(Self { listener, store })
    }

    /// the address actually bound, useful when the configured port was 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve forever. A replica instance first starts its replication link
    /// in the background, then accepts clients like any master would.
    ///
    /// Sessions may block indefinitely (BLPOP with timeout 0), so each
    /// connection gets a dedicated thread instead of a bounded pool.
    pub fn run(self) -> Result<()> {
        if let Some(master) = self.store.config.replicaof.clone() {
            let store = Arc::clone(&self.store);
            let port = self.local_addr()?.port();
            thread::Builder::new()
                .name(String::from("replication"))
                .spawn(move || {
                    if let Err(err) = replica::run(store, &master, port) {
                        error!("replication link failed: {}", err);
                    }
                })?;
        }

        info!("listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            let id = next_session_id();
            let store = Arc::clone(&self.store);
            thread::Builder::new()
                .name(format!("session-{}", id))
                .spawn(move || Session::new(id, stream, store).run())?;
        }
        Ok(())
    }
}
