//! Per-connection dispatcher: framed read loop, subscribed-mode filter,
//! transactions, engine routing, and write propagation.

use super::replication::REPLICATION_ID;
use crate::protocol::{self, Frame, Request};
use crate::storage::{snapshot, Engine, Store};
use crate::Result;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

// whether the session loop keeps going after a command
enum Flow {
    Continue,
    Quit,
}

// commands a session in subscribed mode may still issue
fn allowed_while_subscribed(cmd: &str) -> bool {
    matches!(
        cmd,
        "SUBSCRIBE"
            | "UNSUBSCRIBE"
            | "PSUBSCRIBE"
            | "PUNSUBSCRIBE"
            | "SSUBSCRIBE"
            | "SUNSUBSCRIBE"
            | "PING"
            | "QUIT"
            | "RESET"
    )
}

/// Server-side state of one client connection
pub(crate) struct Session {
    id: u64,
    stream: TcpStream,
    store: Arc<Store>,
    subscribed: bool,
    in_tx: bool,
    queued: Vec<Request>,
    // bytes already read from the socket but not yet framed; a replica link
    // starts with the tail the handshake read past
    pending: Vec<u8>,
}

impl Session {
    pub fn new(id: u64, stream: TcpStream, store: Arc<Store>) -> Self {
        Self::with_pending(id, stream, store, Vec::new())
    }

    pub fn with_pending(id: u64, stream: TcpStream, store: Arc<Store>, pending: Vec<u8>) -> Self {
        Self {
            id,
            stream,
            store,
            subscribed: false,
            in_tx: false,
            queued: Vec::new(),
            pending,
        }
    }

    /// Serve the connection until the peer disconnects or QUITs. Consumes
    /// the session; registry cleanup happens on the way out.
    pub fn run(mut self) {
        if let Err(error) = self.serve() {
            debug!("session {} ended: {}", self.id, error);
        }
        self.store.pubsub.disconnect(self.id);
        self.store.replicas.remove(self.id);
    }

    fn serve(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            // drain every complete frame already buffered
            loop {
                match protocol::scan_frame(&self.pending) {
                    Ok(Some(end)) => {
                        let message: Vec<u8> = self.pending.drain(..end).collect();
                        match self.handle_message(&message)? {
                            Flow::Continue => {}
                            Flow::Quit => return Ok(()),
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // framing is unrecoverable: answer and resync on
                        // whatever arrives next
                        self.pending.clear();
                        self.write_frame(&Frame::err("Protocol error"))?;
                        break;
                    }
                }
            }

            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                debug!("session {} disconnected", self.id);
                return Ok(());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn handle_message(&mut self, message: &[u8]) -> Result<Flow> {
        let request = match protocol::parse_request(message) {
            Ok(request) => request,
            Err(error) => {
                debug!("session {}: unparsable message: {}", self.id, error);
                self.write_frame(&Frame::err("Protocol error"))?;
                return Ok(Flow::Continue);
            }
        };
        self.handle_request(request)
    }

    fn handle_request(&mut self, request: Request) -> Result<Flow> {
        let cmd = request.name.to_ascii_uppercase();

        if self.subscribed && !allowed_while_subscribed(&cmd) {
            self.write_frame(&Frame::err(format!(
                "Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
                request.name
            )))?;
            return Ok(Flow::Continue);
        }

        match cmd.as_str() {
            "PING" => self.ping(),
            "ECHO" => self.echo(&request.args),
            "MULTI" => self.multi(),
            "EXEC" => self.exec(),
            "DISCARD" => self.discard(),
            "TYPE" => self.type_of(&request.args),
            "INFO" => self.info(&request.args),
            "CONFIG" => self.config_get(&request.args),
            "REPLCONF" => self.write_frame(&Frame::Simple(String::from("OK"))),
            "PSYNC" => self.psync(&request.args),
            "QUIT" => {
                self.write_frame(&Frame::Simple(String::from("OK")))?;
                return Ok(Flow::Quit);
            }
            "RESET" => self.reset(),
            _ if self.is_data_command(&cmd) => {
                if self.in_tx {
                    self.queued.push(request);
                    self.write_frame(&Frame::Simple(String::from("QUEUED")))?;
                    return Ok(Flow::Continue);
                }
                let replies = self.run_data_command(&cmd, &request.args)?;
                for reply in &replies {
                    self.write_frame(reply)?;
                }
                self.propagate_if_write(&cmd, &request)?;
                Ok(())
            }
            _ => self.write_frame(&Frame::err(format!("unknown command '{}'", request.name))),
        }?;
        Ok(Flow::Continue)
    }

    fn is_data_command(&self, cmd: &str) -> bool {
        let store = &self.store;
        store.kv.owns(cmd)
            || store.lists.owns(cmd)
            || store.streams.owns(cmd)
            || store.zsets.owns(cmd)
            || matches!(cmd, "SUBSCRIBE" | "UNSUBSCRIBE" | "PUBLISH")
    }

    // run one typed-engine or pub/sub command and collect its reply frames
    // (pub/sub confirmations may span several)
    fn run_data_command(&mut self, cmd: &str, args: &[String]) -> Result<Vec<Frame>> {
        let store = Arc::clone(&self.store);
        let replies = if store.kv.owns(cmd) {
            vec![store.kv.handle(cmd, args)]
        } else if store.lists.owns(cmd) {
            vec![store.lists.handle(cmd, args)]
        } else if store.streams.owns(cmd) {
            vec![store.streams.handle(cmd, args)]
        } else if store.zsets.owns(cmd) {
            vec![store.zsets.handle(cmd, args)]
        } else {
            match cmd {
                "SUBSCRIBE" => self.subscribe(args)?,
                "UNSUBSCRIBE" => self.unsubscribe(args),
                "PUBLISH" => self.publish(args),
                _ => vec![Frame::err(format!("unknown command '{}'", cmd))],
            }
        };
        Ok(replies)
    }

    fn subscribe(&mut self, args: &[String]) -> Result<Vec<Frame>> {
        if args.is_empty() {
            return Ok(vec![Frame::err("SUBSCRIBE requires a channel name")]);
        }
        self.store
            .pubsub
            .register_writer(self.id, self.stream.try_clone()?);
        let mut replies = Vec::with_capacity(args.len());
        for channel in args {
            let count = self.store.pubsub.subscribe(self.id, channel);
            self.subscribed = true;
            replies.push(Frame::Array(vec![
                Frame::Bulk(String::from("subscribe")),
                Frame::Bulk(channel.clone()),
                Frame::Integer(count as i64),
            ]));
        }
        Ok(replies)
    }

    fn unsubscribe(&mut self, args: &[String]) -> Vec<Frame> {
        let confirmations = self.store.pubsub.unsubscribe(self.id, args);
        self.subscribed = self.store.pubsub.is_subscribed(self.id);
        confirmations
            .into_iter()
            .map(|(channel, remaining)| {
                Frame::Array(vec![
                    Frame::Bulk(String::from("unsubscribe")),
                    channel.map_or(Frame::NullBulk, Frame::Bulk),
                    Frame::Integer(remaining as i64),
                ])
            })
            .collect()
    }

    fn publish(&self, args: &[String]) -> Vec<Frame> {
        if args.len() < 2 {
            return vec![Frame::err("PUBLISH requires a channel and a message")];
        }
        let delivered = self.store.pubsub.publish(self.id, &args[0], &args[1]);
        vec![Frame::Integer(delivered as i64)]
    }

    fn ping(&mut self) -> Result<()> {
        if self.subscribed {
            self.write_frame(&Frame::Array(vec![
                Frame::Bulk(String::from("pong")),
                Frame::Bulk(String::new()),
            ]))
        } else {
            self.write_frame(&Frame::Simple(String::from("PONG")))
        }
    }

    fn echo(&mut self, args: &[String]) -> Result<()> {
        match args.first() {
            Some(message) => self.write_frame(&Frame::Bulk(message.clone())),
            None => self.write_frame(&Frame::err("ECHO requires an argument")),
        }
    }

    fn multi(&mut self) -> Result<()> {
        if self.in_tx {
            return self.write_frame(&Frame::err("MULTI calls cannot be nested"));
        }
        self.in_tx = true;
        self.queued.clear();
        self.write_frame(&Frame::Simple(String::from("OK")))
    }

    fn exec(&mut self) -> Result<()> {
        if !self.in_tx {
            return self.write_frame(&Frame::err("EXEC without MULTI"));
        }
        self.in_tx = false;
        let queued = std::mem::take(&mut self.queued);

        // leading header, then each queued command's own reply in order
        self.write_all(format!("*{}\r\n", queued.len()).as_bytes())?;
        for request in queued {
            let cmd = request.name.to_ascii_uppercase();
            let replies = self.run_data_command(&cmd, &request.args)?;
            for reply in &replies {
                self.write_frame(reply)?;
            }
            self.propagate_if_write(&cmd, &request)?;
        }
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        if !self.in_tx {
            return self.write_frame(&Frame::err("DISCARD without MULTI"));
        }
        self.in_tx = false;
        self.queued.clear();
        self.write_frame(&Frame::Simple(String::from("OK")))
    }

    fn reset(&mut self) -> Result<()> {
        self.in_tx = false;
        self.queued.clear();
        self.store.pubsub.unsubscribe(self.id, &[]);
        self.subscribed = false;
        self.write_frame(&Frame::Simple(String::from("RESET")))
    }

    // probe the keyed engines in a fixed order, one lock at a time
    fn type_of(&mut self, args: &[String]) -> Result<()> {
        let key = match args.first() {
            Some(key) => key,
            None => return self.write_frame(&Frame::err("TYPE requires a key")),
        };
        let store = &self.store;
        let probes: [&dyn Engine; 3] = [&store.kv, &store.lists, &store.streams];
        let name = probes
            .iter()
            .find(|engine| engine.has_key(key))
            .map_or("none", |engine| engine.type_name());
        self.write_frame(&Frame::Simple(name.to_string()))
    }

    fn info(&mut self, args: &[String]) -> Result<()> {
        if args.len() != 1 || !args[0].eq_ignore_ascii_case("replication") {
            return self.write_frame(&Frame::err("unsupported INFO section"));
        }
        let payload = if self.store.is_master() {
            format!(
                "role:master\r\nmaster_replid:{}\r\nmaster_repl_offset:0",
                REPLICATION_ID
            )
        } else {
            String::from("role:slave")
        };
        self.write_frame(&Frame::Bulk(payload))
    }

    fn config_get(&mut self, args: &[String]) -> Result<()> {
        if args.len() < 2 || !args[0].eq_ignore_ascii_case("get") {
            return self.write_frame(&Frame::err("CONFIG GET requires a parameter"));
        }
        let param = &args[1];
        let value = if param.eq_ignore_ascii_case("dir") {
            self.store.config.dir.clone()
        } else if param.eq_ignore_ascii_case("dbfilename") {
            self.store.config.dbfilename.clone()
        } else {
            String::new()
        };
        self.write_frame(&Frame::Array(vec![
            Frame::Bulk(param.clone()),
            Frame::Bulk(value),
        ]))
    }

    // master side of the sync: FULLRESYNC line, snapshot payload, then the
    // connection joins the replica registry
    fn psync(&mut self, args: &[String]) -> Result<()> {
        if args.len() != 2 || args[0] != "?" || args[1] != "-1" {
            return self.write_frame(&Frame::err("invalid PSYNC args"));
        }
        self.write_frame(&Frame::Simple(format!("FULLRESYNC {} 0", REPLICATION_ID)))?;

        let blob = snapshot::EMPTY_SNAPSHOT;
        // bulk length prefix, then the raw bytes with no trailing CRLF
        let mut payload = format!("${}\r\n", blob.len()).into_bytes();
        payload.extend_from_slice(blob);
        self.write_all(&payload)?;

        self.store
            .replicas
            .register(self.id, self.stream.try_clone()?);
        Ok(())
    }

    fn propagate_if_write(&self, cmd: &str, request: &Request) -> Result<()> {
        if !self.store.is_master() {
            return Ok(());
        }
        let store = &self.store;
        let is_write = store.kv.is_write(cmd)
            || store.lists.is_write(cmd)
            || store.streams.is_write(cmd)
            || store.zsets.is_write(cmd);
        if is_write {
            store.replicas.propagate(&request.encode());
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_all(&frame.encode())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(error) = self.stream.write_all(bytes) {
            warn!("session {}: write failed: {}", self.id, error);
            return Err(error.into());
        }
        Ok(())
    }
}
