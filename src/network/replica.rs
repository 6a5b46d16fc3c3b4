//! Replica-side bootstrap: handshake with the master, consume the full
//! resynchronization payload, then apply the live command stream.

use super::session::{next_session_id, Session};
use crate::config::MasterAddr;
use crate::protocol::encode_command;
use crate::storage::Store;
use crate::{Result, StoreErrorKind};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{info, warn};

/// Connect to the master, run the handshake, and serve the replication
/// link until the master disconnects. Applied commands flow through the
/// normal dispatcher; the master ignores their replies.
pub(crate) fn run(store: Arc<Store>, master: &MasterAddr, listening_port: u16) -> Result<()> {
    let stream = TcpStream::connect((master.host.as_str(), master.port))?;
    info!("replica: connected to master {}", master);

    let mut handshake = Handshake {
        stream,
        buf: Vec::new(),
    };
    handshake.exchange("PING", &[], "+PONG")?;
    let port = listening_port.to_string();
    handshake.exchange("REPLCONF", &["listening-port", &port], "+OK")?;
    handshake.exchange("REPLCONF", &["capa", "psync2"], "+OK")?;
    handshake.exchange("PSYNC", &["?", "-1"], "+FULLRESYNC")?;
    handshake.consume_snapshot()?;
    info!("replica: full resynchronization complete, entering live sync");

    // commands may already sit behind the snapshot payload in the same
    // read, so the leftover tail seeds the session buffer
    let Handshake { stream, buf } = handshake;
    Session::with_pending(next_session_id(), stream, store, buf).run();
    Ok(())
}

struct Handshake {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Handshake {
    // send one command and read the single-line reply it earns
    fn exchange(&mut self, name: &str, args: &[&str], expect_prefix: &str) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.stream.write_all(&encode_command(name, &args))?;
        let line = self.read_line()?;
        if !line.starts_with(expect_prefix) {
            warn!("replica: unexpected reply to {}: {:?}", name, line);
        }
        Ok(())
    }

    // the FULLRESYNC payload is a length-prefixed blob with no trailing
    // CRLF; read and discard exactly that many bytes
    fn consume_snapshot(&mut self) -> Result<()> {
        let header = self.read_line()?;
        let len = header
            .strip_prefix('$')
            .and_then(|len| len.parse::<usize>().ok())
            .ok_or(StoreErrorKind::HandshakeError)?;
        while self.buf.len() < len {
            self.refill()?;
        }
        self.buf.drain(..len);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(cr) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = std::str::from_utf8(&self.buf[..cr])?.to_string();
                self.buf.drain(..cr + 2);
                return Ok(line);
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(StoreErrorKind::HandshakeError.into());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}
