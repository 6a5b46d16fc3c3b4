//! Blocking client for the store's wire protocol.

use crate::protocol::{self, encode_command, Frame};
use crate::Result;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

/// Client structure that handles communication with the server
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    /// create a new client instance and connect to the given server address
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    /// send a command to the server and return its decoded reply
    pub fn send(&mut self, name: &str, args: &[&str]) -> Result<Frame> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.stream.write_all(&encode_command(name, &args))?;
        self.read_reply()
    }

    /// read one framed reply; blocks until a complete frame arrives.
    /// Useful on its own for subscriber sessions, which receive pushed
    /// message frames they never asked for.
    pub fn read_reply(&mut self) -> Result<Frame> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = protocol::scan_frame(&self.buf)? {
                let message: Vec<u8> = self.buf.drain(..end).collect();
                return protocol::parse_frame(&message);
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// shutdown the client end of TCP
    pub fn shutdown(self) -> Result<()> {
        Ok(self.stream.shutdown(Shutdown::Both)?)
    }
}
