//! Wire codec for the request-response protocol.
//!
//! Requests are length-prefixed arrays of bulk strings. Replies reuse the
//! same grammar. Two layers are exposed to the rest of the crate: a framing
//! detector that finds the boundary of one complete top-level message in a
//! byte buffer (the tail of the buffer may hold the start of the next
//! message), and a strict parser/encoder for complete frames.

use crate::{Result, StoreErrorKind};

/// One protocol value, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+<text>\r\n`
    Simple(String),
    /// `-<text>\r\n`
    Error(String),
    /// `:<decimal>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`
    Bulk(String),
    /// `$-1\r\n`
    NullBulk,
    /// `*<count>\r\n<items>`
    Array(Vec<Frame>),
    /// `*-1\r\n`
    NullArray,
}

impl Frame {
    /// build an error frame with the conventional `ERR ` prefix
    pub fn err(msg: impl Into<String>) -> Frame {
        Frame::Error(format!("ERR {}", msg.into()))
    }

    /// serialize this frame into bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(s) => {
                out.push(b'$');
                out.extend_from_slice(s.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::NullBulk => out.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(out);
                }
            }
            Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
        }
    }
}

impl std::fmt::Display for Frame {
    /// human-oriented rendering, used by the command-line client
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "{}", s),
            Frame::Error(s) => write!(f, "(error) {}", s),
            Frame::Integer(n) => write!(f, "(integer) {}", n),
            Frame::Bulk(s) => write!(f, "\"{}\"", s),
            Frame::NullBulk | Frame::NullArray => write!(f, "(nil)"),
            Frame::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Frame::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

/// A parsed client command: name plus positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub name: String,
    pub args: Vec<String>,
}

impl Request {
    /// serialize back into the array-of-bulk-strings form, which is the
    /// form writes are propagated to replicas in
    pub fn encode(&self) -> Vec<u8> {
        encode_command(&self.name, &self.args)
    }
}

/// serialize a command as an array of bulk strings
pub(crate) fn encode_command(name: &str, args: &[String]) -> Vec<u8> {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Frame::Bulk(name.to_string()));
    for arg in args {
        items.push(Frame::Bulk(arg.clone()));
    }
    Frame::Array(items).encode()
}

/// Locate the end of one complete top-level message starting at the head of
/// `buf`. Returns `Ok(None)` when the buffer holds only a prefix of the
/// message, `Ok(Some(end))` when `buf[..end]` is exactly one message.
pub(crate) fn scan_frame(buf: &[u8]) -> Result<Option<usize>> {
    scan_value(buf, 0)
}

fn scan_value(buf: &[u8], pos: usize) -> Result<Option<usize>> {
    if pos >= buf.len() {
        return Ok(None);
    }
    match buf[pos] {
        b'+' | b'-' | b':' => match find_crlf(buf, pos + 1) {
            Some(cr) => Ok(Some(cr + 2)),
            None => Ok(None),
        },
        b'$' => {
            let (len, after) = match scan_prefixed_int(buf, pos + 1)? {
                Some(v) => v,
                None => return Ok(None),
            };
            if len < 0 {
                // null bulk
                return Ok(Some(after));
            }
            let end = after + len as usize + 2;
            if buf.len() < end {
                return Ok(None);
            }
            if &buf[end - 2..end] != b"\r\n" {
                return Err(StoreErrorKind::ProtocolError.into());
            }
            Ok(Some(end))
        }
        b'*' => {
            let (count, mut at) = match scan_prefixed_int(buf, pos + 1)? {
                Some(v) => v,
                None => return Ok(None),
            };
            if count < 0 {
                return Ok(Some(at));
            }
            for _ in 0..count {
                match scan_value(buf, at)? {
                    Some(end) => at = end,
                    None => return Ok(None),
                }
            }
            Ok(Some(at))
        }
        _ => Err(StoreErrorKind::ProtocolError.into()),
    }
}

// parse the `<decimal>\r\n` that follows a `$` or `*` marker; returns the
// value and the offset just past the CRLF
fn scan_prefixed_int(buf: &[u8], pos: usize) -> Result<Option<(i64, usize)>> {
    let cr = match find_crlf(buf, pos) {
        Some(cr) => cr,
        None => return Ok(None),
    };
    let n = parse_decimal(&buf[pos..cr])?;
    Ok(Some((n, cr + 2)))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_decimal(bytes: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(bytes)?;
    text.parse::<i64>()
        .map_err(|_| StoreErrorKind::ProtocolError.into())
}

/// Parse one complete frame out of `buf[..]`. The caller is expected to have
/// located the boundary with [`scan_frame`] first; a truncated buffer is a
/// protocol error here.
pub(crate) fn parse_frame(buf: &[u8]) -> Result<Frame> {
    let (frame, consumed) = parse_value(buf, 0)?;
    if consumed != buf.len() {
        return Err(StoreErrorKind::ProtocolError.into());
    }
    Ok(frame)
}

fn parse_value(buf: &[u8], pos: usize) -> Result<(Frame, usize)> {
    if pos >= buf.len() {
        return Err(StoreErrorKind::ProtocolError.into());
    }
    match buf[pos] {
        b'+' => {
            let (text, end) = take_line(buf, pos + 1)?;
            Ok((Frame::Simple(text), end))
        }
        b'-' => {
            let (text, end) = take_line(buf, pos + 1)?;
            Ok((Frame::Error(text), end))
        }
        b':' => {
            let (text, end) = take_line(buf, pos + 1)?;
            let n = text
                .parse::<i64>()
                .map_err(|_| StoreErrorKind::ProtocolError)?;
            Ok((Frame::Integer(n), end))
        }
        b'$' => {
            let (len_text, after) = take_line(buf, pos + 1)?;
            let len = len_text
                .parse::<i64>()
                .map_err(|_| StoreErrorKind::ProtocolError)?;
            if len < 0 {
                return Ok((Frame::NullBulk, after));
            }
            let end = after + len as usize;
            if buf.len() < end + 2 || &buf[end..end + 2] != b"\r\n" {
                return Err(StoreErrorKind::ProtocolError.into());
            }
            let payload = std::str::from_utf8(&buf[after..end])?.to_string();
            Ok((Frame::Bulk(payload), end + 2))
        }
        b'*' => {
            let (count_text, mut at) = take_line(buf, pos + 1)?;
            let count = count_text
                .parse::<i64>()
                .map_err(|_| StoreErrorKind::ProtocolError)?;
            if count < 0 {
                return Ok((Frame::NullArray, at));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (item, end) = parse_value(buf, at)?;
                items.push(item);
                at = end;
            }
            Ok((Frame::Array(items), at))
        }
        _ => Err(StoreErrorKind::ProtocolError.into()),
    }
}

fn take_line(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let cr = find_crlf(buf, pos).ok_or(StoreErrorKind::ProtocolError)?;
    let text = std::str::from_utf8(&buf[pos..cr])?.to_string();
    Ok((text, cr + 2))
}

/// Parse one complete top-level message as a command. The array may carry
/// bulk strings, simple strings, or integers (replicas see all three);
/// nested arrays are rejected.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Request> {
    if buf.first() != Some(&b'*') {
        return Err(StoreErrorKind::ProtocolError.into());
    }
    let items = match parse_frame(buf)? {
        Frame::Array(items) => items,
        _ => return Err(StoreErrorKind::ProtocolError.into()),
    };
    let mut words = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Frame::Bulk(s) | Frame::Simple(s) => words.push(s),
            Frame::Integer(n) => words.push(n.to_string()),
            _ => return Err(StoreErrorKind::ProtocolError.into()),
        }
    }
    if words.is_empty() {
        return Err(StoreErrorKind::ProtocolError.into());
    }
    let name = words.remove(0);
    Ok(Request { name, args: words })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, args: &[&str]) -> Request {
        Request {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn command_round_trip_consumes_exactly_what_it_produced() {
        let original = req("SET", &["key", "value", "PX", "100"]);
        let bytes = original.encode();

        let end = scan_frame(&bytes).unwrap().unwrap();
        assert_eq!(end, bytes.len());
        assert_eq!(parse_request(&bytes[..end]).unwrap(), original);
    }

    #[test]
    fn detector_leaves_the_tail_of_a_batched_buffer() {
        let mut bytes = req("SET", &["a", "1"]).encode();
        let second = req("INCR", &["a"]).encode();
        bytes.extend_from_slice(&second);

        let end = scan_frame(&bytes).unwrap().unwrap();
        assert_eq!(parse_request(&bytes[..end]).unwrap(), req("SET", &["a", "1"]));
        let rest = &bytes[end..];
        let end2 = scan_frame(rest).unwrap().unwrap();
        assert_eq!(end2, rest.len());
        assert_eq!(parse_request(&rest[..end2]).unwrap(), req("INCR", &["a"]));
    }

    #[test]
    fn incomplete_buffers_are_not_errors() {
        let bytes = req("GET", &["somekey"]).encode();
        for cut in 0..bytes.len() {
            assert!(scan_frame(&bytes[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn arrays_may_mix_simple_strings_and_integers() {
        let bytes = b"*3\r\n+SET\r\n$1\r\nk\r\n:42\r\n";
        let end = scan_frame(bytes).unwrap().unwrap();
        assert_eq!(end, bytes.len());
        assert_eq!(parse_request(bytes).unwrap(), req("SET", &["k", "42"]));
    }

    #[test]
    fn malformed_first_byte_is_a_protocol_error() {
        assert!(scan_frame(b"SET k v\r\n").is_err());
        assert!(parse_request(b"$3\r\nfoo\r\n").is_err());
    }

    #[test]
    fn bulk_without_terminator_is_a_protocol_error() {
        assert!(scan_frame(b"*1\r\n$3\r\nfooXY").is_err());
    }

    #[test]
    fn unparsable_count_is_a_protocol_error() {
        assert!(scan_frame(b"*x\r\n").is_err());
    }

    #[test]
    fn null_frames_encode_to_their_fixed_forms() {
        assert_eq!(Frame::NullBulk.encode(), b"$-1\r\n");
        assert_eq!(Frame::NullArray.encode(), b"*-1\r\n");
    }

    #[test]
    fn replies_nest() {
        let bytes = b"*1\r\n*2\r\n$1\r\nL\r\n*1\r\n$1\r\nz\r\n";
        let end = scan_frame(bytes).unwrap().unwrap();
        assert_eq!(end, bytes.len());
        let frame = parse_frame(bytes).unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk("L".into()),
                Frame::Array(vec![Frame::Bulk("z".into())]),
            ])])
        );
    }

    #[test]
    fn error_frames_carry_the_err_prefix() {
        assert_eq!(
            Frame::err("unknown command 'FOO'").encode(),
            b"-ERR unknown command 'FOO'\r\n"
        );
    }
}
