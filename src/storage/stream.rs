//! Stream engine: append-only entries with `<ms>-<seq>` IDs, range scans,
//! and blocking reads.

use super::Engine;
use crate::protocol::Frame;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Entry identifier; ordering is lexicographic on `(ms, seq)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

// how XADD specified the new entry's id
enum IdSpec {
    Auto,
    AutoSeq(u64),
    Explicit(StreamId),
}

fn parse_id_spec(text: &str) -> Result<IdSpec, Frame> {
    if text == "*" {
        return Ok(IdSpec::Auto);
    }
    match text.split_once('-') {
        Some((ms, seq)) => {
            let ms = ms.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
            if seq == "*" {
                Ok(IdSpec::AutoSeq(ms))
            } else {
                let seq = seq.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
                Ok(IdSpec::Explicit(StreamId { ms, seq }))
            }
        }
        None => {
            let ms = text.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
            Ok(IdSpec::AutoSeq(ms))
        }
    }
}

// an XRANGE bound; a bare ms defaults seq to 0 at the start and to MAX at
// the end
fn parse_range_bound(text: &str, is_start: bool) -> Result<StreamId, Frame> {
    if is_start && text == "-" {
        return Ok(StreamId { ms: 0, seq: 0 });
    }
    if !is_start && text == "+" {
        return Ok(StreamId {
            ms: u64::MAX,
            seq: u64::MAX,
        });
    }
    match text.split_once('-') {
        Some((ms, seq)) => {
            let ms = ms.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
            let seq = seq.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
            Ok(StreamId { ms, seq })
        }
        None => {
            let ms = text.parse::<u64>().map_err(|_| Frame::err("Invalid ID format"))?;
            Ok(StreamId {
                ms,
                seq: if is_start { 0 } else { u64::MAX },
            })
        }
    }
}

/// An XREAD cursor: entries strictly after this point qualify. A bare ms
/// carries no sequence, which admits every entry of that millisecond.
#[derive(Debug, Clone, Copy)]
struct ReadCursor {
    ms: u64,
    seq: Option<u64>,
}

impl ReadCursor {
    fn parse(text: &str) -> Result<Self, Frame> {
        match text.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| Frame::err("Invalid ID format"))?,
                seq: Some(seq.parse().map_err(|_| Frame::err("Invalid ID format"))?),
            }),
            None => Ok(Self {
                ms: text.parse().map_err(|_| Frame::err("Invalid ID format"))?,
                seq: None,
            }),
        }
    }

    fn admits(&self, id: StreamId) -> bool {
        id.ms > self.ms || (id.ms == self.ms && self.seq.map_or(true, |seq| id.seq > seq))
    }
}

struct StreamEntry {
    id: StreamId,
    fields: BTreeMap<String, String>,
}

impl StreamEntry {
    fn to_frame(&self) -> Frame {
        let mut flat = Vec::with_capacity(self.fields.len() * 2);
        for (name, value) in &self.fields {
            flat.push(Frame::Bulk(name.clone()));
            flat.push(Frame::Bulk(value.clone()));
        }
        Frame::Array(vec![
            Frame::Bulk(self.id.to_string()),
            Frame::Array(flat),
        ])
    }
}

type Streams = HashMap<String, Vec<StreamEntry>>;

/// Stream engine. XADD notifies the condvar; XREAD BLOCK waits on it and
/// re-evaluates its cursors after every wakeup.
pub(crate) struct StreamEngine {
    entries: Mutex<Streams>,
    wakeup: Condvar,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
        }
    }

    fn xadd(&self, args: &[String]) -> Frame {
        if args.len() < 4 || args.len() % 2 != 0 {
            return Frame::err("XADD requires a key, ID, and field-value pairs");
        }
        let key = &args[0];
        let spec = match parse_id_spec(&args[1]) {
            Ok(spec) => spec,
            Err(reply) => return reply,
        };

        let mut entries = self.entries.lock().unwrap();
        let stream = entries.entry(key.clone()).or_default();

        let id = match spec {
            IdSpec::Explicit(id) => id,
            IdSpec::Auto => derive_id(stream, wall_clock_ms()),
            IdSpec::AutoSeq(ms) => derive_id(stream, ms),
        };

        if id.ms == 0 && id.seq == 0 {
            return Frame::err("The ID specified in XADD must be greater than 0-0");
        }
        if let Some(last) = stream.last() {
            if id <= last.id {
                return Frame::err(
                    "The ID specified in XADD is equal or smaller than the target stream top item",
                );
            }
        }

        let mut fields = BTreeMap::new();
        for pair in args[2..].chunks(2) {
            fields.insert(pair[0].clone(), pair[1].clone());
        }
        stream.push(StreamEntry { id, fields });
        self.wakeup.notify_all();
        Frame::Bulk(id.to_string())
    }

    fn xrange(&self, args: &[String]) -> Frame {
        if args.len() < 3 {
            return Frame::err("XRANGE requires key, start, end");
        }
        let start = match parse_range_bound(&args[1], true) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        let end = match parse_range_bound(&args[2], false) {
            Ok(id) => id,
            Err(reply) => return reply,
        };

        let entries = self.entries.lock().unwrap();
        let stream = match entries.get(&args[0]) {
            Some(stream) => stream,
            None => return Frame::Array(Vec::new()),
        };
        Frame::Array(
            stream
                .iter()
                .filter(|entry| entry.id >= start && entry.id <= end)
                .map(StreamEntry::to_frame)
                .collect(),
        )
    }

    fn xread(&self, args: &[String]) -> Frame {
        // [BLOCK ms] streams <key...> <id...>
        let mut block: Option<u64> = None;
        let mut idx = 0;
        while idx < args.len() && !args[idx].eq_ignore_ascii_case("streams") {
            if args[idx].eq_ignore_ascii_case("block") && idx + 1 < args.len() {
                match args[idx + 1].parse::<u64>() {
                    Ok(ms) => block = Some(ms),
                    Err(_) => return Frame::err("timeout is not an integer or out of range"),
                }
                idx += 2;
            } else {
                idx += 1;
            }
        }
        if idx >= args.len() {
            return Frame::err("XREAD syntax error");
        }
        idx += 1;

        let rest = &args[idx..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Frame::err("Number of keys and IDs must match");
        }
        let (keys, ids) = rest.split_at(rest.len() / 2);
        let mut cursors = Vec::with_capacity(keys.len());
        for id in ids {
            match ReadCursor::parse(id) {
                Ok(cursor) => cursors.push(cursor),
                Err(reply) => return reply,
            }
        }

        let mut entries = self.entries.lock().unwrap();
        let mut results = collect_new(&entries, keys, &cursors);

        if results.is_empty() {
            if let Some(ms) = block {
                let anything_new =
                    |streams: &Streams| !collect_new(streams, keys, &cursors).is_empty();
                if ms == 0 {
                    entries = self
                        .wakeup
                        .wait_while(entries, |streams| !anything_new(streams))
                        .unwrap();
                } else {
                    let deadline = Instant::now() + Duration::from_millis(ms);
                    loop {
                        let remaining = match deadline.checked_duration_since(Instant::now()) {
                            Some(remaining) if remaining > Duration::ZERO => remaining,
                            _ => break,
                        };
                        let (guard, result) = self
                            .wakeup
                            .wait_timeout_while(entries, remaining, |streams| {
                                !anything_new(streams)
                            })
                            .unwrap();
                        entries = guard;
                        if !result.timed_out() {
                            break;
                        }
                    }
                }
                results = collect_new(&entries, keys, &cursors);
            }
        }

        if results.is_empty() {
            return Frame::NullArray;
        }
        Frame::Array(results)
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// auto-derive the sequence for the given millisecond: continue the run of
// same-ms entries, otherwise start at 0 (1 for the reserved ms 0)
fn derive_id(stream: &[StreamEntry], ms: u64) -> StreamId {
    let seq = match stream.last() {
        Some(last) if last.id.ms == ms => last.id.seq + 1,
        _ if ms == 0 => 1,
        _ => 0,
    };
    StreamId { ms, seq }
}

fn collect_new(streams: &Streams, keys: &[String], cursors: &[ReadCursor]) -> Vec<Frame> {
    let mut out = Vec::new();
    for (key, cursor) in keys.iter().zip(cursors) {
        let hits: Vec<Frame> = streams
            .get(key)
            .into_iter()
            .flatten()
            .filter(|entry| cursor.admits(entry.id))
            .map(StreamEntry::to_frame)
            .collect();
        if !hits.is_empty() {
            out.push(Frame::Array(vec![
                Frame::Bulk(key.clone()),
                Frame::Array(hits),
            ]));
        }
    }
    out
}

impl Engine for StreamEngine {
    fn owns(&self, cmd: &str) -> bool {
        matches!(cmd, "XADD" | "XRANGE" | "XREAD")
    }

    fn is_write(&self, cmd: &str) -> bool {
        cmd == "XADD"
    }

    fn type_name(&self) -> &'static str {
        "stream"
    }

    fn has_key(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn handle(&self, cmd: &str, args: &[String]) -> Frame {
        match cmd {
            "XADD" => self.xadd(args),
            "XRANGE" => self.xrange(args),
            "XREAD" => self.xread(args),
            _ => Frame::err(format!("unknown command '{}'", cmd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn entry(id: &str, pairs: &[&str]) -> Frame {
        Frame::Array(vec![
            Frame::Bulk(id.to_string()),
            Frame::Array(pairs.iter().map(|p| Frame::Bulk(p.to_string())).collect()),
        ])
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let streams = StreamEngine::new();
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "1-0", "f", "v"])),
            Frame::Bulk("1-0".into())
        );
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "1-0", "f", "v"])),
            Frame::err("The ID specified in XADD is equal or smaller than the target stream top item")
        );
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "0-5", "f", "v"])),
            Frame::err("The ID specified in XADD is equal or smaller than the target stream top item")
        );
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "1-1", "f", "v"])),
            Frame::Bulk("1-1".into())
        );
    }

    #[test]
    fn the_zero_zero_id_is_reserved() {
        let streams = StreamEngine::new();
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "0-0", "f", "v"])),
            Frame::err("The ID specified in XADD must be greater than 0-0")
        );
    }

    #[test]
    fn auto_sequence_continues_the_same_millisecond_run() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "5-0", "f", "v"]));
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "5-*", "f", "v"])),
            Frame::Bulk("5-1".into())
        );
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "6", "f", "v"])),
            Frame::Bulk("6-0".into())
        );
    }

    #[test]
    fn auto_sequence_for_millisecond_zero_starts_at_one() {
        let streams = StreamEngine::new();
        assert_eq!(
            streams.handle("XADD", &strings(&["s", "0-*", "f", "v"])),
            Frame::Bulk("0-1".into())
        );
    }

    #[test]
    fn fully_automatic_ids_use_the_clock_and_stay_increasing() {
        let streams = StreamEngine::new();
        let first = match streams.handle("XADD", &strings(&["s", "*", "f", "v"])) {
            Frame::Bulk(id) => id,
            other => panic!("unexpected reply {:?}", other),
        };
        let second = match streams.handle("XADD", &strings(&["s", "*", "f", "v"])) {
            Frame::Bulk(id) => id,
            other => panic!("unexpected reply {:?}", other),
        };
        let parse = |s: &str| {
            let (ms, seq) = s.split_once('-').unwrap();
            StreamId {
                ms: ms.parse().unwrap(),
                seq: seq.parse().unwrap(),
            }
        };
        assert!(parse(&second) > parse(&first));
    }

    #[test]
    fn duplicate_fields_within_one_entry_replace() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-0", "f", "old", "f", "new"]));
        assert_eq!(
            streams.handle("XRANGE", &strings(&["s", "-", "+"])),
            Frame::Array(vec![entry("1-0", &["f", "new"])])
        );
    }

    #[test]
    fn xrange_is_inclusive_and_understands_bare_milliseconds() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-1", "a", "1"]));
        streams.handle("XADD", &strings(&["s", "2-0", "b", "2"]));
        streams.handle("XADD", &strings(&["s", "2-5", "c", "3"]));
        streams.handle("XADD", &strings(&["s", "3-0", "d", "4"]));

        assert_eq!(
            streams.handle("XRANGE", &strings(&["s", "2", "2"])),
            Frame::Array(vec![entry("2-0", &["b", "2"]), entry("2-5", &["c", "3"])])
        );
        assert_eq!(
            streams.handle("XRANGE", &strings(&["s", "-", "2-0"])),
            Frame::Array(vec![entry("1-1", &["a", "1"]), entry("2-0", &["b", "2"])])
        );
        assert_eq!(
            streams.handle("XRANGE", &strings(&["s", "2-5", "+"])),
            Frame::Array(vec![entry("2-5", &["c", "3"]), entry("3-0", &["d", "4"])])
        );
    }

    #[test]
    fn xrange_on_a_missing_key_is_empty() {
        let streams = StreamEngine::new();
        assert_eq!(
            streams.handle("XRANGE", &strings(&["no", "-", "+"])),
            Frame::Array(vec![])
        );
    }

    #[test]
    fn xread_filters_strictly_greater_entries() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-0", "a", "1"]));
        streams.handle("XADD", &strings(&["s", "1-1", "b", "2"]));

        assert_eq!(
            streams.handle("XREAD", &strings(&["streams", "s", "1-0"])),
            Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk("s".into()),
                Frame::Array(vec![entry("1-1", &["b", "2"])]),
            ])])
        );
    }

    #[test]
    fn xread_bare_millisecond_admits_that_whole_millisecond() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-0", "a", "1"]));
        assert_eq!(
            streams.handle("XREAD", &strings(&["streams", "s", "1"])),
            Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk("s".into()),
                Frame::Array(vec![entry("1-0", &["a", "1"])]),
            ])])
        );
    }

    #[test]
    fn xread_with_nothing_new_is_a_null_array() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-0", "a", "1"]));
        assert_eq!(
            streams.handle("XREAD", &strings(&["streams", "s", "1-0"])),
            Frame::NullArray
        );
        assert_eq!(
            streams.handle("XREAD", &strings(&["streams", "ghost", "0-0"])),
            Frame::NullArray
        );
    }

    #[test]
    fn xread_reports_only_the_keys_that_yielded() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["a", "1-0", "f", "v"]));
        assert_eq!(
            streams.handle("XREAD", &strings(&["streams", "a", "b", "0-0", "0-0"])),
            Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk("a".into()),
                Frame::Array(vec![entry("1-0", &["f", "v"])]),
            ])])
        );
    }

    #[test]
    fn blocking_xread_wakes_on_a_matching_append() {
        let streams = Arc::new(StreamEngine::new());
        let reader = {
            let streams = Arc::clone(&streams);
            thread::spawn(move || {
                streams.handle("XREAD", &strings(&["BLOCK", "0", "streams", "s", "0-0"]))
            })
        };
        thread::sleep(Duration::from_millis(50));
        streams.handle("XADD", &strings(&["s", "7-0", "f", "v"]));
        assert_eq!(
            reader.join().unwrap(),
            Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk("s".into()),
                Frame::Array(vec![entry("7-0", &["f", "v"])]),
            ])])
        );
    }

    #[test]
    fn blocking_xread_times_out_with_a_null_array() {
        let streams = StreamEngine::new();
        let before = Instant::now();
        assert_eq!(
            streams.handle("XREAD", &strings(&["BLOCK", "80", "streams", "s", "0-0"])),
            Frame::NullArray
        );
        assert!(before.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn xread_keyword_matching_is_case_insensitive() {
        let streams = StreamEngine::new();
        streams.handle("XADD", &strings(&["s", "1-0", "f", "v"]));
        assert!(matches!(
            streams.handle("XREAD", &strings(&["STREAMS", "s", "0-0"])),
            Frame::Array(_)
        ));
    }
}
