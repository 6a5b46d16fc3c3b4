//! Reader for the persisted binary snapshot that seeds the store at boot.
//!
//! The file starts with the 5-byte `REDIS` magic and a 4-byte version,
//! followed by a stream of opcodes. Only string records are loaded; other
//! object types are skipped record-by-record. The reader is tolerant: a
//! missing file yields an empty snapshot, and any parse failure aborts the
//! load leaving the live store unchanged.

use crate::{Result, StoreErrorKind};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const OP_METADATA: u8 = 0xFA;
const OP_RESIZE: u8 = 0xFB;
const OP_EXPIRY_MS: u8 = 0xFC;
const OP_EXPIRY_S: u8 = 0xFD;
const OP_SELECT_DB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;
const OP_STRING: u8 = 0x00;

/// The smallest conformant snapshot: magic, version, select DB 0, EOF,
/// zeroed checksum. Sent as the FULLRESYNC payload.
pub(crate) const EMPTY_SNAPSHOT: &[u8] =
    b"REDIS0011\xfe\x00\xff\x00\x00\x00\x00\x00\x00\x00\x00";

struct SnapshotEntry {
    value: String,
    // absolute wall-clock expiry
    expiry_epoch_ms: Option<i64>,
}

/// Parsed snapshot contents, read-only after load
pub(crate) struct Snapshot {
    databases: HashMap<u32, HashMap<String, SnapshotEntry>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            databases: HashMap::new(),
        }
    }

    /// Load `path`, tolerating absence and malformed contents
    pub fn load(path: &str) -> Self {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                info!("no snapshot at {}, starting empty", path);
                return Self::empty();
            }
        };
        match parse(BufReader::new(file)) {
            Ok(databases) => {
                info!("loaded snapshot {}", path);
                Self { databases }
            }
            Err(error) => {
                warn!("snapshot {} unreadable, ignoring it: {}", path, error);
                Self::empty()
            }
        }
    }

    /// Look up a key, honoring its absolute expiry
    pub fn get(&self, db: u32, key: &str) -> Option<&str> {
        let entry = self.databases.get(&db)?.get(key)?;
        if let Some(expiry) = entry.expiry_epoch_ms {
            if expiry <= epoch_ms() {
                return None;
            }
        }
        Some(&entry.value)
    }

    /// Build a snapshot holding the given db-0 keys, bypassing the file
    /// format. Test seam only.
    #[cfg(test)]
    pub fn seeded(entries: &[(&str, &str)]) -> Self {
        let mut db0 = HashMap::new();
        for (key, value) in entries {
            db0.insert(
                key.to_string(),
                SnapshotEntry {
                    value: value.to_string(),
                    expiry_epoch_ms: None,
                },
            );
        }
        let mut databases = HashMap::new();
        databases.insert(0, db0);
        Self { databases }
    }

    /// All non-expired keys of one database
    pub fn keys(&self, db: u32) -> Vec<String> {
        let entries = match self.databases.get(&db) {
            Some(entries) => entries,
            None => return Vec::new(),
        };
        let now = epoch_ms();
        entries
            .iter()
            .filter(|(_, entry)| entry.expiry_epoch_ms.map_or(true, |at| at > now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse(mut reader: impl Read) -> Result<HashMap<u32, HashMap<String, SnapshotEntry>>> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header)?;
    if &header[..5] != b"REDIS" {
        return Err(StoreErrorKind::SnapshotError.into());
    }

    let mut databases: HashMap<u32, HashMap<String, SnapshotEntry>> = HashMap::new();
    let mut current_db: u32 = 0;
    let mut pending_expiry: Option<i64> = None;
    let now = epoch_ms();

    loop {
        let op = match next_op(&mut reader)? {
            Some(op) => op,
            None => break,
        };
        match op {
            OP_EOF => {
                let mut crc = [0u8; 8];
                // checksum is present but not verified
                let _ = reader.read(&mut crc)?;
                break;
            }
            OP_SELECT_DB => {
                current_db = read_plain_length(&mut reader)? as u32;
            }
            OP_RESIZE => {
                read_plain_length(&mut reader)?;
                read_plain_length(&mut reader)?;
            }
            OP_METADATA => {
                read_string(&mut reader)?;
                read_string(&mut reader)?;
            }
            OP_EXPIRY_MS => {
                pending_expiry = Some(reader.read_u64::<LittleEndian>()? as i64);
            }
            OP_EXPIRY_S => {
                pending_expiry = Some(reader.read_u32::<LittleEndian>()? as i64 * 1000);
            }
            OP_STRING => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                let expiry_epoch_ms = pending_expiry.take();
                if let Some(at) = expiry_epoch_ms {
                    if at <= now {
                        continue;
                    }
                }
                databases.entry(current_db).or_default().insert(
                    key,
                    SnapshotEntry {
                        value,
                        expiry_epoch_ms,
                    },
                );
            }
            0x01..=0x05 => {
                // unsupported collection record: skip its payload
                let len = read_plain_length(&mut reader)?;
                for _ in 0..len {
                    read_string(&mut reader)?;
                    if op >= 0x03 {
                        read_string(&mut reader)?;
                    }
                }
                pending_expiry = None;
            }
            _ => return Err(StoreErrorKind::SnapshotError.into()),
        }
    }

    Ok(databases)
}

// a clean EOF at an opcode boundary ends the stream
fn next_op(reader: &mut impl Read) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

enum Length {
    Plain(u64),
    Special(u8),
}

// top two bits of the first byte select the format: 00 inline 6-bit,
// 01 14-bit, 10 32-bit big-endian, 11 special-encoded value
fn read_length(reader: &mut impl Read) -> Result<Length> {
    let first = reader.read_u8()?;
    match first >> 6 {
        0b00 => Ok(Length::Plain(u64::from(first & 0x3F))),
        0b01 => {
            let second = reader.read_u8()?;
            Ok(Length::Plain(
                (u64::from(first & 0x3F) << 8) | u64::from(second),
            ))
        }
        0b10 => Ok(Length::Plain(u64::from(reader.read_u32::<BigEndian>()?))),
        _ => Ok(Length::Special(first & 0x3F)),
    }
}

fn read_plain_length(reader: &mut impl Read) -> Result<u64> {
    match read_length(reader)? {
        Length::Plain(len) => Ok(len),
        Length::Special(_) => Err(StoreErrorKind::SnapshotError.into()),
    }
}

fn read_string(reader: &mut impl Read) -> Result<String> {
    match read_length(reader)? {
        Length::Plain(len) => {
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            String::from_utf8(buf).map_err(|_| StoreErrorKind::SnapshotError.into())
        }
        Length::Special(0) => Ok(i64::from(reader.read_i8()?).to_string()),
        Length::Special(1) => Ok(i64::from(reader.read_i16::<LittleEndian>()?).to_string()),
        Length::Special(2) => Ok(u64::from(reader.read_u32::<LittleEndian>()?).to_string()),
        Length::Special(3) => {
            // LZF-compressed string: skip the compressed payload, then bail
            let clen = read_plain_length(reader)?;
            let _ulen = read_plain_length(reader)?;
            io::copy(&mut reader.take(clen), &mut io::sink())?;
            Err(StoreErrorKind::SnapshotError.into())
        }
        Length::Special(_) => Err(StoreErrorKind::SnapshotError.into()),
    }
}
