//! String key-value engine with monotonic-clock TTL and snapshot fallback.

use super::{Engine, Snapshot};
use crate::protocol::Frame;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct ValueWithExpiry {
    value: String,
    expiry: Option<Instant>,
}

impl ValueWithExpiry {
    fn expired(&self) -> bool {
        self.expiry.map_or(false, |at| Instant::now() >= at)
    }
}

/// String KV engine. Reads fall back to the startup snapshot when the live
/// map lacks the key; expired entries are removed lazily at the read that
/// observes them.
pub(crate) struct KvEngine {
    entries: Mutex<HashMap<String, ValueWithExpiry>>,
    snapshot: Arc<Snapshot>,
}

impl KvEngine {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot,
        }
    }

    fn set(&self, args: &[String]) -> Frame {
        if args.len() < 2 {
            return Frame::err("SET requires key and value");
        }
        let mut expiry = None;
        if args.len() >= 4 && args[2].eq_ignore_ascii_case("px") {
            match args[3].parse::<u64>() {
                Ok(ms) => expiry = Some(Instant::now() + Duration::from_millis(ms)),
                Err(_) => return Frame::err("Invalid PX value"),
            }
        }
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            args[0].clone(),
            ValueWithExpiry {
                value: args[1].clone(),
                expiry,
            },
        );
        Frame::Simple(String::from("OK"))
    }

    fn get(&self, args: &[String]) -> Frame {
        if args.is_empty() {
            return Frame::err("GET requires a key");
        }
        let key = &args[0];
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                if !entry.expired() {
                    return Frame::Bulk(entry.value.clone());
                }
                // lazily expired: the live map no longer holds the key,
                // fall through to the snapshot
                entries.remove(key);
            }
        }
        match self.snapshot.get(0, key) {
            Some(value) => Frame::Bulk(value.to_string()),
            None => Frame::NullBulk,
        }
    }

    fn incr(&self, args: &[String]) -> Frame {
        if args.len() != 1 {
            return Frame::err("INCR requires exactly one key");
        }
        let key = &args[0];
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if !entry.expired() {
                let next = match entry.value.parse::<i64>().ok().and_then(|n| n.checked_add(1)) {
                    Some(next) => next,
                    None => return Frame::err("value is not an integer or out of range"),
                };
                entry.value = next.to_string();
                return Frame::Integer(next);
            }
        }
        // missing or expired: restart from 1
        entries.insert(
            key.clone(),
            ValueWithExpiry {
                value: String::from("1"),
                expiry: None,
            },
        );
        Frame::Integer(1)
    }

    fn keys(&self, args: &[String]) -> Frame {
        if args.len() != 1 || args[0] != "*" {
            return Frame::err("Only KEYS * supported");
        }
        let mut keys: BTreeSet<String> = self.snapshot.keys(0).into_iter().collect();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|_, entry| !entry.expired());
            keys.extend(entries.keys().cloned());
        }
        Frame::Array(keys.into_iter().map(Frame::Bulk).collect())
    }
}

impl Engine for KvEngine {
    fn owns(&self, cmd: &str) -> bool {
        matches!(cmd, "SET" | "GET" | "INCR" | "KEYS")
    }

    fn is_write(&self, cmd: &str) -> bool {
        matches!(cmd, "SET" | "INCR")
    }

    fn type_name(&self) -> &'static str {
        "string"
    }

    fn has_key(&self, key: &str) -> bool {
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                if entry.expired() {
                    entries.remove(key);
                } else {
                    return true;
                }
            }
        }
        self.snapshot.get(0, key).is_some()
    }

    fn handle(&self, cmd: &str, args: &[String]) -> Frame {
        match cmd {
            "SET" => self.set(args),
            "GET" => self.get(args),
            "INCR" => self.incr(args),
            "KEYS" => self.keys(args),
            _ => Frame::err(format!("unknown command '{}'", cmd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn engine() -> KvEngine {
        KvEngine::new(Arc::new(Snapshot::empty()))
    }

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn set_then_get_round_trips() {
        let kv = engine();
        assert_eq!(
            kv.handle("SET", &strings(&["x", "1"])),
            Frame::Simple("OK".into())
        );
        assert_eq!(kv.handle("GET", &strings(&["x"])), Frame::Bulk("1".into()));
    }

    #[test]
    fn set_is_idempotent() {
        let kv = engine();
        kv.handle("SET", &strings(&["x", "7"]));
        kv.handle("SET", &strings(&["x", "7"]));
        assert_eq!(kv.handle("GET", &strings(&["x"])), Frame::Bulk("7".into()));
    }

    #[test]
    fn px_expiry_is_observed_lazily() {
        let kv = engine();
        kv.handle("SET", &strings(&["x", "1", "PX", "30"]));
        assert_eq!(kv.handle("GET", &strings(&["x"])), Frame::Bulk("1".into()));
        sleep(std::time::Duration::from_millis(60));
        assert_eq!(kv.handle("GET", &strings(&["x"])), Frame::NullBulk);
        assert!(!kv.has_key("x"));
    }

    #[test]
    fn px_keyword_is_case_insensitive() {
        let kv = engine();
        kv.handle("SET", &strings(&["x", "1", "px", "30"]));
        sleep(std::time::Duration::from_millis(60));
        assert_eq!(kv.handle("GET", &strings(&["x"])), Frame::NullBulk);
    }

    #[test]
    fn incr_counts_from_missing_and_rejects_garbage() {
        let kv = engine();
        assert_eq!(kv.handle("INCR", &strings(&["n"])), Frame::Integer(1));
        assert_eq!(kv.handle("INCR", &strings(&["n"])), Frame::Integer(2));

        kv.handle("SET", &strings(&["s", "abc"]));
        assert_eq!(
            kv.handle("INCR", &strings(&["s"])),
            Frame::err("value is not an integer or out of range")
        );
    }

    #[test]
    fn incr_on_an_expired_key_restarts_from_one() {
        let kv = engine();
        kv.handle("SET", &strings(&["n", "41", "PX", "20"]));
        sleep(std::time::Duration::from_millis(50));
        assert_eq!(kv.handle("INCR", &strings(&["n"])), Frame::Integer(1));
    }

    #[test]
    fn keys_unions_live_and_snapshot_sorted() {
        let kv = KvEngine::new(Arc::new(Snapshot::seeded(&[("boot", "1"), ("apple", "2")])));
        kv.handle("SET", &strings(&["zed", "3"]));
        assert_eq!(
            kv.handle("KEYS", &strings(&["*"])),
            Frame::Array(vec![
                Frame::Bulk("apple".into()),
                Frame::Bulk("boot".into()),
                Frame::Bulk("zed".into()),
            ])
        );
    }

    #[test]
    fn keys_skips_entries_that_expired_in_place() {
        let kv = engine();
        kv.handle("SET", &strings(&["gone", "1", "PX", "20"]));
        kv.handle("SET", &strings(&["kept", "2"]));
        sleep(std::time::Duration::from_millis(50));
        assert_eq!(
            kv.handle("KEYS", &strings(&["*"])),
            Frame::Array(vec![Frame::Bulk("kept".into())])
        );
    }

    #[test]
    fn keys_rejects_real_patterns() {
        let kv = engine();
        assert!(matches!(kv.handle("KEYS", &strings(&["a*"])), Frame::Error(_)));
    }

    #[test]
    fn get_on_an_expired_live_entry_falls_back_to_the_snapshot() {
        let kv = KvEngine::new(Arc::new(Snapshot::seeded(&[("k", "boot")])));
        kv.handle("SET", &strings(&["k", "live", "PX", "20"]));
        assert_eq!(kv.handle("GET", &strings(&["k"])), Frame::Bulk("live".into()));
        sleep(std::time::Duration::from_millis(50));
        // the live write expired, so the snapshot value surfaces again
        assert_eq!(kv.handle("GET", &strings(&["k"])), Frame::Bulk("boot".into()));
    }

    #[test]
    fn get_falls_back_to_the_snapshot_only_on_live_miss() {
        let kv = KvEngine::new(Arc::new(Snapshot::seeded(&[("k", "old")])));
        assert_eq!(kv.handle("GET", &strings(&["k"])), Frame::Bulk("old".into()));
        kv.handle("SET", &strings(&["k", "new"]));
        assert_eq!(kv.handle("GET", &strings(&["k"])), Frame::Bulk("new".into()));
        assert!(kv.has_key("k"));
    }
}
