//! List engine: ordered sequences with head-biased pop and blocking BLPOP.

use super::{clamp_range, Engine};
use crate::protocol::Frame;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

type Lists = HashMap<String, VecDeque<String>>;

/// List engine. One mutex guards every list; pushes notify the condvar so
/// sessions blocked in BLPOP can re-check their key.
pub(crate) struct ListEngine {
    entries: Mutex<Lists>,
    wakeup: Condvar,
}

impl ListEngine {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
        }
    }

    fn push(&self, args: &[String], front: bool) -> Frame {
        if args.len() < 2 {
            return Frame::err("wrong number of arguments for push");
        }
        let key = &args[0];
        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(key.clone()).or_default();
        for value in &args[1..] {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        let len = list.len();
        self.wakeup.notify_all();
        Frame::Integer(len as i64)
    }

    fn lrange(&self, args: &[String]) -> Frame {
        if args.len() < 3 {
            return Frame::err("LRANGE requires a key, start, and stop");
        }
        let (start, stop) = match (args[1].parse::<i64>(), args[2].parse::<i64>()) {
            (Ok(start), Ok(stop)) => (start, stop),
            _ => return Frame::err("Invalid start or stop value"),
        };
        let entries = self.entries.lock().unwrap();
        let list = match entries.get(&args[0]) {
            Some(list) => list,
            None => return Frame::Array(Vec::new()),
        };
        match clamp_range(start, stop, list.len()) {
            Some((from, to)) => Frame::Array(
                list.iter()
                    .skip(from)
                    .take(to - from + 1)
                    .cloned()
                    .map(Frame::Bulk)
                    .collect(),
            ),
            None => Frame::Array(Vec::new()),
        }
    }

    fn llen(&self, args: &[String]) -> Frame {
        if args.is_empty() {
            return Frame::err("LLEN requires a key");
        }
        let entries = self.entries.lock().unwrap();
        let len = entries.get(&args[0]).map_or(0, |list| list.len());
        Frame::Integer(len as i64)
    }

    fn lpop(&self, args: &[String]) -> Frame {
        if args.is_empty() {
            return Frame::err("LPOP requires a key");
        }
        let key = &args[0];
        let mut entries = self.entries.lock().unwrap();
        let list = match entries.get_mut(key) {
            Some(list) if !list.is_empty() => list,
            _ => return Frame::NullBulk,
        };
        let reply = if args.len() == 1 {
            let value = list.pop_front().unwrap();
            Frame::Bulk(value)
        } else {
            let count = match args[1].parse::<usize>() {
                Ok(count) => count.min(list.len()),
                Err(_) => return Frame::err("Invalid count value"),
            };
            Frame::Array(list.drain(..count).map(Frame::Bulk).collect())
        };
        if list.is_empty() {
            entries.remove(key);
        }
        reply
    }

    fn blpop(&self, args: &[String]) -> Frame {
        if args.len() < 2 {
            return Frame::err("BLPOP requires a key and timeout");
        }
        let key = args[0].clone();
        let timeout = match args[1].parse::<f64>() {
            Ok(secs) if secs >= 0.0 => secs,
            _ => return Frame::err("timeout is not a float or out of range"),
        };

        let has_data = |lists: &Lists| lists.get(&key).map_or(false, |l| !l.is_empty());

        let mut entries = self.entries.lock().unwrap();
        if !has_data(&entries) {
            if timeout == 0.0 {
                entries = self
                    .wakeup
                    .wait_while(entries, |lists| !has_data(lists))
                    .unwrap();
            } else {
                let (guard, result) = self
                    .wakeup
                    .wait_timeout_while(entries, Duration::from_secs_f64(timeout), |lists| {
                        !has_data(lists)
                    })
                    .unwrap();
                entries = guard;
                if result.timed_out() && !has_data(&entries) {
                    return Frame::NullArray;
                }
            }
        }

        let list = entries.get_mut(&key).unwrap();
        let value = list.pop_front().unwrap();
        if list.is_empty() {
            entries.remove(&key);
        }
        Frame::Array(vec![Frame::Bulk(key), Frame::Bulk(value)])
    }
}

impl Engine for ListEngine {
    fn owns(&self, cmd: &str) -> bool {
        matches!(cmd, "LPUSH" | "RPUSH" | "LRANGE" | "LLEN" | "LPOP" | "BLPOP")
    }

    fn is_write(&self, cmd: &str) -> bool {
        matches!(cmd, "LPUSH" | "RPUSH")
    }

    fn type_name(&self) -> &'static str {
        "list"
    }

    fn has_key(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn handle(&self, cmd: &str, args: &[String]) -> Frame {
        match cmd {
            "LPUSH" => self.push(args, true),
            "RPUSH" => self.push(args, false),
            "LRANGE" => self.lrange(args),
            "LLEN" => self.llen(args),
            "LPOP" => self.lpop(args),
            "BLPOP" => self.blpop(args),
            _ => Frame::err(format!("unknown command '{}'", cmd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn bulks(words: &[&str]) -> Frame {
        Frame::Array(words.iter().map(|w| Frame::Bulk(w.to_string())).collect())
    }

    #[test]
    fn rpush_appends_and_lpush_prepends_in_submission_order() {
        let lists = ListEngine::new();
        assert_eq!(lists.handle("RPUSH", &strings(&["L", "a", "b"])), Frame::Integer(2));
        assert_eq!(lists.handle("LPUSH", &strings(&["L", "x", "y"])), Frame::Integer(4));
        // LPUSH x then y leaves y at the head
        assert_eq!(
            lists.handle("LRANGE", &strings(&["L", "0", "-1"])),
            bulks(&["y", "x", "a", "b"])
        );
    }

    #[test]
    fn lrange_negative_indices_cross_zero() {
        let lists = ListEngine::new();
        lists.handle("RPUSH", &strings(&["L", "a", "b", "c", "d"]));
        assert_eq!(lists.handle("LRANGE", &strings(&["L", "-3", "2"])), bulks(&["b", "c"]));
        assert_eq!(lists.handle("LRANGE", &strings(&["L", "-100", "100"])), bulks(&["a", "b", "c", "d"]));
        assert_eq!(lists.handle("LRANGE", &strings(&["L", "2", "1"])), Frame::Array(vec![]));
        assert_eq!(lists.handle("LRANGE", &strings(&["L", "9", "12"])), Frame::Array(vec![]));
        assert_eq!(lists.handle("LRANGE", &strings(&["L", "0", "-9"])), Frame::Array(vec![]));
    }

    #[test]
    fn lrange_on_a_missing_key_is_empty() {
        let lists = ListEngine::new();
        assert_eq!(lists.handle("LRANGE", &strings(&["no", "0", "-1"])), Frame::Array(vec![]));
    }

    #[test]
    fn llen_on_a_missing_key_is_zero() {
        let lists = ListEngine::new();
        assert_eq!(lists.handle("LLEN", &strings(&["no"])), Frame::Integer(0));
    }

    #[test]
    fn lpop_single_and_counted() {
        let lists = ListEngine::new();
        lists.handle("RPUSH", &strings(&["L", "a", "b", "c"]));
        assert_eq!(lists.handle("LPOP", &strings(&["L"])), Frame::Bulk("a".into()));
        assert_eq!(lists.handle("LPOP", &strings(&["L", "5"])), bulks(&["b", "c"]));
        assert_eq!(lists.handle("LPOP", &strings(&["L"])), Frame::NullBulk);
        // fully drained keys disappear
        assert!(!lists.has_key("L"));
    }

    #[test]
    fn blpop_returns_immediately_when_the_head_exists() {
        let lists = ListEngine::new();
        lists.handle("RPUSH", &strings(&["L", "v"]));
        assert_eq!(lists.handle("BLPOP", &strings(&["L", "0"])), bulks(&["L", "v"]));
    }

    #[test]
    fn blpop_wakes_on_a_push_from_another_thread() {
        let lists = Arc::new(ListEngine::new());
        let waiter = {
            let lists = Arc::clone(&lists);
            thread::spawn(move || lists.handle("BLPOP", &strings(&["L", "0"])))
        };
        thread::sleep(Duration::from_millis(50));
        lists.handle("LPUSH", &strings(&["L", "z"]));
        assert_eq!(waiter.join().unwrap(), bulks(&["L", "z"]));
    }

    #[test]
    fn blpop_times_out_with_a_null_array() {
        let lists = ListEngine::new();
        let before = Instant::now();
        assert_eq!(lists.handle("BLPOP", &strings(&["L", "0.1"])), Frame::NullArray);
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn blpop_ignores_pushes_to_other_keys() {
        let lists = Arc::new(ListEngine::new());
        let waiter = {
            let lists = Arc::clone(&lists);
            thread::spawn(move || lists.handle("BLPOP", &strings(&["wanted", "0.2"])))
        };
        thread::sleep(Duration::from_millis(30));
        lists.handle("RPUSH", &strings(&["other", "x"]));
        assert_eq!(waiter.join().unwrap(), Frame::NullArray);
    }
}
