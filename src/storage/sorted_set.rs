//! Sorted-set engine: a score-ordered multiset kept as two views in
//! bijection — member→score lookup and a `(score, member)` ordered set.

use super::{clamp_range, Engine};
use crate::protocol::Frame;
use crate::storage::geo;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

// f64 carrying the total order, so it can key a BTreeSet. Scores are finite
// by construction (parse rejects nan/inf).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Score(pub f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Default)]
struct ZSet {
    lookup: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl ZSet {
    // returns true when the member is new
    fn insert(&mut self, member: String, score: f64) -> bool {
        let added = match self.lookup.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member));
        added
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.lookup.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }
}

/// Sorted-set engine; also carries the geo commands, which store and query
/// geohash scores through the same maps.
pub(crate) struct ZSetEngine {
    entries: Mutex<HashMap<String, ZSet>>,
}

impl ZSetEngine {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// insert or update one member; true when newly added. Shared with the
    /// geo layer.
    pub fn insert(&self, key: &str, score: f64, member: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score)
    }

    /// score of one member, if present. Shared with the geo layer.
    pub fn score_of(&self, key: &str, member: &str) -> Option<f64> {
        let entries = self.entries.lock().unwrap();
        entries.get(key)?.lookup.get(member).copied()
    }

    /// every member with its score, in ordered-view order. Shared with the
    /// geo layer's linear search.
    pub fn members_with_scores(&self, key: &str) -> Vec<(String, f64)> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(zset) => zset
                .ordered
                .iter()
                .map(|(score, member)| (member.clone(), score.0))
                .collect(),
            None => Vec::new(),
        }
    }

    fn zadd(&self, args: &[String]) -> Frame {
        if args.len() < 3 {
            return Frame::err("ZADD requires key, score and member");
        }
        let score = match parse_score(&args[1]) {
            Some(score) => score,
            None => return Frame::err("value is not a valid float"),
        };
        let added = self.insert(&args[0], score, &args[2]);
        Frame::Integer(if added { 1 } else { 0 })
    }

    fn zrank(&self, args: &[String]) -> Frame {
        if args.len() < 2 {
            return Frame::err("ZRANK requires key and member");
        }
        let entries = self.entries.lock().unwrap();
        let zset = match entries.get(&args[0]) {
            Some(zset) => zset,
            None => return Frame::NullBulk,
        };
        let score = match zset.lookup.get(&args[1]) {
            Some(score) => *score,
            None => return Frame::NullBulk,
        };
        let rank = zset
            .ordered
            .range(..(Score(score), args[1].clone()))
            .count();
        Frame::Integer(rank as i64)
    }

    fn zrange(&self, args: &[String]) -> Frame {
        if args.len() < 3 {
            return Frame::err("ZRANGE requires key, start and stop");
        }
        let (start, stop) = match (args[1].parse::<i64>(), args[2].parse::<i64>()) {
            (Ok(start), Ok(stop)) => (start, stop),
            _ => return Frame::err("value is not an integer or out of range"),
        };
        let entries = self.entries.lock().unwrap();
        let zset = match entries.get(&args[0]) {
            Some(zset) => zset,
            None => return Frame::Array(Vec::new()),
        };
        match clamp_range(start, stop, zset.ordered.len()) {
            Some((from, to)) => Frame::Array(
                zset.ordered
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .map(|(_, member)| Frame::Bulk(member.clone()))
                    .collect(),
            ),
            None => Frame::Array(Vec::new()),
        }
    }

    fn zcard(&self, args: &[String]) -> Frame {
        if args.is_empty() {
            return Frame::err("ZCARD requires key");
        }
        let entries = self.entries.lock().unwrap();
        let card = entries.get(&args[0]).map_or(0, |zset| zset.lookup.len());
        Frame::Integer(card as i64)
    }

    fn zscore(&self, args: &[String]) -> Frame {
        if args.len() < 2 {
            return Frame::err("ZSCORE requires key and member");
        }
        match self.score_of(&args[0], &args[1]) {
            Some(score) => Frame::Bulk(geo::format_float(score)),
            None => Frame::NullBulk,
        }
    }

    fn zrem(&self, args: &[String]) -> Frame {
        if args.len() < 2 {
            return Frame::err("ZREM requires key and member");
        }
        let mut entries = self.entries.lock().unwrap();
        let removed = match entries.get_mut(&args[0]) {
            Some(zset) => zset.remove(&args[1]),
            None => false,
        };
        Frame::Integer(if removed { 1 } else { 0 })
    }

    #[cfg(test)]
    fn assert_bijection(&self, key: &str) {
        let entries = self.entries.lock().unwrap();
        let zset = entries.get(key).expect("key should exist");
        assert_eq!(zset.lookup.len(), zset.ordered.len());
        for (member, score) in &zset.lookup {
            assert!(zset.ordered.contains(&(Score(*score), member.clone())));
        }
    }
}

fn parse_score(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|score| score.is_finite())
}

impl Engine for ZSetEngine {
    fn owns(&self, cmd: &str) -> bool {
        matches!(
            cmd,
            "ZADD"
                | "ZRANK"
                | "ZRANGE"
                | "ZCARD"
                | "ZSCORE"
                | "ZREM"
                | "GEOADD"
                | "GEOPOS"
                | "GEODIST"
                | "GEOSEARCH"
        )
    }

    fn type_name(&self) -> &'static str {
        "zset"
    }

    fn has_key(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn handle(&self, cmd: &str, args: &[String]) -> Frame {
        match cmd {
            "ZADD" => self.zadd(args),
            "ZRANK" => self.zrank(args),
            "ZRANGE" => self.zrange(args),
            "ZCARD" => self.zcard(args),
            "ZSCORE" => self.zscore(args),
            "ZREM" => self.zrem(args),
            "GEOADD" => geo::geoadd(self, args),
            "GEOPOS" => geo::geopos(self, args),
            "GEODIST" => geo::geodist(self, args),
            "GEOSEARCH" => geo::geosearch(self, args),
            _ => Frame::err(format!("unknown command '{}'", cmd)),
        }
    }
}
