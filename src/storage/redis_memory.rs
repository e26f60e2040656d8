// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process RCACHE for tests and embedded use.
//!
//! Understands the subset of commands the engine sends: strings, lists,
//! sets, hashes, sorted sets, streams with consumer groups, and the two lock
//! scripts. Expiry is lazy. Blocking commands return immediately.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{ErrorKind, RedisError, RedisResult, Value};

use super::lock::{REFRESH_SCRIPT, RELEASE_SCRIPT};
use super::redis::{Command, RedisConnection};

type Bytes = Vec<u8>;
type StreamId = (u64, u64);

#[derive(Debug, Default)]
struct Group {
    last_delivered: StreamId,
    /// Delivered, unacknowledged entry ids by consumer.
    pending: BTreeMap<StreamId, String>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<(StreamId, Vec<(Bytes, Bytes)>)>,
    last: StreamId,
    groups: HashMap<String, Group>,
}

#[derive(Debug)]
enum Entry {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    ZSet(HashMap<Bytes, f64>),
    Stream(Stream),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Str(_) | Entry::Stream(_) => false,
            Entry::List(l) => l.is_empty(),
            Entry::Set(s) => s.is_empty(),
            Entry::Hash(h) => h.is_empty(),
            Entry::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<Bytes, Slot>,
    scripts: HashSet<String>,
}

fn err(message: impl Into<String>) -> RedisError {
    RedisError::from((ErrorKind::ResponseError, "ERR", message.into()))
}

fn wrong_type() -> RedisError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE",
        "Operation against a key holding the wrong kind of value".to_string(),
    ))
}

fn text(arg: &[u8]) -> RedisResult<&str> {
    std::str::from_utf8(arg).map_err(|_| err("invalid utf-8 argument"))
}

fn int(arg: &[u8]) -> RedisResult<i64> {
    text(arg)?
        .parse()
        .map_err(|_| err("value is not an integer or out of range"))
}

fn float(arg: &[u8]) -> RedisResult<f64> {
    text(arg)?.parse().map_err(|_| err("value is not a valid float"))
}

fn arity(name: &str, args: &[Bytes], min: usize) -> RedisResult<()> {
    if args.len() < min {
        return Err(err(format!("wrong number of arguments for '{name}' command")));
    }
    Ok(())
}

fn bulk(bytes: &[u8]) -> Value {
    Value::BulkString(bytes.to_vec())
}

fn int_value(n: usize) -> Value {
    Value::Int(n as i64)
}

fn format_id(id: StreamId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(arg: &[u8]) -> RedisResult<StreamId> {
    let raw = text(arg)?;
    let (ms, seq) = raw.split_once('-').unwrap_or((raw, "0"));
    match (ms.parse(), seq.parse()) {
        (Ok(ms), Ok(seq)) => Ok((ms, seq)),
        _ => Err(err("Invalid stream ID specified as stream command argument")),
    }
}

fn entry_value(id: StreamId, fields: &[(Bytes, Bytes)]) -> Value {
    let flat = fields
        .iter()
        .flat_map(|(f, v)| [bulk(f), bulk(v)])
        .collect();
    Value::Array(vec![Value::BulkString(format_id(id).into_bytes()), Value::Array(flat)])
}

/// Inclusive index range of a list slice, Redis style.
fn span(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Score bound of ZRANGEBYSCORE: value and exclusivity.
fn score_bound(arg: &[u8]) -> RedisResult<(f64, bool)> {
    match arg.strip_prefix(b"(") {
        Some(rest) => Ok((float(rest)?, true)),
        None => Ok((float(arg)?, false)),
    }
}

fn script_hash(source: &str) -> String {
    redis::Script::new(source).get_hash().to_string()
}

impl State {
    fn purge(&mut self, key: &[u8]) {
        let now = Instant::now();
        if self
            .slots
            .get(key)
            .is_some_and(|s| s.expires_at.is_some_and(|at| at <= now))
        {
            self.slots.remove(key);
        }
    }

    fn entry(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.purge(key);
        self.slots.get_mut(key).map(|s| &mut s.entry)
    }

    fn entry_or(&mut self, key: &[u8], make: fn() -> Entry) -> &mut Entry {
        self.purge(key);
        &mut self
            .slots
            .entry(key.to_vec())
            .or_insert_with(|| Slot {
                entry: make(),
                expires_at: None,
            })
            .entry
    }

    fn drop_if_empty(&mut self, key: &[u8]) {
        if self.slots.get(key).is_some_and(|s| s.entry.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn list(&mut self, key: &[u8]) -> RedisResult<Option<&mut VecDeque<Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn list_or_new(&mut self, key: &[u8]) -> RedisResult<&mut VecDeque<Bytes>> {
        match self.entry_or(key, || Entry::List(VecDeque::new())) {
            Entry::List(l) => Ok(l),
            _ => Err(wrong_type()),
        }
    }

    fn set(&mut self, key: &[u8]) -> RedisResult<Option<&mut HashSet<Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash(&mut self, key: &[u8]) -> RedisResult<Option<&mut HashMap<Bytes, Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn zset(&mut self, key: &[u8]) -> RedisResult<Option<&mut HashMap<Bytes, f64>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn stream(&mut self, key: &[u8]) -> RedisResult<Option<&mut Stream>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Stream(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn string(&mut self, key: &[u8]) -> RedisResult<Option<&Bytes>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn pexpire(&mut self, key: &[u8], ttl: Duration) -> Value {
        self.purge(key);
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Value::Int(1)
            }
            None => Value::Int(0),
        }
    }

    fn execute(&mut self, command: &Command) -> RedisResult<Value> {
        let name = command.name().to_ascii_uppercase();
        let args = command.args();
        match name.as_str() {
            "PING" => Ok(Value::SimpleString("PONG".to_string())),
            "FLUSHDB" => {
                self.slots.clear();
                Ok(Value::Okay)
            }
            "GET" => {
                arity(&name, args, 1)?;
                Ok(self.string(&args[0])?.map_or(Value::Nil, |s| bulk(s)))
            }
            "SET" => self.cmd_set(args),
            "DEL" => {
                arity(&name, args, 1)?;
                let mut removed = 0;
                for key in args {
                    self.purge(key);
                    removed += usize::from(self.slots.remove(key).is_some());
                }
                Ok(int_value(removed))
            }
            "EXISTS" => {
                arity(&name, args, 1)?;
                let mut found = 0;
                for key in args {
                    found += usize::from(self.entry(key).is_some());
                }
                Ok(int_value(found))
            }
            "PEXPIRE" => {
                arity(&name, args, 2)?;
                Ok(self.pexpire(&args[0], Duration::from_millis(int(&args[1])?.max(0) as u64)))
            }
            "EXPIRE" => {
                arity(&name, args, 2)?;
                Ok(self.pexpire(&args[0], Duration::from_secs(int(&args[1])?.max(0) as u64)))
            }
            "PTTL" => {
                arity(&name, args, 1)?;
                self.purge(&args[0]);
                Ok(Value::Int(match self.slots.get(args[0].as_slice()) {
                    None => -2,
                    Some(Slot { expires_at: None, .. }) => -1,
                    Some(Slot {
                        expires_at: Some(at),
                        ..
                    }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
                }))
            }
            "KEYS" => {
                arity(&name, args, 1)?;
                Ok(Value::Array(self.matching_keys(&args[0])))
            }
            "SCAN" => {
                let mut pattern: &[u8] = b"*";
                let mut i = 1;
                while i + 1 < args.len() {
                    if args[i].eq_ignore_ascii_case(b"MATCH") {
                        pattern = &args[i + 1];
                    }
                    i += 2;
                }
                Ok(Value::Array(vec![
                    bulk(b"0"),
                    Value::Array(self.matching_keys(pattern)),
                ]))
            }

            "HSET" => {
                arity(&name, args, 3)?;
                let entry = self.entry_or(&args[0], || Entry::Hash(HashMap::new()));
                let Entry::Hash(hash) = entry else {
                    return Err(wrong_type());
                };
                let mut added = 0;
                for pair in args[1..].chunks_exact(2) {
                    added += usize::from(hash.insert(pair[0].clone(), pair[1].clone()).is_none());
                }
                Ok(int_value(added))
            }
            "HGET" => {
                arity(&name, args, 2)?;
                Ok(self
                    .hash(&args[0])?
                    .and_then(|h| h.get(&args[1]))
                    .map_or(Value::Nil, |v| bulk(v)))
            }
            "HEXISTS" => {
                arity(&name, args, 2)?;
                let found = self.hash(&args[0])?.is_some_and(|h| h.contains_key(&args[1]));
                Ok(int_value(usize::from(found)))
            }
            "HMGET" => {
                arity(&name, args, 2)?;
                let hash = self.hash(&args[0])?;
                Ok(Value::Array(
                    args[1..]
                        .iter()
                        .map(|f| {
                            hash.as_ref()
                                .and_then(|h| h.get(f))
                                .map_or(Value::Nil, |v| bulk(v))
                        })
                        .collect(),
                ))
            }
            "HDEL" => {
                arity(&name, args, 2)?;
                let removed = match self.hash(&args[0])? {
                    Some(hash) => args[1..].iter().filter(|f| hash.remove(*f).is_some()).count(),
                    None => 0,
                };
                self.drop_if_empty(&args[0]);
                Ok(int_value(removed))
            }
            "HGETALL" => {
                arity(&name, args, 1)?;
                let flat = self
                    .hash(&args[0])?
                    .map(|h| h.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect())
                    .unwrap_or_default();
                Ok(Value::Array(flat))
            }
            "HLEN" => {
                arity(&name, args, 1)?;
                Ok(int_value(self.hash(&args[0])?.map_or(0, |h| h.len())))
            }
            "HINCRBY" => {
                arity(&name, args, 3)?;
                let delta = int(&args[2])?;
                let entry = self.entry_or(&args[0], || Entry::Hash(HashMap::new()));
                let Entry::Hash(hash) = entry else {
                    return Err(wrong_type());
                };
                let current = match hash.get(&args[1]) {
                    Some(v) => int(v)?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(args[1].clone(), next.to_string().into_bytes());
                Ok(Value::Int(next))
            }

            "LPUSH" | "RPUSH" => {
                arity(&name, args, 2)?;
                let list = self.list_or_new(&args[0])?;
                for value in &args[1..] {
                    if name == "LPUSH" {
                        list.push_front(value.clone());
                    } else {
                        list.push_back(value.clone());
                    }
                }
                Ok(int_value(list.len()))
            }
            "LRANGE" => {
                arity(&name, args, 3)?;
                let (start, stop) = (int(&args[1])?, int(&args[2])?);
                let items = match self.list(&args[0])? {
                    Some(list) => match span(start, stop, list.len()) {
                        Some((a, b)) => list.range(a..=b).map(|v| bulk(v)).collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(Value::Array(items))
            }
            "LINDEX" => {
                arity(&name, args, 2)?;
                let index = int(&args[1])?;
                Ok(self
                    .list(&args[0])?
                    .and_then(|list| {
                        span(index, index, list.len())
                            .and_then(|(i, _)| list.get(i).map(|v| bulk(v)))
                    })
                    .unwrap_or(Value::Nil))
            }
            "LLEN" => {
                arity(&name, args, 1)?;
                Ok(int_value(self.list(&args[0])?.map_or(0, |l| l.len())))
            }
            "LTRIM" => {
                arity(&name, args, 3)?;
                let (start, stop) = (int(&args[1])?, int(&args[2])?);
                if let Some(list) = self.list(&args[0])? {
                    match span(start, stop, list.len()) {
                        Some((a, b)) => {
                            list.truncate(b + 1);
                            list.drain(..a);
                        }
                        None => list.clear(),
                    }
                }
                self.drop_if_empty(&args[0]);
                Ok(Value::Okay)
            }
            "LPOP" | "RPOP" => {
                arity(&name, args, 1)?;
                let popped = match self.list(&args[0])? {
                    Some(list) if name == "LPOP" => list.pop_front(),
                    Some(list) => list.pop_back(),
                    None => None,
                };
                self.drop_if_empty(&args[0]);
                Ok(popped.map_or(Value::Nil, Value::BulkString))
            }
            "LREM" => {
                arity(&name, args, 3)?;
                let count = int(&args[1])?;
                let target = &args[2];
                let removed = match self.list(&args[0])? {
                    Some(list) => {
                        let limit = if count == 0 {
                            usize::MAX
                        } else {
                            count.unsigned_abs() as usize
                        };
                        let mut positions: Vec<usize> = list
                            .iter()
                            .enumerate()
                            .filter(|(_, v)| *v == target)
                            .map(|(i, _)| i)
                            .collect();
                        if count < 0 {
                            positions.reverse();
                        }
                        positions.truncate(limit);
                        positions.sort_unstable_by(|a, b| b.cmp(a));
                        for i in &positions {
                            list.remove(*i);
                        }
                        positions.len()
                    }
                    None => 0,
                };
                self.drop_if_empty(&args[0]);
                Ok(int_value(removed))
            }
            "LSET" => {
                arity(&name, args, 3)?;
                let index = int(&args[1])?;
                let list = self.list(&args[0])?.ok_or_else(|| err("no such key"))?;
                let (i, _) =
                    span(index, index, list.len()).ok_or_else(|| err("index out of range"))?;
                list[i] = args[2].clone();
                Ok(Value::Okay)
            }
            "BLMOVE" | "LMOVE" => {
                arity(&name, args, 4)?;
                let from_left = args[2].eq_ignore_ascii_case(b"LEFT");
                let to_left = args[3].eq_ignore_ascii_case(b"LEFT");
                let moved = match self.list(&args[0])? {
                    Some(list) if from_left => list.pop_front(),
                    Some(list) => list.pop_back(),
                    None => None,
                };
                self.drop_if_empty(&args[0]);
                let Some(value) = moved else {
                    return Ok(Value::Nil);
                };
                let destination = self.list_or_new(&args[1])?;
                if to_left {
                    destination.push_front(value.clone());
                } else {
                    destination.push_back(value.clone());
                }
                Ok(Value::BulkString(value))
            }

            "SADD" => {
                arity(&name, args, 2)?;
                let Entry::Set(set) = self.entry_or(&args[0], || Entry::Set(HashSet::new())) else {
                    return Err(wrong_type());
                };
                Ok(int_value(args[1..].iter().filter(|m| set.insert((*m).clone())).count()))
            }
            "SREM" => {
                arity(&name, args, 2)?;
                let removed = match self.set(&args[0])? {
                    Some(set) => args[1..].iter().filter(|m| set.remove(*m)).count(),
                    None => 0,
                };
                self.drop_if_empty(&args[0]);
                Ok(int_value(removed))
            }
            "SMEMBERS" => {
                arity(&name, args, 1)?;
                let mut members: Vec<Bytes> = self
                    .set(&args[0])?
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                members.sort();
                Ok(Value::Array(members.into_iter().map(Value::BulkString).collect()))
            }
            "SISMEMBER" => {
                arity(&name, args, 2)?;
                let found = self.set(&args[0])?.is_some_and(|s| s.contains(&args[1]));
                Ok(int_value(usize::from(found)))
            }
            "SCARD" => {
                arity(&name, args, 1)?;
                Ok(int_value(self.set(&args[0])?.map_or(0, |s| s.len())))
            }
            "SPOP" => {
                arity(&name, args, 1)?;
                let popped = match self.set(&args[0])? {
                    Some(set) => {
                        let member = set.iter().next().cloned();
                        if let Some(m) = &member {
                            set.remove(m);
                        }
                        member
                    }
                    None => None,
                };
                self.drop_if_empty(&args[0]);
                Ok(popped.map_or(Value::Nil, Value::BulkString))
            }

            "ZADD" => {
                arity(&name, args, 3)?;
                let mut scored = Vec::new();
                for pair in args[1..].chunks_exact(2) {
                    scored.push((float(&pair[0])?, pair[1].clone()));
                }
                let entry = self.entry_or(&args[0], || Entry::ZSet(HashMap::new()));
                let Entry::ZSet(zset) = entry else {
                    return Err(wrong_type());
                };
                let added = scored
                    .into_iter()
                    .filter(|(score, member)| zset.insert(member.clone(), *score).is_none())
                    .count();
                Ok(int_value(added))
            }
            "ZRANGEBYSCORE" => {
                arity(&name, args, 3)?;
                let (min, min_open) = score_bound(&args[1])?;
                let (max, max_open) = score_bound(&args[2])?;
                let mut limit = (0usize, usize::MAX);
                if args.len() >= 6 && args[3].eq_ignore_ascii_case(b"LIMIT") {
                    limit = (int(&args[4])?.max(0) as usize, int(&args[5])?.max(0) as usize);
                }
                let mut members: Vec<(f64, Bytes)> = self
                    .zset(&args[0])?
                    .map(|z| {
                        z.iter()
                            .filter(|(_, s)| {
                                (if min_open { **s > min } else { **s >= min })
                                    && (if max_open { **s < max } else { **s <= max })
                            })
                            .map(|(m, s)| (*s, m.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(Value::Array(
                    members
                        .into_iter()
                        .skip(limit.0)
                        .take(limit.1)
                        .map(|(_, m)| Value::BulkString(m))
                        .collect(),
                ))
            }
            "ZSCORE" => {
                arity(&name, args, 2)?;
                Ok(self
                    .zset(&args[0])?
                    .and_then(|z| z.get(&args[1]))
                    .map_or(Value::Nil, |s| Value::BulkString(s.to_string().into_bytes())))
            }
            "ZCARD" => {
                arity(&name, args, 1)?;
                Ok(int_value(self.zset(&args[0])?.map_or(0, |z| z.len())))
            }
            "ZREM" => {
                arity(&name, args, 2)?;
                let removed = match self.zset(&args[0])? {
                    Some(zset) => args[1..].iter().filter(|m| zset.remove(*m).is_some()).count(),
                    None => 0,
                };
                self.drop_if_empty(&args[0]);
                Ok(int_value(removed))
            }

            "XADD" => self.cmd_xadd(args),
            "XLEN" => {
                arity(&name, args, 1)?;
                Ok(int_value(self.stream(&args[0])?.map_or(0, |s| s.entries.len())))
            }
            "XTRIM" => {
                arity(&name, args, 3)?;
                let max_len = int(&args[args.len() - 1])?.max(0) as usize;
                let removed = match self.stream(&args[0])? {
                    Some(stream) if stream.entries.len() > max_len => {
                        let excess = stream.entries.len() - max_len;
                        stream.entries.drain(..excess);
                        excess
                    }
                    _ => 0,
                };
                Ok(int_value(removed))
            }
            "XRANGE" => {
                arity(&name, args, 3)?;
                let start = if args[1] == b"-" { (0, 0) } else { parse_id(&args[1])? };
                let end = if args[2] == b"+" { (u64::MAX, u64::MAX) } else { parse_id(&args[2])? };
                let entries = self
                    .stream(&args[0])?
                    .map(|s| {
                        s.entries
                            .iter()
                            .filter(|(id, _)| *id >= start && *id <= end)
                            .map(|(id, fields)| entry_value(*id, fields))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Value::Array(entries))
            }
            "XGROUP" => self.cmd_xgroup(args),
            "XREADGROUP" => self.cmd_xreadgroup(args),
            "XACK" => {
                arity(&name, args, 3)?;
                let ids = args[2..].iter().map(|a| parse_id(a)).collect::<RedisResult<Vec<_>>>()?;
                let group = text(&args[1])?.to_string();
                let acked = match self.stream(&args[0])?.and_then(|s| s.groups.get_mut(&group)) {
                    Some(group) => {
                        ids.iter().filter(|id| group.pending.remove(*id).is_some()).count()
                    }
                    None => 0,
                };
                Ok(int_value(acked))
            }
            "XPENDING" => {
                arity(&name, args, 2)?;
                let group = text(&args[1])?.to_string();
                let stream = self.stream(&args[0])?;
                let pending = stream
                    .and_then(|s| s.groups.get(&group))
                    .map(|g| &g.pending);
                Ok(match pending {
                    Some(p) if !p.is_empty() => {
                        let first = p.keys().next().copied().unwrap_or_default();
                        let last = p.keys().next_back().copied().unwrap_or_default();
                        let mut per_consumer: BTreeMap<&str, usize> = BTreeMap::new();
                        for consumer in p.values() {
                            *per_consumer.entry(consumer.as_str()).or_default() += 1;
                        }
                        Value::Array(vec![
                            int_value(p.len()),
                            Value::BulkString(format_id(first).into_bytes()),
                            Value::BulkString(format_id(last).into_bytes()),
                            Value::Array(
                                per_consumer
                                    .into_iter()
                                    .map(|(c, n)| {
                                        Value::Array(vec![
                                            bulk(c.as_bytes()),
                                            Value::BulkString(n.to_string().into_bytes()),
                                        ])
                                    })
                                    .collect(),
                            ),
                        ])
                    }
                    _ => Value::Array(vec![Value::Int(0), Value::Nil, Value::Nil, Value::Nil]),
                })
            }
            "XCLAIM" => {
                arity(&name, args, 5)?;
                let group = text(&args[1])?.to_string();
                let consumer = text(&args[2])?.to_string();
                let ids = args[4..]
                    .iter()
                    .filter_map(|a| parse_id(a).ok())
                    .collect::<Vec<_>>();
                let Some(stream) = self.stream(&args[0])? else {
                    return Ok(Value::Array(Vec::new()));
                };
                let Some(g) = stream.groups.get_mut(&group) else {
                    return Err(err("NOGROUP No such consumer group"));
                };
                let mut claimed = Vec::new();
                for id in ids {
                    if let Some(owner) = g.pending.get_mut(&id) {
                        *owner = consumer.clone();
                        let entry = stream.entries.iter().find(|(eid, _)| *eid == id);
                        if let Some((_, fields)) = entry {
                            claimed.push(entry_value(id, fields));
                        }
                    }
                }
                Ok(Value::Array(claimed))
            }

            "EVAL" | "EVALSHA" => self.cmd_eval(&name, args),

            other => Err(err(format!("unknown command '{other}'"))),
        }
    }

    fn matching_keys(&mut self, pattern: &[u8]) -> Vec<Value> {
        let keys: Vec<Bytes> = self.slots.keys().cloned().collect();
        let mut found: Vec<Bytes> = keys
            .into_iter()
            .filter(|k| {
                self.purge(k);
                self.slots.contains_key(k) && glob_match(pattern, k)
            })
            .collect();
        found.sort();
        found.into_iter().map(Value::BulkString).collect()
    }

    fn cmd_set(&mut self, args: &[Bytes]) -> RedisResult<Value> {
        arity("SET", args, 2)?;
        let (mut nx, mut xx, mut ttl) = (false, false, None);
        let mut i = 2;
        while i < args.len() {
            let option = text(&args[i])?.to_ascii_uppercase();
            match option.as_str() {
                "NX" => nx = true,
                "XX" => xx = true,
                "PX" | "EX" => {
                    let raw = args.get(i + 1).ok_or_else(|| err("syntax error"))?;
                    let amount = int(raw)?.max(0) as u64;
                    ttl = Some(if option == "PX" {
                        Duration::from_millis(amount)
                    } else {
                        Duration::from_secs(amount)
                    });
                    i += 1;
                }
                _ => return Err(err("syntax error")),
            }
            i += 1;
        }
        let exists = self.entry(&args[0]).is_some();
        if (nx && exists) || (xx && !exists) {
            return Ok(Value::Nil);
        }
        self.slots.insert(
            args[0].clone(),
            Slot {
                entry: Entry::Str(args[1].clone()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(Value::Okay)
    }

    fn cmd_xadd(&mut self, args: &[Bytes]) -> RedisResult<Value> {
        arity("XADD", args, 4)?;
        if args[2..].len() % 2 != 0 {
            return Err(err("wrong number of arguments for 'xadd' command"));
        }
        let requested = if args[1] == b"*" { None } else { Some(parse_id(&args[1])?) };
        let fields: Vec<(Bytes, Bytes)> = args[2..]
            .chunks_exact(2)
            .map(|p| (p[0].clone(), p[1].clone()))
            .collect();
        let entry = self.entry_or(&args[0], || Entry::Stream(Stream::default()));
        let Entry::Stream(stream) = entry else {
            return Err(wrong_type());
        };
        let id = match requested {
            Some(id) if id <= stream.last => {
                return Err(err(
                    "The ID specified in XADD is equal or smaller than the target stream top item",
                ))
            }
            Some(id) => id,
            None => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                if now > stream.last.0 {
                    (now, 0)
                } else {
                    (stream.last.0, stream.last.1 + 1)
                }
            }
        };
        stream.last = id;
        stream.entries.push((id, fields));
        Ok(Value::BulkString(format_id(id).into_bytes()))
    }

    fn cmd_xgroup(&mut self, args: &[Bytes]) -> RedisResult<Value> {
        arity("XGROUP", args, 4)?;
        if !args[0].eq_ignore_ascii_case(b"CREATE") {
            return Err(err("unknown XGROUP subcommand"));
        }
        let mkstream = args[4..].iter().any(|a| a.eq_ignore_ascii_case(b"MKSTREAM"));
        let group = text(&args[2])?.to_string();
        let stream = if mkstream {
            match self.entry_or(&args[1], || Entry::Stream(Stream::default())) {
                Entry::Stream(s) => s,
                _ => return Err(wrong_type()),
            }
        } else {
            self.stream(&args[1])?
                .ok_or_else(|| err("The XGROUP subcommand requires the key to exist"))?
        };
        if stream.groups.contains_key(&group) {
            return Err(RedisError::from((
                ErrorKind::ExtensionError,
                "BUSYGROUP",
                "Consumer Group name already exists".to_string(),
            )));
        }
        let start = if args[3] == b"$" { stream.last } else { parse_id(&args[3])? };
        stream.groups.insert(
            group,
            Group {
                last_delivered: start,
                pending: BTreeMap::new(),
            },
        );
        Ok(Value::Okay)
    }

    fn cmd_xreadgroup(&mut self, args: &[Bytes]) -> RedisResult<Value> {
        arity("XREADGROUP", args, 6)?;
        let group = text(&args[1])?.to_string();
        let consumer = text(&args[2])?.to_string();
        let mut count = usize::MAX;
        let mut i = 3;
        while i < args.len() && !args[i].eq_ignore_ascii_case(b"STREAMS") {
            if args[i].eq_ignore_ascii_case(b"COUNT") {
                count = int(args.get(i + 1).ok_or_else(|| err("syntax error"))?)?.max(0) as usize;
                i += 1;
            }
            i += 1;
        }
        let key = args.get(i + 1).ok_or_else(|| err("syntax error"))?.clone();
        let stream = self
            .stream(&key)?
            .ok_or_else(|| err("NOGROUP No such key or consumer group"))?;
        let g = stream
            .groups
            .get_mut(&group)
            .ok_or_else(|| err("NOGROUP No such key or consumer group"))?;
        let fresh: Vec<&(StreamId, Vec<(Bytes, Bytes)>)> = stream
            .entries
            .iter()
            .filter(|(id, _)| *id > g.last_delivered)
            .take(count)
            .collect();
        if fresh.is_empty() {
            return Ok(Value::Nil);
        }
        let mut delivered = Vec::with_capacity(fresh.len());
        for (id, fields) in fresh {
            g.last_delivered = *id;
            g.pending.insert(*id, consumer.clone());
            delivered.push(entry_value(*id, fields));
        }
        Ok(Value::Array(vec![Value::Array(vec![
            Value::BulkString(key),
            Value::Array(delivered),
        ])]))
    }

    fn cmd_eval(&mut self, name: &str, args: &[Bytes]) -> RedisResult<Value> {
        arity(name, args, 2)?;
        let known = [REFRESH_SCRIPT, RELEASE_SCRIPT];
        let script = if name == "EVAL" {
            let source = text(&args[0])?;
            let script = known
                .into_iter()
                .find(|s| *s == source)
                .ok_or_else(|| err("script not supported by the in-memory server"))?;
            self.scripts.insert(script_hash(script));
            script
        } else {
            let sha = text(&args[0])?.to_ascii_lowercase();
            if !self.scripts.contains(&sha) {
                return Err(RedisError::from((
                    ErrorKind::NoScriptError,
                    "NOSCRIPT",
                    "No matching script. Please use EVAL.".to_string(),
                )));
            }
            known
                .into_iter()
                .find(|s| script_hash(s) == sha)
                .ok_or_else(|| err("script not supported by the in-memory server"))?
        };
        let numkeys = int(&args[1])?.max(0) as usize;
        let keys = args.get(2..2 + numkeys).ok_or_else(|| err("not enough keys"))?;
        let argv = &args[2 + numkeys..];
        arity(name, keys, 1)?;
        arity(name, argv, 1)?;
        let owned = self.string(&keys[0])?.is_some_and(|v| *v == argv[0]);
        if !owned {
            return Ok(Value::Int(0));
        }
        if script == REFRESH_SCRIPT {
            arity(name, argv, 2)?;
            let ttl = Duration::from_millis(int(&argv[1])?.max(0) as u64);
            Ok(self.pexpire(&keys[0], ttl))
        } else {
            self.slots.remove(&keys[0]);
            Ok(Value::Int(1))
        }
    }
}

/// Process-local stand-in for a Redis server.
#[derive(Debug, Default)]
pub struct MemoryRedis {
    state: Mutex<State>,
}

impl MemoryRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<Bytes> = state.slots.keys().cloned().collect();
        for key in &keys {
            state.purge(key);
        }
        state.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RedisConnection for MemoryRedis {
    async fn query(&self, command: &Command) -> RedisResult<Value> {
        self.state.lock().execute(command)
    }

    async fn pipeline(&self, commands: &[Command], _atomic: bool) -> RedisResult<Vec<Value>> {
        let mut state = self.state.lock();
        commands.iter().map(|c| state.execute(c)).collect()
    }
}
