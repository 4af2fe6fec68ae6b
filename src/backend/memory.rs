//! In-memory backend
//!
//! A complete in-process implementation of [`Backend`], used by tests,
//! benchmarks and the `sackd` binary.
//!
//! ## Concurrency Model
//! - Read-only commands share a read lock on the keyspace
//! - Mutating commands and whole scripts take the write lock, which is
//!   what makes scripts atomic
//! - Pipelines take the lock once per command, so other clients can
//!   interleave between the commands of a pipeline
//! - Notifications are published after the lock is released
//! - Scan cursors remember the last key they visited, so keys removed
//!   between pages never shift keys that are still there out of the scan

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SackError};

use super::pattern::glob_match;
use super::pubsub::{EventClass, NotifyFlags, Subscriber, Subscription};
use super::{Backend, Command, Reply, ScanPage, Script, ScriptContext};

/// A stored value
#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Hash(BTreeMap<Vec<u8>, Bytes>),
}

/// A notification ready to publish: (channel, payload)
type Notification = (Vec<u8>, Vec<u8>);

/// Open scan cursors kept before the oldest get forgotten
const MAX_OPEN_CURSORS: usize = 1024;

/// Resume points of unfinished scans, by cursor id
#[derive(Default)]
struct ScanCursors {
    last_id: u64,
    resume_keys: BTreeMap<u64, Vec<u8>>,
}

impl ScanCursors {
    /// Key to resume after; `None` starts from the beginning
    fn resume(&mut self, cursor: u64) -> Result<Option<Vec<u8>>> {
        if cursor == 0 {
            return Ok(None);
        }
        self.resume_keys
            .remove(&cursor)
            .map(Some)
            .ok_or_else(|| SackError::Backend(format!("unknown or expired scan cursor {}", cursor)))
    }

    /// Remember `last_key` under a fresh, non-zero cursor id
    fn open(&mut self, last_key: Vec<u8>) -> u64 {
        if self.resume_keys.len() >= MAX_OPEN_CURSORS {
            self.resume_keys.pop_first();
        }
        self.last_id = self.last_id.wrapping_add(1).max(1);
        self.resume_keys.insert(self.last_id, last_key);
        self.last_id
    }
}

/// Up to `count` entries strictly after `after`, and whether more follow
fn page_after<'a, V>(
    map: &'a BTreeMap<Vec<u8>, V>,
    after: Option<&[u8]>,
    count: usize,
) -> (Vec<(&'a Vec<u8>, &'a V)>, bool) {
    let lower = match after {
        Some(key) => Bound::Excluded(key),
        None => Bound::Unbounded,
    };
    let mut entries = map.range::<[u8], _>((lower, Bound::Unbounded));
    let page: Vec<_> = entries.by_ref().take(count).collect();
    let more = entries.next().is_some();
    (page, more)
}

/// The data itself plus notification settings
struct Keyspace {
    data: BTreeMap<Vec<u8>, Value>,
    flags: NotifyFlags,
    database: u32,
    cursors: Mutex<ScanCursors>,
}

impl Keyspace {
    fn new(database: u32) -> Self {
        Self {
            data: BTreeMap::new(),
            flags: NotifyFlags::default(),
            database,
            cursors: Mutex::new(ScanCursors::default()),
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    fn query(&self, command: &Command) -> Result<Reply> {
        match command {
            Command::Ping => Ok(Reply::Bulk(Bytes::from_static(b"PONG"))),
            Command::Get { key } => match self.data.get(key) {
                None => Ok(Reply::Nil),
                Some(Value::Str(v)) => Ok(Reply::Bulk(v.clone())),
                Some(_) => Err(wrong_type(key)),
            },
            Command::Exists { key } => Ok(Reply::Integer(self.data.contains_key(key) as i64)),
            Command::LLen { key } => Ok(Reply::Integer(
                self.list(key)?.map(|l| l.len()).unwrap_or(0) as i64,
            )),
            Command::LRange { key, start, stop } => {
                let items = match self.list(key)? {
                    None => Vec::new(),
                    Some(list) => match normalize_range(list.len(), *start, *stop) {
                        None => Vec::new(),
                        Some((s, e)) => list.range(s..=e).cloned().map(Reply::Bulk).collect(),
                    },
                };
                Ok(Reply::Array(items))
            }
            Command::HGet { key, field } => Ok(Reply::from(
                self.hash(key)?.and_then(|h| h.get(field).cloned()),
            )),
            Command::HMGet { key, fields } => {
                let hash = self.hash(key)?;
                Ok(Reply::Array(
                    fields
                        .iter()
                        .map(|f| Reply::from(hash.and_then(|h| h.get(f).cloned())))
                        .collect(),
                ))
            }
            Command::Keys { pattern } => Ok(Reply::Array(
                self.data
                    .keys()
                    .filter(|k| glob_match(pattern, k))
                    .map(|k| Reply::Bulk(Bytes::copy_from_slice(k)))
                    .collect(),
            )),
            other => Err(SackError::Backend(format!(
                "{:?} is not a read-only command",
                other.command_type()
            ))),
        }
    }

    fn scan(&self, cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage> {
        let mut cursors = self.cursors.lock();
        let after = cursors.resume(cursor)?;
        let (page, more) = page_after(&self.data, after.as_deref(), count.max(1));

        let next = match page.last() {
            Some((last, _)) if more => cursors.open(last.to_vec()),
            _ => 0,
        };
        let items = page
            .into_iter()
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(ScanPage { cursor: next, items })
    }

    fn hscan(&self, key: &[u8], cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage> {
        let mut cursors = self.cursors.lock();
        let after = cursors.resume(cursor)?;
        let hash = match self.hash(key)? {
            Some(h) => h,
            None => return Ok(ScanPage::default()),
        };
        let (page, more) = page_after(hash, after.as_deref(), count.max(1));

        let next = match page.last() {
            Some((last, _)) if more => cursors.open(last.to_vec()),
            _ => 0,
        };
        let mut items = Vec::new();
        for (field, value) in page {
            if glob_match(pattern, field) {
                items.push(field.clone());
                items.push(value.to_vec());
            }
        }
        Ok(ScanPage { cursor: next, items })
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    fn apply(&mut self, command: Command, events: &mut Vec<Notification>) -> Result<Reply> {
        if command.is_read_only() {
            return self.query(&command);
        }

        match command {
            Command::Set { key, value } => {
                self.data.insert(key.clone(), Value::Str(Bytes::from(value)));
                self.emit(events, EventClass::String, &key, "set");
                Ok(Reply::Ok)
            }
            Command::SetNx { key, value } => {
                if self.data.contains_key(&key) {
                    return Ok(Reply::Integer(0));
                }
                self.data.insert(key.clone(), Value::Str(Bytes::from(value)));
                self.emit(events, EventClass::String, &key, "set");
                Ok(Reply::Integer(1))
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.data.remove(&key).is_some() {
                        removed += 1;
                        self.emit(events, EventClass::Generic, &key, "del");
                    }
                }
                Ok(Reply::Integer(removed))
            }
            Command::RPush { key, values } => {
                let entry = self
                    .data
                    .entry(key.clone())
                    .or_insert_with(|| Value::List(VecDeque::new()));
                let list = match entry {
                    Value::List(l) => l,
                    _ => return Err(wrong_type(&key)),
                };
                list.extend(values.into_iter().map(Bytes::from));
                let len = list.len() as i64;
                self.emit(events, EventClass::List, &key, "rpush");
                Ok(Reply::Integer(len))
            }
            Command::LTrim { key, start, stop } => {
                let now_empty = match self.data.get_mut(&key) {
                    None => return Ok(Reply::Ok),
                    Some(Value::List(list)) => {
                        match normalize_range(list.len(), start, stop) {
                            None => list.clear(),
                            Some((s, e)) => {
                                list.truncate(e + 1);
                                list.drain(..s);
                            }
                        }
                        list.is_empty()
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                self.emit(events, EventClass::List, &key, "ltrim");
                if now_empty {
                    self.data.remove(&key);
                    self.emit(events, EventClass::Generic, &key, "del");
                }
                Ok(Reply::Ok)
            }
            Command::HSet { key, field, value } => {
                let created = self.hash_mut(&key)?.insert(field, Bytes::from(value)).is_none();
                self.emit(events, EventClass::Hash, &key, "hset");
                Ok(Reply::Integer(created as i64))
            }
            Command::HSetNx { key, field, value } => {
                let hash = self.hash_mut(&key)?;
                if hash.contains_key(&field) {
                    return Ok(Reply::Integer(0));
                }
                hash.insert(field, Bytes::from(value));
                self.emit(events, EventClass::Hash, &key, "hset");
                Ok(Reply::Integer(1))
            }
            Command::HDel { key, fields } => {
                let (removed, now_empty) = match self.data.get_mut(&key) {
                    None => return Ok(Reply::Integer(0)),
                    Some(Value::Hash(hash)) => {
                        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                        (removed, hash.is_empty())
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                if removed > 0 {
                    self.emit(events, EventClass::Hash, &key, "hdel");
                }
                if now_empty {
                    self.data.remove(&key);
                    self.emit(events, EventClass::Generic, &key, "del");
                }
                Ok(Reply::Integer(removed as i64))
            }
            Command::ConfigSet { parameter, value } => {
                if !parameter.eq_ignore_ascii_case("notify-keyspace-events") {
                    return Err(SackError::Backend(format!(
                        "unsupported CONFIG SET parameter '{}'",
                        parameter
                    )));
                }
                self.flags = NotifyFlags::parse(&value)?;
                Ok(Reply::Ok)
            }
            other => Err(SackError::Backend(format!(
                "unhandled command {:?}",
                other.command_type()
            ))),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn list(&self, key: &[u8]) -> Result<Option<&VecDeque<Bytes>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash(&self, key: &[u8]) -> Result<Option<&BTreeMap<Vec<u8>, Bytes>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &[u8]) -> Result<&mut BTreeMap<Vec<u8>, Bytes>> {
        match self
            .data
            .entry(key.to_vec())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn emit(&self, events: &mut Vec<Notification>, class: EventClass, key: &[u8], event: &str) {
        if !self.flags.enabled(class) {
            return;
        }
        if self.flags.keyspace {
            let mut channel = format!("__keyspace@{}__:", self.database).into_bytes();
            channel.extend_from_slice(key);
            events.push((channel, event.as_bytes().to_vec()));
        }
        if self.flags.keyevent {
            let channel = format!("__keyevent@{}__:{}", self.database, event).into_bytes();
            events.push((channel, key.to_vec()));
        }
    }
}

/// Resolve an inclusive, possibly negative range against a list length
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if s > e || s >= len {
        return None;
    }
    Some((s as usize, e as usize))
}

fn wrong_type(key: &[u8]) -> SackError {
    SackError::WrongType {
        key: String::from_utf8_lossy(key).into_owned(),
    }
}

/// Script execution handle, alive while the write lock is held
struct ScriptRun<'a> {
    keyspace: &'a mut Keyspace,
    events: &'a mut Vec<Notification>,
}

impl ScriptContext for ScriptRun<'_> {
    fn call(&mut self, command: Command) -> Result<Reply> {
        self.keyspace.apply(command, self.events)
    }

    fn hscan(&mut self, key: &[u8], cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage> {
        self.keyspace.hscan(key, cursor, pattern, count)
    }
}

/// In-process key-value backend
pub struct MemoryBackend {
    keyspace: RwLock<Keyspace>,
    subscribers: Mutex<Vec<Subscriber>>,
    round_trips: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend for database 0
    pub fn new() -> Self {
        Self::with_database(0)
    }

    /// Create an empty backend whose notification channels name `database`
    pub fn with_database(database: u32) -> Self {
        Self {
            keyspace: RwLock::new(Keyspace::new(database)),
            subscribers: Mutex::new(Vec::new()),
            round_trips: AtomicU64::new(0),
        }
    }

    /// Number of keys currently holding data
    pub fn key_count(&self) -> usize {
        self.keyspace.read().data.len()
    }

    /// Number of round trips served so far (commands, pipelines, scripts, scan pages)
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Number of live pattern subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn run(&self, command: Command) -> Result<Reply> {
        tracing::trace!("memory backend: {:?}", command.command_type());
        if command.is_read_only() {
            return self.keyspace.read().query(&command);
        }
        let mut events = Vec::new();
        let reply = self.keyspace.write().apply(command, &mut events);
        self.publish(events);
        reply
    }

    fn publish(&self, events: Vec<Notification>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        for (channel, payload) in &events {
            subscribers.retain(|s| s.deliver(channel, payload));
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn execute(&self, command: Command) -> Result<Reply> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.run(command)
    }

    fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        commands.into_iter().map(|c| self.run(c)).collect()
    }

    fn eval(&self, script: &dyn Script, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("memory backend: eval {}", script.name());
        let mut events = Vec::new();
        let reply = {
            let mut keyspace = self.keyspace.write();
            let mut ctx = ScriptRun {
                keyspace: &mut *keyspace,
                events: &mut events,
            };
            script.run(&mut ctx, keys, args)
        };
        self.publish(events);
        reply
    }

    fn scan(&self, cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.keyspace.read().scan(cursor, pattern, count)
    }

    fn psubscribe(&self, pattern: &[u8]) -> Result<Subscription> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let (subscriber, subscription) = Subscriber::pair(pattern);
        self.subscribers.lock().push(subscriber);
        Ok(subscription)
    }
}
