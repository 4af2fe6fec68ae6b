//! Tests for MemoryBackend
//!
//! These tests verify:
//! - String, list and hash command semantics
//! - Empty lists/hashes disappearing from the keyspace
//! - Glob matching, KEYS and cursor scans
//! - Cursors resume after the last visited key when keys come and go
//! - Pipelines and atomic scripts
//! - Keyspace notifications

use std::time::Duration;

use bytes::Bytes;
use sackdb::backend::{
    escape, glob_match, scan_all, Backend, Command, MemoryBackend, Reply, Script, ScriptContext,
};
use sackdb::{Result, SackError};

// =============================================================================
// Helper Functions
// =============================================================================

fn bulk(s: &str) -> Reply {
    Reply::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn key(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn rpush(backend: &MemoryBackend, k: &str, values: &[&str]) {
    backend
        .execute(Command::RPush {
            key: key(k),
            values: values.iter().map(|v| key(v)).collect(),
        })
        .unwrap();
}

fn lrange(backend: &MemoryBackend, k: &str, start: i64, stop: i64) -> Vec<Reply> {
    backend
        .execute(Command::LRange {
            key: key(k),
            start,
            stop,
        })
        .unwrap()
        .into_array()
        .unwrap()
}

fn exists(backend: &MemoryBackend, k: &str) -> bool {
    backend
        .execute(Command::Exists { key: key(k) })
        .unwrap()
        .into_integer()
        .unwrap()
        == 1
}

// =============================================================================
// String Tests
// =============================================================================

#[test]
fn test_set_get() {
    let backend = MemoryBackend::new();

    backend
        .execute(Command::Set {
            key: key("k"),
            value: key("v"),
        })
        .unwrap();

    assert_eq!(backend.execute(Command::Get { key: key("k") }).unwrap(), bulk("v"));
    assert_eq!(
        backend.execute(Command::Get { key: key("missing") }).unwrap(),
        Reply::Nil
    );
}

#[test]
fn test_setnx_only_creates_once() {
    let backend = MemoryBackend::new();

    let first = backend
        .execute(Command::SetNx {
            key: key("marker"),
            value: key("1"),
        })
        .unwrap();
    let second = backend
        .execute(Command::SetNx {
            key: key("marker"),
            value: key("2"),
        })
        .unwrap();

    assert_eq!(first, Reply::Integer(1));
    assert_eq!(second, Reply::Integer(0));
    assert_eq!(
        backend.execute(Command::Get { key: key("marker") }).unwrap(),
        bulk("1")
    );
}

#[test]
fn test_del_counts_removed_keys() {
    let backend = MemoryBackend::new();
    rpush(&backend, "a", &["x"]);

    let removed = backend
        .execute(Command::Del {
            keys: vec![key("a"), key("b")],
        })
        .unwrap();

    assert_eq!(removed, Reply::Integer(1));
    assert!(!exists(&backend, "a"));
}

// =============================================================================
// List Tests
// =============================================================================

#[test]
fn test_rpush_preserves_order() {
    let backend = MemoryBackend::new();
    rpush(&backend, "q", &["a", "b"]);
    rpush(&backend, "q", &["c"]);

    assert_eq!(lrange(&backend, "q", 0, -1), vec![bulk("a"), bulk("b"), bulk("c")]);
    assert_eq!(
        backend.execute(Command::LLen { key: key("q") }).unwrap(),
        Reply::Integer(3)
    );
}

#[test]
fn test_lrange_is_inclusive_and_clamped() {
    let backend = MemoryBackend::new();
    rpush(&backend, "q", &["a", "b", "c", "d"]);

    assert_eq!(lrange(&backend, "q", 0, 1), vec![bulk("a"), bulk("b")]);
    assert_eq!(lrange(&backend, "q", -2, -1), vec![bulk("c"), bulk("d")]);
    assert_eq!(lrange(&backend, "q", 2, 100), vec![bulk("c"), bulk("d")]);
    assert_eq!(lrange(&backend, "q", -100, 0), vec![bulk("a")]);
    assert!(lrange(&backend, "q", 3, 1).is_empty());
    assert!(lrange(&backend, "missing", 0, -1).is_empty());
}

#[test]
fn test_ltrim_drops_prefix() {
    let backend = MemoryBackend::new();
    rpush(&backend, "q", &["a", "b", "c", "d"]);

    backend
        .execute(Command::LTrim {
            key: key("q"),
            start: 2,
            stop: -1,
        })
        .unwrap();

    assert_eq!(lrange(&backend, "q", 0, -1), vec![bulk("c"), bulk("d")]);
}

#[test]
fn test_ltrim_everything_removes_key() {
    let backend = MemoryBackend::new();
    rpush(&backend, "q", &["a", "b"]);

    backend
        .execute(Command::LTrim {
            key: key("q"),
            start: 2,
            stop: -1,
        })
        .unwrap();

    assert!(!exists(&backend, "q"));
    assert_eq!(backend.key_count(), 0);
}

#[test]
fn test_ltrim_missing_key_is_ok() {
    let backend = MemoryBackend::new();

    let reply = backend
        .execute(Command::LTrim {
            key: key("missing"),
            start: 1,
            stop: -1,
        })
        .unwrap();

    assert_eq!(reply, Reply::Ok);
}

#[test]
fn test_wrong_type() {
    let backend = MemoryBackend::new();
    rpush(&backend, "q", &["a"]);

    let result = backend.execute(Command::Get { key: key("q") });

    assert!(matches!(result, Err(SackError::WrongType { .. })));
}

// =============================================================================
// Hash Tests
// =============================================================================

#[test]
fn test_hash_set_get_and_mget() {
    let backend = MemoryBackend::new();

    let created = backend
        .execute(Command::HSet {
            key: key("h"),
            field: key("f1"),
            value: key("v1"),
        })
        .unwrap();
    let overwritten = backend
        .execute(Command::HSet {
            key: key("h"),
            field: key("f1"),
            value: key("v2"),
        })
        .unwrap();

    assert_eq!(created, Reply::Integer(1));
    assert_eq!(overwritten, Reply::Integer(0));

    let values = backend
        .execute(Command::HMGet {
            key: key("h"),
            fields: vec![key("f1"), key("nope")],
        })
        .unwrap();
    assert_eq!(values, Reply::Array(vec![bulk("v2"), Reply::Nil]));
}

#[test]
fn test_hsetnx_does_not_clobber() {
    let backend = MemoryBackend::new();
    backend
        .execute(Command::HSet {
            key: key("h"),
            field: key("f"),
            value: key("keep"),
        })
        .unwrap();

    let reply = backend
        .execute(Command::HSetNx {
            key: key("h"),
            field: key("f"),
            value: key("clobber"),
        })
        .unwrap();

    assert_eq!(reply, Reply::Integer(0));
    assert_eq!(
        backend
            .execute(Command::HGet {
                key: key("h"),
                field: key("f"),
            })
            .unwrap(),
        bulk("keep")
    );
}

#[test]
fn test_hdel_last_field_removes_hash() {
    let backend = MemoryBackend::new();
    backend
        .execute(Command::HSet {
            key: key("h"),
            field: key("f"),
            value: key("v"),
        })
        .unwrap();

    let removed = backend
        .execute(Command::HDel {
            key: key("h"),
            fields: vec![key("f"), key("g")],
        })
        .unwrap();

    assert_eq!(removed, Reply::Integer(1));
    assert!(!exists(&backend, "h"));
}

#[test]
fn test_hmget_on_missing_hash_is_all_nil() {
    let backend = MemoryBackend::new();

    let values = backend
        .execute(Command::HMGet {
            key: key("h"),
            fields: vec![key("a"), key("b")],
        })
        .unwrap();

    assert_eq!(values, Reply::Array(vec![Reply::Nil, Reply::Nil]));
}

// =============================================================================
// Pattern and Scan Tests
// =============================================================================

#[test]
fn test_glob_match() {
    assert!(glob_match(b"*", b""));
    assert!(glob_match(b"incoming8-*", b"incoming8-3"));
    assert!(glob_match(b"incoming8-3:*", b"incoming8-3:abc"));
    assert!(!glob_match(b"incoming8-3:*", b"incoming8-30:abc"));
    assert!(glob_match(b"h?llo", b"hello"));
    assert!(glob_match(b"h[ae]llo", b"hallo"));
    assert!(!glob_match(b"h[^e]llo", b"hello"));
    assert!(glob_match(b"v[0-9]", b"v7"));
    assert!(glob_match(b"*_mean_300.0_v3", b"1420070400.0_mean_300.0_v3"));
    assert!(!glob_match(b"*_mean_300.0", b"1420070400.0_mean_300.0_v3"));
    assert!(glob_match(b"a\\*b", b"a*b"));
    assert!(!glob_match(b"a\\*b", b"axb"));
}

#[test]
fn test_escape_matches_only_itself() {
    let literal = b"we*ird[key]?";
    let pattern = escape(literal);

    assert!(glob_match(&pattern, literal));
    assert!(!glob_match(&pattern, b"weXird[key]?"));
}

#[test]
fn test_keys_command() {
    let backend = MemoryBackend::new();
    rpush(&backend, "incoming4-1:a", &["x"]);
    rpush(&backend, "incoming4-1:b", &["x"]);
    rpush(&backend, "incoming4-2:c", &["x"]);

    let keys = backend
        .execute(Command::Keys {
            pattern: key("incoming4-1:*"),
        })
        .unwrap()
        .into_array()
        .unwrap();

    assert_eq!(keys, vec![bulk("incoming4-1:a"), bulk("incoming4-1:b")]);
}

#[test]
fn test_scan_pages_until_cursor_zero() {
    let backend = MemoryBackend::new();
    for i in 0..7 {
        rpush(&backend, &format!("key{}", i), &["x"]);
    }
    rpush(&backend, "other", &["x"]);

    let first = backend.scan(0, b"key*", 3).unwrap();
    assert_ne!(first.cursor, 0, "a single page must not cover 8 keys");

    let mut all = scan_all(&backend, b"key*", 3).unwrap();
    all.sort();
    let expected: Vec<Vec<u8>> = (0..7).map(|i| key(&format!("key{}", i))).collect();
    assert_eq!(all, expected);
}

#[test]
fn test_scan_survives_deleting_returned_keys() {
    let backend = MemoryBackend::new();
    for k in ["a", "b", "c", "d", "e"] {
        rpush(&backend, k, &["x"]);
    }

    let first = backend.scan(0, b"*", 2).unwrap();
    assert_eq!(first.items, vec![key("a"), key("b")]);
    backend.execute(Command::Del { keys: vec![key("a")] }).unwrap();

    let mut seen = first.items;
    let mut cursor = first.cursor;
    while cursor != 0 {
        let page = backend.scan(cursor, b"*", 2).unwrap();
        seen.extend(page.items);
        cursor = page.cursor;
    }

    assert_eq!(seen, vec![key("a"), key("b"), key("c"), key("d"), key("e")]);
}

#[test]
fn test_scan_sees_keys_added_after_the_cursor() {
    let backend = MemoryBackend::new();
    for k in ["a", "c"] {
        rpush(&backend, k, &["x"]);
    }

    let first = backend.scan(0, b"*", 1).unwrap();
    rpush(&backend, "b", &["x"]);
    let second = backend.scan(first.cursor, b"*", 10).unwrap();

    assert_eq!(first.items, vec![key("a")]);
    assert_eq!(second.items, vec![key("b"), key("c")]);
    assert_eq!(second.cursor, 0);
}

#[test]
fn test_scan_unknown_cursor() {
    let backend = MemoryBackend::new();
    rpush(&backend, "a", &["x"]);

    assert!(matches!(
        backend.scan(12345, b"*", 10),
        Err(SackError::Backend(_))
    ));
}

/// Pages through the hash at KEYS[1] two fields at a time, deleting each
/// page's first field before asking for the next one
struct ScanWhileDeleting;

impl Script for ScanWhileDeleting {
    fn name(&self) -> &'static str {
        "scan_while_deleting"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], _args: &[Vec<u8>]) -> Result<Reply> {
        let mut seen = Vec::new();
        let mut cursor = 0u64;
        loop {
            let page = ctx.hscan(&keys[0], cursor, b"*", 2)?;
            let fields: Vec<Vec<u8>> = page.items.chunks(2).map(|pair| pair[0].clone()).collect();
            if let Some(first) = fields.first() {
                ctx.call(Command::HDel {
                    key: keys[0].clone(),
                    fields: vec![first.clone()],
                })?;
            }
            seen.extend(fields.into_iter().map(|f| Reply::Bulk(Bytes::from(f))));
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(Reply::Array(seen))
    }
}

#[test]
fn test_hscan_survives_deleting_returned_fields() {
    let backend = MemoryBackend::new();
    for field in ["f1", "f2", "f3", "f4", "f5"] {
        backend
            .execute(Command::HSet {
                key: key("h"),
                field: key(field),
                value: key("v"),
            })
            .unwrap();
    }

    let seen = backend
        .eval(&ScanWhileDeleting, &[key("h")], &[])
        .unwrap()
        .into_array()
        .unwrap();

    assert_eq!(
        seen,
        vec![bulk("f1"), bulk("f2"), bulk("f3"), bulk("f4"), bulk("f5")]
    );
}

// =============================================================================
// Pipeline and Script Tests
// =============================================================================

#[test]
fn test_pipeline_is_one_round_trip() {
    let backend = MemoryBackend::new();
    let before = backend.round_trips();

    let replies = backend
        .pipeline(vec![
            Command::RPush {
                key: key("q"),
                values: vec![key("a")],
            },
            Command::RPush {
                key: key("q"),
                values: vec![key("b")],
            },
            Command::LLen { key: key("q") },
        ])
        .unwrap();

    assert_eq!(backend.round_trips() - before, 1);
    assert_eq!(
        replies,
        vec![Reply::Integer(1), Reply::Integer(2), Reply::Integer(2)]
    );
}

/// Moves the whole list at KEYS[1] to KEYS[2]
struct MoveList;

impl Script for MoveList {
    fn name(&self) -> &'static str {
        "move_list"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], _args: &[Vec<u8>]) -> Result<Reply> {
        let items = ctx
            .call(Command::LRange {
                key: keys[0].clone(),
                start: 0,
                stop: -1,
            })?
            .into_array()?;
        let values = items
            .into_iter()
            .map(|i| i.into_bulk().map(|b| b.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let moved = values.len() as i64;
        ctx.call(Command::Del {
            keys: vec![keys[0].clone()],
        })?;
        if !values.is_empty() {
            ctx.call(Command::RPush {
                key: keys[1].clone(),
                values,
            })?;
        }
        Ok(Reply::Integer(moved))
    }
}

#[test]
fn test_eval_runs_script() {
    let backend = MemoryBackend::new();
    rpush(&backend, "src", &["a", "b"]);

    let moved = backend
        .eval(&MoveList, &[key("src"), key("dst")], &[])
        .unwrap();

    assert_eq!(moved, Reply::Integer(2));
    assert!(!exists(&backend, "src"));
    assert_eq!(lrange(&backend, "dst", 0, -1), vec![bulk("a"), bulk("b")]);
}

#[test]
fn test_eval_is_atomic_against_concurrent_pushes() {
    let backend = std::sync::Arc::new(MemoryBackend::new());
    let pusher = {
        let backend = std::sync::Arc::clone(&backend);
        std::thread::spawn(move || {
            for i in 0..2000 {
                rpush(&backend, "src", &[&i.to_string()]);
            }
        })
    };

    let mut moved = 0;
    while moved < 2000 {
        moved += backend
            .eval(&MoveList, &[key("src"), key("dst")], &[])
            .unwrap()
            .into_integer()
            .unwrap();
    }
    pusher.join().unwrap();

    let dst = lrange(&backend, "dst", 0, -1);
    assert_eq!(dst.len(), 2000);
    for (i, item) in dst.into_iter().enumerate() {
        assert_eq!(item, bulk(&i.to_string()));
    }
}

#[test]
fn test_unknown_config_parameter() {
    let backend = MemoryBackend::new();

    let result = backend.execute(Command::ConfigSet {
        parameter: "maxmemory".to_string(),
        value: "1".to_string(),
    });

    assert!(matches!(result, Err(SackError::Backend(_))));
}

// =============================================================================
// Notification Tests
// =============================================================================

fn enable_string_notifications(backend: &MemoryBackend) {
    backend
        .execute(Command::ConfigSet {
            parameter: "notify-keyspace-events".to_string(),
            value: "K$".to_string(),
        })
        .unwrap();
}

#[test]
fn test_no_notifications_by_default() {
    let backend = MemoryBackend::new();
    let sub = backend.psubscribe(b"__keyspace@0__:*").unwrap();

    backend
        .execute(Command::Set {
            key: key("k"),
            value: key("v"),
        })
        .unwrap();

    assert_eq!(sub.try_recv().unwrap(), None);
}

#[test]
fn test_setnx_notifies_only_on_creation() {
    let backend = MemoryBackend::new();
    enable_string_notifications(&backend);
    let sub = backend.psubscribe(b"__keyspace@0__:marker*").unwrap();

    for _ in 0..3 {
        backend
            .execute(Command::SetNx {
                key: key("marker"),
                value: key("1"),
            })
            .unwrap();
    }

    let msg = sub.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(msg.channel, key("__keyspace@0__:marker"));
    assert_eq!(msg.payload, key("set"));
    assert_eq!(msg.pattern, key("__keyspace@0__:marker*"));
    assert_eq!(sub.try_recv().unwrap(), None);
}

#[test]
fn test_list_events_filtered_by_flags() {
    let backend = MemoryBackend::new();
    enable_string_notifications(&backend);
    let sub = backend.psubscribe(b"__keyspace@0__:*").unwrap();

    rpush(&backend, "q", &["a"]);

    assert_eq!(sub.try_recv().unwrap(), None);
}

#[test]
fn test_notification_channel_uses_database() {
    let backend = MemoryBackend::with_database(3);
    enable_string_notifications(&backend);
    let sub = backend.psubscribe(b"__keyspace@3__:*").unwrap();

    backend
        .execute(Command::Set {
            key: key("k"),
            value: key("v"),
        })
        .unwrap();

    let msg = sub.try_recv().unwrap().unwrap();
    assert_eq!(msg.channel, key("__keyspace@3__:k"));
}

#[test]
fn test_dropped_subscription_is_pruned() {
    let backend = MemoryBackend::new();
    enable_string_notifications(&backend);
    let sub = backend.psubscribe(b"__keyspace@0__:*").unwrap();
    assert_eq!(backend.subscriber_count(), 1);

    drop(sub);
    backend
        .execute(Command::Set {
            key: key("k"),
            value: key("v"),
        })
        .unwrap();

    assert_eq!(backend.subscriber_count(), 0);
}
