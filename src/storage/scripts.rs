//! Atomic scripts of the aggregate store

use crate::backend::{Command, Reply, Script, ScriptContext};
use crate::error::{Result, SackError};

/// Reply code of `GetMeasuresScript` when the namespace is absent
pub(super) const METRIC_MISSING: i64 = -2;

/// KEYS[1] = metric namespace, ARGV[1] = page size, ARGV[2..] = field globs.
///
/// Replies nil when the namespace is absent, otherwise one array of
/// matching field names per glob. Each glob is paged with HSCAN until the
/// cursor comes back to 0.
pub(super) struct ListSplitKeysScript;

impl Script for ListSplitKeysScript {
    fn name(&self) -> &'static str {
        "list_split_keys"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply> {
        let key = single_key(keys)?;
        let (count, patterns) = args.split_first().ok_or_else(|| {
            SackError::ProtocolViolation("list_split_keys needs a page size".to_string())
        })?;
        let count: usize = std::str::from_utf8(count)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SackError::ProtocolViolation("invalid page size".to_string()))?;

        let exists = ctx.call(Command::Exists { key: key.clone() })?.into_integer()?;
        if exists == 0 {
            return Ok(Reply::Nil);
        }

        let mut per_pattern = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let mut fields = Vec::new();
            let mut cursor = 0u64;
            loop {
                let page = ctx.hscan(key, cursor, pattern, count)?;
                // Items alternate field and value; keep the names only
                fields.extend(
                    page.items
                        .into_iter()
                        .step_by(2)
                        .map(|f| Reply::Bulk(f.into())),
                );
                cursor = page.cursor;
                if cursor == 0 {
                    break;
                }
            }
            per_pattern.push(Reply::Array(fields));
        }
        Ok(Reply::Array(per_pattern))
    }
}

/// KEYS[1] = metric namespace, ARGV = fields.
///
/// Replies [METRIC_MISSING, nil] when the namespace is absent, otherwise
/// [0, [value or nil, ...]]. Existence is checked at most once, and only
/// if some field is missing.
pub(super) struct GetMeasuresScript;

impl Script for GetMeasuresScript {
    fn name(&self) -> &'static str {
        "get_measures"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply> {
        let key = single_key(keys)?;
        let values = ctx
            .call(Command::HMGet {
                key: key.clone(),
                fields: args.to_vec(),
            })?
            .into_array()?;

        let mut metric_exists = false;
        for value in &values {
            if value.is_nil() && !metric_exists {
                if ctx.call(Command::Exists { key: key.clone() })?.into_integer()? == 0 {
                    return Ok(Reply::Array(vec![Reply::Integer(METRIC_MISSING), Reply::Nil]));
                }
                metric_exists = true;
            }
        }
        Ok(Reply::Array(vec![Reply::Integer(0), Reply::Array(values)]))
    }
}

fn single_key(keys: &[Vec<u8>]) -> Result<&Vec<u8>> {
    match keys {
        [key] => Ok(key),
        _ => Err(SackError::ProtocolViolation(format!(
            "expected exactly one key, got {}",
            keys.len()
        ))),
    }
}
