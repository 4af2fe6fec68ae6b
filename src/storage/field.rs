//! Aggregate field names
//!
//! ## Format
//! ```text
//! <split timestamp>_<method>_<granularity>[_v<version>]   aggregated split
//! none[_v<version>]                                        unaggregated buffer
//! ```
//! Timestamps and granularities are written in seconds with a decimal
//! part ("1420070400.0", "0.5"). Version 0 means the legacy unversioned
//! layout without suffix.

use std::time::Duration;

use crate::backend::escape;
use crate::error::{Result, SackError};
use crate::metric::{duration_nanos, Aggregation, SplitKey, FIELD_SEP};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Field holding the unaggregated buffer
pub fn unaggregated_field(version: u32) -> String {
    let mut field = "none".to_string();
    push_version(&mut field, version);
    field
}

/// Field holding one split of `method`
pub fn split_field(key: &SplitKey, method: &str, version: u32) -> String {
    let mut field = format!(
        "{}{sep}{}{sep}{}",
        format_seconds(key.timestamp()),
        method,
        format_seconds(duration_nanos(key.granularity())),
        sep = FIELD_SEP
    );
    push_version(&mut field, version);
    field
}

/// Glob over every split field of `aggregation`
pub fn split_pattern(aggregation: &Aggregation, version: u32) -> Vec<u8> {
    let mut suffix = format!(
        "{sep}{}{sep}{}",
        aggregation.method(),
        format_seconds(duration_nanos(aggregation.granularity())),
        sep = FIELD_SEP
    );
    push_version(&mut suffix, version);
    let mut pattern = vec![b'*'];
    pattern.extend_from_slice(&escape(suffix.as_bytes()));
    pattern
}

/// Decode a split field back into (split key, method)
pub fn parse_split_field(field: &str) -> Result<(SplitKey, String)> {
    let parts: Vec<&str> = field.split(FIELD_SEP).collect();
    let (timestamp, method, granularity) = match parts.as_slice() {
        [ts, method, gran] => (*ts, *method, *gran),
        [ts, method, gran, version] if version.starts_with('v') => (*ts, *method, *gran),
        _ => {
            return Err(SackError::ProtocolViolation(format!(
                "malformed split field '{}'",
                field
            )))
        }
    };

    let timestamp = parse_seconds(timestamp)?;
    let granularity = parse_seconds(granularity)?;
    if granularity <= 0 {
        return Err(SackError::ProtocolViolation(format!(
            "split field '{}' has a non-positive granularity",
            field
        )));
    }
    let key = SplitKey::new(timestamp, Duration::from_nanos(granularity as u64))?;
    Ok((key, method.to_string()))
}

/// Nanoseconds → "<seconds>.<fraction>", fraction trimmed but never empty
pub fn format_seconds(nanos: i64) -> String {
    let sign = if nanos < 0 { "-" } else { "" };
    let abs = (nanos as i128).abs();
    let secs = abs / NANOS_PER_SEC as i128;
    let frac = abs % NANOS_PER_SEC as i128;
    if frac == 0 {
        return format!("{}{}.0", sign, secs);
    }
    let frac = format!("{:09}", frac);
    format!("{}{}.{}", sign, secs, frac.trim_end_matches('0'))
}

/// "<seconds>[.<fraction>]" → nanoseconds
pub fn parse_seconds(s: &str) -> Result<i64> {
    let invalid = || SackError::ProtocolViolation(format!("invalid seconds value '{}'", s));

    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty()
        || frac.len() > 9
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", frac).parse().map_err(|_| invalid())?
    };
    let nanos = whole
        .checked_mul(NANOS_PER_SEC)
        .and_then(|n| n.checked_add(frac))
        .ok_or_else(invalid)?;
    Ok(if negative { -nanos } else { nanos })
}

fn push_version(field: &mut String, version: u32) {
    if version > 0 {
        field.push(FIELD_SEP);
        field.push('v');
        field.push_str(&version.to_string());
    }
}
