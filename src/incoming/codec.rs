//! Measure batch codec
//!
//! ## Format
//! ```text
//! ┌────────────────────┬────────────────────┐
//! │ timestamp i64 (LE) │   value f64 (LE)   │  ... repeated
//! └────────────────────┴────────────────────┘
//! ```
//! Records are fixed width with no batch header, so concatenating encoded
//! batches yields the encoding of all their measures in order. The
//! sack snapshot relies on that.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SackError};

/// Encoded size of one measure
pub const MEASURE_SIZE: usize = 16;

/// One raw measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measure {
    /// Nanoseconds since the epoch
    pub timestamp: i64,
    pub value: f64,
}

impl Measure {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Encode a batch of measures
pub fn encode_measures(measures: &[Measure]) -> Bytes {
    let mut buf = BytesMut::with_capacity(measures.len() * MEASURE_SIZE);
    for m in measures {
        buf.put_i64_le(m.timestamp);
        buf.put_f64_le(m.value);
    }
    buf.freeze()
}

/// Decode one or more concatenated batches
pub fn decode_measures(mut data: &[u8]) -> Result<Vec<Measure>> {
    if data.len() % MEASURE_SIZE != 0 {
        return Err(SackError::Serialization(format!(
            "measure blob of {} bytes is not a multiple of {}",
            data.len(),
            MEASURE_SIZE
        )));
    }

    let mut measures = Vec::with_capacity(data.len() / MEASURE_SIZE);
    while data.has_remaining() {
        let timestamp = data.get_i64_le();
        let value = data.get_f64_le();
        measures.push(Measure { timestamp, value });
    }
    Ok(measures)
}
