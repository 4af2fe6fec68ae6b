//! Reply definitions
//!
//! What a backend answers to a command or a script.

use bytes::Bytes;

use crate::error::{Result, SackError};

/// A reply from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Absent value
    Nil,

    /// Status acknowledgement
    Ok,

    /// Integer result (counts, flags, lengths)
    Integer(i64),

    /// Binary-safe value
    Bulk(Bytes),

    /// Nested replies
    Array(Vec<Reply>),
}

impl Reply {
    /// Expect an integer reply
    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Expect a bulk reply, mapping nil to `None`
    pub fn into_optional_bulk(self) -> Result<Option<Bytes>> {
        match self {
            Reply::Bulk(b) => Ok(Some(b)),
            Reply::Nil => Ok(None),
            other => Err(unexpected("bulk or nil", &other)),
        }
    }

    /// Expect a bulk reply
    pub fn into_bulk(self) -> Result<Bytes> {
        match self {
            Reply::Bulk(b) => Ok(b),
            other => Err(unexpected("bulk", &other)),
        }
    }

    /// Expect an array reply
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Expect a status acknowledgement
    pub fn expect_ok(self) -> Result<()> {
        match self {
            Reply::Ok => Ok(()),
            other => Err(unexpected("OK", &other)),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Reply::Bulk(b)
    }
}

impl From<Option<Bytes>> for Reply {
    fn from(b: Option<Bytes>) -> Self {
        b.map(Reply::Bulk).unwrap_or(Reply::Nil)
    }
}

fn unexpected(expected: &str, got: &Reply) -> SackError {
    SackError::ProtocolViolation(format!("expected {} reply, got {:?}", expected, got))
}
