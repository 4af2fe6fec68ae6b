//! Command definitions
//!
//! One backend operation. Keys, fields and values are raw bytes; the
//! core builds them from composite textual keys.

/// Command types, used for logging and notification event names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Ping,
    Get,
    Set,
    SetNx,
    Del,
    Exists,
    RPush,
    LLen,
    LRange,
    LTrim,
    HSet,
    HSetNx,
    HGet,
    HMGet,
    HDel,
    Keys,
    ConfigSet,
}

/// A single backend command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ping (health check)
    Ping,

    /// Get a string value
    Get { key: Vec<u8> },

    /// Set a string value, overwriting whatever was there
    Set { key: Vec<u8>, value: Vec<u8> },

    /// Set a string value only if the key is absent. Replies 1 if set, 0 otherwise
    SetNx { key: Vec<u8>, value: Vec<u8> },

    /// Delete keys. Replies the number of keys removed
    Del { keys: Vec<Vec<u8>> },

    /// Replies 1 if the key holds data, 0 otherwise
    Exists { key: Vec<u8> },

    /// Append values at the tail of a list. Replies the new length
    RPush { key: Vec<u8>, values: Vec<Vec<u8>> },

    /// Length of a list (0 when absent)
    LLen { key: Vec<u8> },

    /// Inclusive range of list items, negative indices count from the tail
    LRange { key: Vec<u8>, start: i64, stop: i64 },

    /// Keep only the inclusive range, negative indices count from the tail
    LTrim { key: Vec<u8>, start: i64, stop: i64 },

    /// Set a hash field. Replies 1 if the field is new, 0 if overwritten
    HSet { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },

    /// Set a hash field only if absent. Replies 1 if set, 0 otherwise
    HSetNx { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },

    /// Get one hash field
    HGet { key: Vec<u8>, field: Vec<u8> },

    /// Get many hash fields, one reply per field (nil when absent)
    HMGet { key: Vec<u8>, fields: Vec<Vec<u8>> },

    /// Remove hash fields. Replies the number of fields removed
    HDel { key: Vec<u8>, fields: Vec<Vec<u8>> },

    /// All keys matching a glob pattern
    Keys { pattern: Vec<u8> },

    /// Set a runtime parameter (only `notify-keyspace-events` is understood)
    ConfigSet { parameter: String, value: String },
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Ping => CommandType::Ping,
            Command::Get { .. } => CommandType::Get,
            Command::Set { .. } => CommandType::Set,
            Command::SetNx { .. } => CommandType::SetNx,
            Command::Del { .. } => CommandType::Del,
            Command::Exists { .. } => CommandType::Exists,
            Command::RPush { .. } => CommandType::RPush,
            Command::LLen { .. } => CommandType::LLen,
            Command::LRange { .. } => CommandType::LRange,
            Command::LTrim { .. } => CommandType::LTrim,
            Command::HSet { .. } => CommandType::HSet,
            Command::HSetNx { .. } => CommandType::HSetNx,
            Command::HGet { .. } => CommandType::HGet,
            Command::HMGet { .. } => CommandType::HMGet,
            Command::HDel { .. } => CommandType::HDel,
            Command::Keys { .. } => CommandType::Keys,
            Command::ConfigSet { .. } => CommandType::ConfigSet,
        }
    }

    /// Whether the command leaves the keyspace untouched
    pub fn is_read_only(&self) -> bool {
        matches!(
            self.command_type(),
            CommandType::Ping
                | CommandType::Get
                | CommandType::Exists
                | CommandType::LLen
                | CommandType::LRange
                | CommandType::HGet
                | CommandType::HMGet
                | CommandType::Keys
        )
    }
}
