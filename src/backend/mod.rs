//! Backend Module
//!
//! The key-value capability the ingestion core is written against.
//!
//! ## Capabilities
//! - Single commands and pipelined batches (one round trip, no cross-command
//!   transaction)
//! - Atomic server-side scripts: nothing else runs on the keyspace while a
//!   script executes
//! - Cursor-driven SCAN / HSCAN pagination over glob patterns
//! - Pattern subscriptions to keyspace notifications
//!
//! ## Keyspace Model
//! ```text
//! key ──► String(bytes)
//!     ├─► List(bytes, bytes, ...)      head ... tail
//!     └─► Hash{field: bytes, ...}
//! ```
//! Lists and hashes that become empty are removed, so `Exists` means
//! "holds data".

mod command;
mod memory;
mod pattern;
mod pubsub;
mod reply;

pub use command::{Command, CommandType};
pub use memory::MemoryBackend;
pub use pattern::{escape, glob_match};
pub use pubsub::{EventClass, Message, NotifyFlags, Subscription};
pub use reply::Reply;

use crate::error::Result;

/// One page of a cursor scan. A returned cursor of 0 means the scan is complete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub cursor: u64,
    pub items: Vec<Vec<u8>>,
}

/// A key-value store the ingestion core can drive
pub trait Backend: Send + Sync {
    /// Run one command
    fn execute(&self, command: Command) -> Result<Reply>;

    /// Run many commands in one round trip, replies in command order.
    ///
    /// Each command is atomic on its own; other clients may interleave
    /// between them. On error, commands before the failing one stay applied.
    fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;

    /// Run a script atomically
    fn eval(&self, script: &dyn Script, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply>;

    /// One page of keys matching `pattern`
    fn scan(&self, cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage>;

    /// Subscribe to notification channels matching `pattern`
    fn psubscribe(&self, pattern: &[u8]) -> Result<Subscription>;
}

/// Logic executed inside the backend as one indivisible step
pub trait Script: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Execute against the keyspace through `ctx`
    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply>;
}

/// What a running script can do
pub trait ScriptContext {
    /// Run a command inside the script
    fn call(&mut self, command: Command) -> Result<Reply>;

    /// One page of fields of a hash whose names match `pattern`.
    /// Items alternate field name and value.
    fn hscan(&mut self, key: &[u8], cursor: u64, pattern: &[u8], count: usize) -> Result<ScanPage>;
}

/// Collect every key matching `pattern`, following the cursor until the
/// backend reports completion.
///
/// Not a snapshot: keys created or removed while scanning may or may not
/// show up.
pub fn scan_all(backend: &dyn Backend, pattern: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    let mut cursor = 0u64;
    loop {
        let page = backend.scan(cursor, pattern, count)?;
        keys.extend(page.items);
        cursor = page.cursor;
        if cursor == 0 {
            break;
        }
    }
    Ok(keys)
}
