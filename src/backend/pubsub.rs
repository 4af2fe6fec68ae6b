//! Keyspace notifications
//!
//! Subscribers register a glob over notification channels and receive
//! messages on a crossbeam channel. Delivery is best effort: a dropped
//! subscription simply stops receiving, and nothing is replayed to a
//! new subscription.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{Result, SackError};

use super::pattern::glob_match;

/// One notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Pattern the subscriber registered
    pub pattern: Vec<u8>,

    /// Channel the event was published on, e.g. `__keyspace@0__:incoming128-17`
    pub channel: Vec<u8>,

    /// Event name, e.g. `set`
    pub payload: Vec<u8>,
}

/// Receiving end of a pattern subscription
pub struct Subscription {
    pattern: Vec<u8>,
    receiver: Receiver<Message>,
}

impl Subscription {
    /// Pattern this subscription listens on
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Block until the next message
    pub fn recv(&self) -> Result<Message> {
        self.receiver.recv().map_err(|_| SackError::SubscriptionClosed)
    }

    /// Block for at most `timeout`; `Ok(None)` when nothing arrived
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SackError::SubscriptionClosed),
        }
    }

    /// Non-blocking poll
    pub fn try_recv(&self) -> Result<Option<Message>> {
        match self.receiver.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SackError::SubscriptionClosed),
        }
    }
}

/// Publishing side kept by the backend
pub(crate) struct Subscriber {
    pattern: Vec<u8>,
    sender: Sender<Message>,
}

impl Subscriber {
    /// Create a connected subscriber / subscription pair
    pub(crate) fn pair(pattern: &[u8]) -> (Subscriber, Subscription) {
        let (sender, receiver) = channel::unbounded();
        (
            Subscriber {
                pattern: pattern.to_vec(),
                sender,
            },
            Subscription {
                pattern: pattern.to_vec(),
                receiver,
            },
        )
    }

    /// Deliver if the channel matches. Returns false once the subscription is gone
    pub(crate) fn deliver(&self, channel: &[u8], payload: &[u8]) -> bool {
        if !glob_match(&self.pattern, channel) {
            return true;
        }
        self.sender
            .send(Message {
                pattern: self.pattern.clone(),
                channel: channel.to_vec(),
                payload: payload.to_vec(),
            })
            .is_ok()
    }
}

/// Event classes, mirroring the `notify-keyspace-events` flag letters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// `g`: DEL and keys removed because they became empty
    Generic,
    /// `$`: string commands
    String,
    /// `l`: list commands
    List,
    /// `h`: hash commands
    Hash,
}

/// Which notifications the backend emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    pub keyspace: bool,
    pub keyevent: bool,
    pub generic: bool,
    pub string: bool,
    pub list: bool,
    pub hash: bool,
}

impl NotifyFlags {
    /// Parse a flag string such as `K$` or `KEA`
    pub fn parse(flags: &str) -> Result<Self> {
        let mut out = NotifyFlags::default();
        for c in flags.chars() {
            match c {
                'K' => out.keyspace = true,
                'E' => out.keyevent = true,
                'g' => out.generic = true,
                '$' => out.string = true,
                'l' => out.list = true,
                'h' => out.hash = true,
                'A' => {
                    out.generic = true;
                    out.string = true;
                    out.list = true;
                    out.hash = true;
                }
                other => {
                    return Err(SackError::Backend(format!(
                        "unsupported notify-keyspace-events flag '{}'",
                        other
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Whether events of `class` should be published at all
    pub fn enabled(&self, class: EventClass) -> bool {
        if !self.keyspace && !self.keyevent {
            return false;
        }
        match class {
            EventClass::Generic => self.generic,
            EventClass::String => self.string,
            EventClass::List => self.list,
            EventClass::Hash => self.hash,
        }
    }
}
