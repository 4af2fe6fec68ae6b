//! Sack-ready notifications
//!
//! Workers block on keyspace notifications for sack markers instead of
//! polling. A marker is created by the first append after a drain, and
//! deleted by `finish_sack_processing`, which re-arms it.
//!
//! Wake-ups are at-least-once and may coalesce: a worker must look at
//! the sack itself rather than trust that a wake-up means work.

use std::time::{Duration, Instant};

use crate::backend::{escape, Command, Message, Subscription};
use crate::error::{Result, SackError};

use super::{IncomingBuffer, Sack};

/// Notification classes the stream needs: keyspace channel, string commands
const NOTIFY_FLAGS: &str = "K$";

/// Endless stream of sacks that received data since their last drain.
///
/// Yields `Err(SubscriptionClosed)` once if the backend drops the
/// subscription, then ends; subscribe again to resume.
pub struct SackStream {
    subscription: Subscription,
    channel_prefix: Vec<u8>,
    sack_count: u32,
    closed: bool,
}

impl SackStream {
    /// Wait at most `timeout` for the next ready sack
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Sack>> {
        if self.closed {
            return Err(SackError::SubscriptionClosed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.subscription.recv_timeout(remaining) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            };
            if let Some(sack) = self.decode(&message) {
                return Ok(Some(sack));
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    /// Sack named by a notification channel, if it is one of ours
    fn decode(&self, message: &Message) -> Option<Sack> {
        if message.pattern != self.subscription.pattern() {
            return None;
        }
        let name = message
            .channel
            .strip_prefix(self.channel_prefix.as_slice())
            .and_then(|key| std::str::from_utf8(key).ok());
        match name.and_then(|n| Sack::parse_name(n, self.sack_count)) {
            Some(sack) => Some(sack),
            None => {
                tracing::warn!(
                    "Ignoring notification on unexpected channel {}",
                    String::from_utf8_lossy(&message.channel)
                );
                None
            }
        }
    }
}

impl Iterator for SackStream {
    type Item = Result<Sack>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.closed {
                return None;
            }
            match self.subscription.recv() {
                Ok(message) => {
                    if let Some(sack) = self.decode(&message) {
                        return Some(Ok(sack));
                    }
                }
                Err(e) => {
                    self.closed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl IncomingBuffer {
    /// Subscribe to sack marker creation.
    ///
    /// Every call opens a fresh subscription; nothing published before it
    /// is replayed.
    pub fn iter_sacks_to_process(&self) -> Result<SackStream> {
        self.backend
            .execute(Command::ConfigSet {
                parameter: "notify-keyspace-events".to_string(),
                value: NOTIFY_FLAGS.to_string(),
            })?
            .expect_ok()?;

        let channel_prefix = self.config.keyspace_prefix().into_bytes();
        let mut pattern = escape(&channel_prefix);
        pattern.extend_from_slice(&escape(
            format!("{}{}-", super::SACK_PREFIX, self.router.sack_count()).as_bytes(),
        ));
        pattern.push(b'*');

        let subscription = self.backend.psubscribe(&pattern)?;
        tracing::debug!(
            "Subscribed to sack notifications on {}",
            String::from_utf8_lossy(&pattern)
        );
        Ok(SackStream {
            subscription,
            channel_prefix,
            sack_count: self.router.sack_count(),
            closed: false,
        })
    }

    /// Delete the marker of `sack` so the next append notifies again
    pub fn finish_sack_processing(&self, sack: &Sack) -> Result<()> {
        self.check_sack(sack)?;
        self.backend.execute(Command::Del {
            keys: vec![sack.name().into_bytes()],
        })?;
        Ok(())
    }

    /// Whether any metric of `sack` has pending measures right now
    pub fn sack_has_pending(&self, sack: &Sack) -> Result<bool> {
        Ok(!self.list_metrics_in_sack(sack)?.is_empty())
    }
}
