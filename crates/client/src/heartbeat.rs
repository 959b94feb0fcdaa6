// Protocol-level heartbeat.
//
// Sans-io: the embedder calls `tick` with the current time and acts on the
// returned action. Any inbound message counts as a pong, as it proves the
// link is alive; `note_message` records that and the next tick refreshes
// the idle clock.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// What the connection should do in response to a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// The link has been idle for a full interval; probe it.
    SendPing,
    /// A probe went unanswered past the timeout; the stream is dead.
    TimedOut,
}

pub struct Heartbeat {
    interval: chrono::Duration,
    timeout: chrono::Duration,
    last_message_at: Option<DateTime<Utc>>,
    ping_sent_at: Option<DateTime<Utc>>,
    saw_message: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: chrono::Duration::from_std(interval).unwrap_or_default(),
            timeout: chrono::Duration::from_std(timeout).unwrap_or_default(),
            last_message_at: None,
            ping_sent_at: None,
            saw_message: false,
        }
    }

    /// Record that any message arrived. Timestamped at the next tick.
    pub fn note_message(&mut self) {
        self.saw_message = true;
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<HeartbeatAction> {
        if self.saw_message {
            self.saw_message = false;
            self.last_message_at = Some(now);
            self.ping_sent_at = None;
        }

        if let Some(sent_at) = self.ping_sent_at {
            if now - sent_at >= self.timeout {
                return Some(HeartbeatAction::TimedOut);
            }
            return None;
        }

        let last = match self.last_message_at {
            Some(at) => at,
            None => {
                // First tick after connecting starts the idle clock.
                self.last_message_at = Some(now);
                return None;
            }
        };

        if now - last >= self.interval {
            self.ping_sent_at = Some(now);
            return Some(HeartbeatAction::SendPing);
        }
        None
    }
}
