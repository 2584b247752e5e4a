use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageKind;

/// Per-message-type in/out counts for introspection
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DirectionCounts {
    pub open: u64,
    pub update: u64,
    pub keepalive: u64,
    pub notification: u64,
    pub refresh: u64,
}

impl DirectionCounts {
    fn increment(&mut self, kind: MessageKind) {
        match kind {
            MessageKind::Open => self.open += 1,
            MessageKind::Update => self.update += 1,
            MessageKind::Keepalive => self.keepalive += 1,
            MessageKind::Notification => self.notification += 1,
            MessageKind::RouteRefresh => self.refresh += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.open + self.update + self.keepalive + self.notification + self.refresh
    }
}

/// Session statistics owned by the supervisor; no locking needed since
/// the event loop is single-threaded.
#[derive(Debug, Default)]
pub struct MessageCounters {
    pub received: DirectionCounts,
    pub sent: DirectionCounts,
    pub flops: u32,
    pub established_transitions: u32,
    pub uptime: Option<DateTime<Utc>>,
    pub downtime: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_received(&mut self, kind: MessageKind) {
        self.received.increment(kind);
    }

    pub fn count_sent(&mut self, kind: MessageKind) {
        self.sent.increment(kind);
    }

    /// Zero everything except the session clocks
    pub fn reset(&mut self) {
        self.received = DirectionCounts::default();
        self.sent = DirectionCounts::default();
        self.flops = 0;
        self.established_transitions = 0;
        self.last_update = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_and_reset() {
        let mut counters = MessageCounters::new();
        counters.count_received(MessageKind::Open);
        counters.count_received(MessageKind::Update);
        counters.count_received(MessageKind::Update);
        counters.count_sent(MessageKind::Keepalive);
        assert_eq!(counters.received.total(), 3);
        assert_eq!(counters.received.update, 2);
        assert_eq!(counters.sent.keepalive, 1);

        counters.flops = 2;
        counters.uptime = Some(Utc::now());
        counters.reset();
        assert_eq!(counters.received.total(), 0);
        assert_eq!(counters.flops, 0);
        // Clocks survive a counter reset
        assert!(counters.uptime.is_some());
    }
}
