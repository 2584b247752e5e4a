use std::fmt;
use std::time;

use chrono::{DateTime, Duration, Utc};
use futures::future;
use tokio::time::{interval, Interval};

use super::HoldEvent;
use crate::utils::{format_elapsed_time, get_elapsed_time};

/// Hold-time bookkeeping for one FSM cycle.
///
/// Keepalives go out once less than two keepalive intervals of hold time
/// remain; expiry fires when the peer has been silent for the whole
/// negotiated hold time. A hold time of zero disables both, per RFC 4271.
#[derive(Debug)]
pub struct HoldTimer {
    pub(crate) hold_time: u16,
    pub(crate) interval: u16,
    timer: Interval,
    pub(crate) last_sent: DateTime<Utc>,
    pub(crate) last_received: DateTime<Utc>,
}

impl HoldTimer {
    pub fn new(hold_time: u16) -> HoldTimer {
        HoldTimer {
            hold_time,
            interval: hold_time / 3,
            timer: interval(time::Duration::from_millis(100)),
            last_received: Utc::now(),
            last_sent: Utc::now(),
        }
    }

    /// Wait for the next timer tick and report what is due
    pub async fn poll(&mut self) -> HoldEvent {
        if self.hold_time == 0 {
            // Timers disabled; never resolves
            future::pending::<()>().await;
        }
        self.timer.tick().await;
        if get_elapsed_time(self.last_received) >= Duration::seconds(self.hold_time.into()) {
            return HoldEvent::Expired;
        }
        if self.remaining().num_seconds() < (2 * i64::from(self.interval)) {
            HoldEvent::SendKeepalive
        } else {
            HoldEvent::Wait
        }
    }

    /// Bump the last received to now
    pub fn received(&mut self) {
        self.last_received = Utc::now();
    }

    /// Bump the last sent to now
    pub fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    // Hold time left before the remote side would consider us quiet,
    // counting down from the negotiated value and floored at zero
    fn remaining(&self) -> Duration {
        let hold_time = Duration::seconds(self.hold_time.into());
        if get_elapsed_time(self.last_sent) > hold_time {
            Duration::seconds(0)
        } else {
            hold_time - get_elapsed_time(self.last_sent)
        }
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format_elapsed_time(self.remaining()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keepalive_pacing() {
        let mut ht = HoldTimer::new(30);
        assert_eq!(ht.interval, 10);
        // Keepalive should not be due yet
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        ht.timer = interval(time::Duration::from_millis(1));
        assert_eq!(ht.poll().await, HoldEvent::Wait);
        // After waiting 1/3 of the hold time, a keepalive is due
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        ht.timer = interval(time::Duration::from_millis(1));
        assert_eq!(ht.poll().await, HoldEvent::SendKeepalive);

        ht.sent();
        ht.timer = interval(time::Duration::from_millis(1));
        assert_eq!(ht.poll().await, HoldEvent::Wait);

        // And once the hold time has passed in silence, the session expires
        ht.last_received = ht.last_received - Duration::seconds(30);
        ht.timer = interval(time::Duration::from_millis(1));
        assert_eq!(ht.poll().await, HoldEvent::Expired);
    }

    #[tokio::test]
    async fn test_zero_hold_time_never_fires() {
        use tokio::time::timeout;
        let mut ht = HoldTimer::new(0);
        let result = timeout(time::Duration::from_millis(50), ht.poll()).await;
        assert!(result.is_err()); // timed out, as intended
    }
}
