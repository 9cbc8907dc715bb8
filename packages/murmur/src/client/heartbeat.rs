//! Ping bookkeeping: tokens go out in order, echoes come back in order.

use std::collections::VecDeque;
use std::time::Duration;

use murmur_proto::message::Ping;
use tokio::time::Instant;

/// Most pings allowed in flight before the oldest is forgotten.
pub const MAX_OUTSTANDING: usize = 16;

#[derive(Debug)]
pub struct Heartbeat {
    outstanding: VecDeque<(u64, Instant)>,
    next_token: u64,
    capacity: usize,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::with_capacity(MAX_OUTSTANDING)
    }
}

impl Heartbeat {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            outstanding: VecDeque::new(),
            next_token: 1,
            capacity: capacity.max(1),
        }
    }

    /// Record a new ping sent at `now`.
    pub fn issue(&mut self, now: Instant) -> Ping {
        if self.outstanding.len() >= self.capacity {
            self.outstanding.pop_front();
        }
        let token = self.next_token;
        self.next_token += 1;
        self.outstanding.push_back((token, now));
        Ping { token }
    }

    /// Pair an echo with the oldest outstanding ping. Tokens older than the
    /// echo were lost and are discarded; an echo for a token already
    /// forgotten yields nothing.
    pub fn answer(&mut self, echo: &Ping, now: Instant) -> Option<Duration> {
        while let Some(&(token, sent)) = self.outstanding.front() {
            if token > echo.token {
                return None;
            }
            self.outstanding.pop_front();
            if token == echo.token {
                return Some(now.saturating_duration_since(sent));
            }
        }
        None
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Forget everything in flight; used when the connection drops.
    pub fn reset(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_in_order() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::default();
        let a = hb.issue(t0);
        let b = hb.issue(t0 + Duration::from_millis(10));

        assert_eq!(
            hb.answer(&a, t0 + Duration::from_millis(30)),
            Some(Duration::from_millis(30))
        );
        assert_eq!(
            hb.answer(&b, t0 + Duration::from_millis(35)),
            Some(Duration::from_millis(25))
        );
        assert_eq!(hb.outstanding(), 0);
    }

    #[test]
    fn lost_echo_is_skipped() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::default();
        let _lost = hb.issue(t0);
        let b = hb.issue(t0 + Duration::from_millis(5));
        assert_eq!(
            hb.answer(&b, t0 + Duration::from_millis(15)),
            Some(Duration::from_millis(10))
        );
        assert_eq!(hb.outstanding(), 0);
    }

    #[test]
    fn bounded_drops_oldest() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::with_capacity(2);
        let first = hb.issue(t0);
        let second = hb.issue(t0);
        let _third = hb.issue(t0);
        assert_eq!(hb.outstanding(), 2);
        assert_eq!(hb.answer(&first, t0), None);
        assert_eq!(hb.outstanding(), 2);
        assert!(hb.answer(&second, t0).is_some());
    }

    #[test]
    fn reset_forgets_in_flight() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::default();
        let a = hb.issue(t0);
        hb.reset();
        assert_eq!(hb.answer(&a, t0), None);
    }
}
