use embassy_time::{Duration, Instant};

/// What the keep-alive timer asks the writer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// A PINGREQ went unanswered for a whole keep-alive interval.
    TimedOut,
}

/// Keep-alive bookkeeping for one connection.
///
/// A PINGREQ is due once half the interval has passed since the last write. After
/// that, any inbound packet counts as the answer.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    interval: Duration,
    last_sent: Instant,
    ping_sent: Option<Instant>,
}

impl KeepAlive {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Instant::from_ticks(0),
            ping_sent: None,
        }
    }

    /// Starts tracking a freshly established connection.
    pub fn reset(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        self.last_sent = now;
        self.ping_sent = None;
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent = Some(now);
    }

    pub fn on_receive(&mut self) {
        self.ping_sent = None;
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                if self.ping_sent.is_some() {
                    KeepAliveAction::TimedOut
                } else {
                    KeepAliveAction::SendPing
                }
            }
            _ => KeepAliveAction::Idle,
        }
    }

    /// When [`poll`](Self::poll) next has something to do. `None` when disabled.
    pub fn deadline(&self) -> Option<Instant> {
        if self.interval == Duration::from_ticks(0) {
            return None;
        }
        match self.ping_sent {
            Some(sent) => sent.checked_add(self.interval),
            None => self.last_sent.checked_add(self.interval / 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn ping_is_due_at_half_interval() {
        let mut keep_alive = KeepAlive::new(Duration::from_secs(0));
        keep_alive.reset(Duration::from_secs(60), at(100));
        assert_eq!(keep_alive.poll(at(129)), KeepAliveAction::Idle);
        assert_eq!(keep_alive.poll(at(130)), KeepAliveAction::SendPing);

        keep_alive.on_send(at(125));
        assert_eq!(keep_alive.poll(at(130)), KeepAliveAction::Idle);
        assert_eq!(keep_alive.deadline(), Some(at(155)));
    }

    #[test]
    fn unanswered_ping_times_out_after_full_interval() {
        let mut keep_alive = KeepAlive::new(Duration::from_secs(0));
        keep_alive.reset(Duration::from_secs(10), at(0));
        keep_alive.on_ping_sent(at(5));
        assert_eq!(keep_alive.poll(at(14)), KeepAliveAction::Idle);
        assert_eq!(keep_alive.poll(at(15)), KeepAliveAction::TimedOut);

        // The answer clears the pending ping; the next one is measured from the
        // last write.
        keep_alive.on_receive();
        assert_eq!(keep_alive.deadline(), Some(at(10)));
        assert_eq!(keep_alive.poll(at(9)), KeepAliveAction::Idle);
    }

    #[test]
    fn zero_interval_disables_pings() {
        let mut keep_alive = KeepAlive::new(Duration::from_secs(0));
        keep_alive.reset(Duration::from_secs(0), at(0));
        assert_eq!(keep_alive.deadline(), None);
        assert_eq!(keep_alive.poll(at(1_000_000)), KeepAliveAction::Idle);
    }
}
