use tokio::time::{Duration, Instant};

/// Result of a heartbeat poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCheck {
    /// Nothing to do yet
    Idle,
    /// The interval elapsed and the last beat was acknowledged
    Due,
    /// The interval elapsed without an ack for the last beat
    TimedOut,
}

/// Tracks heartbeat liveness for a single connection.
///
/// Time is passed in by the caller so checks are deterministic.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    /// Interval from Hello
    interval: Option<Duration>,

    /// Time of the last heartbeat sent
    last_sent: Option<Instant>,

    /// Whether the last client heartbeat is still waiting for its ack
    ack_pending: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new connection's cadence with the interval from Hello
    pub fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.last_sent = None;
        self.ack_pending = false;
    }

    /// Record a heartbeat we initiated; an ack is expected before the next one
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.ack_pending = true;
    }

    /// Record a heartbeat sent in reply to a server request
    pub fn record_reply_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Record an ack and return the measured latency
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.ack_pending = false;
        let latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        if latency.is_some() {
            self.latency = latency;
        }
        latency
    }

    /// Decide what the poll tick should do
    pub fn check(&self, now: Instant) -> HeartbeatCheck {
        let (Some(interval), Some(last_sent)) = (self.interval, self.last_sent) else {
            return HeartbeatCheck::Idle;
        };

        if now.saturating_duration_since(last_sent) < interval {
            return HeartbeatCheck::Idle;
        }

        if self.ack_pending {
            HeartbeatCheck::TimedOut
        } else {
            HeartbeatCheck::Due
        }
    }

    /// Forget the interval and pending state (connection ended)
    pub fn reset(&mut self) {
        self.interval = None;
        self.last_sent = None;
        self.ack_pending = false;
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn test_idle_before_hello() {
        let monitor = HeartbeatMonitor::new();
        assert_eq!(monitor.check(Instant::now()), HeartbeatCheck::Idle);
    }

    #[test]
    fn test_idle_until_first_beat() {
        let mut monitor = HeartbeatMonitor::new();
        let now = Instant::now();
        monitor.start(INTERVAL);
        assert_eq!(monitor.check(now + INTERVAL * 5), HeartbeatCheck::Idle);
    }

    #[test]
    fn test_beat_cycle() {
        let mut monitor = HeartbeatMonitor::new();
        let t0 = Instant::now();
        monitor.start(INTERVAL);
        monitor.record_sent(t0);

        assert_eq!(monitor.check(t0 + Duration::from_millis(50)), HeartbeatCheck::Idle);

        let latency = monitor.record_ack(t0 + Duration::from_millis(30));
        assert_eq!(latency, Some(Duration::from_millis(30)));
        assert!(!monitor.is_ack_pending());
        assert_eq!(monitor.check(t0 + INTERVAL), HeartbeatCheck::Due);
    }

    #[test]
    fn test_missing_ack_times_out() {
        let mut monitor = HeartbeatMonitor::new();
        let t0 = Instant::now();
        monitor.start(INTERVAL);
        monitor.record_sent(t0);

        assert_eq!(monitor.check(t0 + INTERVAL), HeartbeatCheck::TimedOut);
    }

    #[test]
    fn test_reply_does_not_expect_ack() {
        let mut monitor = HeartbeatMonitor::new();
        let t0 = Instant::now();
        monitor.start(INTERVAL);
        monitor.record_sent(t0);
        monitor.record_ack(t0 + Duration::from_millis(10));
        monitor.record_reply_sent(t0 + Duration::from_millis(20));

        assert!(!monitor.is_ack_pending());
        assert_eq!(monitor.check(t0 + Duration::from_millis(60)), HeartbeatCheck::Idle);
        assert_eq!(monitor.check(t0 + Duration::from_millis(120)), HeartbeatCheck::Due);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut monitor = HeartbeatMonitor::new();
        let t0 = Instant::now();
        monitor.start(INTERVAL);
        monitor.record_sent(t0);
        monitor.reset();

        assert_eq!(monitor.interval(), None);
        assert_eq!(monitor.check(t0 + INTERVAL * 2), HeartbeatCheck::Idle);
    }
}
