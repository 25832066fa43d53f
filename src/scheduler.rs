use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Drives the render cadence: self-throttled to a target interval and
/// guarded against overlapping cycles. A tick that arrives while the
/// previous cycle is still running is dropped, never queued.
pub struct FrameScheduler {
    interval: Duration,
    last_tick: Option<Instant>,
    in_flight: bool,
    window: VecDeque<Instant>,
}

impl FrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
            in_flight: false,
            window: VecDeque::new(),
        }
    }

    /// Claim the next cycle. Returns false when the target interval has
    /// not elapsed yet or a cycle is already in flight.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        if let Some(last) = self.last_tick {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_tick = Some(now);
        self.in_flight = true;
        true
    }

    /// Mark the claimed cycle complete and record it in the throughput
    /// window.
    pub fn finish(&mut self, now: Instant) {
        self.in_flight = false;
        self.window.push_back(now);
        self.prune(now);
    }

    /// Abandon a claimed cycle without counting it (e.g. capture failed).
    pub fn abort(&mut self) {
        self.in_flight = false;
    }

    /// Cycles completed in the sliding 1-second window ending at `now`.
    pub fn throughput(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.window.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) > Duration::from_secs(1) {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_always_due() {
        let mut sched = FrameScheduler::new(Duration::from_millis(33));
        assert!(sched.try_begin(Instant::now()));
    }

    #[test]
    fn ticks_inside_the_interval_are_skipped() {
        let mut sched = FrameScheduler::new(Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(sched.try_begin(t0));
        sched.finish(t0 + Duration::from_millis(5));

        assert!(!sched.try_begin(t0 + Duration::from_millis(10)));
        assert!(sched.try_begin(t0 + Duration::from_millis(33)));
    }

    #[test]
    fn in_flight_cycle_blocks_new_ticks() {
        let mut sched = FrameScheduler::new(Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(sched.try_begin(t0));
        // Well past the interval, but the previous cycle never finished.
        assert!(!sched.try_begin(t0 + Duration::from_secs(1)));

        sched.finish(t0 + Duration::from_secs(1));
        assert!(sched.try_begin(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn aborted_cycle_releases_the_guard_without_counting() {
        let mut sched = FrameScheduler::new(Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(sched.try_begin(t0));
        sched.abort();
        assert_eq!(sched.throughput(t0 + Duration::from_millis(100)), 0);
        assert!(sched.try_begin(t0 + Duration::from_millis(40)));
    }

    #[test]
    fn throughput_window_slides_over_one_second() {
        let mut sched = FrameScheduler::new(Duration::from_millis(33));
        let t0 = Instant::now();
        for i in 0..10 {
            let t = t0 + Duration::from_millis(33 * i);
            assert!(sched.try_begin(t));
            sched.finish(t);
        }
        assert_eq!(sched.throughput(t0 + Duration::from_millis(33 * 9)), 10);
        // Two seconds later everything has aged out.
        assert_eq!(sched.throughput(t0 + Duration::from_secs(3)), 0);
    }
}
