use std::time::{Duration, Instant};

/// Polled timer gating expensive operations to a fixed cadence.
///
/// Fires at most once per period. Unless configured to fire immediately,
/// it stays false until a full period has elapsed from the first poll.
/// The current instant is passed in by the caller so tests control time.
#[derive(Debug)]
pub struct PeriodicTrigger {
    period: Duration,
    fire_immediately: bool,
    last_fired: Option<Instant>,
    armed_at: Option<Instant>,
}

impl PeriodicTrigger {
    pub fn new(period: Duration, fire_immediately: bool) -> Self {
        Self {
            period,
            fire_immediately,
            last_fired: None,
            armed_at: None,
        }
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Forget all timing state. Guarantees timer-gated updates cannot fire
    /// out of phase after a seek.
    pub fn reset(&mut self) {
        self.last_fired = None;
        self.armed_at = None;
    }

    /// Returns true when a full period has elapsed since the last firing.
    pub fn check_trigger(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) => {
                if now.duration_since(last) >= self.period {
                    self.last_fired = Some(now);
                    true
                } else {
                    false
                }
            }
            None => {
                if self.fire_immediately {
                    self.last_fired = Some(now);
                    return true;
                }
                let armed = *self.armed_at.get_or_insert(now);
                if now.duration_since(armed) >= self.period {
                    self.last_fired = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period() {
        let mut trigger = PeriodicTrigger::new(Duration::from_millis(100), false);
        let t0 = Instant::now();

        assert!(!trigger.check_trigger(t0));
        assert!(!trigger.check_trigger(t0 + Duration::from_millis(50)));
        assert!(trigger.check_trigger(t0 + Duration::from_millis(100)));
        // Same window: must not fire twice.
        assert!(!trigger.check_trigger(t0 + Duration::from_millis(150)));
        assert!(trigger.check_trigger(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn immediate_mode_fires_on_first_poll_only() {
        let mut trigger = PeriodicTrigger::new(Duration::from_millis(100), true);
        let t0 = Instant::now();

        assert!(trigger.check_trigger(t0));
        assert!(!trigger.check_trigger(t0 + Duration::from_millis(10)));
        assert!(trigger.check_trigger(t0 + Duration::from_millis(110)));
    }

    #[test]
    fn reset_rearms_from_scratch() {
        let mut trigger = PeriodicTrigger::new(Duration::from_millis(100), false);
        let t0 = Instant::now();

        assert!(!trigger.check_trigger(t0));
        assert!(trigger.check_trigger(t0 + Duration::from_millis(100)));
        trigger.reset();

        // After reset the first poll re-arms; a full period must elapse again.
        let t1 = t0 + Duration::from_millis(500);
        assert!(!trigger.check_trigger(t1));
        assert!(!trigger.check_trigger(t1 + Duration::from_millis(99)));
        assert!(trigger.check_trigger(t1 + Duration::from_millis(100)));
    }
}
