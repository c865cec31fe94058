//! Shared pause/resume state for the bot's own playback.
//!
//! The level-triggered path, the remote pause command and the playback loop
//! all go through `PauseGate`; nothing else reads or writes the window.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for the gate. Tests substitute a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Snapshot of the pause state.
///
/// `active` is only meaningful together with `resumes_at`: a window whose
/// `resumes_at` has passed is inactive even if the flag has not been
/// cleared yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseWindow {
    pub active: bool,
    pub resumes_at: Instant,
}

pub struct PauseGate {
    clock: Arc<dyn Clock>,
    window: Mutex<PauseWindow>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            window: Mutex::new(PauseWindow {
                active: false,
                resumes_at: now,
            }),
        }
    }

    /// Pauses playback until at least `now + duration`.
    ///
    /// An in-progress pause is extended, never shortened. Zero durations are
    /// ignored.
    pub fn pause_for(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let Some(until) = self.clock.now().checked_add(duration) else {
            log::warn!("Ignoring pause of {:?}: past the clock's range", duration);
            return;
        };
        let mut window = self.window.lock();
        // A cleared or expired window has resumes_at <= now < until.
        window.resumes_at = window.resumes_at.max(until);
        window.active = true;
    }

    /// Whether a pause is in effect. Expired windows are cleared here.
    pub fn is_active(&self) -> bool {
        let now = self.clock.now();
        let mut window = self.window.lock();
        Self::expire(&mut window, now);
        window.active
    }

    /// Time left until playback may resume; zero when not paused.
    pub fn remaining(&self) -> Duration {
        let now = self.clock.now();
        let mut window = self.window.lock();
        Self::expire(&mut window, now);
        if window.active {
            window.resumes_at - now
        } else {
            Duration::ZERO
        }
    }

    /// End of the current pause, if one is in effect.
    pub fn resumes_at(&self) -> Option<Instant> {
        let now = self.clock.now();
        let mut window = self.window.lock();
        Self::expire(&mut window, now);
        window.active.then_some(window.resumes_at)
    }

    /// Resumes immediately.
    pub fn clear(&self) {
        let now = self.clock.now();
        let mut window = self.window.lock();
        window.active = false;
        window.resumes_at = window.resumes_at.min(now);
    }

    fn expire(window: &mut PauseWindow, now: Instant) {
        if window.active && now >= window.resumes_at {
            window.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Clock that only moves when told to.
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }
    }

    fn gate() -> (Arc<ManualClock>, PauseGate) {
        let clock = ManualClock::new();
        let gate = PauseGate::with_clock(clock.clone());
        (clock, gate)
    }

    #[test]
    fn idle_gate_is_inactive() {
        let (_, gate) = gate();
        assert!(!gate.is_active());
        assert_eq!(gate.remaining(), Duration::ZERO);
        assert_eq!(gate.resumes_at(), None);
    }

    #[test]
    fn active_strictly_before_resume_time() {
        let (clock, gate) = gate();
        gate.pause_for(Duration::from_millis(800));

        clock.advance(Duration::from_millis(799));
        assert!(gate.is_active());
        assert_eq!(gate.remaining(), Duration::from_millis(1));

        clock.advance(Duration::from_millis(1));
        assert!(!gate.is_active());

        // No flicker once expired.
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            assert!(!gate.is_active());
        }
    }

    #[test]
    fn shorter_pause_does_not_shorten() {
        let (clock, gate) = gate();
        gate.pause_for(Duration::from_millis(1500));
        let first = gate.resumes_at().unwrap();

        gate.pause_for(Duration::from_millis(800));
        assert_eq!(gate.resumes_at(), Some(first));

        clock.advance(Duration::from_millis(1000));
        assert!(gate.is_active());
    }

    #[test]
    fn longer_pause_extends() {
        let (clock, gate) = gate();
        gate.pause_for(Duration::from_millis(800));
        clock.advance(Duration::from_millis(500));
        gate.pause_for(Duration::from_millis(800));

        clock.advance(Duration::from_millis(500));
        assert!(gate.is_active());
        assert_eq!(gate.remaining(), Duration::from_millis(300));
    }

    #[test]
    fn pause_after_expiry_starts_fresh_window() {
        let (clock, gate) = gate();
        gate.pause_for(Duration::from_millis(100));
        clock.advance(Duration::from_millis(200));
        assert!(!gate.is_active());

        gate.pause_for(Duration::from_millis(100));
        assert_eq!(gate.remaining(), Duration::from_millis(100));
    }

    #[test]
    fn zero_duration_is_ignored() {
        let (_, gate) = gate();
        gate.pause_for(Duration::ZERO);
        assert!(!gate.is_active());
    }

    #[test]
    fn unrepresentable_duration_is_ignored() {
        let (_, gate) = gate();
        gate.pause_for(Duration::MAX);
        assert!(!gate.is_active());

        gate.pause_for(Duration::from_millis(500));
        gate.pause_for(Duration::MAX);
        assert_eq!(gate.remaining(), Duration::from_millis(500));
    }

    #[test]
    fn clear_resumes_immediately() {
        let (clock, gate) = gate();
        gate.pause_for(Duration::from_secs(10));
        gate.clear();
        assert!(!gate.is_active());

        // A later pause is not lengthened by the cleared window.
        clock.advance(Duration::from_millis(10));
        gate.pause_for(Duration::from_millis(50));
        assert_eq!(gate.remaining(), Duration::from_millis(50));
    }

    #[test]
    fn concurrent_pauses_keep_the_longest() {
        let gate = Arc::new(PauseGate::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.pause_for(Duration::from_secs(i * 10)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(gate.remaining() > Duration::from_secs(70));
    }
}
