// crates/klip-core/src/clock.rs
//
// Clock: a monotonic, seekable, loop-capable master time source. Read and
// written only from the orchestration thread — no internal locking.

use std::time::Instant;

/// Injected wall-clock source so `Clock::tick` is testable without sleeping
/// real time. The default impl wraps `std::time::Instant`; tests supply a
/// fake that advances on command.
pub trait MonotonicClock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Signal raised by `tick()` when a loop boundary was just crossed. The
/// render loop consumes this to reset every Playing worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Looped;

#[derive(Debug)]
pub struct Clock {
    position_s: f64,
    is_playing: bool,
    loop_enabled: bool,
    duration_s: f64,
    wall_start: Instant,
    wall_position: f64,
}

impl Clock {
    pub fn new(clock: &dyn MonotonicClock) -> Self {
        Clock {
            position_s: 0.0,
            is_playing: false,
            loop_enabled: false,
            duration_s: 0.0,
            wall_start: clock.now(),
            wall_position: 0.0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn position(&self) -> f64 {
        self.position_s
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    pub fn set_duration(&mut self, duration_s: f64) {
        self.duration_s = duration_s;
    }

    pub fn play(&mut self, clock: &dyn MonotonicClock, start: Option<f64>) {
        let start = start.unwrap_or(self.position_s);
        self.wall_position = start;
        self.wall_start = clock.now();
        self.position_s = start;
        self.is_playing = true;
    }

    pub fn pause(&mut self, clock: &dyn MonotonicClock) {
        self.position_s = self.sample(clock);
        self.is_playing = false;
    }

    pub fn stop(&mut self) {
        self.position_s = 0.0;
        self.wall_position = 0.0;
        self.is_playing = false;
    }

    pub fn seek(&mut self, clock: &dyn MonotonicClock, t: f64) {
        self.position_s = t;
        self.wall_position = t;
        self.wall_start = clock.now();
    }

    fn sample(&self, clock: &dyn MonotonicClock) -> f64 {
        if self.is_playing {
            self.wall_position + clock.now().duration_since(self.wall_start).as_secs_f64()
        } else {
            self.position_s
        }
    }

    /// Advance and return the current position. Side-effect-free except
    /// for the loop reset: when looping is enabled, a known duration is
    /// set, and the sampled time has reached it, position wraps to 0 and
    /// `Some(Looped)` is returned.
    pub fn tick(&mut self, clock: &dyn MonotonicClock) -> (f64, Option<Looped>) {
        let now = self.sample(clock);
        if self.loop_enabled && self.duration_s > 0.0 && now >= self.duration_s {
            self.wall_position = 0.0;
            self.wall_start = clock.now();
            self.position_s = 0.0;
            return (0.0, Some(Looped));
        }
        self.position_s = now;
        (now, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    /// Advances only when told to, so loop-boundary and monotonicity
    /// assertions don't race real wall-clock sleeps.
    struct FakeClock {
        base: Instant,
        offset: Cell<Duration>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock {
                base: Instant::now(),
                offset: Cell::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl MonotonicClock for FakeClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }
    }

    #[test]
    fn tick_is_monotonic_non_decreasing_while_playing() {
        let fake = FakeClock::new();
        let mut clock = Clock::new(&fake);
        clock.set_duration(100.0);
        clock.play(&fake, Some(0.0));

        let mut last = 0.0;
        for _ in 0..5 {
            fake.advance(Duration::from_millis(16));
            let (t, looped) = clock.tick(&fake);
            assert!(looped.is_none());
            assert!(t >= last, "tick went backwards: {t} < {last}");
            last = t;
        }
    }

    #[test]
    fn tick_past_duration_wraps_and_reports_looped() {
        let fake = FakeClock::new();
        let mut clock = Clock::new(&fake);
        clock.set_duration(3.0);
        clock.set_loop(true);
        clock.play(&fake, Some(0.0));

        fake.advance(Duration::from_millis(3010));
        let (t, looped) = clock.tick(&fake);
        assert_eq!(looped, Some(Looped));
        assert_eq!(t, 0.0);

        fake.advance(Duration::from_millis(50));
        let (t2, looped2) = clock.tick(&fake);
        assert!(looped2.is_none());
        assert!(t2 < clock.duration_s);
    }

    #[test]
    fn tick_without_loop_enabled_does_not_wrap() {
        let fake = FakeClock::new();
        let mut clock = Clock::new(&fake);
        clock.set_duration(3.0);
        clock.play(&fake, Some(0.0));

        fake.advance(Duration::from_millis(5000));
        let (t, looped) = clock.tick(&fake);
        assert!(looped.is_none());
        assert!(t >= 5.0);
    }

    #[test]
    fn pause_then_sample_freezes_position() {
        let fake = FakeClock::new();
        let mut clock = Clock::new(&fake);
        clock.play(&fake, Some(1.0));
        fake.advance(Duration::from_millis(500));
        clock.pause(&fake);
        let frozen = clock.position();
        fake.advance(Duration::from_secs(1));
        assert_eq!(clock.position(), frozen);
        assert!(!clock.is_playing());
    }
}
