//! Recovery Supervisor
//!
//! Periodic housekeeping that keeps a slave responsive when the line or the
//! receive path misbehaves. On every tick the [`Supervisor`] checks, in
//! order:
//!
//! 1. Has the error window expired? If so, the error count starts over.
//! 2. Have enough errors piled up within the window? Recover.
//! 3. Has the preventive interval passed since the last preventive
//!    recovery? Recover.
//! 4. Has the line been silent for too long? Recover.
//!
//! At most one recovery happens per tick. Every comparison is a strict
//! "greater than", on wrapping millisecond timestamps, so the policy keeps
//! working across a wrap of the tick counter.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use embassy_time::{Duration, Instant};

/// The window in which transport errors are counted
pub const ERROR_WINDOW: Duration = Duration::from_millis(5000);

/// The number of errors within [`ERROR_WINDOW`] that triggers a recovery
pub const ERROR_THRESHOLD: u8 = 3;

/// The interval between preventive recoveries
pub const FORCED_INTERVAL: Duration = Duration::from_millis(10_000);

/// The line silence that triggers a recovery
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_millis(2500);

/// How often the supervisor should be ticked
pub const TICK_PERIOD: Duration = Duration::from_millis(10);

/// A wrapping millisecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Millis(pub u32);

impl Millis {
    /// Milliseconds elapsed from `earlier` to `self`
    ///
    /// Correct across a single wrap of the counter.
    #[inline]
    pub const fn elapsed_since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

/// A monotonic millisecond tick source
pub trait Clock {
    /// The current time
    fn now(&self) -> Millis;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Millis {
        C::now(self)
    }
}

/// A [`Clock`] backed by the embassy time driver
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Millis {
        // Truncation is the wrap
        Millis(Instant::now().as_millis() as u32)
    }
}

/// Tunables of the recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct RecoveryConfig {
    /// See [`ERROR_WINDOW`]
    pub error_window: Duration,
    /// See [`ERROR_THRESHOLD`]
    pub error_threshold: u8,
    /// See [`FORCED_INTERVAL`]
    pub forced_interval: Duration,
    /// See [`INACTIVITY_TIMEOUT`]
    pub inactivity_timeout: Duration,
}

impl RecoveryConfig {
    /// The standard policy
    pub const DEFAULT: Self = Self {
        error_window: ERROR_WINDOW,
        error_threshold: ERROR_THRESHOLD,
        forced_interval: FORCED_INTERVAL,
        inactivity_timeout: INACTIVITY_TIMEOUT,
    };
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Why a recovery was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RecoveryReason {
    /// Too many errors within the error window
    ErrorBurst,
    /// The preventive interval elapsed
    Preventive,
    /// The line was silent for too long
    Inactivity,
}

/// The reset action performed on recovery
///
/// This must drive the context back to idle and get reception going again.
pub trait Recover {
    /// Perform the reset
    fn recover(&mut self);
}

impl<F: FnMut()> Recover for F {
    fn recover(&mut self) {
        self()
    }
}

/// Tracks activity and errors, and decides when to recover
///
/// All methods take `&self`: the receive path marks activity and errors while
/// the main loop calls [`Supervisor::update()`].
pub struct Supervisor<C: Clock> {
    clock: C,
    config: RecoveryConfig,
    last_activity: AtomicU32,
    last_forced: AtomicU32,
    window_start: AtomicU32,
    errors: AtomicU8,
    recoveries: AtomicU32,
}

impl<C: Clock> Supervisor<C> {
    /// Create a new supervisor with every timestamp at zero
    ///
    /// Intended for static usage. Call [`Supervisor::restart()`] once the
    /// clock is running if it does not start at zero.
    pub const fn new(clock: C, config: RecoveryConfig) -> Self {
        Self {
            clock,
            config,
            last_activity: AtomicU32::new(0),
            last_forced: AtomicU32::new(0),
            window_start: AtomicU32::new(0),
            errors: AtomicU8::new(0),
            recoveries: AtomicU32::new(0),
        }
    }

    /// Set every timestamp to now, and clear the error count
    pub fn restart(&self) {
        let now = self.clock.now().0;
        critical_section::with(|_| {
            self.last_activity.store(now, Ordering::Relaxed);
            self.last_forced.store(now, Ordering::Relaxed);
            self.window_start.store(now, Ordering::Relaxed);
            self.errors.store(0, Ordering::Relaxed);
        });
    }

    /// Record that bytes were received
    pub fn mark_activity(&self) {
        self.last_activity
            .store(self.clock.now().0, Ordering::Release);
    }

    /// Record a transport error
    ///
    /// Uses a [critical section][critical_section::with], as targets without
    /// CAS atomics have no `fetch_add`.
    pub fn mark_error(&self) {
        critical_section::with(|_| {
            let errors = self.errors.load(Ordering::Acquire);
            self.errors
                .store(errors.saturating_add(1), Ordering::Release);
        });
    }

    /// Run the policy once, recovering `target` if needed
    ///
    /// The decision is made inside a critical section, but `target` is
    /// recovered outside of it.
    pub fn update<R: Recover + ?Sized>(&self, target: &mut R) -> Option<RecoveryReason> {
        let now = self.clock.now();
        let cfg = &self.config;
        let since = |stamp: &AtomicU32| now.elapsed_since(Millis(stamp.load(Ordering::Acquire)));

        let reason = critical_section::with(|_| {
            if u64::from(since(&self.window_start)) > cfg.error_window.as_millis() {
                self.errors.store(0, Ordering::Release);
                self.window_start.store(now.0, Ordering::Release);
            }

            if self.errors.load(Ordering::Acquire) >= cfg.error_threshold {
                self.errors.store(0, Ordering::Release);
                self.window_start.store(now.0, Ordering::Release);
                Some(RecoveryReason::ErrorBurst)
            } else if u64::from(since(&self.last_forced)) > cfg.forced_interval.as_millis() {
                self.last_forced.store(now.0, Ordering::Release);
                Some(RecoveryReason::Preventive)
            } else if u64::from(since(&self.last_activity)) > cfg.inactivity_timeout.as_millis() {
                self.last_activity.store(now.0, Ordering::Release);
                Some(RecoveryReason::Inactivity)
            } else {
                None
            }
        })?;

        mb_warn!("recovering: {}", reason);
        let count = self.recoveries.load(Ordering::Relaxed);
        self.recoveries.store(count.wrapping_add(1), Ordering::Relaxed);
        target.recover();
        Some(reason)
    }

    /// The number of recoveries performed so far
    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// The number of errors counted in the current window
    pub fn error_count(&self) -> u8 {
        self.errors.load(Ordering::Relaxed)
    }

    /// The policy in use
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Manual(Cell<u32>);

    impl Manual {
        fn at(ms: u32) -> Self {
            Self(Cell::new(ms))
        }

        fn set(&self, ms: u32) {
            self.0.set(ms);
        }
    }

    impl Clock for Manual {
        fn now(&self) -> Millis {
            Millis(self.0.get())
        }
    }

    fn supervisor(clock: &Manual) -> Supervisor<&Manual> {
        let sup = Supervisor::new(clock, RecoveryConfig::DEFAULT);
        sup.restart();
        sup
    }

    #[test]
    fn elapsed_wraps() {
        assert_eq!(Millis(5).elapsed_since(Millis(u32::MAX - 4)), 10);
        assert_eq!(Millis(100).elapsed_since(Millis(40)), 60);
    }

    #[test]
    fn quiet_start_does_nothing() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        let mut hits = 0;
        for t in (0..=2500).step_by(10) {
            clock.set(t);
            assert_eq!(sup.update(&mut || hits += 1), None);
        }
        assert_eq!(hits, 0);
    }

    #[test]
    fn inactivity_fires_then_rearms() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        let mut hits = 0;

        clock.set(2510);
        assert_eq!(
            sup.update(&mut || hits += 1),
            Some(RecoveryReason::Inactivity)
        );
        clock.set(2520);
        assert_eq!(sup.update(&mut || hits += 1), None);

        clock.set(5010);
        assert_eq!(sup.update(&mut || hits += 1), None);
        clock.set(5020);
        assert_eq!(
            sup.update(&mut || hits += 1),
            Some(RecoveryReason::Inactivity)
        );
        assert_eq!(hits, 2);
        assert_eq!(sup.recoveries(), 2);
    }

    #[test]
    fn activity_holds_off_inactivity() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        for t in (0..9000).step_by(1000) {
            clock.set(t);
            sup.mark_activity();
            assert_eq!(sup.update(&mut || ()), None);
        }
    }

    #[test]
    fn error_burst() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        for t in [100, 200, 300] {
            clock.set(t);
            sup.mark_activity();
            sup.mark_error();
        }
        assert_eq!(sup.error_count(), 3);

        clock.set(400);
        assert_eq!(sup.update(&mut || ()), Some(RecoveryReason::ErrorBurst));
        assert_eq!(sup.error_count(), 0);
        assert_eq!(sup.update(&mut || ()), None);
    }

    #[test]
    fn errors_expire_with_the_window() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        clock.set(100);
        sup.mark_error();
        sup.mark_error();

        clock.set(5100);
        sup.mark_activity();
        assert_eq!(sup.update(&mut || ()), None);
        assert_eq!(sup.error_count(), 0);

        sup.mark_error();
        assert_eq!(sup.update(&mut || ()), None);
        assert_eq!(sup.error_count(), 1);
    }

    #[test]
    fn preventive_recovery_despite_traffic() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        for t in (1000..=10_000).step_by(1000) {
            clock.set(t);
            sup.mark_activity();
            assert_eq!(sup.update(&mut || ()), None);
        }

        clock.set(10_001);
        sup.mark_activity();
        assert_eq!(sup.update(&mut || ()), Some(RecoveryReason::Preventive));

        clock.set(15_000);
        sup.mark_activity();
        assert_eq!(sup.update(&mut || ()), None);
    }

    #[test]
    fn burst_beats_the_other_reasons() {
        let clock = Manual::at(0);
        let sup = supervisor(&clock);
        clock.set(4000);
        for _ in 0..3 {
            sup.mark_error();
        }
        // Inactive AND bursting, only one recovery per tick
        assert_eq!(sup.update(&mut || ()), Some(RecoveryReason::ErrorBurst));
        assert_eq!(sup.update(&mut || ()), Some(RecoveryReason::Inactivity));
        assert_eq!(sup.update(&mut || ()), None);
    }

    #[test]
    fn works_across_a_counter_wrap() {
        let start = u32::MAX - 1000;
        let clock = Manual::at(start);
        let sup = supervisor(&clock);

        clock.set(start.wrapping_add(2000));
        assert_eq!(sup.update(&mut || ()), None);

        clock.set(start.wrapping_add(2501));
        assert_eq!(sup.update(&mut || ()), Some(RecoveryReason::Inactivity));
        assert_eq!(sup.update(&mut || ()), None);
    }
}
